//! [`DownloadEngine`] – per-file fetch with retry, resume and throttling.
//!
//! Every attempt streams into `cache/partial/<sha256(url)>.part` and the
//! partial file is renamed onto the destination only after a non-empty body
//! has been received in full. Media kinds keep the partial file between
//! attempts (and runs) and resume with an HTTP `Range` request; other kinds
//! always restart from zero.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use kiosk_core::{Attempt, CancelToken, RetryError, RetryPolicy};
use kiosk_types::{EngineError, IoResultExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::manifest::ContentKind;

const COPY_BUF: usize = 64 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Status line and body stream of a single GET.
pub struct TransportResponse {
    pub status: u16,
    pub body: Box<dyn Read + Send>,
}

/// Minimal GET capability the engine needs from the network.
pub trait Transport {
    /// Issue a GET for `url`, asking for bytes from `range_start` onwards
    /// when given. Errors are connection-level failures worth retrying.
    fn get(&self, url: &str, range_start: Option<u64>) -> Result<TransportResponse, String>;
}

/// `reqwest` blocking client, plus `file://` URLs served from disk.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration, max_time: Duration) -> Result<Self, EngineError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(max_time)
            .user_agent(concat!("kiosk-content-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn get_file(path: &str, range_start: Option<u64>) -> Result<TransportResponse, String> {
        use std::io::{Seek, SeekFrom};

        let mut file = File::open(path).map_err(|e| format!("{path}: {e}"))?;
        let status = match range_start {
            Some(offset) => {
                file.seek(SeekFrom::Start(offset))
                    .map_err(|e| format!("{path}: {e}"))?;
                206
            }
            None => 200,
        };
        Ok(TransportResponse {
            status,
            body: Box::new(file),
        })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, range_start: Option<u64>) -> Result<TransportResponse, String> {
        if let Some(path) = url.strip_prefix("file://") {
            return Self::get_file(path, range_start);
        }
        let mut request = self.client.get(url);
        if let Some(offset) = range_start {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().map_err(|e| e.to_string())?;
        Ok(TransportResponse {
            status: response.status().as_u16(),
            body: Box::new(response),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Throttle
// ─────────────────────────────────────────────────────────────────────────────

/// Paces a byte stream to at most `bytes_per_sec`.
struct Throttle {
    bytes_per_sec: u64,
    started: Instant,
    transferred: u64,
}

impl Throttle {
    fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            started: Instant::now(),
            transferred: 0,
        }
    }

    /// How long to wait after `n` more bytes so the average stays under the cap.
    fn delay_after(&mut self, n: usize) -> Duration {
        self.transferred += n as u64;
        let due = Duration::from_secs_f64(self.transferred as f64 / self.bytes_per_sec as f64);
        due.saturating_sub(self.started.elapsed())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DownloadEngine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Report intent only; no network or filesystem I/O.
    pub dry_run: bool,
    /// Bytes per second for media kinds; `None` is unlimited.
    pub bandwidth_limit: Option<u64>,
    /// Wall-clock cap per attempt.
    pub max_time: Duration,
    /// Where `.part` files live between attempts.
    pub partial_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { bytes: u64, attempts: u32 },
    DryRun,
}

pub struct DownloadEngine<T: Transport> {
    transport: T,
    policy: RetryPolicy,
    options: DownloadOptions,
    cancel: CancelToken,
    completed: u32,
}

impl<T: Transport> DownloadEngine<T> {
    pub fn new(transport: T, policy: RetryPolicy, options: DownloadOptions, cancel: CancelToken) -> Self {
        Self {
            transport,
            policy,
            options,
            cancel,
            completed: 0,
        }
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Point `.part` files at `dir`, returning the previous location.
    pub(crate) fn set_partial_dir(&mut self, dir: PathBuf) -> PathBuf {
        std::mem::replace(&mut self.options.partial_dir, dir)
    }

    /// Number of successful network fetches so far (manifest included).
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Fetch `url` to `destination`, honouring dry-run.
    ///
    /// # Errors
    ///
    /// [`EngineError::Network`] once the retry budget is exhausted,
    /// [`EngineError::Interrupted`] on cancellation.
    pub fn download(&mut self, url: &str, destination: &Path, kind: ContentKind) -> Result<DownloadOutcome, EngineError> {
        self.download_revision(url, None, destination, kind)
    }

    /// Like [`download`](Self::download), with the partial file keyed by
    /// `revision` as well as the URL, so bytes left over from a different
    /// revision of the same URL are never resumed.
    pub fn download_revision(
        &mut self,
        url: &str,
        revision: Option<&str>,
        destination: &Path,
        kind: ContentKind,
    ) -> Result<DownloadOutcome, EngineError> {
        if self.options.dry_run {
            info!(url, destination = %destination.display(), ?kind, "dry run: would download");
            return Ok(DownloadOutcome::DryRun);
        }
        self.fetch(url, revision, destination, kind)
    }

    /// Fetch regardless of dry-run; used for read-only metadata.
    pub(crate) fn fetch(
        &mut self,
        url: &str,
        revision: Option<&str>,
        destination: &Path,
        kind: ContentKind,
    ) -> Result<DownloadOutcome, EngineError> {
        fs::create_dir_all(&self.options.partial_dir)
            .io_context(|| format!("creating {}", self.options.partial_dir.display()))?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        }
        let part = self.partial_path(url, revision);

        let result = self.policy.run(&self.cancel, url, |attempt| {
            debug!(url, attempt, "download attempt");
            self.attempt(url, &part, kind).map(|bytes| (bytes, attempt))
        });

        let (bytes, attempts) = match result {
            Ok(done) => done,
            Err(RetryError::Exhausted { attempts, last }) => {
                return Err(EngineError::Network(format!(
                    "{url}: giving up after {attempts} attempts: {last}"
                )));
            }
            Err(RetryError::Aborted(e)) => return Err(e),
        };

        move_into_place(&part, destination)?;
        self.completed += 1;
        info!(url, destination = %destination.display(), bytes, attempts, "downloaded");
        Ok(DownloadOutcome::Downloaded { bytes, attempts })
    }

    fn partial_path(&self, url: &str, revision: Option<&str>) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        if let Some(revision) = revision {
            hasher.update(b"\0");
            hasher.update(revision.as_bytes());
        }
        let key = hex::encode(hasher.finalize());
        self.options.partial_dir.join(format!("{key}.part"))
    }

    /// One attempt; returns the final size of the partial file.
    fn attempt(&self, url: &str, part: &Path, kind: ContentKind) -> Result<u64, Attempt<String>> {
        let resume_from = if kind.is_media() {
            fs::metadata(part).map(|m| m.len()).unwrap_or(0)
        } else {
            remove_if_present(part).map_err(abort)?;
            0
        };

        let response = self
            .transport
            .get(url, (resume_from > 0).then_some(resume_from))
            .map_err(Attempt::Retry)?;

        let append = match response.status {
            206 if resume_from > 0 => {
                debug!(url, offset = resume_from, "resuming partial download");
                true
            }
            200..=299 => false,
            416 => {
                remove_if_present(part).map_err(abort)?;
                return Err(Attempt::Retry("range not satisfiable, restarting".into()));
            }
            status => return Err(Attempt::Retry(format!("HTTP {status}"))),
        };

        let mut file = open_partial(part, append).map_err(abort)?;
        self.copy_body(response.body, &mut file, kind)?;
        file.sync_all()
            .io_context(|| format!("syncing {}", part.display()))
            .map_err(abort)?;

        let size = fs::metadata(part)
            .io_context(|| format!("inspecting {}", part.display()))
            .map_err(abort)?
            .len();
        if size == 0 {
            remove_if_present(part).map_err(abort)?;
            return Err(Attempt::Retry("empty response body".into()));
        }
        Ok(size)
    }

    fn copy_body(&self, mut body: Box<dyn Read + Send>, out: &mut File, kind: ContentKind) -> Result<(), Attempt<String>> {
        let deadline = Instant::now() + self.options.max_time;
        let mut throttle = self
            .options
            .bandwidth_limit
            .filter(|_| kind.is_media())
            .map(Throttle::new);
        let mut buf = vec![0u8; COPY_BUF];

        loop {
            self.cancel.check().map_err(abort)?;
            if Instant::now() >= deadline {
                return Err(Attempt::Retry(format!(
                    "exceeded max time of {}s",
                    self.options.max_time.as_secs()
                )));
            }
            let n = match body.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Attempt::Retry(format!("read failed: {e}"))),
            };
            out.write_all(&buf[..n])
                .map_err(|e| abort(EngineError::io("writing partial download", e)))?;
            if let Some(throttle) = throttle.as_mut() {
                let pause = throttle.delay_after(n);
                if !pause.is_zero() {
                    self.cancel.sleep(pause).map_err(abort)?;
                }
            }
        }
    }
}

fn abort(e: EngineError) -> Attempt<String> {
    Attempt::Abort(e)
}

fn open_partial(part: &Path, append: bool) -> Result<File, EngineError> {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options
        .open(part)
        .io_context(|| format!("opening {}", part.display()))
}

fn remove_if_present(path: &Path) -> Result<(), EngineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::io(format!("removing {}", path.display()), e)),
    }
}

/// Rename, falling back to copy + remove across filesystems.
fn move_into_place(from: &Path, to: &Path) -> Result<(), EngineError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).io_context(|| format!("copying {} to {}", from.display(), to.display()))?;
    remove_if_present(from)
}
