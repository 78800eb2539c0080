//! Shared fixtures for content-sync integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use kiosk_content::{SyncSettings, Transport, TransportResponse};
use kiosk_core::{EngineConfig, RetryPolicy};

pub const MANIFEST_URL: &str = "https://cdn.example/manifest.json";

/// In-memory origin that can fail chosen URLs a number of times.
#[derive(Default)]
pub struct Origin {
    bodies: HashMap<String, Vec<u8>>,
    failures: Mutex<HashMap<String, u32>>,
    requests: Mutex<Vec<String>>,
}

impl Origin {
    pub fn serve(mut self, url: &str, body: impl AsRef<[u8]>) -> Self {
        self.bodies.insert(url.to_string(), body.as_ref().to_vec());
        self
    }

    pub fn fail(self, url: &str, times: u32) -> Self {
        self.failures.lock().unwrap().insert(url.to_string(), times);
        self
    }

    /// Requests for anything but the manifest.
    pub fn file_requests(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() != MANIFEST_URL)
            .count()
    }
}

impl Transport for &Origin {
    fn get(&self, url: &str, range_start: Option<u64>) -> Result<TransportResponse, String> {
        self.requests.lock().unwrap().push(url.to_string());
        if let Some(left) = self.failures.lock().unwrap().get_mut(url)
            && *left > 0
        {
            *left -= 1;
            return Err("connection timed out".into());
        }
        let Some(body) = self.bodies.get(url) else {
            return Ok(TransportResponse {
                status: 404,
                body: Box::new(Cursor::new(Vec::new())),
            });
        };
        let (status, bytes) = match range_start {
            Some(offset) => (206, body[offset as usize..].to_vec()),
            None => (200, body.clone()),
        };
        Ok(TransportResponse {
            status,
            body: Box::new(Cursor::new(bytes)),
        })
    }
}

pub fn settings(root: &Path, max_retries: u32) -> SyncSettings {
    let mut cfg = EngineConfig::default();
    cfg.paths.content_root = root.join("content");
    cfg.paths.runtime_dir = root.join("run");
    cfg.content.manifest_url = Some(MANIFEST_URL.to_string());
    let mut settings = SyncSettings::from_config(&cfg).expect("settings");
    settings.policy = RetryPolicy::new(max_retries, Duration::ZERO);
    settings
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}
