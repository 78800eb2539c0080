//! External commands with a hard deadline.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use kiosk_types::{EngineError, IoResultExt};
use tracing::{debug, warn};

const POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
}

/// Run `argv` and kill it once `timeout` elapses.
///
/// A timeout is reported as an unsuccessful output, not an error; only a
/// failure to spawn is an error.
pub fn run_with_timeout(argv: &[String], timeout: Duration) -> Result<CommandOutput, EngineError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(EngineError::Config("empty command line".into()));
    };
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .io_context(|| format!("spawning {program}"))?;

    // Drain stdout on the side so a chatty child cannot fill the pipe.
    let reader = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = out.read_to_string(&mut buf);
            buf
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait().io_context(|| format!("waiting for {program}"))? {
            Some(status) => break Some(status),
            None if Instant::now() >= deadline => {
                warn!(command = %program, timeout_secs = timeout.as_secs(), "command timed out, killing");
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            None => thread::sleep(POLL),
        }
    };

    let stdout = reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    let success = status.is_some_and(|s| s.success());
    debug!(command = %program, success, "command finished");
    Ok(CommandOutput { success, stdout })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn captures_stdout_and_status() {
        let out = run_with_timeout(&argv(&["sh", "-c", "echo window-1"]), Duration::from_secs(5)).unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "window-1");
    }

    #[test]
    fn non_zero_exit_is_unsuccessful() {
        let out = run_with_timeout(&argv(&["sh", "-c", "exit 3"]), Duration::from_secs(5)).unwrap();
        assert!(!out.success);
    }

    #[test]
    fn slow_command_is_killed() {
        let started = Instant::now();
        let out = run_with_timeout(&argv(&["sleep", "30"]), Duration::from_millis(200)).unwrap();
        assert!(!out.success);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_program_is_an_error() {
        assert!(run_with_timeout(&argv(&["/nonexistent/kiosk-probe"]), Duration::from_secs(1)).is_err());
        assert!(run_with_timeout(&[], Duration::from_secs(1)).is_err());
    }
}
