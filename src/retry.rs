//! Retry with exponential backoff for backend calls.
//!
//! Only transient failures ([`BackendError::is_transient`]) are retried:
//! timeouts, connection errors, HTTP 429 and 5xx. Client errors and
//! malformed payloads fail immediately.
//!
//! Backoff doubles from `base_delay` per attempt, capped at 2^5 × base
//! and at `max_delay`.

use std::sync::mpsc;
use std::time::Duration;

use tenant_rag_core::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(30),
        }
    }

    /// No retries; used in tests and for local backends.
    pub fn none() -> Self {
        Self::new(0, 0)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(5);
        (self.base_delay * factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
pub fn with_backoff<T>(
    policy: &RetryPolicy,
    label: &str,
    mut op: impl FnMut() -> Result<T, BackendError>,
) -> Result<T, BackendError> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                tracing::warn!(
                    backend = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient backend failure, retrying"
                );
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Run a blocking computation on its own thread, giving up after `timeout`.
///
/// A timed-out computation keeps running to completion in the background;
/// its result is discarded.
pub fn run_with_timeout<T, F>(backend: &str, timeout: Duration, f: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name(format!("{}-call", backend))
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| BackendError::unavailable(backend, format!("failed to spawn worker: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(BackendError::Timeout {
            backend: backend.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(BackendError::unavailable(
            backend,
            "worker thread exited without a result",
        )),
    }
}

/// Map a non-success HTTP status to a [`BackendError`].
///
/// 429 and 5xx are transient; other statuses are rejections.
pub fn status_error(backend: &str, status: reqwest::StatusCode, body: &str) -> BackendError {
    let message = format!("HTTP {}: {}", status, truncate(body, 300));
    if status.as_u16() == 429 || status.is_server_error() {
        BackendError::unavailable(backend, message)
    } else {
        BackendError::rejected(backend, message)
    }
}

/// Map a transport-level failure to a [`BackendError`].
pub fn transport_error(backend: &str, err: &reqwest::Error, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout {
            backend: backend.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if err.is_decode() {
        BackendError::malformed(backend, err.to_string())
    } else {
        BackendError::unavailable(backend, err.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
