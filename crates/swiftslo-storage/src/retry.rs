use std::time::Duration;

/// Backoff and attempt-cap knobs for HTTP operations against the object store.
///
/// Transport-level failures (DNS, TCP reset, TLS) are retried without bound by
/// default because a multi-hour upload should survive a flaky network; server
/// errors get a finite cap so a persistently broken endpoint fails eventually.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// First backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_delay_ms: u64,
    /// Total attempts allowed when the server answers 5xx.
    pub max_server_error_attempts: u32,
    /// Total attempts allowed on transport errors; `None` means unbounded.
    pub max_transport_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_server_error_attempts: 5,
            max_transport_attempts: None,
        }
    }
}

/// Retry a closure on transient `ureq::Error`s with exponential backoff + jitter.
///
/// 5xx and transport errors are transient (with separate attempt budgets);
/// everything else returns to the caller on the first occurrence. 401 handling
/// (re-auth) lives a level up in [`crate::SwiftConnection`], not here.
#[allow(clippy::result_large_err)]
pub fn retry_http<T>(
    config: &RetryConfig,
    op_name: &str,
    f: impl Fn() -> std::result::Result<T, ureq::Error>,
) -> std::result::Result<T, ureq::Error> {
    let mut delay_ms = config.base_delay_ms;
    let mut server_errors = 0u32;
    let mut transport_errors = 0u32;

    loop {
        let err = match f() {
            Ok(val) => return Ok(val),
            Err(e) => e,
        };

        let will_retry = match &err {
            ureq::Error::Transport(_) => {
                transport_errors += 1;
                config
                    .max_transport_attempts
                    .map_or(true, |cap| transport_errors < cap)
            }
            ureq::Error::Status(code, _) if *code >= 500 => {
                server_errors += 1;
                server_errors < config.max_server_error_attempts
            }
            ureq::Error::Status(_, _) => false,
        };
        if !will_retry {
            return Err(err);
        }

        tracing::warn!(
            "{op_name}: transient error (attempt {}), retrying in {delay_ms}ms: {err}",
            server_errors + transport_errors,
        );
        let jitter = rand::random::<u64>() % delay_ms.max(1);
        std::thread::sleep(Duration::from_millis(delay_ms + jitter));
        delay_ms = (delay_ms * 2).min(config.max_delay_ms);
    }
}
