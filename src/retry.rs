use std::future::Future;
use std::time::Duration;

use crate::models::Envelope;

/// Error codes the hosted backend and the OS report for transient network trouble.
pub const TRANSIENT_CODES: &[&str] = &[
    "ECONNRESET",
    "ECONNREFUSED",
    "ECONNABORTED",
    "ETIMEDOUT",
    "EPIPE",
    "ENOTFOUND",
    "EAI_AGAIN",
    "ENETUNREACH",
    "EHOSTUNREACH",
    "PGRST000",
    "PGRST001",
    "PGRST002",
    "57P01",
    "08000",
    "08003",
    "08006",
];

const TRANSIENT_MESSAGE_FRAGMENTS: &[&str] = &["failed to fetch", "network", "timeout"];

/// True when a code/message pair describes a failure worth retrying.
pub fn is_transient(code: Option<&str>, message: &str) -> bool {
    if let Some(code) = code {
        if TRANSIENT_CODES.iter().any(|c| c.eq_ignore_ascii_case(code)) {
            return true;
        }
    }
    let lower = message.to_lowercase();
    TRANSIENT_MESSAGE_FRAGMENTS.iter().any(|f| lower.contains(f))
}

/// Errors that can be classified by the retry loop.
pub trait TransientError: Sized {
    fn code(&self) -> Option<&str>;
    fn message(&self) -> String;
    /// Builds the error reported when an attempt outlives the per-attempt timeout.
    fn timed_out(after: Duration) -> Self;

    fn is_retryable(&self) -> bool {
        is_transient(self.code(), &self.message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            delay: Duration::from_millis(300),
            timeout: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration, timeout: Duration) -> Self {
        Self { retries, delay, timeout }
    }

    pub fn from_env() -> Self {
        fn u64_env(name: &str) -> Option<u64> { std::env::var(name).ok().and_then(|v| v.parse().ok()) }
        let d = Self::default();
        Self {
            retries: u64_env("RETRY_MAX").and_then(|v| u32::try_from(v).ok()).unwrap_or(d.retries),
            delay: u64_env("RETRY_DELAY_MS").map(Duration::from_millis).unwrap_or(d.delay),
            timeout: u64_env("RETRY_TIMEOUT_MS").map(Duration::from_millis).unwrap_or(d.timeout),
        }
    }

    /// Linear backoff: the wait before retry `n` (1-based) is `delay * n`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.delay.checked_mul(attempt).unwrap_or(Duration::MAX)
    }
}

/// Runs `op` under the policy, retrying transient `Err`s.
///
/// The operation is invoked at most `retries + 1` times. Whatever the last
/// attempt produced is returned, retryable or not.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: TransientError,
{
    run(policy, &mut op, |_| false).await
}

/// Like [`with_retry`] for operations following the `{data, error}` convention.
///
/// An envelope whose embedded error is transient is retried; once attempts are
/// exhausted (or the embedded error is not transient) the envelope is handed
/// back untouched so the caller can inspect it.
pub async fn with_retry_envelope<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<Envelope<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Envelope<T>, E>>,
    E: TransientError,
{
    run(policy, &mut op, |env: &Envelope<T>| {
        env.error.as_ref().map(|e| e.is_retryable()).unwrap_or(false)
    })
    .await
}

async fn run<T, E, F, Fut, R>(policy: &RetryPolicy, op: &mut F, embedded_retryable: R) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: TransientError,
    R: Fn(&T) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        let outcome = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(res) => res,
            Err(_) => Err(E::timed_out(policy.timeout)),
        };
        let retryable = match &outcome {
            Ok(v) => embedded_retryable(v),
            Err(e) => e.is_retryable(),
        };
        if !retryable || attempt >= policy.retries {
            return outcome;
        }
        attempt += 1;
        tokio::time::sleep(policy.backoff(attempt)).await;
    }
}
