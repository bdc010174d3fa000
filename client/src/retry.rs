//! Retry policy shared by the foreground and background paths.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::api_client::RemoteStore;
use crate::error::DriveError;

/// Capped exponential delay with up to 25 % random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt += 1;
        delay + jitter(delay / 4)
    }
}

/// A random duration in `[0, max]`.
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::random_range(0..=max_ms))
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// Foreground reads must fail eventually.
    pub fn foreground() -> Self {
        Self { max_attempts: 5, base: Duration::from_millis(200), cap: Duration::from_secs(5) }
    }

    pub fn background() -> Self {
        Self { max_attempts: 8, base: Duration::from_millis(500), cap: Duration::from_secs(30) }
    }
}

/// Runs `op` until it succeeds, fails permanently or runs out of attempts.
///
/// Transient errors back off; a rejected credential triggers one refresh
/// per attempt. Every other error is returned immediately.
///
/// # Arguments
/// * `remote` - Used to refresh credentials.
/// * `policy` - Attempt budget and delays.
/// * `what` - Short label for log lines.
/// * `op` - Produces one attempt.
pub async fn with_retries<T, F, Fut>(
    remote: &dyn RemoteStore,
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, DriveError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DriveError>>,
{
    let mut backoff = Backoff::new(policy.base, policy.cap);
    let mut attempt = 1;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if attempt >= policy.max_attempts {
            warn!(what, attempt, error = %err, "giving up");
            return Err(err);
        }
        match err {
            DriveError::CredentialInvalid => {
                warn!(what, "credentials rejected, refreshing");
                remote.refresh_credentials().await?;
            }
            ref e if e.is_transient() => {
                let delay = backoff.next_delay();
                warn!(what, attempt, error = %e, ?delay, "transient failure, retrying");
                tokio::time::sleep(delay).await;
            }
            e => return Err(e),
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let first = b.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let second = b.next_delay();
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(250));
        for _ in 0..10 {
            b.next_delay();
        }
        let late = b.next_delay();
        assert!(late >= Duration::from_millis(1000) && late <= Duration::from_millis(1250));
        assert_eq!(b.attempt(), 13);
    }

    #[test]
    fn jitter_of_zero_is_zero() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        assert!(jitter(Duration::from_millis(10)) <= Duration::from_millis(10));
    }
}
