use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Bounded constant-delay retry for transient failures. The last error is
/// returned once the attempt budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    sleep: Duration,
    max_attempts: u64,
}

impl RetryPolicy {
    pub fn repeat_constant(sleep: Duration, max_attempts: u64) -> Self {
        Self { sleep, max_attempts }
    }
}

pub async fn with_retry<F, Fut, R, Err>(mut get_future: F, policy: RetryPolicy) -> Result<R, Err>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, Err>>,
{
    let mut attempts: u64 = 0;
    loop {
        match get_future().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts = attempts.saturating_add(1);
                if attempts >= policy.max_attempts {
                    return Err(err);
                }

                sleep(policy.sleep).await;
            }
        }
    }
}
