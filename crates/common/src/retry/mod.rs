use std::{future::Future, time::Duration};

use tracing::{error, warn};

pub mod policies;

/// Default maximum number of retries for reads against the chain.
pub const DEFAULT_MAX_RETRIES: u16 = 4;

/// Runs `operation` until it succeeds, sleeping between attempts as `backoff` dictates.
///
/// Gives up after `max_retries` retries and returns the last error. Meant for reads against the
/// chain; a rejected transaction is never resubmitted this way.
///
/// ```rust
/// use catbridge_common::retry::{policies::ExponentialBackoff, retry_with_backoff};
///
/// # async fn run() {
/// let height = retry_with_backoff("block_count", 3, &ExponentialBackoff::default(), || async {
///     Ok::<_, &str>(42u64)
/// })
/// .await;
/// assert_eq!(height, Ok(42));
/// # }
/// ```
pub async fn retry_with_backoff<R, E, F, Fut>(
    name: &str,
    max_retries: u16,
    backoff: &impl Backoff,
    operation: F,
) -> Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: std::fmt::Debug,
{
    retry_with_backoff_inner(name, max_retries, backoff, operation, tokio::time::sleep).await
}

/// [`retry_with_backoff`] with an injectable sleep.
async fn retry_with_backoff_inner<R, E, F, Fut, S, SFut>(
    name: &str,
    max_retries: u16,
    backoff: &impl Backoff,
    mut operation: F,
    mut sleep_fn: S,
) -> Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: std::fmt::Debug,
    S: FnMut(Duration) -> SFut,
    SFut: Future<Output = ()>,
{
    let mut delay = backoff.base_delay_ms();
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_retries => {
                warn!(%name, ?err, attempt, delay_ms = delay, "retrying");
                sleep_fn(Duration::from_millis(delay)).await;
                delay = backoff.next_delay_ms(delay);
                attempt += 1;
            }
            Err(err) => {
                error!(%name, ?err, %max_retries, "giving up");
                return Err(err);
            }
        }
    }
}

/// Delay schedule between retries.
pub trait Backoff {
    /// Delay before the first retry, in milliseconds.
    fn base_delay_ms(&self) -> u64;

    /// Delay following one of `curr_delay_ms`.
    fn next_delay_ms(&self, curr_delay_ms: u64) -> u64;
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    struct HalfBackoff;

    impl Backoff for HalfBackoff {
        fn base_delay_ms(&self) -> u64 {
            128
        }

        fn next_delay_ms(&self, curr: u64) -> u64 {
            curr / 2
        }
    }

    fn sleep_recorder(log: &Arc<Mutex<Vec<u64>>>) -> impl FnMut(Duration) -> std::future::Ready<()> {
        let log = Arc::clone(log);
        move |dur| {
            log.lock().unwrap().push(dur.as_millis() as u64);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let counter = Arc::new(Mutex::new(0));
        let sleep_log = Arc::new(Mutex::new(Vec::new()));
        let max_retries = 2;

        let result = retry_with_backoff_inner(
            "mock_op",
            max_retries,
            &HalfBackoff,
            || {
                *counter.lock().unwrap() += 1;
                async { Err::<(), _>("fail") }
            },
            sleep_recorder(&sleep_log),
        )
        .await;

        assert_eq!(result, Err("fail"));
        assert_eq!(*counter.lock().unwrap(), 1 + max_retries);
        assert_eq!(sleep_log.lock().unwrap().to_vec(), vec![128, 64]);
    }

    #[tokio::test]
    async fn test_recovers_on_third_attempt() {
        let attempts = Arc::new(Mutex::new(0));
        let success_at_attempt = 2;
        let sleep_log = Arc::new(Mutex::new(Vec::new()));

        let result = retry_with_backoff_inner(
            "mock_op_success",
            3,
            &HalfBackoff,
            || {
                let mut count = attempts.lock().unwrap();
                *count += 1;
                let done = *count - 1 == success_at_attempt;
                async move {
                    if done {
                        Ok("success")
                    } else {
                        Err("fail")
                    }
                }
            },
            sleep_recorder(&sleep_log),
        )
        .await;

        assert_eq!(result, Ok("success"));
        assert_eq!(*attempts.lock().unwrap(), success_at_attempt + 1);
        assert_eq!(sleep_log.lock().unwrap().to_vec(), vec![128, 64]);
    }
}
