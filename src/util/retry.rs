use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

/// Bounded retry over an explicit list of attempt values, e.g. candidate baud
///  rates or just attempt indices. Runs the operation per attempt, sleeping a
///  fixed interval between failures; the first success wins. When all attempts
///  are exhausted (or the continue-predicate says stop) the failure is an
///  aggregate [RetryError] preserving every attempt's error.
pub struct Retry<A> {
    attempts: Vec<A>,
    interval: Duration,
    should_continue: Box<dyn Fn(&anyhow::Error, &A) -> bool + Send + Sync>,
}

impl Retry<usize> {
    pub fn up_to(max_attempts: usize) -> Retry<usize> {
        Retry::over((0..max_attempts).collect())
    }
}

impl<A: Debug + Clone> Retry<A> {
    pub fn over(attempts: Vec<A>) -> Retry<A> {
        Retry {
            attempts,
            interval: Duration::from_secs(1),
            should_continue: Box::new(|_, _| true),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Retry<A> {
        self.interval = interval;
        self
    }

    /// decides after each failure whether the remaining attempts are still worth
    ///  trying (default: always)
    pub fn continue_if(
        mut self,
        predicate: impl Fn(&anyhow::Error, &A) -> bool + Send + Sync + 'static,
    ) -> Retry<A> {
        self.should_continue = Box::new(predicate);
        self
    }

    pub async fn run<T, F, Fut>(self, mut operation: F) -> anyhow::Result<T>
    where
        F: FnMut(A, Duration) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if self.attempts.is_empty() {
            anyhow::bail!("retry configured with no attempts");
        }

        let started = Instant::now();
        let num_attempts = self.attempts.len();
        let mut failures: Vec<(String, anyhow::Error)> = Vec::new();

        for (i, attempt) in self.attempts.iter().enumerate() {
            let label = format!("{:?}", attempt);

            match operation(attempt.clone(), started.elapsed()).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    debug!("[{}/{}] attempt {} failed after {:?}: {:#}",
                           i + 1, num_attempts, label, started.elapsed(), e);

                    let is_last = i + 1 == num_attempts;
                    let stop = is_last || !(self.should_continue)(&e, attempt);
                    failures.push((label, e));

                    if stop {
                        return Err(RetryError::new(failures).into());
                    }
                    sleep(self.interval).await;
                }
            }
        }

        unreachable!("the last attempt either returned or aborted the loop")
    }
}


/// The aggregate failure of an exhausted [Retry]: every attempt's error, with
///  identical messages collapsed to a single `(xN)` entry in the rendering.
#[derive(Debug)]
pub struct RetryError {
    attempts: Vec<String>,
    errors: Vec<anyhow::Error>,
}

impl RetryError {
    fn new(failures: Vec<(String, anyhow::Error)>) -> RetryError {
        let (attempts, errors) = failures.into_iter().unzip();
        RetryError { attempts, errors }
    }

    pub fn num_attempts(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }
}

impl Display for RetryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut grouped: Vec<(String, usize)> = Vec::new();
        for error in &self.errors {
            let message = error.to_string();
            match grouped.iter_mut().find(|(m, _)| *m == message) {
                Some((_, count)) => *count += 1,
                None => grouped.push((message, 1)),
            }
        }

        let rendered = grouped.iter()
            .map(|(message, count)| format!("{} (x{})", message, count))
            .collect::<Vec<_>>()
            .join(", ");

        write!(f, "all {} attempt(s) failed on [{}]: {}",
               self.errors.len(), self.attempts.join(", "), rendered)
    }
}

impl std::error::Error for RetryError {}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;

    use super::*;

    #[tokio::test]
    async fn test_succeeds_on_first_attempt() {
        let result = Retry::over(vec![1, 2, 3])
            .run(|i, _| async move {
                if i == 1 { Ok(i) } else { Err(anyhow!("failed")) }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_second_item() {
        let result = Retry::over(vec!["a", "b", "c"])
            .run(|s, _| async move {
                if s == "b" { Ok(s) } else { Err(anyhow!("failed")) }
            })
            .await;

        assert_eq!(result.unwrap(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_all_attempts_with_aggregate_error() {
        let result: anyhow::Result<()> = Retry::over(vec![1, 2, 3])
            .run(|_, _| async { Err(anyhow!("always fails")) })
            .await;

        let error = result.unwrap_err();
        let retry_error = error.downcast_ref::<RetryError>().unwrap();
        assert_eq!(retry_error.num_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_max_attempts() {
        let count = AtomicUsize::new(0);

        let result: anyhow::Result<()> = Retry::up_to(2)
            .run(|_, _| {
                count.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("failed")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_immediately_on_success() {
        let count = AtomicUsize::new(0);

        let result = Retry::over(vec![1, 2, 3])
            .run(|i, _| {
                count.fetch_add(1, Ordering::SeqCst);
                async move {
                    if i == 2 { Ok(i * 10) } else { Err(anyhow!("failed")) }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 20);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provides_elapsed_time() {
        let mut elapsed_per_attempt = Vec::new();

        let _: anyhow::Result<()> = Retry::up_to(2)
            .with_interval(Duration::from_millis(100))
            .run(|_, elapsed| {
                elapsed_per_attempt.push(elapsed);
                async { Err(anyhow!("failed")) }
            })
            .await;

        assert_eq!(elapsed_per_attempt.len(), 2);
        assert!(elapsed_per_attempt[1] >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_message_groups_identical_failures() {
        let result: anyhow::Result<()> = Retry::over(vec![1, 2, 3])
            .run(|i, _| async move {
                if i < 3 { Err(anyhow!("boom")) } else { Err(anyhow!("zap")) }
            })
            .await;

        let message = result.unwrap_err().to_string();
        assert!(message.contains("all 3 attempt(s) failed"), "was: {}", message);
        assert!(message.contains("[1, 2, 3]"), "was: {}", message);
        assert!(message.contains("boom (x2)"), "was: {}", message);
        assert!(message.contains("zap (x1)"), "was: {}", message);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_predicate_can_abort_early() {
        let count = AtomicUsize::new(0);

        let result: anyhow::Result<()> = Retry::up_to(5)
            .continue_if(|_, _| false)
            .run(|_, _| {
                count.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("fatal")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
