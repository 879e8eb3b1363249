//! Deadline-bounded retries for waiting on asynchronous readiness.
//!
//! A service inside a freshly started container is not usable right away.
//! [`Retryer`] keeps calling an operation until it succeeds or the deadline
//! passes. Attempts never overlap, and there is no attempt limit: only the
//! deadline bounds the total time spent.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Delay between attempts used by [`await_connection`].
pub const DEFAULT_ATTEMPT_INTERVAL: Duration = Duration::from_millis(200);

/// The deadline passed before any attempt succeeded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Deadline of {deadline:?} exceeded after {attempts} attempt(s)")]
pub struct DeadlineExceeded {
    pub deadline: Duration,
    /// Attempts that completed before the deadline fired.
    pub attempts: usize,
}

type AttemptObserver<'a, E> = Box<dyn FnMut(&E) + Send + 'a>;

/// Repeats an operation until it succeeds or a deadline elapses.
///
/// The first attempt starts immediately; later attempts wait `interval`
/// after the previous failure. The deadline is measured from the call to
/// [`Retryer::run`] and also interrupts an attempt that is still in flight.
pub struct Retryer<'a, F, E> {
    operation: F,
    deadline: Duration,
    interval: Duration,
    on_error: Option<AttemptObserver<'a, E>>,
}

impl<'a, F, E> Retryer<'a, F, E> {
    pub fn new(operation: F, deadline: Duration) -> Self {
        Self {
            operation,
            deadline,
            interval: DEFAULT_ATTEMPT_INTERVAL,
            on_error: None,
        }
    }

    /// Delay between a failed attempt and the next one. Zero retries as fast
    /// as the operation returns.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Observe each failed attempt, e.g. for logging.
    pub fn on_attempt_error(mut self, observer: impl FnMut(&E) + Send + 'a) -> Self {
        self.on_error = Some(Box::new(observer));
        self
    }

    pub async fn run<Fut, T>(mut self) -> Result<T, DeadlineExceeded>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let deadline = sleep(self.deadline);
        tokio::pin!(deadline);

        let mut attempts = 0usize;
        loop {
            let delay = (attempts > 0).then_some(self.interval);
            let operation = &mut self.operation;
            let attempt = async move {
                match delay {
                    Some(delay) if !delay.is_zero() => sleep(delay).await,
                    // Yield so the deadline timer can fire against an always-ready operation.
                    Some(_) => tokio::task::yield_now().await,
                    None => {}
                }
                operation().await
            };

            tokio::select! {
                biased;

                _ = &mut deadline => {
                    return Err(DeadlineExceeded {
                        deadline: self.deadline,
                        attempts,
                    });
                }
                outcome = attempt => {
                    attempts += 1;
                    match outcome {
                        Ok(value) => return Ok(value),
                        Err(err) => {
                            if let Some(observer) = self.on_error.as_mut() {
                                observer(&err);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Retry `operation` every [`DEFAULT_ATTEMPT_INTERVAL`] until it succeeds or
/// `deadline` elapses. Failed attempts are logged at debug level.
pub async fn await_connection<F, Fut, T, E>(operation: F, deadline: Duration) -> Result<T, DeadlineExceeded>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    Retryer::new(operation, deadline)
        .on_attempt_error(|err: &E| debug!("Connection attempt failed: {}", err))
        .run()
        .await
}

/// Wait until something accepts TCP connections on `address` (`host:port`).
pub async fn await_tcp(address: &str, deadline: Duration) -> Result<(), DeadlineExceeded> {
    let address = address.to_string();
    await_connection(
        || {
            let address = address.clone();
            async move { tokio::net::TcpStream::connect(address).await.map(|_| ()) }
        },
        deadline,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_succeeds_after_k_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = Retryer::new(
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= 3 {
                        Err(format!("attempt {} refused", n))
                    } else {
                        Ok(n)
                    }
                }
            },
            Duration::from_secs(5),
        )
        .interval(Duration::from_millis(5))
        .run()
        .await;

        assert_eq!(result, Ok(4));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_first_attempt_is_immediate() {
        let started = tokio::time::Instant::now();
        let result: Result<u8, DeadlineExceeded> = Retryer::new(
            || async { Ok::<_, String>(7) },
            Duration::from_secs(5),
        )
        .interval(Duration::from_secs(2))
        .run()
        .await;

        assert_eq!(result, Ok(7));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_deadline_shorter_than_interval() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let err = Retryer::new(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("down")
                }
            },
            Duration::from_millis(50),
        )
        .interval(Duration::from_millis(500))
        .run()
        .await
        .unwrap_err();

        assert_eq!(err.deadline, Duration::from_millis(50));
        assert_eq!(err.attempts, attempts.load(Ordering::SeqCst));
        assert!(err.attempts <= 1);
    }

    #[tokio::test]
    async fn test_slow_operation_is_interrupted_by_deadline() {
        let err = Retryer::new(
            || async {
                sleep(Duration::from_secs(10)).await;
                Err::<(), _>("never")
            },
            Duration::from_millis(30),
        )
        .run()
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 0);
    }

    #[tokio::test]
    async fn test_zero_interval_is_not_throttled() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = Retryer::new(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("busy")
                }
            },
            Duration::from_millis(100),
        )
        .interval(Duration::ZERO)
        .run()
        .await;

        assert!(result.is_err());
        // 200ms spacing would allow a single attempt in 100ms.
        assert!(attempts.load(Ordering::SeqCst) > 10);
    }

    #[tokio::test]
    async fn test_observer_sees_each_failure() {
        let mut seen = Vec::new();
        let attempts = AtomicUsize::new(0);

        let result = Retryer::new(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(format!("failure {}", n))
                    } else {
                        Ok(())
                    }
                }
            },
            Duration::from_secs(5),
        )
        .interval(Duration::from_millis(1))
        .on_attempt_error(|err: &String| seen.push(err.clone()))
        .run()
        .await;

        assert!(result.is_ok());
        assert_eq!(seen, vec!["failure 0".to_string(), "failure 1".to_string()]);
    }

    #[tokio::test]
    async fn test_await_tcp_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        assert!(await_tcp(&address, Duration::from_secs(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_deadline_error_message() {
        let err = DeadlineExceeded {
            deadline: Duration::from_secs(3),
            attempts: 2,
        };
        assert_eq!(err.to_string(), "Deadline of 3s exceeded after 2 attempt(s)");
    }
}
