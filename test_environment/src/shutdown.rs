//! Termination-signal handling.
//!
//! When the process receives a termination signal while an environment is
//! live, cleanup runs in the background and races against a grace period and
//! a second signal. Whichever finishes first decides the exit code; a cleanup
//! that loses the race is abandoned, not cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TestEnvError};

/// Source of termination signals.
#[async_trait]
pub trait SignalSource: Send + 'static {
    /// Wait for the next signal and return its name. `None` means no more
    /// signals will arrive.
    async fn recv(&mut self) -> Option<&'static str>;
}

/// Interrupt, terminate and quit from the operating system.
///
/// The process handlers are installed once and shared by every subscription.
/// A signal that arrives while no subscription is live gets the signal's
/// default action, so the process can still be stopped once every
/// environment is gone.
pub struct OsSignals {
    #[cfg(unix)]
    id: u64,
    #[cfg(unix)]
    receiver: mpsc::UnboundedReceiver<i32>,
}

impl OsSignals {
    /// Subscribe until the returned value is dropped.
    pub fn new() -> std::io::Result<Self> {
        Self::subscribe(CancellationToken::new())
    }

    /// Subscribe until `token` is cancelled or the returned value is dropped.
    /// Signals arriving after cancellation are no longer delivered here.
    #[cfg(unix)]
    pub fn subscribe(token: CancellationToken) -> std::io::Result<Self> {
        dispatcher::install()?;
        let (id, receiver) = dispatcher::subscribe(token);
        Ok(Self { id, receiver })
    }

    #[cfg(not(unix))]
    pub fn subscribe(_token: CancellationToken) -> std::io::Result<Self> {
        Ok(Self {})
    }
}

#[cfg(unix)]
impl Drop for OsSignals {
    fn drop(&mut self) {
        dispatcher::unsubscribe(self.id);
        // Forwarded but never handled: hand it back so it is not lost.
        while let Ok(signal) = self.receiver.try_recv() {
            dispatcher::dispatch(signal);
        }
    }
}

#[async_trait]
impl SignalSource for OsSignals {
    #[cfg(unix)]
    async fn recv(&mut self) -> Option<&'static str> {
        self.receiver.recv().await.map(dispatcher::name)
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> Option<&'static str> {
        tokio::signal::ctrl_c().await.ok().map(|_| "ctrl-c")
    }
}

#[cfg(unix)]
mod dispatcher {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Mutex, MutexGuard};

    use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
    use signal_hook::iterator::Signals;
    use signal_hook::low_level;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, error, warn};

    struct Subscriber {
        sender: mpsc::UnboundedSender<i32>,
        token: CancellationToken,
    }

    impl Subscriber {
        fn is_live(&self) -> bool {
            !self.token.is_cancelled() && !self.sender.is_closed()
        }
    }

    static INSTALLED: Mutex<bool> = Mutex::new(false);
    static SUBSCRIBERS: Mutex<BTreeMap<u64, Subscriber>> = Mutex::new(BTreeMap::new());
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);

    fn subscribers() -> MutexGuard<'static, BTreeMap<u64, Subscriber>> {
        SUBSCRIBERS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register the process handlers and start the forwarding thread, once.
    pub(super) fn install() -> std::io::Result<()> {
        let mut installed = INSTALLED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *installed {
            return Ok(());
        }

        let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])?;
        std::thread::Builder::new()
            .name("testenv-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    dispatch(signal);
                }
            })?;
        *installed = true;
        debug!("Shutdown: Signal handlers installed");
        Ok(())
    }

    pub(super) fn subscribe(token: CancellationToken) -> (u64, mpsc::UnboundedReceiver<i32>) {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        subscribers().insert(id, Subscriber { sender, token });
        (id, receiver)
    }

    pub(super) fn unsubscribe(id: u64) {
        subscribers().remove(&id);
    }

    pub(super) fn name(signal: i32) -> &'static str {
        match signal {
            SIGINT => "SIGINT",
            SIGTERM => "SIGTERM",
            SIGQUIT => "SIGQUIT",
            _ => "signal",
        }
    }

    /// Forward `signal` to every live subscriber, or take its default action
    /// when there is none.
    pub(super) fn dispatch(signal: i32) {
        let name = name(signal);
        let delivered = {
            let mut subscribers = subscribers();
            subscribers.retain(|_, subscriber| subscriber.is_live());
            subscribers
                .values()
                .filter(|subscriber| subscriber.sender.send(signal).is_ok())
                .count()
        };
        if delivered > 0 {
            debug!("Shutdown: Forwarded {} to {} environment(s)", name, delivered);
            return;
        }

        warn!("Shutdown: Received {} with no live environment, taking the default action", name);
        if let Err(e) = low_level::emulate_default_handler(signal) {
            error!("Shutdown: Default action for {} failed: {}", name, e);
        }
        std::process::exit(128 + signal);
    }
}

/// Signals delivered through a channel.
#[async_trait]
impl SignalSource for mpsc::Receiver<&'static str> {
    async fn recv(&mut self) -> Option<&'static str> {
        mpsc::Receiver::recv(self).await
    }
}

#[async_trait]
impl SignalSource for Box<dyn SignalSource> {
    async fn recv(&mut self) -> Option<&'static str> {
        (**self).recv().await
    }
}

/// How a signal-triggered cleanup ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Cleanup finished within the grace period.
    Completed,
    GracePeriodElapsed,
    /// Another signal arrived while cleanup was running.
    SecondSignal,
}

impl ShutdownOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownOutcome::Completed => 0,
            ShutdownOutcome::GracePeriodElapsed | ShutdownOutcome::SecondSignal => 1,
        }
    }
}

/// Called with the exit code once a signal-triggered cleanup is decided.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// Exit hook that terminates the process.
pub fn process_exit() -> ExitHook {
    Arc::new(|code| std::process::exit(code))
}

/// Race `cleanup` against `grace` and the next signal from `signals`.
///
/// A cleanup error still counts as [`ShutdownOutcome::Completed`]; it is
/// logged here.
pub async fn race_cleanup<F, S>(cleanup: F, grace: Duration, signals: &mut S) -> ShutdownOutcome
where
    F: Future<Output = Result<()>>,
    S: SignalSource + ?Sized,
{
    tokio::select! {
        result = cleanup => {
            match result {
                Ok(()) => info!("Shutdown: Cleanup finished"),
                Err(e) => error!("Shutdown: Cleanup finished with errors: {}", e),
            }
            ShutdownOutcome::Completed
        }
        _ = tokio::time::sleep(grace) => {
            warn!("Shutdown: Cleanup did not finish within {:?}", grace);
            ShutdownOutcome::GracePeriodElapsed
        }
        Some(name) = signals.recv() => {
            warn!("Shutdown: Received {} during cleanup, giving up", name);
            ShutdownOutcome::SecondSignal
        }
    }
}

/// Wait for a signal, then run `cleanup` under [`race_cleanup`] and hand the
/// outcome to `exit`. Cancelling `token` before a signal arrives stops the
/// listener without side effects.
pub(crate) fn spawn_listener<S, C, Fut>(
    mut signals: S,
    token: CancellationToken,
    grace: Duration,
    exit: ExitHook,
    cleanup: C,
) -> JoinHandle<()>
where
    S: SignalSource,
    C: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let name = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Shutdown: Listener unsubscribed");
                return;
            }
            received = signals.recv() => match received {
                Some(name) => name,
                None => return,
            },
        };

        warn!("Shutdown: Received {}, cleaning up (grace period {:?})", name, grace);
        let task = tokio::spawn(cleanup());
        let cleanup = async move {
            task.await
                .unwrap_or_else(|e| Err(TestEnvError::InvalidState(format!("cleanup task failed: {}", e))))
        };
        let outcome = race_cleanup(cleanup, grace, &mut signals).await;
        info!("Shutdown: Exiting with code {} ({:?})", outcome.exit_code(), outcome);
        exit(outcome.exit_code());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn recording_exit() -> (ExitHook, Arc<AtomicI32>) {
        let code = Arc::new(AtomicI32::new(-1));
        let recorded = code.clone();
        (Arc::new(move |c| recorded.store(c, Ordering::SeqCst)), code)
    }

    #[tokio::test]
    async fn test_completed_cleanup_exits_zero() {
        let (_tx, mut rx) = mpsc::channel::<&'static str>(1);
        let outcome = race_cleanup(async { Ok(()) }, Duration::from_secs(1), &mut rx).await;
        assert_eq!(outcome, ShutdownOutcome::Completed);
        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_failed_cleanup_still_completes() {
        let (_tx, mut rx) = mpsc::channel::<&'static str>(1);
        let outcome = race_cleanup(
            async { Err(TestEnvError::InvalidState("boom".to_string())) },
            Duration::from_secs(1),
            &mut rx,
        )
        .await;
        assert_eq!(outcome, ShutdownOutcome::Completed);
    }

    #[tokio::test]
    async fn test_grace_period_elapses() {
        let (_tx, mut rx) = mpsc::channel::<&'static str>(1);
        let outcome = race_cleanup(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            Duration::from_millis(20),
            &mut rx,
        )
        .await;
        assert_eq!(outcome, ShutdownOutcome::GracePeriodElapsed);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_second_signal_wins() {
        let (tx, mut rx) = mpsc::channel::<&'static str>(1);
        tx.send("SIGINT").await.unwrap();
        let outcome = race_cleanup(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            Duration::from_secs(10),
            &mut rx,
        )
        .await;
        assert_eq!(outcome, ShutdownOutcome::SecondSignal);
    }

    #[tokio::test]
    async fn test_closed_source_does_not_end_race() {
        let (tx, mut rx) = mpsc::channel::<&'static str>(1);
        drop(tx);
        let outcome = race_cleanup(
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            },
            Duration::from_secs(5),
            &mut rx,
        )
        .await;
        assert_eq!(outcome, ShutdownOutcome::Completed);
    }

    #[tokio::test]
    async fn test_listener_runs_cleanup_on_signal() {
        let (tx, rx) = mpsc::channel::<&'static str>(2);
        let (exit, code) = recording_exit();
        let handle = spawn_listener(
            rx,
            CancellationToken::new(),
            Duration::from_secs(1),
            exit,
            || async { Ok(()) },
        );

        tx.send("SIGTERM").await.unwrap();
        handle.await.unwrap();
        assert_eq!(code.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_listener_does_nothing() {
        let (_tx, rx) = mpsc::channel::<&'static str>(1);
        let (exit, code) = recording_exit();
        let token = CancellationToken::new();
        let handle = spawn_listener(rx, token.clone(), Duration::from_secs(1), exit, || async {
            Ok(())
        });

        token.cancel();
        handle.await.unwrap();
        assert_eq!(code.load(Ordering::SeqCst), -1);
    }
}
