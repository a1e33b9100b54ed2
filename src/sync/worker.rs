use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{log_debug, log_info};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "phasemark::sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Periodic timer.
    Interval,
    /// A local edit asked for an early pass.
    Opportunistic,
}

/// One background sync pass. Implementors decide what a pass does; the
/// worker only decides when it runs.
#[async_trait]
pub trait SyncPass: Send + Sync + 'static {
    async fn run_pass(&self, trigger: SyncTrigger);
}

/// Owns the background sync task.
pub struct SyncWorker {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    nudge: Arc<Notify>,
}

impl Default for SyncWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncWorker {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
            nudge: Arc::new(Notify::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start<P: SyncPass>(&mut self, pass: Arc<P>, interval: Duration) -> Result<()> {
        if self.handle.is_some() {
            bail!("sync worker already running");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(sync_loop(
            pass,
            interval,
            Arc::clone(&self.nudge),
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        log_info!("Sync worker started (every {:?})", interval);
        Ok(())
    }

    /// Requests an early pass. Coalesces with any nudge not yet consumed.
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("sync loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

async fn sync_loop<P: SyncPass>(
    pass: Arc<P>,
    interval: Duration,
    nudge: Arc<Notify>,
    cancel_token: CancellationToken,
) {
    // First tick one interval out; startup runs its own pass.
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log_info!("sync loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                log_debug!("interval sync pass");
                pass.run_pass(SyncTrigger::Interval).await;
            }
            _ = nudge.notified() => {
                log_debug!("opportunistic sync pass");
                pass.run_pass(SyncTrigger::Opportunistic).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        triggers: Mutex<Vec<SyncTrigger>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<SyncTrigger> {
            self.triggers.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncPass for Recorder {
        async fn run_pass(&self, trigger: SyncTrigger) {
            self.triggers.lock().unwrap().push(trigger);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_on_interval_until_stopped() {
        let recorder = Arc::new(Recorder::default());
        let mut worker = SyncWorker::new();
        worker
            .start(Arc::clone(&recorder), Duration::from_secs(30))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(recorder.seen(), vec![SyncTrigger::Interval; 3]);

        worker.stop().await.unwrap();
        assert!(!worker.is_running());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(recorder.seen().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn nudge_triggers_early_pass() {
        let recorder = Arc::new(Recorder::default());
        let mut worker = SyncWorker::new();
        worker
            .start(Arc::clone(&recorder), Duration::from_secs(30))
            .unwrap();

        worker.nudge();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.seen(), vec![SyncTrigger::Opportunistic]);
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let mut worker = SyncWorker::new();
        worker
            .start(Arc::clone(&recorder), Duration::from_secs(30))
            .unwrap();
        assert!(worker
            .start(Arc::clone(&recorder), Duration::from_secs(30))
            .is_err());
        worker.stop().await.unwrap();
    }
}
