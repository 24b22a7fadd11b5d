//! Background retry scheduler.
//!
//! Runs [`Dispatcher::run_due`] on a fixed interval until told to stop. Spawn
//! [`RetryScheduler::run`] as a tokio task and keep the [`SchedulerHandle`]:
//!
//! ```rust,ignore
//! let (scheduler, handle) = RetryScheduler::new(dispatcher, Duration::from_secs(30));
//! let task = tokio::spawn(scheduler.run());
//! // ...
//! handle.shutdown();
//! task.await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::dispatcher::Dispatcher;

/// Periodic sweep over due deliveries
#[derive(Debug)]
pub struct RetryScheduler {
    dispatcher: Arc<Dispatcher>,
    every: Duration,
    shutdown: watch::Receiver<bool>,
}

/// Stops a running [`RetryScheduler`]
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl SchedulerHandle {
    /// Ask the scheduler to exit after its current sweep
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl RetryScheduler {
    /// Create a scheduler sweeping every `every`
    pub fn new(dispatcher: Arc<Dispatcher>, every: Duration) -> (Self, SchedulerHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                dispatcher,
                every,
                shutdown: rx,
            },
            SchedulerHandle {
                shutdown: Arc::new(tx),
            },
        )
    }

    /// Run until shutdown
    pub async fn run(mut self) {
        tracing::info!(interval_secs = self.every.as_secs_f64(), "Starting retry scheduler");

        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.dispatcher.run_due().await;
                    if report.selected > 0 {
                        tracing::info!(
                            selected = report.selected,
                            succeeded = report.succeeded,
                            retrying = report.retrying,
                            dead = report.dead,
                            skipped = report.skipped,
                            "retry sweep finished"
                        );
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Retry scheduler shutting down");
    }
}
