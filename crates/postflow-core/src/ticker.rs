//! Repeating background task with explicit start/stop.
//!
//! Ticks are serialized: the loop awaits each tick before waiting for the next
//! interval, and missed intervals are skipped instead of bursted. Stopping only
//! signals the loop, so a tick that is already running finishes normally.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Running {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// A named periodic loop running on the tokio runtime.
pub struct RepeatingTask {
    name: String,
    period: Duration,
    running: Mutex<Option<Running>>,
}

impl RepeatingTask {
    pub fn new(name: &str, period: Duration) -> Self {
        Self {
            name: name.to_string(),
            period,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the loop is currently scheduled.
    pub fn is_active(&self) -> bool {
        match self.running.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|r| !r.join.is_finished()),
            Err(_) => false,
        }
    }

    /// Start the loop. The first tick runs immediately.
    /// Returns `false` (and does nothing) if the loop is already active.
    pub fn start<F, Fut>(&self, tick: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(mut guard) = self.running.lock() else {
            return false;
        };
        if guard.as_ref().is_some_and(|r| !r.join.is_finished()) {
            tracing::debug!("⏱️ {} already running", self.name);
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let period = self.period;
        let name = self.name.clone();
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop_rx.changed() => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
                tick().await;
            }
            tracing::info!("⏹️ {} loop stopped", name);
        });

        tracing::info!("⏱️ {} started (every {}s)", self.name, period.as_secs());
        *guard = Some(Running { stop_tx, join });
        true
    }

    /// Signal the loop to stop after any in-flight tick.
    /// Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        let Ok(mut guard) = self.running.lock() else {
            return false;
        };
        match guard.take() {
            Some(running) => {
                let was_active = !running.join.is_finished();
                let _ = running.stop_tx.send(true);
                was_active
            }
            None => false,
        }
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(&self) {
        let running = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(running) = running {
            let _ = running.stop_tx.send(true);
            let _ = running.join.await;
        }
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.running.lock() {
            if let Some(running) = guard.take() {
                let _ = running.stop_tx.send(true);
            }
        }
    }
}
