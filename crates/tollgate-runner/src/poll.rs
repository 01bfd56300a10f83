//! Adaptive wait between orchestrator passes.
//!
//! The loop blocks on a `Notify` (new task submitted, operator nudge) with a
//! fallback timer. The timer shrinks to the minimum after a pass that did
//! work and grows geometrically while passes stay idle.

use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::PollConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Notified,
    Elapsed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AdaptivePoll {
    min: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl AdaptivePoll {
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            factor: factor.max(1.0),
            current: min,
        }
    }

    pub fn from_config(config: &PollConfig) -> Self {
        Self::new(
            Duration::from_millis(config.min_interval_ms),
            Duration::from_millis(config.max_interval_ms),
            config.growth_factor,
        )
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn on_activity(&mut self) {
        self.current = self.min;
    }

    pub fn on_idle(&mut self) {
        self.current = self.current.mul_f64(self.factor).min(self.max);
    }

    /// Sleep for the current interval unless notified or cancelled first.
    pub async fn wait(&self, notify: &Notify, cancel: &CancellationToken) -> WakeReason {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => WakeReason::Cancelled,
            _ = notify.notified() => WakeReason::Notified,
            _ = tokio::time::sleep(self.current) => WakeReason::Elapsed,
        }
    }
}
