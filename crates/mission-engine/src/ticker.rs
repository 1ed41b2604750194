//! Scheduling abstraction for backend tick loops.
//!
//! Production code drives backends from a tokio interval; tests can swap in
//! a [`ManualTicker`] and advance the loop one step at a time.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};

#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick
    async fn tick(&mut self);

    /// Restart the period so the next tick is a full interval away
    fn reset(&mut self);
}

/// Periodic ticker backed by `tokio::time::Interval`
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }

    fn reset(&mut self) {
        self.interval.reset();
    }
}

/// Ticker that only advances when its [`ManualTickHandle`] says so
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

/// Stepping side of a [`ManualTicker`]
#[derive(Clone)]
pub struct ManualTickHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualTicker {
    pub fn new() -> (Self, ManualTickHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, ManualTickHandle { tx })
    }
}

impl ManualTickHandle {
    pub fn step(&self) {
        let _ = self.tx.send(());
    }

    pub fn step_n(&self, n: usize) {
        for _ in 0..n {
            self.step();
        }
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) {
        if self.rx.recv().await.is_none() {
            // Handle dropped: never tick again
            std::future::pending::<()>().await;
        }
    }

    fn reset(&mut self) {
        // Steps are explicit; there is no period to restart
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticker_waits_full_period() {
        let start = time::Instant::now();
        let mut ticker = IntervalTicker::new(Duration::from_millis(500));

        ticker.tick().await;
        assert!(start.elapsed() >= Duration::from_millis(500));

        ticker.tick().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_manual_ticker_steps() {
        let (mut ticker, handle) = ManualTicker::new();
        handle.step_n(2);

        ticker.tick().await;
        ticker.tick().await;

        let pending = tokio::time::timeout(Duration::from_millis(20), ticker.tick()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_manual_ticker_reset_keeps_queued_steps() {
        let (mut ticker, handle) = ManualTicker::new();
        handle.step();
        ticker.reset();

        let ticked = tokio::time::timeout(Duration::from_millis(20), ticker.tick()).await;
        assert!(ticked.is_ok());
    }
}
