//! Per-mission telemetry channel and upstream relay.
//!
//! The channel stamps every event with the mission's sequence number, keeps
//! a bounded history for late subscribers and fans events out over a
//! broadcast channel. The relay forwards one mission's stream to an external
//! sink; it reconnects with bounded backoff and never blocks the mission.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mission_core::{MissionId, TelemetryEnvelope, TelemetryEvent};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::error::{ChannelError, ChannelResult};

/// Upper bound for a single sink connect or send
pub const SINK_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Event stream of a single mission
#[derive(Clone)]
pub struct TelemetryChannel {
    mission_id: MissionId,
    sender: broadcast::Sender<TelemetryEnvelope>,
    history: Arc<RwLock<VecDeque<TelemetryEnvelope>>>,
    max_history: usize,
    sequence: Arc<AtomicU64>,
    /// Cross-mission feed shared by every channel of a registry
    firehose: Option<broadcast::Sender<TelemetryEnvelope>>,
}

impl TelemetryChannel {
    pub fn new(mission_id: MissionId, capacity: usize, max_history: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            mission_id,
            sender,
            history: Arc::new(RwLock::new(VecDeque::with_capacity(max_history.min(1024)))),
            max_history,
            sequence: Arc::new(AtomicU64::new(0)),
            firehose: None,
        }
    }

    pub fn with_firehose(mut self, firehose: broadcast::Sender<TelemetryEnvelope>) -> Self {
        self.firehose = Some(firehose);
        self
    }

    pub fn mission_id(&self) -> &MissionId {
        &self.mission_id
    }

    /// Wrap, record and broadcast an event
    pub fn publish(&self, event: TelemetryEvent) -> TelemetryEnvelope {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = TelemetryEnvelope::new(self.mission_id.clone(), sequence, event);

        {
            let mut history = self.history.write();
            history.push_back(envelope.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        // No subscribers is not an error
        let _ = self.sender.send(envelope.clone());
        if let Some(firehose) = &self.firehose {
            let _ = firehose.send(envelope.clone());
        }

        debug!(
            mission_id = %self.mission_id,
            sequence,
            kind = envelope.event.kind(),
            "Telemetry published"
        );
        envelope
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEnvelope> {
        self.sender.subscribe()
    }

    /// Most recent `count` events, oldest first
    pub fn recent(&self, count: usize) -> Vec<TelemetryEnvelope> {
        let history = self.history.read();
        let start = history.len().saturating_sub(count);
        history.iter().skip(start).cloned().collect()
    }

    /// Sequence number of the last published event
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

// ============================================================================
// UPSTREAM RELAY
// ============================================================================

/// External consumer of a mission's telemetry
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn connect(&self) -> ChannelResult<()>;

    async fn send(&self, envelope: &TelemetryEnvelope) -> ChannelResult<()>;

    async fn close(&self) {}
}

/// Builds a sink for each mission that starts
pub trait SinkFactory: Send + Sync {
    fn create(&self, mission_id: &MissionId) -> Arc<dyn TelemetrySink>;
}

/// How a relay task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The mission's terminal event was delivered
    Finished,
    Cancelled,
    /// Reconnect attempts exhausted; the stream is dropped
    GaveUp { attempts: u32 },
}

pub struct TelemetryRelay;

impl TelemetryRelay {
    /// Forward `channel` to `sink` until the terminal event is delivered.
    ///
    /// Subscribes before returning, so nothing published after this call
    /// is missed.
    pub fn spawn(
        channel: &TelemetryChannel,
        sink: Arc<dyn TelemetrySink>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> JoinHandle<RelayOutcome> {
        let mission_id = channel.mission_id().clone();
        let stream = BroadcastStream::new(channel.subscribe());

        tokio::spawn(async move {
            let outcome = Self::run(&mission_id, stream, sink.as_ref(), retry, cancel).await;
            sink.close().await;
            info!(mission_id = %mission_id, ?outcome, "Telemetry relay stopped");
            outcome
        })
    }

    async fn run(
        mission_id: &MissionId,
        mut stream: BroadcastStream<TelemetryEnvelope>,
        sink: &dyn TelemetrySink,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> RelayOutcome {
        let mut backoff = retry.backoff();
        let mut connected = false;
        let mut pending: Option<TelemetryEnvelope> = None;

        loop {
            if !connected {
                match bounded(sink.connect()).await {
                    Ok(()) => {
                        connected = true;
                        debug!(mission_id = %mission_id, "Telemetry sink connected");
                    }
                    Err(e) => {
                        let Some(delay) = backoff.next_delay() else {
                            error!(
                                mission_id = %mission_id,
                                error = %e,
                                attempts = backoff.attempts(),
                                "Telemetry sink unreachable, giving up"
                            );
                            return RelayOutcome::GaveUp {
                                attempts: backoff.attempts(),
                            };
                        };
                        warn!(mission_id = %mission_id, error = %e, ?delay, "Telemetry sink connect failed, retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => return RelayOutcome::Cancelled,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                }
            }

            if let Some(envelope) = pending.take() {
                match bounded(sink.send(&envelope)).await {
                    Ok(()) => {
                        backoff.reset();
                        if envelope.event.is_terminal() {
                            return RelayOutcome::Finished;
                        }
                    }
                    Err(e) => {
                        warn!(mission_id = %mission_id, error = %e, "Telemetry send failed, reconnecting");
                        connected = false;
                        pending = Some(envelope);
                        continue;
                    }
                }
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return RelayOutcome::Cancelled,
                item = stream.next() => item,
            };
            match next {
                Some(Ok(envelope)) => pending = Some(envelope),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(mission_id = %mission_id, error = %ChannelError::Lagged(skipped), "Telemetry relay fell behind");
                }
                None => return RelayOutcome::Finished,
            }
        }
    }
}

async fn bounded(call: impl Future<Output = ChannelResult<()>>) -> ChannelResult<()> {
    timeout(SINK_CALL_TIMEOUT, call)
        .await
        .unwrap_or_else(|_| Err(ChannelError::Timeout(SINK_CALL_TIMEOUT)))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mission_core::{MissionStatus, WarningLevel};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        connect_failures: Mutex<u32>,
        connects: Mutex<u32>,
        received: Mutex<Vec<TelemetryEnvelope>>,
    }

    impl RecordingSink {
        fn failing(times: u32) -> Self {
            Self {
                connect_failures: Mutex::new(times),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn connect(&self) -> ChannelResult<()> {
            *self.connects.lock() += 1;
            let mut failures = self.connect_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ChannelError::Connect("refused".into()));
            }
            Ok(())
        }

        async fn send(&self, envelope: &TelemetryEnvelope) -> ChannelResult<()> {
            self.received.lock().push(envelope.clone());
            Ok(())
        }
    }

    fn channel() -> TelemetryChannel {
        TelemetryChannel::new(MissionId::new("m-1"), 64, 5)
    }

    #[test]
    fn test_sequence_starts_at_one_and_increments() {
        let channel = channel();
        let first = channel.publish(TelemetryEvent::warning(WarningLevel::Info, "a"));
        let second = channel.publish(TelemetryEvent::warning(WarningLevel::Info, "b"));

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(channel.last_sequence(), 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let channel = channel();
        for i in 0..8 {
            channel.publish(TelemetryEvent::warning(WarningLevel::Info, format!("event {i}")));
        }

        let recent = channel.recent(100);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent.first().unwrap().sequence, 4);
        assert_eq!(channel.recent(2).last().unwrap().sequence, 8);
    }

    #[tokio::test]
    async fn test_subscribers_and_firehose_receive_events() {
        let (firehose, mut all) = broadcast::channel(16);
        let channel = channel().with_firehose(firehose);
        let mut rx = channel.subscribe();

        channel.publish(TelemetryEvent::MissionComplete {});

        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        assert_eq!(all.recv().await.unwrap().mission_id, MissionId::new("m-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_reconnects_then_delivers_until_terminal() {
        let channel = channel();
        let sink = Arc::new(RecordingSink::failing(2));
        let relay = TelemetryRelay::spawn(
            &channel,
            sink.clone(),
            RetryPolicy::default(),
            CancellationToken::new(),
        );

        channel.publish(TelemetryEvent::warning(WarningLevel::Info, "airborne"));
        channel.publish(TelemetryEvent::error("motor failure", MissionStatus::Failed));
        channel.publish(TelemetryEvent::warning(WarningLevel::Info, "after the end"));

        assert_eq!(relay.await.unwrap(), RelayOutcome::Finished);
        assert_eq!(*sink.connects.lock(), 3);
        let sequences: Vec<u64> = sink.received.lock().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_gives_up_after_bounded_attempts() {
        let channel = channel();
        let sink = Arc::new(RecordingSink::failing(u32::MAX));
        let started = tokio::time::Instant::now();

        let relay = TelemetryRelay::spawn(
            &channel,
            sink.clone(),
            RetryPolicy::default(),
            CancellationToken::new(),
        );

        assert_eq!(relay.await.unwrap(), RelayOutcome::GaveUp { attempts: 5 });
        assert_eq!(*sink.connects.lock(), 6);
        assert!(started.elapsed() >= Duration::from_secs(1 + 2 + 4 + 8 + 8));
    }

    /// Accepts the connection, then never answers a send
    #[derive(Default)]
    struct StalledSink {
        connects: Mutex<u32>,
    }

    #[async_trait]
    impl TelemetrySink for StalledSink {
        async fn connect(&self) -> ChannelResult<()> {
            let attempt = {
                let mut connects = self.connects.lock();
                *connects += 1;
                *connects
            };
            if attempt > 1 {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn send(&self, _envelope: &TelemetryEnvelope) -> ChannelResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sink_times_out_and_gives_up() {
        let channel = channel();
        let sink = Arc::new(StalledSink::default());
        let started = tokio::time::Instant::now();
        let relay = TelemetryRelay::spawn(
            &channel,
            sink.clone(),
            RetryPolicy::default(),
            CancellationToken::new(),
        );

        channel.publish(TelemetryEvent::warning(WarningLevel::Info, "airborne"));

        assert_eq!(relay.await.unwrap(), RelayOutcome::GaveUp { attempts: 5 });
        assert_eq!(*sink.connects.lock(), 7);
        // One stalled send plus six stalled reconnects
        assert!(started.elapsed() >= SINK_CALL_TIMEOUT * 7);
    }

    #[tokio::test]
    async fn test_relay_cancellation() {
        let channel = channel();
        let cancel = CancellationToken::new();
        let relay = TelemetryRelay::spawn(
            &channel,
            Arc::new(RecordingSink::default()),
            RetryPolicy::default(),
            cancel.clone(),
        );

        cancel.cancel();
        assert_eq!(relay.await.unwrap(), RelayOutcome::Cancelled);
    }
}
