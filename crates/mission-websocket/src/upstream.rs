//! Upstream relay sink.
//!
//! [`WsUpstreamSink`] pushes one mission's telemetry envelopes to a remote
//! WebSocket endpoint (`{base_url}/{mission_id}`). The link is duplex: the
//! remote side may answer with operator decisions, which are routed back to
//! the mission through the registry.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use mission_core::{ClientMessage, MissionId, TelemetryEnvelope};
use mission_engine::{ChannelError, ChannelResult, MissionRegistry, SinkFactory, TelemetrySink};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsUpstreamSink {
    url: String,
    mission_id: MissionId,
    writer: tokio::sync::Mutex<Option<SplitSink<Socket, Message>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    registry: Option<Weak<MissionRegistry>>,
}

impl WsUpstreamSink {
    pub fn new(base_url: &str, mission_id: MissionId) -> Self {
        Self {
            url: format!("{}/{}", base_url.trim_end_matches('/'), mission_id),
            mission_id,
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            registry: None,
        }
    }

    /// Route decisions received from upstream to this registry
    pub fn with_registry(mut self, registry: Weak<MissionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn spawn_reader(&self, stream: SplitStream<Socket>) -> JoinHandle<()> {
        let mission_id = self.mission_id.clone();
        let registry = self.registry.clone();
        tokio::spawn(read_decisions(stream, mission_id, registry))
    }

    fn stop_reader(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

async fn read_decisions(mut stream: SplitStream<Socket>, mission_id: MissionId, registry: Option<Weak<MissionRegistry>>) {
    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let decision = match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(ClientMessage::Decision(decision)) => decision,
            Ok(other) => {
                debug!(mission_id = %mission_id, ?other, "Ignoring upstream message");
                continue;
            }
            Err(e) => {
                warn!(mission_id = %mission_id, error = %e, "Malformed upstream message");
                continue;
            }
        };

        let Some(registry) = registry.as_ref().and_then(Weak::upgrade) else {
            warn!(mission_id = %mission_id, "Upstream decision dropped, no registry attached");
            continue;
        };
        if let Err(e) = registry.decide(&mission_id, decision).await {
            warn!(mission_id = %mission_id, error = %e, "Upstream decision rejected");
        }
    }
}

#[async_trait]
impl TelemetrySink for WsUpstreamSink {
    async fn connect(&self) -> ChannelResult<()> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let (writer, reader) = socket.split();

        self.stop_reader();
        *self.writer.lock().await = Some(writer);
        *self.reader.lock() = Some(self.spawn_reader(reader));
        info!(mission_id = %self.mission_id, url = %self.url, "Upstream relay connected");
        Ok(())
    }

    async fn send(&self, envelope: &TelemetryEnvelope) -> ChannelResult<()> {
        let json = serde_json::to_string(envelope)?;
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(ChannelError::Send("not connected".to_string()));
        };

        if let Err(e) = sink.send(Message::Text(json.into())).await {
            *writer = None;
            return Err(ChannelError::Send(e.to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.stop_reader();
    }
}

/// Builds a [`WsUpstreamSink`] per mission against one base URL
pub struct WsUpstreamSinkFactory {
    base_url: String,
    registry: Option<Weak<MissionRegistry>>,
}

impl WsUpstreamSinkFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            registry: None,
        }
    }

    pub fn with_registry(mut self, registry: Weak<MissionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

impl SinkFactory for WsUpstreamSinkFactory {
    fn create(&self, mission_id: &MissionId) -> Arc<dyn TelemetrySink> {
        let mut sink = WsUpstreamSink::new(&self.base_url, mission_id.clone());
        if let Some(registry) = &self.registry {
            sink = sink.with_registry(registry.clone());
        }
        Arc::new(sink)
    }
}

// ============================================================================
// TESTS
// ============================================================================
