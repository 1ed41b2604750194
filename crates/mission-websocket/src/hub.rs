//! WebSocket connection hub
//!
//! Tracks the clients attached to each mission stream and turns client
//! messages into mission control calls on the registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mission_core::{
    ClientMessage, DroneState, MissionCommand, MissionId, ServerMessage, TelemetryEnvelope,
};
use mission_engine::MissionRegistry;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{WsError, WsResult};

/// WebSocket connection hub
pub struct MissionHub {
    registry: Arc<MissionRegistry>,
    clients: DashMap<Uuid, ClientState>,
    /// Messages written to clients
    message_count: AtomicUsize,
}

/// State for a connected client
#[derive(Debug)]
struct ClientState {
    mission_id: MissionId,
    connected_at: DateTime<Utc>,
}

impl MissionHub {
    pub fn new(registry: Arc<MissionRegistry>) -> Self {
        Self {
            registry,
            clients: DashMap::new(),
            message_count: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<MissionRegistry> {
        &self.registry
    }

    /// Attach a client to a mission stream.
    ///
    /// Subscribes before reading the snapshot, so no event published after
    /// the snapshot is missed.
    pub fn register_client(
        &self,
        client_id: Uuid,
        mission_id: &MissionId,
    ) -> WsResult<(DroneState, broadcast::Receiver<TelemetryEnvelope>)> {
        let events = self.registry.subscribe(mission_id)?;
        let state = self.registry.get_status(mission_id)?;

        self.clients.insert(
            client_id,
            ClientState {
                mission_id: mission_id.clone(),
                connected_at: Utc::now(),
            },
        );
        info!(
            %client_id,
            mission_id = %mission_id,
            total = self.clients.len(),
            "Client registered"
        );
        Ok((state, events))
    }

    pub fn unregister_client(&self, client_id: Uuid) {
        if let Some((_, client)) = self.clients.remove(&client_id) {
            let connected_for = Utc::now().signed_duration_since(client.connected_at);
            info!(
                %client_id,
                mission_id = %client.mission_id,
                connected_secs = connected_for.num_seconds(),
                remaining = self.clients.len(),
                "Client unregistered"
            );
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Clients attached to one mission
    pub fn mission_client_count(&self, mission_id: &MissionId) -> usize {
        self.clients.iter().filter(|c| &c.mission_id == mission_id).count()
    }

    pub fn is_client_connected(&self, client_id: Uuid) -> bool {
        self.clients.contains_key(&client_id)
    }

    pub fn record_sent(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Total messages written to clients
    pub fn message_count(&self) -> usize {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Handle a text frame from a client; returns the reply to send, if any
    pub async fn handle_client_message(
        &self,
        client_id: Uuid,
        mission_id: &MissionId,
        text: &str,
    ) -> Option<ServerMessage> {
        let result = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.dispatch(client_id, mission_id, message).await,
            Err(e) => Err(WsError::from(e)),
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                debug!(%client_id, mission_id = %mission_id, error = %e, "Client message rejected");
                Some(ServerMessage::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    async fn dispatch(
        &self,
        client_id: Uuid,
        mission_id: &MissionId,
        message: ClientMessage,
    ) -> WsResult<Option<ServerMessage>> {
        match message {
            ClientMessage::Decision(decision) => {
                info!(
                    %client_id,
                    mission_id = %mission_id,
                    approval_id = %decision.approval_id,
                    decision = %decision.decision,
                    "Operator decision received"
                );
                self.registry.decide(mission_id, decision).await?;
                Ok(Some(ack(format!("Decision {} recorded", decision.decision))))
            }
            ClientMessage::Command { command } => {
                info!(%client_id, mission_id = %mission_id, ?command, "Mission command received");
                match command {
                    MissionCommand::Start => self.registry.start_mission(mission_id).await?,
                    MissionCommand::Pause => self.registry.pause_mission(mission_id).await?,
                    MissionCommand::Resume => self.registry.resume_mission(mission_id).await?,
                    MissionCommand::Abort => self.registry.abort_mission(mission_id).await?,
                }
                Ok(Some(ack(format!("{command:?} accepted"))))
            }
            ClientMessage::RequestState => {
                let state = self.registry.get_status(mission_id)?;
                Ok(Some(ServerMessage::Connected { state }))
            }
            ClientMessage::Pong { timestamp } => {
                debug!(%client_id, timestamp, "Pong");
                Ok(None)
            }
        }
    }
}

fn ack(message: String) -> ServerMessage {
    ServerMessage::Ack { message }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mission_core::{MissionKind, MissionPlaybook, MissionStatus, Waypoint};
    use mission_engine::{EngineConfig, SimulatedBackendFactory};

    async fn hub_with_mission() -> (MissionHub, MissionId) {
        let registry = Arc::new(MissionRegistry::new(
            EngineConfig::default(),
            Arc::new(SimulatedBackendFactory::new()),
        ));
        let playbook = MissionPlaybook::new("m-1", MissionKind::Delivery)
            .with_waypoint(Waypoint::new(49.588, 22.676, 100.0));
        let id = registry.create_mission(playbook).await.unwrap();
        (MissionHub::new(registry), id)
    }

    #[tokio::test]
    async fn test_client_registration() {
        let (hub, id) = hub_with_mission().await;
        let client = Uuid::new_v4();

        let (state, _rx) = hub.register_client(client, &id).unwrap();
        assert_eq!(state.phase, MissionStatus::Planned);
        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.mission_client_count(&id), 1);
        assert!(hub.is_client_connected(client));

        hub.unregister_client(client);
        assert_eq!(hub.client_count(), 0);
        assert!(!hub.is_client_connected(client));
    }

    #[tokio::test]
    async fn test_unknown_mission_rejected() {
        let (hub, _) = hub_with_mission().await;
        let err = hub
            .register_client(Uuid::new_v4(), &MissionId::new("missing"))
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_gets_error_reply() {
        let (hub, id) = hub_with_mission().await;

        let reply = hub.handle_client_message(Uuid::new_v4(), &id, "not json").await;
        assert!(matches!(reply, Some(ServerMessage::Error { code, .. }) if code == "bad_request"));
    }

    #[tokio::test]
    async fn test_pause_before_start_is_conflict() {
        let (hub, id) = hub_with_mission().await;
        let text = r#"{"type":"command","payload":{"command":"pause"}}"#;

        let reply = hub.handle_client_message(Uuid::new_v4(), &id, text).await;
        assert!(matches!(reply, Some(ServerMessage::Error { code, .. }) if code == "conflict"));
    }

    #[tokio::test]
    async fn test_abort_command_acknowledged() {
        let (hub, id) = hub_with_mission().await;
        let text = r#"{"type":"command","payload":{"command":"abort"}}"#;

        let reply = hub.handle_client_message(Uuid::new_v4(), &id, text).await;
        assert!(matches!(reply, Some(ServerMessage::Ack { .. })));
        assert_eq!(
            hub.registry().get_status(&id).unwrap().phase,
            MissionStatus::Aborted
        );
    }

    #[tokio::test]
    async fn test_request_state_and_pong() {
        let (hub, id) = hub_with_mission().await;
        let client = Uuid::new_v4();

        let reply = hub
            .handle_client_message(client, &id, r#"{"type":"request_state"}"#)
            .await;
        assert!(matches!(reply, Some(ServerMessage::Connected { .. })));

        let reply = hub
            .handle_client_message(client, &id, r#"{"type":"pong","payload":{"timestamp":1}}"#)
            .await;
        assert!(reply.is_none());
    }
}
