#![forbid(unsafe_code)]

// Signaling protocol - message shapes for the WebSocket wire. Requests carry
// a correlation id and are answered exactly once; events are fire-and-forget.

use crate::error::{ErrorKind, ServerError};
use crate::media::TransportDirection;
use crate::registry::channel::ChannelSummary;
use crate::registry::client::{ClientStatus, ClientSummary};
use crate::registry::permissions::{PermissionMatrix, PermissionPatch};
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A client request: correlation id plus the event-tagged body.
#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub body: RequestBody,
}

/// Client-to-server requests.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum RequestBody {
    /// Present the server secret; enrolls as pending (or resumes a
    /// remembered identity when the previous session token is supplied).
    #[serde(rename_all = "camelCase")]
    Authenticate {
        display_name: String,
        server_secret: String,
        #[serde(default)]
        session_token: Option<String>,
    },
    /// Present server and admin secrets; enrolls directly as an active admin.
    #[serde(rename_all = "camelCase")]
    AdminAuthenticate {
        display_name: String,
        server_secret: String,
        admin_secret: String,
    },
    GetRtpCapabilities,
    #[serde(rename_all = "camelCase")]
    CreateTransport { direction: TransportDirection },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        #[serde(default)]
        kind: Option<MediaKind>,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    /// Advisory push-to-talk: resumes the producer when speak is permitted.
    #[serde(rename_all = "camelCase")]
    StartSpeaking { channel_id: String },
    #[serde(rename_all = "camelCase")]
    StopSpeaking { channel_id: String },
    #[serde(rename_all = "camelCase")]
    SetChannelMute { channel_id: String, muted: bool },
    #[serde(rename_all = "camelCase")]
    SetChannelVolume { channel_id: String, volume: f32 },
    #[serde(rename_all = "camelCase")]
    CreateChannel {
        name: String,
        #[serde(default)]
        description: String,
    },
    #[serde(rename_all = "camelCase")]
    UpdateChannel {
        channel_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DeleteChannel { channel_id: String },
    ListChannels,
    ListClients,
    #[serde(rename_all = "camelCase")]
    AuthorizePending {
        client_id: String,
        channels: Vec<String>,
        permissions: PermissionMatrix,
    },
    #[serde(rename_all = "camelCase")]
    RejectPending { client_id: String },
    #[serde(rename_all = "camelCase")]
    UpdatePermissions {
        client_id: String,
        permissions: PermissionPatch,
    },
    #[serde(rename_all = "camelCase")]
    AddToChannel {
        client_id: String,
        channel_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RemoveFromChannel {
        client_id: String,
        channel_id: String,
    },
}

impl RequestBody {
    /// The wire name, for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            RequestBody::Authenticate { .. } => "authenticate",
            RequestBody::AdminAuthenticate { .. } => "adminAuthenticate",
            RequestBody::GetRtpCapabilities => "getRtpCapabilities",
            RequestBody::CreateTransport { .. } => "createTransport",
            RequestBody::ConnectTransport { .. } => "connectTransport",
            RequestBody::Produce { .. } => "produce",
            RequestBody::Consume { .. } => "consume",
            RequestBody::StartSpeaking { .. } => "startSpeaking",
            RequestBody::StopSpeaking { .. } => "stopSpeaking",
            RequestBody::SetChannelMute { .. } => "setChannelMute",
            RequestBody::SetChannelVolume { .. } => "setChannelVolume",
            RequestBody::CreateChannel { .. } => "createChannel",
            RequestBody::UpdateChannel { .. } => "updateChannel",
            RequestBody::DeleteChannel { .. } => "deleteChannel",
            RequestBody::ListChannels => "listChannels",
            RequestBody::ListClients => "listClients",
            RequestBody::AuthorizePending { .. } => "authorizePending",
            RequestBody::RejectPending { .. } => "rejectPending",
            RequestBody::UpdatePermissions { .. } => "updatePermissions",
            RequestBody::AddToChannel { .. } => "addToChannel",
            RequestBody::RemoveFromChannel { .. } => "removeFromChannel",
        }
    }
}

/// Structured error object carried in failed responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Server answer to one request, correlated by id.
#[derive(Debug, Serialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ResponseEnvelope {
    pub fn success<T: Serialize>(id: u64, result: &T) -> Self {
        Self {
            id,
            ok: true,
            result: serde_json::to_value(result).ok(),
            error: None,
        }
    }

    pub fn failure(id: u64, err: &ServerError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(WireError {
                kind: err.kind(),
                message: err.public_message(),
            }),
        }
    }
}

/// Server-to-client events (fire-and-forget, no correlation id).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum ServerEvent {
    /// A new client awaits an admin decision. Admin sessions only.
    #[serde(rename_all = "camelCase")]
    PendingClient {
        client_id: String,
        display_name: String,
    },
    /// The receiving client was accepted and joined its initial channels.
    #[serde(rename_all = "camelCase")]
    Authorized {
        client_id: String,
        channels: Vec<ChannelSummary>,
    },
    /// The receiving client was rejected; the session will close.
    #[serde(rename_all = "camelCase")]
    Rejected { client_id: String },
    #[serde(rename_all = "camelCase")]
    ChannelCreated { channel: ChannelSummary },
    #[serde(rename_all = "camelCase")]
    ChannelUpdated { channel: ChannelSummary },
    #[serde(rename_all = "camelCase")]
    ChannelDeleted { channel_id: String },
    #[serde(rename_all = "camelCase")]
    ClientJoinedChannel {
        channel_id: String,
        client_id: String,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ClientLeftChannel {
        channel_id: String,
        client_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ClientSpeaking {
        channel_id: String,
        client_id: String,
        /// dBFS as reported by the observer.
        volume: i8,
    },
    #[serde(rename_all = "camelCase")]
    ClientStoppedSpeaking {
        channel_id: String,
        client_id: String,
    },
    /// A producer the receiver may consume appeared in one of its channels.
    #[serde(rename_all = "camelCase")]
    ProducerOpened {
        channel_id: String,
        client_id: String,
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: String },
    /// One of the receiver's own transports was closed server-side (DTLS
    /// failure or ICE establishment timeout).
    #[serde(rename_all = "camelCase")]
    TransportClosed { transport_id: String },
    /// A client's session ended. Admin sessions only.
    #[serde(rename_all = "camelCase")]
    Disconnected { client_id: String },
}

/// Result payload for `authenticate` / `adminAuthenticate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    pub client_id: String,
    pub session_token: String,
    pub status: ClientStatus,
    pub admin: bool,
}

/// Result payload for `getRtpCapabilities`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesResult {
    pub rtp_capabilities: RtpCapabilitiesFinalized,
}

/// Result payload for `produce`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResult {
    pub producer_id: String,
}

/// Result payload for `listClients`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientListResult {
    pub clients: Vec<ClientSummary>,
    pub pending: Vec<ClientSummary>,
}

/// Result payload for `listChannels`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelListResult {
    pub channels: Vec<ChannelSummary>,
}

/// Result payload for `setChannelVolume` — the value after clamping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeResult {
    pub volume: f32,
}

/// Empty `ok` result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ack {}

/// Serializes an event once and queues it on a session sender. Full queues
/// drop the frame (slow consumer), closed queues mean the session is gone.
pub fn send_event(sender: &mpsc::Sender<Arc<String>>, event: &ServerEvent) {
    let json = match serde_json::to_string(event) {
        Ok(j) => Arc::new(j),
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            return;
        }
    };
    match sender.try_send(json) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Session queue full, dropping event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Session queue closed, dropping event");
        }
    }
}

/// Serializes an event once and fans it to a set of session senders.
pub fn fan_event<'a, I>(senders: I, event: &ServerEvent)
where
    I: IntoIterator<Item = &'a mpsc::Sender<Arc<String>>>,
{
    let json = match serde_json::to_string(event) {
        Ok(j) => Arc::new(j),
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            return;
        }
    };
    for sender in senders {
        match sender.try_send(Arc::clone(&json)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Session queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_parses_event_and_payload() {
        let raw = r#"{"id":7,"event":"authenticate","payload":{"displayName":"bob","serverSecret":"wire"}}"#;
        let envelope: RequestEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.id, 7);
        match envelope.body {
            RequestBody::Authenticate {
                display_name,
                server_secret,
                session_token,
            } => {
                assert_eq!(display_name, "bob");
                assert_eq!(server_secret, "wire");
                assert!(session_token.is_none());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn payloadless_request_parses() {
        let raw = r#"{"id":1,"event":"getRtpCapabilities"}"#;
        let envelope: RequestEnvelope = serde_json::from_str(raw).unwrap();
        assert!(matches!(envelope.body, RequestBody::GetRtpCapabilities));
    }

    #[test]
    fn unknown_event_is_rejected() {
        let raw = r#"{"id":1,"event":"transcodeVideo","payload":{}}"#;
        assert!(serde_json::from_str::<RequestEnvelope>(raw).is_err());
    }

    #[test]
    fn success_response_has_result_and_no_error() {
        let response = ResponseEnvelope::success(3, &ProduceResult {
            producer_id: "p1".into(),
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["ok"], true);
        assert_eq!(json["result"]["producerId"], "p1");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn failure_response_carries_kind_and_message() {
        let err = ServerError::PermissionDenied("no speak right in ops".into());
        let response = ResponseEnvelope::failure(9, &err);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["kind"], "permissionDenied");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn events_are_tagged_without_id() {
        let event = ServerEvent::ClientSpeaking {
            channel_id: "main".into(),
            client_id: "c1".into(),
            volume: -42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "clientSpeaking");
        assert_eq!(json["payload"]["channelId"], "main");
        assert_eq!(json["payload"]["volume"], -42);
        assert!(json.get("id").is_none());
    }

    #[test]
    fn permission_matrix_round_trips_camel_case() {
        let raw = r#"{"speakToAll":false,"listenTo":{"main":true},"speakTo":{"main":true}}"#;
        let matrix: PermissionMatrix = serde_json::from_str(raw).unwrap();
        assert!(matrix.speak_to["main"]);
        assert!(matrix.listen_to["main"]);
        assert!(!matrix.speak_to_all);
    }
}
