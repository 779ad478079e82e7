#![forbid(unsafe_code)]

// Common types and error handling for the media module

use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Custom error type for media operations.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("transport not found: {0}")]
    TransportNotFound(String),

    #[error("transport already connected: {0}")]
    AlreadyConnected(String),

    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("producer not found: {0}")]
    ProducerNotFound(String),

    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("no media state for client: {0}")]
    ClientNotFound(String),

    #[error("unsupported media kind: {0}")]
    UnsupportedKind(String),

    #[error("cannot consume producer {producer_id} with the offered capabilities")]
    CannotConsume { producer_id: String },

    #[error("worker died: {0}")]
    WorkerDied(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("producer error: {0}")]
    Producer(String),

    #[error("consumer error: {0}")]
    Consumer(String),

    #[error("media setup error: {0}")]
    Setup(String),
}

/// Result type alias for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Direction of a WebRTC transport as requested over signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportDirection {
    Send,
    Receive,
}

/// Transport parameters handed to the client for ICE/DTLS negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<SctpParameters>,
}

impl From<&WebRtcTransport> for TransportParams {
    fn from(transport: &WebRtcTransport) -> Self {
        Self {
            id: transport.id().to_string(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
            sctp_parameters: transport.sctp_parameters(),
        }
    }
}

/// Consumer parameters for the subscriber side of one (producer, client)
/// pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
    pub producer_paused: bool,
}

impl ConsumerParams {
    pub fn from_consumer(consumer: &Consumer, producer_paused: bool) -> Self {
        Self {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            paused: consumer.paused(),
            producer_paused,
        }
    }
}

/// Per-client media state: at most one send and one receive transport, and
/// the producers and consumers hanging off them.
#[derive(Debug)]
pub struct ClientMedia {
    pub client_id: String,
    pub send_transport: Option<WebRtcTransport>,
    pub recv_transport: Option<WebRtcTransport>,
    pub send_connected: bool,
    pub recv_connected: bool,
    /// Ids of transports this client once held that have since closed.
    /// Producing on one of these is a conflict, not an unknown id.
    pub closed_transports: HashSet<String>,
    pub producers: HashMap<String, Producer>,
    pub consumers: HashMap<String, Consumer>,
}

impl ClientMedia {
    pub fn new(client_id: String) -> Self {
        Self {
            client_id,
            send_transport: None,
            recv_transport: None,
            send_connected: false,
            recv_connected: false,
            closed_transports: HashSet::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    /// Closes all media resources. Producers, consumers and transports close
    /// on drop. Returns the ids of the producers that were closed.
    pub fn close_all(&mut self) -> Vec<String> {
        let producer_ids: Vec<String> = self.producers.keys().cloned().collect();
        self.consumers.clear();
        self.producers.clear();
        if let Some(transport) = self.send_transport.take() {
            self.closed_transports.insert(transport.id().to_string());
        }
        if let Some(transport) = self.recv_transport.take() {
            self.closed_transports.insert(transport.id().to_string());
        }
        self.send_connected = false;
        self.recv_connected = false;
        producer_ids
    }
}

/// Asynchronous media notifications drained by the routing core.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// DTLS failed or the ICE watchdog expired: the transport has been closed
    /// and its producers/consumers must cascade.
    TransportFailed {
        client_id: String,
        transport_id: String,
        direction: TransportDirection,
    },
}

/// Active-speaker observer notifications.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// Producers above the threshold in the last interval, loudest first.
    Volumes(Vec<(String, i8)>),
    /// No producer above the threshold in the last interval.
    Silence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_direction_serializes_camel_case() {
        assert_eq!(serde_json::to_string(&TransportDirection::Send).unwrap(), "\"send\"");
        assert_eq!(
            serde_json::to_string(&TransportDirection::Receive).unwrap(),
            "\"receive\""
        );
    }
}
