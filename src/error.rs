#![forbid(unsafe_code)]

// Wire-visible error taxonomy. Every failed request answers with one of
// these kinds; anything unexpected collapses to `Internal` with the detail
// logged server-side only.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to clients in signaling responses.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("request timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

/// Result type alias for request handlers.
pub type ServerResult<T> = Result<T, ServerError>;

/// Stable kind strings, matched by client UIs for localized messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Unauthorized,
    NotFound,
    BadRequest,
    PermissionDenied,
    Conflict,
    UnsupportedCodec,
    Timeout,
    Internal,
    Fatal,
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Unauthorized(_) => ErrorKind::Unauthorized,
            ServerError::NotFound(_) => ErrorKind::NotFound,
            ServerError::BadRequest(_) => ErrorKind::BadRequest,
            ServerError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ServerError::Conflict(_) => ErrorKind::Conflict,
            ServerError::UnsupportedCodec(_) => ErrorKind::UnsupportedCodec,
            ServerError::Timeout => ErrorKind::Timeout,
            ServerError::Internal(_) => ErrorKind::Internal,
            ServerError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Message safe to show to the client. Internal detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ServerError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<crate::media::MediaError> for ServerError {
    fn from(err: crate::media::MediaError) -> Self {
        use crate::media::MediaError;
        match err {
            MediaError::TransportNotFound(id) => ServerError::NotFound(format!("transport {id}")),
            MediaError::ProducerNotFound(id) => ServerError::NotFound(format!("producer {id}")),
            MediaError::ConsumerNotFound(id) => ServerError::NotFound(format!("consumer {id}")),
            MediaError::ClientNotFound(id) => ServerError::NotFound(format!("client media {id}")),
            MediaError::TransportClosed(id) => ServerError::Conflict(format!("transport {id} is closed")),
            MediaError::AlreadyConnected(id) => {
                ServerError::Conflict(format!("transport {id} is already connected"))
            }
            MediaError::UnsupportedKind(kind) => {
                ServerError::BadRequest(format!("unsupported media kind: {kind}"))
            }
            MediaError::CannotConsume { producer_id } => {
                ServerError::UnsupportedCodec(format!("cannot consume producer {producer_id}"))
            }
            MediaError::WorkerDied(reason) => ServerError::Fatal(reason),
            // Transport/connection failures surface as conflicts on the
            // in-flight call; async close events follow separately.
            MediaError::Transport(detail) => ServerError::Conflict(detail),
            // Negotiation failures: the offered parameters were no good.
            MediaError::Producer(detail) | MediaError::Consumer(detail) => {
                ServerError::BadRequest(detail)
            }
            MediaError::Setup(detail) => {
                tracing::error!("media setup failure: {detail}");
                ServerError::Internal(detail)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_camel_case() {
        let json = serde_json::to_string(&ErrorKind::PermissionDenied).unwrap();
        assert_eq!(json, "\"permissionDenied\"");
        let json = serde_json::to_string(&ErrorKind::UnsupportedCodec).unwrap();
        assert_eq!(json, "\"unsupportedCodec\"");
    }

    #[test]
    fn internal_detail_is_not_exposed() {
        let err = ServerError::Internal("worker ipc pipe broke".to_string());
        assert_eq!(err.public_message(), "internal error");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn non_internal_messages_pass_through() {
        let err = ServerError::NotFound("channel ops".to_string());
        assert_eq!(err.public_message(), "not found: channel ops");
    }
}
