#![forbid(unsafe_code)]

// WebSocket connection handler - one task per session, requests processed
// strictly in arrival order, each answered with its correlation id. The
// session walks NEW -> PENDING -> ACTIVE (or straight to ACTIVE for admins
// and remembered identities); everything else is Unauthorized until then.

use super::protocol::{
    send_event, Ack, CapabilitiesResult, ChannelListResult, ClientListResult, ProduceResult,
    RequestBody, RequestEnvelope, ResponseEnvelope, ServerEvent, VolumeResult,
};
use super::AppState;
use crate::error::{ServerError, ServerResult};
use crate::media::ConsumerParams;
use crate::registry::channel::SYSTEM_CHANNEL_ID;
use crate::registry::client::ClientStatus;
use crate::registry::permissions::Direction;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use mediasoup::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

/// Bounded channel capacity per session. Events queued beyond this are stale
/// for a live intercom — drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout — close the session if nothing arrives within this duration.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Authentication state of one signaling session.
#[derive(Debug, Clone)]
enum SessionState {
    New,
    Pending { client_id: String },
    Active { client_id: String, admin: bool },
}

impl SessionState {
    fn client_id(&self) -> Option<&str> {
        match self {
            SessionState::New => None,
            SessionState::Pending { client_id } | SessionState::Active { client_id, .. } => {
                Some(client_id)
            }
        }
    }
}

/// Handles a single WebSocket session.
pub async fn handle_connection(socket: WebSocket, state: Arc<AppState>, _permit: OwnedSemaphorePermit) {
    state.metrics.inc_connections_total();
    let _conn_guard = state.metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded queue of pre-serialized frames for this session.
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_metrics = state.metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
    });

    let mut session = SessionState::New;

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout, closing session");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                state.metrics.inc_messages_received();

                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for session {:?}", session.client_id());
                    }
                    continue;
                }

                let envelope: RequestEnvelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!("Malformed request: {}", e);
                        state.metrics.inc_errors();
                        let response = ResponseEnvelope::failure(
                            0,
                            &ServerError::BadRequest(format!("malformed request: {e}")),
                        );
                        queue_response(&tx, &response);
                        continue;
                    }
                };

                let request_id = envelope.id;
                let request_name = envelope.body.name();
                let start = Instant::now();

                let outcome = match tokio::time::timeout(
                    state.config.request_timeout,
                    dispatch(&state, &session, envelope.body, &tx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Request {} ({}) timed out", request_id, request_name);
                        Err(ServerError::Timeout)
                    }
                };
                state.metrics.observe_request_handling(start.elapsed());

                let response = match outcome {
                    Ok(Outcome { result, new_state }) => {
                        if let Some(new_state) = new_state {
                            session = new_state;
                        }
                        ResponseEnvelope {
                            id: request_id,
                            ok: true,
                            result: Some(result),
                            error: None,
                        }
                    }
                    Err(err) => {
                        state.metrics.inc_errors();
                        debug!("Request {} ({}) failed: {}", request_id, request_name, err);
                        ResponseEnvelope::failure(request_id, &err)
                    }
                };
                queue_response(&tx, &response);
            }
            Message::Close(_) => {
                debug!("Session closed by client");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                warn!("Unexpected message type on signaling socket");
            }
        }
    }

    // Disconnect cascade: close media, drop routing entries, leave channels.
    if let Some(client_id) = session.client_id() {
        info!("Session for client {} ended, cascading", client_id);
        state.routing.client_disconnected(client_id).await;
    }

    drop(tx);
    let _ = send_task.await;
}

fn queue_response(tx: &mpsc::Sender<Arc<String>>, response: &ResponseEnvelope) {
    match serde_json::to_string(response) {
        Ok(json) => {
            if tx.try_send(Arc::new(json)).is_err() {
                debug!("Session queue unavailable, dropping response");
            }
        }
        Err(e) => warn!("Failed to serialize response: {}", e),
    }
}

struct Outcome {
    result: serde_json::Value,
    new_state: Option<SessionState>,
}

fn ok<T: serde::Serialize>(value: &T) -> ServerResult<Outcome> {
    Ok(Outcome {
        result: serde_json::to_value(value)
            .map_err(|e| ServerError::Internal(format!("serialize result: {e}")))?,
        new_state: None,
    })
}

fn ok_with_state<T: serde::Serialize>(value: &T, state: SessionState) -> ServerResult<Outcome> {
    Ok(Outcome {
        result: serde_json::to_value(value)
            .map_err(|e| ServerError::Internal(format!("serialize result: {e}")))?,
        new_state: Some(state),
    })
}

async fn dispatch(
    state: &AppState,
    session: &SessionState,
    body: RequestBody,
    tx: &mpsc::Sender<Arc<String>>,
) -> ServerResult<Outcome> {
    match body {
        // === Authentication (NEW only) ===
        RequestBody::Authenticate {
            display_name,
            server_secret,
            session_token,
        } => {
            if !matches!(session, SessionState::New) {
                return Err(ServerError::Conflict("session already authenticated".into()));
            }
            let admission = state.admission.authenticate(
                &display_name,
                &server_secret,
                session_token.as_deref(),
                tx.clone(),
            )?;
            let result = admission.result.clone();
            let new_state = match result.status {
                ClientStatus::Active => {
                    // Remembered identity: re-wire surviving memberships.
                    for channel_id in &admission.resumed_channels {
                        state.routing.join_channel(&result.client_id, channel_id);
                    }
                    SessionState::Active {
                        client_id: result.client_id.clone(),
                        admin: result.admin,
                    }
                }
                _ => SessionState::Pending {
                    client_id: result.client_id.clone(),
                },
            };
            ok_with_state(&result, new_state)
        }

        RequestBody::AdminAuthenticate {
            display_name,
            server_secret,
            admin_secret,
        } => {
            if !matches!(session, SessionState::New) {
                return Err(ServerError::Conflict("session already authenticated".into()));
            }
            let admission = state.admission.admin_authenticate(
                &display_name,
                &server_secret,
                &admin_secret,
                tx.clone(),
            )?;
            let result = admission.result.clone();
            // Admin consoles sit on the system channel.
            state
                .routing
                .clients()
                .add_to_channel(&result.client_id, SYSTEM_CHANNEL_ID)?;
            state.routing.join_channel(&result.client_id, SYSTEM_CHANNEL_ID);
            ok_with_state(
                &result,
                SessionState::Active {
                    client_id: result.client_id.clone(),
                    admin: true,
                },
            )
        }

        // === Everything else requires ACTIVE ===
        body => {
            let (client_id, admin, promoted) = match session {
                SessionState::Active { client_id, admin } => (client_id.clone(), *admin, false),
                // The admin decision lands in the registry first; a pending
                // session is promoted here on its next request.
                SessionState::Pending { client_id }
                    if state.routing.clients().status_of(client_id)
                        == Some(ClientStatus::Active) =>
                {
                    let admin = state.routing.clients().is_admin(client_id);
                    (client_id.clone(), admin, true)
                }
                _ => {
                    return Err(ServerError::Unauthorized(
                        "not authorized in the current session state".into(),
                    ))
                }
            };
            let mut outcome = dispatch_active(state, &client_id, admin, body, tx).await?;
            if promoted && outcome.new_state.is_none() {
                outcome.new_state = Some(SessionState::Active { client_id, admin });
            }
            Ok(outcome)
        }
    }
}

async fn dispatch_active(
    state: &AppState,
    client_id: &str,
    admin: bool,
    body: RequestBody,
    _tx: &mpsc::Sender<Arc<String>>,
) -> ServerResult<Outcome> {
    let routing = &state.routing;
    let media = routing.media();
    let clients = routing.clients();
    let channels = routing.channels();

    let require_admin = || -> ServerResult<()> {
        if admin {
            Ok(())
        } else {
            Err(ServerError::PermissionDenied("admin role required".into()))
        }
    };

    match body {
        // Handled before active dispatch; an active session re-authenticating
        // is a conflict.
        RequestBody::Authenticate { .. } | RequestBody::AdminAuthenticate { .. } => {
            Err(ServerError::Conflict("session already authenticated".into()))
        }

        // === Media negotiation ===
        RequestBody::GetRtpCapabilities => ok(&CapabilitiesResult {
            rtp_capabilities: media.rtp_capabilities(),
        }),

        RequestBody::CreateTransport { direction } => {
            let params = media.create_transport(client_id, direction).await?;
            ok(&params)
        }

        RequestBody::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            media
                .connect_transport(client_id, &transport_id, dtls_parameters)
                .await?;
            ok(&Ack {})
        }

        RequestBody::Produce {
            transport_id,
            kind,
            rtp_parameters,
        } => {
            let kind = kind.unwrap_or(MediaKind::Audio);
            if kind != MediaKind::Audio {
                return Err(ServerError::BadRequest(format!(
                    "only audio can be produced, got {kind:?}"
                )));
            }
            // Speak right in at least one channel is required before the
            // media worker is touched.
            if clients.speak_channels(client_id).is_empty() {
                return Err(ServerError::PermissionDenied(
                    "no channel with a speak right".into(),
                ));
            }
            // One audio stream per client.
            if media.producer_of(client_id).await.is_some() {
                return Err(ServerError::Conflict("already producing".into()));
            }
            let producer = media
                .produce(client_id, &transport_id, kind, rtp_parameters)
                .await?;
            let producer_id = producer.id().to_string();
            routing.register_producer(client_id, &producer_id);
            ok(&ProduceResult { producer_id })
        }

        RequestBody::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => {
            if !routing.producer_known(&producer_id) {
                return Err(ServerError::NotFound(format!("producer {producer_id}")));
            }
            if routing.permitting_channels(&producer_id, client_id).is_empty() {
                return Err(ServerError::PermissionDenied(
                    "no shared channel with a listen right for this producer".into(),
                ));
            }
            if routing.has_pair(&producer_id, client_id) {
                return Err(ServerError::Conflict(
                    "already consuming this producer".into(),
                ));
            }
            let parsed: ProducerId = producer_id
                .parse()
                .map_err(|_| ServerError::BadRequest(format!("invalid producer id: {producer_id}")))?;
            let owner = routing
                .producer_owner(&producer_id)
                .ok_or_else(|| ServerError::NotFound(format!("producer {producer_id}")))?;
            let producer_paused = media.producer_paused(&owner, &producer_id).await.unwrap_or(false);

            let consumer = media
                .consume(client_id, &transport_id, parsed, rtp_capabilities, false)
                .await?;
            let consumer_id = consumer.id().to_string();
            if !routing.record_consumer(&consumer_id, &producer_id, client_id) {
                // Lost a race against a concurrent consume of the same pair.
                media.close_consumer(client_id, &consumer_id).await;
                return Err(ServerError::Conflict(
                    "already consuming this producer".into(),
                ));
            }
            ok(&ConsumerParams::from_consumer(&consumer, producer_paused))
        }

        // === Advisory push-to-talk ===
        RequestBody::StartSpeaking { channel_id } => {
            if clients.allow(client_id, &channel_id, Direction::Speak) {
                if let Some(producer_id) = media.producer_of(client_id).await {
                    media.resume_producer(client_id, &producer_id).await?;
                }
            }
            ok(&Ack {})
        }

        RequestBody::StopSpeaking { channel_id } => {
            if clients.allow(client_id, &channel_id, Direction::Speak) {
                if let Some(producer_id) = media.producer_of(client_id).await {
                    media.pause_producer(client_id, &producer_id).await?;
                }
            }
            ok(&Ack {})
        }

        // === Listen-side user settings ===
        RequestBody::SetChannelMute { channel_id, muted } => {
            clients.set_channel_mute(client_id, &channel_id, muted)?;
            ok(&Ack {})
        }

        RequestBody::SetChannelVolume { channel_id, volume } => {
            let applied = clients.set_channel_volume(client_id, &channel_id, volume)?;
            ok(&VolumeResult { volume: applied })
        }

        RequestBody::ListChannels => ok(&ChannelListResult {
            channels: channels.list(),
        }),

        // === Admin: channel CRUD ===
        RequestBody::CreateChannel { name, description } => {
            require_admin()?;
            let summary = channels.create(&name, &description)?;
            state.metrics.inc_channels_created();
            routing.fan_to_active(&ServerEvent::ChannelCreated {
                channel: summary.clone(),
            });
            ok(&summary)
        }

        RequestBody::UpdateChannel {
            channel_id,
            name,
            description,
        } => {
            require_admin()?;
            let summary =
                channels.update_metadata(&channel_id, name.as_deref(), description.as_deref())?;
            routing.fan_to_active(&ServerEvent::ChannelUpdated {
                channel: summary.clone(),
            });
            ok(&summary)
        }

        RequestBody::DeleteChannel { channel_id } => {
            require_admin()?;
            routing.delete_channel(&channel_id).await?;
            ok(&Ack {})
        }

        RequestBody::ListClients => {
            require_admin()?;
            ok(&ClientListResult {
                clients: clients.list(),
                pending: clients.pending_list(),
            })
        }

        // === Admin: admission decisions ===
        RequestBody::AuthorizePending {
            client_id: target,
            channels: channel_ids,
            permissions,
        } => {
            require_admin()?;
            state
                .admission
                .authorize_pending(&target, &channel_ids, permissions)?;
            let mut summaries = Vec::with_capacity(channel_ids.len());
            for channel_id in &channel_ids {
                routing.join_channel(&target, channel_id);
                if let Ok(summary) = channels.get(channel_id) {
                    summaries.push(summary);
                }
            }
            if let Some(sender) = clients.sender_of(&target) {
                send_event(
                    &sender,
                    &ServerEvent::Authorized {
                        client_id: target.clone(),
                        channels: summaries,
                    },
                );
            }
            ok(&Ack {})
        }

        RequestBody::RejectPending { client_id: target } => {
            require_admin()?;
            state.admission.reject_pending(&target)?;
            ok(&Ack {})
        }

        // === Admin: membership and permissions ===
        RequestBody::UpdatePermissions {
            client_id: target,
            permissions,
        } => {
            require_admin()?;
            routing.apply_permissions(&target, &permissions).await?;
            ok(&Ack {})
        }

        RequestBody::AddToChannel {
            client_id: target,
            channel_id,
        } => {
            require_admin()?;
            if !channels.exists(&channel_id) {
                return Err(ServerError::NotFound(format!("channel {channel_id}")));
            }
            clients.add_to_channel(&target, &channel_id)?;
            routing.join_channel(&target, &channel_id);
            ok(&Ack {})
        }

        RequestBody::RemoveFromChannel {
            client_id: target,
            channel_id,
        } => {
            require_admin()?;
            clients.remove_from_channel(&target, &channel_id)?;
            routing.leave_channel(&target, &channel_id).await;
            ok(&Ack {})
        }
    }
}
