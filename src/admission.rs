#![forbid(unsafe_code)]

// Admission controller - gates every new session behind the shared server
// secret and the optional admin key. Secret comparison is constant time; an
// unset admin key means the admin path fails closed.

use crate::config::Config;
use crate::error::{ServerError, ServerResult};
use crate::metrics::ServerMetrics;
use crate::registry::channel::ChannelRegistry;
use crate::registry::client::{ClientRegistry, ClientSummary};
use crate::registry::permissions::PermissionMatrix;
use crate::signaling::protocol::{fan_event, send_event, AuthResult, ServerEvent};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{info, warn};

const MAX_DISPLAY_NAME_LEN: usize = 64;

pub struct AdmissionController {
    server_secret: String,
    admin_secret: Option<String>,
    clients: Arc<ClientRegistry>,
    channels: Arc<ChannelRegistry>,
    metrics: ServerMetrics,
}

/// Outcome of a successful authentication, for the session loop.
#[derive(Debug, Clone)]
pub struct Admission {
    pub result: AuthResult,
    /// Channels to wire into the routing core (remembered identities only).
    pub resumed_channels: Vec<String>,
}

fn secrets_match(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

impl AdmissionController {
    pub fn new(
        config: &Config,
        clients: Arc<ClientRegistry>,
        channels: Arc<ChannelRegistry>,
        metrics: ServerMetrics,
    ) -> Self {
        if config.admin_secret.is_none() {
            warn!("ADMIN_SECRET not set — admin authentication is disabled");
        }
        Self {
            server_secret: config.server_secret.clone(),
            admin_secret: config.admin_secret.clone(),
            clients,
            channels,
            metrics,
        }
    }

    fn check_display_name(display_name: &str) -> ServerResult<()> {
        if display_name.is_empty() || display_name.len() > MAX_DISPLAY_NAME_LEN {
            return Err(ServerError::BadRequest(format!(
                "displayName must be 1-{MAX_DISPLAY_NAME_LEN} characters"
            )));
        }
        Ok(())
    }

    /// Regular authentication: enrolls as pending (admins are notified), or
    /// resumes a remembered identity straight to active when the previous
    /// session token matches.
    pub fn authenticate(
        &self,
        display_name: &str,
        server_secret: &str,
        session_token: Option<&str>,
        sender: mpsc::Sender<Arc<String>>,
    ) -> ServerResult<Admission> {
        Self::check_display_name(display_name)?;
        if !secrets_match(&self.server_secret, server_secret) {
            return Err(ServerError::Unauthorized("invalid server secret".into()));
        }

        if let Some(token) = session_token {
            if let Some(resumed) = self.clients.resume(token, sender.clone()) {
                // Channels deleted while the client was away fall off here.
                let mut live = Vec::new();
                for channel_id in &resumed.channels {
                    if self.channels.exists(channel_id) {
                        live.push(channel_id.clone());
                    } else {
                        let _ = self.clients.remove_from_channel(&resumed.id, channel_id);
                    }
                }
                let token = self
                    .clients
                    .session_token_of(&resumed.id)
                    .unwrap_or_default();
                return Ok(Admission {
                    result: AuthResult {
                        client_id: resumed.id,
                        session_token: token,
                        status: crate::registry::client::ClientStatus::Active,
                        admin: resumed.admin,
                    },
                    resumed_channels: live,
                });
            }
        }

        let enrolled = self.clients.enroll_pending(display_name, sender);
        let token = self
            .clients
            .session_token_of(&enrolled.id)
            .unwrap_or_default();
        self.notify_admins_pending(&enrolled);
        Ok(Admission {
            result: AuthResult {
                client_id: enrolled.id,
                session_token: token,
                status: enrolled.status,
                admin: false,
            },
            resumed_channels: Vec::new(),
        })
    }

    /// Admin authentication: both secrets must match; the admin path is
    /// disabled entirely when no admin key is configured.
    pub fn admin_authenticate(
        &self,
        display_name: &str,
        server_secret: &str,
        admin_secret: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> ServerResult<Admission> {
        Self::check_display_name(display_name)?;
        if !secrets_match(&self.server_secret, server_secret) {
            return Err(ServerError::Unauthorized("invalid server secret".into()));
        }
        let expected = self
            .admin_secret
            .as_deref()
            .ok_or_else(|| ServerError::Unauthorized("admin authentication is disabled".into()))?;
        if !secrets_match(expected, admin_secret) {
            return Err(ServerError::Unauthorized("invalid admin secret".into()));
        }

        let enrolled = self.clients.enroll_admin(display_name, sender);
        let token = self
            .clients
            .session_token_of(&enrolled.id)
            .unwrap_or_default();
        info!("Admin session for {} ({})", display_name, enrolled.id);
        Ok(Admission {
            result: AuthResult {
                client_id: enrolled.id,
                session_token: token,
                status: enrolled.status,
                admin: true,
            },
            resumed_channels: Vec::new(),
        })
    }

    /// Validates and applies an admin accept decision on the registries. The
    /// caller wires the memberships into the routing core and emits
    /// `authorized`.
    pub fn authorize_pending(
        &self,
        client_id: &str,
        channels: &[String],
        permissions: PermissionMatrix,
    ) -> ServerResult<ClientSummary> {
        for channel_id in channels {
            if !self.channels.exists(channel_id) {
                return Err(ServerError::NotFound(format!("channel {channel_id}")));
            }
        }
        let summary = self.clients.authorize(client_id, channels, permissions)?;
        self.metrics.inc_clients_authorized();
        Ok(summary)
    }

    /// Applies an admin reject decision and tells the client.
    pub fn reject_pending(&self, client_id: &str) -> ServerResult<()> {
        let sender = self.clients.sender_of(client_id);
        self.clients.reject(client_id)?;
        self.metrics.inc_clients_rejected();
        if let Some(sender) = sender {
            send_event(
                &sender,
                &ServerEvent::Rejected {
                    client_id: client_id.to_string(),
                },
            );
        }
        Ok(())
    }

    fn notify_admins_pending(&self, enrolled: &ClientSummary) {
        let admins = self.clients.admin_senders();
        fan_event(
            admins.iter(),
            &ServerEvent::PendingClient {
                client_id: enrolled.id.clone(),
                display_name: enrolled.display_name.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::net::IpAddr;
    use std::time::Duration;

    fn test_config(admin_secret: Option<&str>) -> Config {
        Config {
            server_secret: "wire".to_string(),
            admin_secret: admin_secret.map(str::to_string),
            media_listen_ip: "0.0.0.0".parse::<IpAddr>().unwrap(),
            media_announced_ip: None,
            media_port_min: 10_000,
            media_port_max: 59_999,
            signaling_port: 5000,
            log_level: crate::config::LogLevel::Info,
            request_timeout: Duration::from_secs(10),
            ice_timeout: Duration::from_secs(20),
            speaking_threshold: -70,
            speaking_interval: Duration::from_millis(800),
            speaking_hold_off: Duration::from_millis(800),
            max_connections: 100,
        }
    }

    fn controller(admin_secret: Option<&str>) -> AdmissionController {
        AdmissionController::new(
            &test_config(admin_secret),
            Arc::new(ClientRegistry::new()),
            Arc::new(ChannelRegistry::new()),
            ServerMetrics::new(),
        )
    }

    fn sender() -> mpsc::Sender<Arc<String>> {
        mpsc::channel(8).0
    }

    #[test]
    fn wrong_server_secret_is_unauthorized() {
        let admission = controller(Some("key"));
        let err = admission
            .authenticate("bob", "not-wire", None, sender())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn authenticate_enrolls_pending() {
        let admission = controller(Some("key"));
        let outcome = admission.authenticate("bob", "wire", None, sender()).unwrap();
        assert_eq!(
            outcome.result.status,
            crate::registry::client::ClientStatus::Pending
        );
        assert!(!outcome.result.admin);
        assert!(!outcome.result.session_token.is_empty());
        assert_eq!(admission.clients.pending_list().len(), 1);
    }

    #[test]
    fn admin_path_fails_closed_without_key() {
        let admission = controller(None);
        let err = admission
            .admin_authenticate("root", "wire", "anything", sender())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn admin_authenticate_goes_straight_to_active() {
        let admission = controller(Some("key"));
        let outcome = admission
            .admin_authenticate("stage", "wire", "key", sender())
            .unwrap();
        assert!(outcome.result.admin);
        assert_eq!(
            outcome.result.status,
            crate::registry::client::ClientStatus::Active
        );
    }

    #[test]
    fn wrong_admin_secret_is_unauthorized() {
        let admission = controller(Some("key"));
        let err = admission
            .admin_authenticate("stage", "wire", "not-key", sender())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn pending_admins_are_notified() {
        let admission = controller(Some("key"));
        let (admin_tx, mut admin_rx) = mpsc::channel(8);
        admission
            .admin_authenticate("stage", "wire", "key", admin_tx)
            .unwrap();

        admission.authenticate("bob", "wire", None, sender()).unwrap();

        let frame = admin_rx.try_recv().expect("admin should receive pendingClient");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "pendingClient");
        assert_eq!(value["payload"]["displayName"], "bob");
    }

    #[test]
    fn authorize_unknown_channel_is_not_found() {
        let admission = controller(Some("key"));
        let outcome = admission.authenticate("bob", "wire", None, sender()).unwrap();
        let err = admission
            .authorize_pending(
                &outcome.result.client_id,
                &["ghost".to_string()],
                PermissionMatrix::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        // Still pending — nothing was applied.
        assert_eq!(admission.clients.pending_list().len(), 1);
    }

    #[test]
    fn reject_notifies_the_client() {
        let admission = controller(Some("key"));
        let (tx, mut rx) = mpsc::channel(8);
        let outcome = admission.authenticate("bob", "wire", None, tx).unwrap();
        admission.reject_pending(&outcome.result.client_id).unwrap();

        let frame = rx.try_recv().expect("client should receive rejected");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "rejected");
    }

    #[test]
    fn resume_requires_matching_token() {
        let admission = controller(Some("key"));
        let outcome = admission.authenticate("bob", "wire", None, sender()).unwrap();
        let id = outcome.result.client_id.clone();
        admission
            .authorize_pending(&id, &["main".to_string()], PermissionMatrix::default())
            .unwrap();
        let token = outcome.result.session_token;
        admission.clients.close(&id);

        // Wrong token: brand new pending enrollment.
        let fresh = admission
            .authenticate("bob", "wire", Some("bogus"), sender())
            .unwrap();
        assert_ne!(fresh.result.client_id, id);
        assert_eq!(
            fresh.result.status,
            crate::registry::client::ClientStatus::Pending
        );

        // Right token: same identity, active again, memberships to re-wire.
        let resumed = admission
            .authenticate("bob", "wire", Some(&token), sender())
            .unwrap();
        assert_eq!(resumed.result.client_id, id);
        assert_eq!(
            resumed.result.status,
            crate::registry::client::ClientStatus::Active
        );
        assert_eq!(resumed.resumed_channels, vec!["main".to_string()]);
    }
}
