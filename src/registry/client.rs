#![forbid(unsafe_code)]

// Client registry — identity, session handle, memberships, permission matrix
// and per-channel user settings for every client, plus the pending queue of
// sessions awaiting an admin decision. Closed clients are remembered so a
// reconnecting identity can be promoted straight back to active.

use crate::error::{ServerError, ServerResult};
use crate::registry::permissions::{Direction, PermissionMatrix, PermissionPatch};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientStatus {
    Pending,
    Active,
    Closed,
}

/// The live signaling connection for a client: the session token handed out
/// at authentication and the bounded queue of pre-serialized JSON frames.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub token: String,
    pub sender: mpsc::Sender<Arc<String>>,
}

/// Per-channel listen-side preferences. These never touch producer state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSettings {
    pub muted: bool,
    pub volume: f32,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            muted: false,
            volume: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: String,
    pub display_name: String,
    pub session: Option<SessionHandle>,
    pub admin: bool,
    pub status: ClientStatus,
    /// Ordered set of channel ids, in join order.
    pub channels: Vec<String>,
    pub permissions: PermissionMatrix,
    pub settings: HashMap<String, ChannelSettings>,
}

/// Sanitized snapshot for `listClients` and admin events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: String,
    pub display_name: String,
    pub status: ClientStatus,
    pub admin: bool,
    pub channels: Vec<String>,
}

impl ClientRecord {
    fn summary(&self) -> ClientSummary {
        ClientSummary {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            status: self.status,
            admin: self.admin,
            channels: self.channels.clone(),
        }
    }
}

struct Inner {
    clients: HashMap<String, ClientRecord>,
    /// Pending client ids in enrollment order.
    pending: Vec<String>,
}

pub struct ClientRegistry {
    inner: RwLock<Inner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                clients: HashMap::new(),
                pending: Vec::new(),
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Enrolls a freshly authenticated client as pending.
    pub fn enroll_pending(
        &self,
        display_name: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> ClientSummary {
        let id = Uuid::new_v4().to_string();
        let token = Uuid::new_v4().to_string();
        let record = ClientRecord {
            id: id.clone(),
            display_name: display_name.to_string(),
            session: Some(SessionHandle { token, sender }),
            admin: false,
            status: ClientStatus::Pending,
            channels: Vec::new(),
            permissions: PermissionMatrix::default(),
            settings: HashMap::new(),
        };
        let summary = record.summary();
        let mut inner = self.write();
        inner.clients.insert(id.clone(), record);
        inner.pending.push(id.clone());
        info!("Enrolled pending client {} ({})", display_name, id);
        summary
    }

    /// Enrolls an admin-authenticated client directly as active.
    pub fn enroll_admin(
        &self,
        display_name: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> ClientSummary {
        let id = Uuid::new_v4().to_string();
        let token = Uuid::new_v4().to_string();
        let record = ClientRecord {
            id: id.clone(),
            display_name: display_name.to_string(),
            session: Some(SessionHandle { token, sender }),
            admin: true,
            status: ClientStatus::Active,
            channels: Vec::new(),
            permissions: PermissionMatrix {
                speak_to_all: true,
                listen_to_all: true,
                ..Default::default()
            },
            settings: HashMap::new(),
        };
        let summary = record.summary();
        self.write().clients.insert(id.clone(), record);
        info!("Enrolled admin client {} ({})", display_name, id);
        summary
    }

    /// Remembered-identity path: a closed client presenting its previous
    /// session token gets a new session handle and goes straight to active,
    /// keeping its channels and permissions. Returns `None` when the token
    /// does not match any remembered identity.
    pub fn resume(
        &self,
        token: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> Option<ClientSummary> {
        let mut inner = self.write();
        let record = inner.clients.values_mut().find(|c| {
            c.status == ClientStatus::Closed
                && c.session.as_ref().is_some_and(|s| s.token == token)
        })?;
        let new_token = Uuid::new_v4().to_string();
        record.session = Some(SessionHandle {
            token: new_token,
            sender,
        });
        record.status = ClientStatus::Active;
        info!("Resumed client {} ({})", record.display_name, record.id);
        Some(record.summary())
    }

    /// Moves a pending client to active, seeding memberships and default
    /// per-channel settings. Channel existence is the caller's concern.
    pub fn authorize(
        &self,
        client_id: &str,
        channels: &[String],
        permissions: PermissionMatrix,
    ) -> ServerResult<ClientSummary> {
        let mut inner = self.write();
        let pos = inner
            .pending
            .iter()
            .position(|id| id == client_id)
            .ok_or_else(|| ServerError::NotFound(format!("pending client {client_id}")))?;
        inner.pending.remove(pos);

        let record = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| ServerError::NotFound(format!("client {client_id}")))?;
        record.status = ClientStatus::Active;
        record.permissions = permissions;
        record.channels = channels.to_vec();
        record.settings = channels
            .iter()
            .map(|id| (id.clone(), ChannelSettings::default()))
            .collect();
        info!("Authorized client {} into {:?}", client_id, channels);
        Ok(record.summary())
    }

    /// Drops a pending entry. The record is kept as closed so a later
    /// authorize/reject of the same id answers `NotFound` rather than acting
    /// twice.
    pub fn reject(&self, client_id: &str) -> ServerResult<ClientSummary> {
        let mut inner = self.write();
        let pos = inner
            .pending
            .iter()
            .position(|id| id == client_id)
            .ok_or_else(|| ServerError::NotFound(format!("pending client {client_id}")))?;
        inner.pending.remove(pos);
        let record = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| ServerError::NotFound(format!("client {client_id}")))?;
        record.status = ClientStatus::Closed;
        info!("Rejected pending client {}", client_id);
        Ok(record.summary())
    }

    /// Applies a permission patch, returning (before, after) matrices so the
    /// routing core can reconcile.
    pub fn update_permissions(
        &self,
        client_id: &str,
        patch: &PermissionPatch,
    ) -> ServerResult<(PermissionMatrix, PermissionMatrix)> {
        let mut inner = self.write();
        let record = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| ServerError::NotFound(format!("client {client_id}")))?;
        let before = record.permissions.clone();
        record.permissions.apply(patch);
        debug!("Updated permissions for client {}", client_id);
        Ok((before, record.permissions.clone()))
    }

    /// Adds a channel membership with default user settings. Idempotent.
    pub fn add_to_channel(&self, client_id: &str, channel_id: &str) -> ServerResult<()> {
        let mut inner = self.write();
        let record = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| ServerError::NotFound(format!("client {client_id}")))?;
        if record.status != ClientStatus::Active {
            return Err(ServerError::Conflict(format!("client {client_id} is not active")));
        }
        if !record.channels.iter().any(|id| id == channel_id) {
            record.channels.push(channel_id.to_string());
        }
        record
            .settings
            .entry(channel_id.to_string())
            .or_default();
        Ok(())
    }

    /// Removes a channel membership and its user settings.
    pub fn remove_from_channel(&self, client_id: &str, channel_id: &str) -> ServerResult<()> {
        let mut inner = self.write();
        let record = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| ServerError::NotFound(format!("client {client_id}")))?;
        record.channels.retain(|id| id != channel_id);
        record.settings.remove(channel_id);
        Ok(())
    }

    /// Detaches a deleted channel from every client: membership, settings and
    /// per-channel permission entries.
    pub fn forget_channel(&self, channel_id: &str) {
        let mut inner = self.write();
        for record in inner.clients.values_mut() {
            record.channels.retain(|id| id != channel_id);
            record.settings.remove(channel_id);
            record.permissions.forget_channel(channel_id);
        }
    }

    pub fn set_channel_mute(&self, client_id: &str, channel_id: &str, muted: bool) -> ServerResult<()> {
        let mut inner = self.write();
        let record = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| ServerError::NotFound(format!("client {client_id}")))?;
        let settings = record
            .settings
            .get_mut(channel_id)
            .ok_or_else(|| ServerError::NotFound(format!("not a member of channel {channel_id}")))?;
        settings.muted = muted;
        Ok(())
    }

    /// Volume is clamped to [0, 1]; out-of-range values are not an error.
    pub fn set_channel_volume(
        &self,
        client_id: &str,
        channel_id: &str,
        volume: f32,
    ) -> ServerResult<f32> {
        if !volume.is_finite() {
            return Err(ServerError::BadRequest("volume must be a finite number".into()));
        }
        let clamped = volume.clamp(0.0, 1.0);
        let mut inner = self.write();
        let record = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| ServerError::NotFound(format!("client {client_id}")))?;
        let settings = record
            .settings
            .get_mut(channel_id)
            .ok_or_else(|| ServerError::NotFound(format!("not a member of channel {channel_id}")))?;
        settings.volume = clamped;
        Ok(clamped)
    }

    /// Closes a client: drops the live sender, marks the record closed and
    /// returns the channels it belonged to so the caller can cascade. The
    /// membership list and permissions stay on the record for the
    /// remembered-identity path. Safe to call twice — the second close is a
    /// no-op returning nothing.
    pub fn close(&self, client_id: &str) -> Vec<String> {
        let mut inner = self.write();
        inner.pending.retain(|id| id != client_id);
        match inner.clients.get_mut(client_id) {
            Some(record) if record.status != ClientStatus::Closed => {
                record.status = ClientStatus::Closed;
                // Keep the token for the remembered-identity path, drop the queue.
                if let Some(session) = record.session.as_mut() {
                    let (dead_tx, _) = mpsc::channel(1);
                    session.sender = dead_tx;
                }
                record.channels.clone()
            }
            _ => Vec::new(),
        }
    }

    pub fn get(&self, client_id: &str) -> ServerResult<ClientSummary> {
        self.read()
            .clients
            .get(client_id)
            .map(ClientRecord::summary)
            .ok_or_else(|| ServerError::NotFound(format!("client {client_id}")))
    }

    pub fn status_of(&self, client_id: &str) -> Option<ClientStatus> {
        self.read().clients.get(client_id).map(|c| c.status)
    }

    pub fn is_admin(&self, client_id: &str) -> bool {
        self.read()
            .clients
            .get(client_id)
            .is_some_and(|c| c.admin)
    }

    pub fn display_name_of(&self, client_id: &str) -> Option<String> {
        self.read()
            .clients
            .get(client_id)
            .map(|c| c.display_name.clone())
    }

    pub fn permissions_of(&self, client_id: &str) -> Option<PermissionMatrix> {
        self.read()
            .clients
            .get(client_id)
            .map(|c| c.permissions.clone())
    }

    pub fn channels_of(&self, client_id: &str) -> Vec<String> {
        self.read()
            .clients
            .get(client_id)
            .map(|c| c.channels.clone())
            .unwrap_or_default()
    }

    /// The full produce/consume authorization check: active, member, and the
    /// matrix grants the direction.
    pub fn allow(&self, client_id: &str, channel_id: &str, direction: Direction) -> bool {
        let inner = self.read();
        let Some(record) = inner.clients.get(client_id) else {
            return false;
        };
        if record.status != ClientStatus::Active {
            return false;
        }
        let is_member = record.channels.iter().any(|id| id == channel_id);
        crate::registry::permissions::allowed(&record.permissions, is_member, channel_id, direction)
    }

    /// Channels in which the client may currently speak (active ∧ member ∧
    /// speak right). The producer registration set.
    pub fn speak_channels(&self, client_id: &str) -> Vec<String> {
        let inner = self.read();
        let Some(record) = inner.clients.get(client_id) else {
            return Vec::new();
        };
        if record.status != ClientStatus::Active {
            return Vec::new();
        }
        record
            .channels
            .iter()
            .filter(|id| record.permissions.allows(id, Direction::Speak))
            .cloned()
            .collect()
    }

    pub fn sender_of(&self, client_id: &str) -> Option<mpsc::Sender<Arc<String>>> {
        self.read()
            .clients
            .get(client_id)
            .filter(|c| c.status != ClientStatus::Closed)
            .and_then(|c| c.session.as_ref().map(|s| s.sender.clone()))
    }

    /// Senders for every active admin session.
    pub fn admin_senders(&self) -> Vec<mpsc::Sender<Arc<String>>> {
        self.read()
            .clients
            .values()
            .filter(|c| c.admin && c.status == ClientStatus::Active)
            .filter_map(|c| c.session.as_ref().map(|s| s.sender.clone()))
            .collect()
    }

    /// Senders for every active session.
    pub fn active_senders(&self) -> Vec<mpsc::Sender<Arc<String>>> {
        self.read()
            .clients
            .values()
            .filter(|c| c.status == ClientStatus::Active)
            .filter_map(|c| c.session.as_ref().map(|s| s.sender.clone()))
            .collect()
    }

    /// Members of `channel_id` (drawn from the given member list) that hold
    /// the listen right there — the audience for speaking/producer events.
    pub fn listeners_among(
        &self,
        members: &[String],
        channel_id: &str,
    ) -> Vec<(String, mpsc::Sender<Arc<String>>)> {
        let inner = self.read();
        members
            .iter()
            .filter_map(|id| {
                let record = inner.clients.get(id)?;
                if record.status != ClientStatus::Active {
                    return None;
                }
                if !record.permissions.allows(channel_id, Direction::Listen) {
                    return None;
                }
                let sender = record.session.as_ref()?.sender.clone();
                Some((id.clone(), sender))
            })
            .collect()
    }

    pub fn session_token_of(&self, client_id: &str) -> Option<String> {
        self.read()
            .clients
            .get(client_id)
            .and_then(|c| c.session.as_ref().map(|s| s.token.clone()))
    }

    pub fn list(&self) -> Vec<ClientSummary> {
        let mut summaries: Vec<ClientSummary> =
            self.read().clients.values().map(ClientRecord::summary).collect();
        summaries.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        summaries
    }

    pub fn pending_list(&self) -> Vec<ClientSummary> {
        let inner = self.read();
        inner
            .pending
            .iter()
            .filter_map(|id| inner.clients.get(id).map(ClientRecord::summary))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.read()
            .clients
            .values()
            .filter(|c| c.status == ClientStatus::Active)
            .count()
    }

    /// Invariant check used by tests: settings domain equals membership set.
    #[cfg(test)]
    pub fn settings_domain_matches_channels(&self, client_id: &str) -> bool {
        let inner = self.read();
        let Some(record) = inner.clients.get(client_id) else {
            return false;
        };
        record.channels.len() == record.settings.len()
            && record.channels.iter().all(|id| record.settings.contains_key(id))
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sender() -> mpsc::Sender<Arc<String>> {
        mpsc::channel(8).0
    }

    fn registry_with_pending(name: &str) -> (ClientRegistry, String) {
        let registry = ClientRegistry::new();
        let client = registry.enroll_pending(name, sender());
        (registry, client.id)
    }

    #[test]
    fn enroll_starts_pending_with_no_channels() {
        let (registry, id) = registry_with_pending("bob");
        let client = registry.get(&id).unwrap();
        assert_eq!(client.status, ClientStatus::Pending);
        assert!(client.channels.is_empty());
        assert_eq!(registry.pending_list().len(), 1);
    }

    #[test]
    fn authorize_seeds_membership_and_settings() {
        let (registry, id) = registry_with_pending("bob");
        let mut permissions = PermissionMatrix::default();
        permissions.listen_to.insert("main".into(), true);
        permissions.speak_to.insert("main".into(), true);

        registry
            .authorize(&id, &["main".to_string()], permissions)
            .unwrap();

        let client = registry.get(&id).unwrap();
        assert_eq!(client.status, ClientStatus::Active);
        assert_eq!(client.channels, vec!["main".to_string()]);
        assert!(registry.settings_domain_matches_channels(&id));
        assert!(registry.allow(&id, "main", Direction::Speak));
        assert!(registry.allow(&id, "main", Direction::Listen));
        assert!(registry.pending_list().is_empty());
    }

    #[test]
    fn authorize_then_reject_same_id_is_not_found() {
        let (registry, id) = registry_with_pending("bob");
        registry
            .authorize(&id, &[], PermissionMatrix::default())
            .unwrap();
        let err = registry.reject(&id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn reject_twice_is_not_found() {
        let (registry, id) = registry_with_pending("bob");
        registry.reject(&id).unwrap();
        let err = registry.reject(&id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn mute_is_idempotent() {
        let (registry, id) = registry_with_pending("bob");
        registry
            .authorize(&id, &["main".to_string()], PermissionMatrix::default())
            .unwrap();
        registry.set_channel_mute(&id, "main", true).unwrap();
        registry.set_channel_mute(&id, "main", true).unwrap();
        // No error, still muted — second call is equivalent to one.
        registry.set_channel_mute(&id, "main", false).unwrap();
    }

    #[test]
    fn volume_is_clamped() {
        let (registry, id) = registry_with_pending("bob");
        registry
            .authorize(&id, &["main".to_string()], PermissionMatrix::default())
            .unwrap();
        assert_eq!(registry.set_channel_volume(&id, "main", -0.5).unwrap(), 0.0);
        assert_eq!(registry.set_channel_volume(&id, "main", 1.5).unwrap(), 1.0);
        assert_eq!(registry.set_channel_volume(&id, "main", 0.25).unwrap(), 0.25);
        assert!(registry.set_channel_volume(&id, "main", f32::NAN).is_err());
    }

    #[test]
    fn settings_require_membership() {
        let (registry, id) = registry_with_pending("bob");
        registry
            .authorize(&id, &["main".to_string()], PermissionMatrix::default())
            .unwrap();
        let err = registry.set_channel_mute(&id, "ops", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn add_then_remove_channel_restores_state() {
        let (registry, id) = registry_with_pending("bob");
        registry
            .authorize(&id, &["main".to_string()], PermissionMatrix::default())
            .unwrap();
        let before_channels = registry.channels_of(&id);
        let before_perms = registry.permissions_of(&id).unwrap();

        registry.add_to_channel(&id, "ops").unwrap();
        assert!(registry.settings_domain_matches_channels(&id));
        registry.remove_from_channel(&id, "ops").unwrap();

        assert_eq!(registry.channels_of(&id), before_channels);
        assert_eq!(registry.permissions_of(&id).unwrap(), before_perms);
        assert!(registry.settings_domain_matches_channels(&id));
    }

    #[test]
    fn add_to_channel_is_idempotent() {
        let (registry, id) = registry_with_pending("bob");
        registry
            .authorize(&id, &["main".to_string()], PermissionMatrix::default())
            .unwrap();
        registry.add_to_channel(&id, "ops").unwrap();
        registry.add_to_channel(&id, "ops").unwrap();
        assert_eq!(registry.channels_of(&id), vec!["main".to_string(), "ops".to_string()]);
    }

    #[test]
    fn close_twice_is_safe() {
        let (registry, id) = registry_with_pending("bob");
        registry
            .authorize(&id, &["main".to_string()], PermissionMatrix::default())
            .unwrap();
        let channels = registry.close(&id);
        assert_eq!(channels, vec!["main".to_string()]);
        let channels = registry.close(&id);
        assert!(channels.is_empty());
        assert_eq!(registry.status_of(&id), Some(ClientStatus::Closed));
    }

    #[test]
    fn resume_restores_remembered_identity() {
        let (registry, id) = registry_with_pending("bob");
        let mut perms = PermissionMatrix::default();
        perms.speak_to.insert("main".into(), true);
        registry.authorize(&id, &["main".to_string()], perms).unwrap();
        let token = registry.session_token_of(&id).unwrap();
        registry.close(&id);

        let resumed = registry.resume(&token, sender()).unwrap();
        assert_eq!(resumed.id, id);
        assert_eq!(resumed.status, ClientStatus::Active);
        // Permissions survive the reconnection; a fresh token is issued.
        assert!(registry.permissions_of(&id).unwrap().allows("main", Direction::Speak));
        assert_ne!(registry.session_token_of(&id).unwrap(), token);
    }

    #[test]
    fn resume_with_unknown_token_fails() {
        let registry = ClientRegistry::new();
        assert!(registry.resume("not-a-token", sender()).is_none());
    }

    #[test]
    fn admin_enrolls_directly_active() {
        let registry = ClientRegistry::new();
        let admin = registry.enroll_admin("stage manager", sender());
        assert_eq!(admin.status, ClientStatus::Active);
        assert!(admin.admin);
        assert_eq!(registry.admin_senders().len(), 1);
    }

    #[test]
    fn closed_clients_have_no_sender() {
        let (registry, id) = registry_with_pending("bob");
        registry
            .authorize(&id, &[], PermissionMatrix::default())
            .unwrap();
        assert!(registry.sender_of(&id).is_some());
        registry.close(&id);
        assert!(registry.sender_of(&id).is_none());
    }
}
