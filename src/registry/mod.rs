#![forbid(unsafe_code)]

// Registry module - in-memory channel and client state plus the permission
// evaluator. All registries use brief, await-free critical sections.

pub mod channel;
pub mod client;
pub mod permissions;

pub use channel::{ChannelRegistry, ChannelSummary, SYSTEM_CHANNEL_ID};
pub use client::{ClientRegistry, ClientStatus, ClientSummary, SessionHandle};
pub use permissions::{Direction, PermissionMatrix, PermissionPatch};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn sender() -> mpsc::Sender<Arc<String>> {
        mpsc::channel(8).0
    }

    /// A pending client must never appear in any channel's member set.
    #[test]
    fn pending_clients_stay_out_of_member_sets() {
        let channels = ChannelRegistry::new();
        let clients = ClientRegistry::new();

        let pending = clients.enroll_pending("bob", sender());
        for channel in channels.list() {
            assert!(!channels.members_of(&channel.id).contains(&pending.id));
        }

        // Authorization is what wires membership in, on both sides.
        clients
            .authorize(&pending.id, &[SYSTEM_CHANNEL_ID.to_string()], PermissionMatrix::default())
            .unwrap();
        channels.add_member(SYSTEM_CHANNEL_ID, &pending.id).unwrap();
        assert!(channels.members_of(SYSTEM_CHANNEL_ID).contains(&pending.id));
    }

    /// Deleting a channel detaches memberships, settings and per-channel
    /// permission entries everywhere.
    #[test]
    fn channel_deletion_detaches_clients() {
        let channels = ChannelRegistry::new();
        let clients = ClientRegistry::new();

        let ops = channels.create("ops", "").unwrap();
        let enrolled = clients.enroll_pending("bob", sender());
        let mut matrix = PermissionMatrix::default();
        matrix.listen_to.insert(ops.id.clone(), true);
        clients
            .authorize(&enrolled.id, &[ops.id.clone()], matrix)
            .unwrap();
        channels.add_member(&ops.id, &enrolled.id).unwrap();

        let record = channels.delete(&ops.id).unwrap();
        assert!(record.members.contains(&enrolled.id));
        clients.forget_channel(&ops.id);

        assert!(clients.channels_of(&enrolled.id).is_empty());
        let perms = clients.permissions_of(&enrolled.id).unwrap();
        assert!(!perms.allows(&ops.id, Direction::Listen));
    }

    /// Membership alone grants nothing; the matrix alone grants nothing.
    #[test]
    fn effective_rights_need_membership_and_grant() {
        let clients = ClientRegistry::new();
        let enrolled = clients.enroll_pending("bob", sender());

        let mut matrix = PermissionMatrix::default();
        matrix.speak_to.insert("main".to_string(), true);
        matrix.listen_to.insert("ops".to_string(), true);
        clients
            .authorize(&enrolled.id, &["main".to_string()], matrix)
            .unwrap();

        // Member of main with a speak grant there.
        assert!(clients.allow(&enrolled.id, "main", Direction::Speak));
        // Listen grant for ops, but not a member of ops.
        assert!(!clients.allow(&enrolled.id, "ops", Direction::Listen));
        // Member of main without a listen grant there.
        assert!(!clients.allow(&enrolled.id, "main", Direction::Listen));
    }
}
