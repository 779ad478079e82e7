#![forbid(unsafe_code)]

// Per-client talk/listen rights. The evaluator is pure: membership is the
// caller's input, user mute/volume never enter the decision.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Direction of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Speak,
    Listen,
}

/// Per-client permission matrix: global flags plus channel-keyed overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionMatrix {
    pub speak_to_all: bool,
    pub listen_to_all: bool,
    pub speak_to: HashMap<String, bool>,
    pub listen_to: HashMap<String, bool>,
}

/// Partial update applied by `updatePermissions`. Absent fields are untouched;
/// per-channel entries are merged key by key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionPatch {
    pub speak_to_all: Option<bool>,
    pub listen_to_all: Option<bool>,
    pub speak_to: HashMap<String, bool>,
    pub listen_to: HashMap<String, bool>,
}

impl PermissionMatrix {
    /// Effective right in a channel: global flag OR the per-channel grant.
    /// Membership is checked by the caller.
    pub fn allows(&self, channel_id: &str, direction: Direction) -> bool {
        match direction {
            Direction::Speak => {
                self.speak_to_all || self.speak_to.get(channel_id).copied().unwrap_or(false)
            }
            Direction::Listen => {
                self.listen_to_all || self.listen_to.get(channel_id).copied().unwrap_or(false)
            }
        }
    }

    pub fn apply(&mut self, patch: &PermissionPatch) {
        if let Some(flag) = patch.speak_to_all {
            self.speak_to_all = flag;
        }
        if let Some(flag) = patch.listen_to_all {
            self.listen_to_all = flag;
        }
        for (channel, grant) in &patch.speak_to {
            self.speak_to.insert(channel.clone(), *grant);
        }
        for (channel, grant) in &patch.listen_to {
            self.listen_to.insert(channel.clone(), *grant);
        }
    }

    /// Drops the per-channel entries for a channel that no longer exists.
    pub fn forget_channel(&mut self, channel_id: &str) {
        self.speak_to.remove(channel_id);
        self.listen_to.remove(channel_id);
    }
}

/// The full authorization check: member of the channel AND the matrix grants
/// the direction. Consulted before every produce/consume media call.
pub fn allowed(
    matrix: &PermissionMatrix,
    is_member: bool,
    channel_id: &str,
    direction: Direction,
) -> bool {
    is_member && matrix.allows(channel_id, direction)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_with(channel: &str, speak: bool, listen: bool) -> PermissionMatrix {
        let mut m = PermissionMatrix::default();
        m.speak_to.insert(channel.to_string(), speak);
        m.listen_to.insert(channel.to_string(), listen);
        m
    }

    #[test]
    fn global_flag_overrides_missing_channel_entry() {
        let m = PermissionMatrix {
            speak_to_all: true,
            ..Default::default()
        };
        assert!(m.allows("ops", Direction::Speak));
        assert!(!m.allows("ops", Direction::Listen));
    }

    #[test]
    fn per_channel_grant_is_scoped() {
        let m = matrix_with("ops", true, false);
        assert!(m.allows("ops", Direction::Speak));
        assert!(!m.allows("stage", Direction::Speak));
        assert!(!m.allows("ops", Direction::Listen));
    }

    #[test]
    fn membership_is_required() {
        let m = matrix_with("ops", true, true);
        assert!(allowed(&m, true, "ops", Direction::Speak));
        assert!(!allowed(&m, false, "ops", Direction::Speak));
        assert!(!allowed(&m, false, "ops", Direction::Listen));
    }

    #[test]
    fn patch_merges_without_clearing_other_channels() {
        let mut m = matrix_with("ops", true, true);
        let mut patch = PermissionPatch::default();
        patch.speak_to.insert("stage".to_string(), true);
        patch.listen_to_all = Some(true);
        m.apply(&patch);

        assert!(m.allows("ops", Direction::Speak));
        assert!(m.allows("stage", Direction::Speak));
        assert!(m.listen_to_all);
    }

    #[test]
    fn patch_can_revoke() {
        let mut m = matrix_with("main", true, true);
        let mut patch = PermissionPatch::default();
        patch.speak_to.insert("main".to_string(), false);
        m.apply(&patch);

        assert!(!m.allows("main", Direction::Speak));
        assert!(m.allows("main", Direction::Listen));
    }
}
