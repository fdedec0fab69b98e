//! Conversation documents.

use crate::ids::{ConversationId, MessageId, Timestamp, UserId};
use crate::message::MessageKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Authenticated identity handed to the engine by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// User id.
    pub uid: UserId,
    /// Display name.
    pub display_name: String,
    /// Avatar URL.
    pub avatar: Option<String>,
}

impl Identity {
    /// Profile entry for this identity.
    pub fn profile(&self) -> ParticipantProfile {
        ParticipantProfile {
            name: self.display_name.clone(),
            avatar: self.avatar.clone(),
            is_online: true,
        }
    }
}

/// Denormalized display metadata for one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    /// Display name.
    pub name: String,
    /// Avatar URL.
    pub avatar: Option<String>,
    /// Last known online status.
    #[serde(default)]
    pub is_online: bool,
}

impl ParticipantProfile {
    /// Profile with a name only.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            avatar: None,
            is_online: false,
        }
    }
}

/// Summary of the newest message, shown in conversation lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    /// Id of the summarized message.
    pub message_id: MessageId,
    /// Body text (tombstone or placeholder when not displayable).
    pub text: String,
    /// Sender.
    pub sender_id: UserId,
    /// Message timestamp.
    pub timestamp: Timestamp,
    /// Kind of the message.
    pub kind: MessageKind,
}

/// Per-group permission toggles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSettings {
    /// Only admins may post.
    #[serde(default)]
    pub only_admins_can_message: bool,
    /// Only admins may add members.
    #[serde(default)]
    pub only_admins_can_add_members: bool,
    /// Only admins may change name, description, avatar.
    #[serde(default)]
    pub only_admins_can_edit_info: bool,
}

/// Group-only conversation fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Group name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Group avatar URL.
    pub avatar: Option<String>,
    /// Admin user ids (always a subset of participants).
    pub admins: BTreeSet<UserId>,
    /// Permission toggles.
    #[serde(default)]
    pub settings: GroupSettings,
}

/// Direct or group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationKind {
    /// Two-party conversation.
    Direct,
    /// Multi-party conversation with admins and settings.
    Group(GroupInfo),
}

/// A shared conversation document.
///
/// Every per-participant map is keyed by a subset of `participants`, and
/// `last_message_time` never moves backwards. Both are maintained by the
/// aggregate rules in `parley-core`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Document id.
    pub id: ConversationId,
    /// Direct or group.
    pub kind: ConversationKind,
    /// Participant ids.
    pub participants: BTreeSet<UserId>,
    /// Display metadata per participant.
    #[serde(default)]
    pub participant_details: BTreeMap<UserId, ParticipantProfile>,
    /// Newest message summary.
    pub last_message: Option<LastMessage>,
    /// Timestamp of the newest message.
    pub last_message_time: Option<Timestamp>,
    /// Unread messages per participant.
    #[serde(default)]
    pub unread_count: BTreeMap<UserId, u32>,
    /// When each participant last read the conversation.
    #[serde(default)]
    pub last_read_timestamp: BTreeMap<UserId, Timestamp>,
    /// Archived flag per participant.
    #[serde(default)]
    pub is_archived: BTreeMap<UserId, bool>,
    /// Muted flag per participant.
    #[serde(default)]
    pub is_muted: BTreeMap<UserId, bool>,
    /// Pinned-to-top flag per participant.
    #[serde(default)]
    pub is_pinned: BTreeMap<UserId, bool>,
    /// Close-friend flag per participant.
    #[serde(default)]
    pub is_close_friend: BTreeMap<UserId, bool>,
    /// Participant -> last time they were seen typing.
    #[serde(default)]
    pub typing_users: BTreeMap<UserId, Timestamp>,
    /// Whether message bodies are encrypted through the encryption collaborator.
    #[serde(default)]
    pub encryption_enabled: bool,
    /// Creator.
    pub created_by: UserId,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last metadata change.
    pub updated_at: Timestamp,
}

impl Conversation {
    /// Whether this is a group conversation.
    pub fn is_group(&self) -> bool {
        matches!(self.kind, ConversationKind::Group(_))
    }

    /// Group fields, if this is a group.
    pub fn group(&self) -> Option<&GroupInfo> {
        match &self.kind {
            ConversationKind::Group(info) => Some(info),
            ConversationKind::Direct => None,
        }
    }

    /// Mutable group fields, if this is a group.
    pub fn group_mut(&mut self) -> Option<&mut GroupInfo> {
        match &mut self.kind {
            ConversationKind::Group(info) => Some(info),
            ConversationKind::Direct => None,
        }
    }

    /// Whether `user` participates.
    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    /// Whether `user` is a group admin. Always false for direct conversations.
    pub fn is_admin(&self, user: &UserId) -> bool {
        self.group().is_some_and(|g| g.admins.contains(user))
    }

    /// Unread count for `user` (0 when absent).
    pub fn unread_for(&self, user: &UserId) -> u32 {
        self.unread_count.get(user).copied().unwrap_or(0)
    }

    /// Whether `user` archived this conversation.
    pub fn archived_for(&self, user: &UserId) -> bool {
        self.is_archived.get(user).copied().unwrap_or(false)
    }

    /// Whether `user` muted this conversation.
    pub fn muted_for(&self, user: &UserId) -> bool {
        self.is_muted.get(user).copied().unwrap_or(false)
    }

    /// Display name of `user`, falling back to the id.
    pub fn display_name_of(&self, user: &UserId) -> String {
        self.participant_details
            .get(user)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| user.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> Conversation {
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        Conversation {
            id: ConversationId::new("g1"),
            kind: ConversationKind::Group(GroupInfo {
                name: "Hikers".into(),
                description: None,
                avatar: None,
                admins: [alice.clone()].into_iter().collect(),
                settings: GroupSettings::default(),
            }),
            participants: [alice.clone(), bob].into_iter().collect(),
            participant_details: BTreeMap::new(),
            last_message: None,
            last_message_time: None,
            unread_count: BTreeMap::new(),
            last_read_timestamp: BTreeMap::new(),
            is_archived: BTreeMap::new(),
            is_muted: BTreeMap::new(),
            is_pinned: BTreeMap::new(),
            is_close_friend: BTreeMap::new(),
            typing_users: BTreeMap::new(),
            encryption_enabled: false,
            created_by: alice,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn admin_checks_use_group_admins() {
        let conv = group();
        assert!(conv.is_admin(&UserId::new("alice")));
        assert!(!conv.is_admin(&UserId::new("bob")));
        assert!(conv.is_group());
    }

    #[test]
    fn missing_map_entries_default() {
        let conv = group();
        assert_eq!(conv.unread_for(&UserId::new("bob")), 0);
        assert!(!conv.archived_for(&UserId::new("bob")));
        assert_eq!(conv.display_name_of(&UserId::new("bob")), "bob");
    }

    #[test]
    fn conversation_roundtrips_through_json() {
        let conv = group();
        let json = serde_json::to_string(&conv).unwrap();
        let back: Conversation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, conv);
    }
}
