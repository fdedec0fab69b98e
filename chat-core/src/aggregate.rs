//! Conversation aggregate rules.
//!
//! These keep the per-participant maps of a [`Conversation`] consistent as
//! messages arrive and membership changes. Every map's key set stays a
//! subset of `participants`, and `last_message_time` never moves backwards.

use crate::mutation::check_participant;
use parley_types::{
    ChatError, Conversation, ConversationId, ConversationKind, GroupInfo, GroupSettings,
    LastMessage, Message, MessageKind, MessageStatus, ParticipantProfile, Timestamp, UserId,
};
use std::collections::{BTreeMap, BTreeSet};

/// Partial update of one participant's conversation settings.
///
/// `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    /// Close-friend flag.
    pub is_close_friend: Option<bool>,
    /// Muted flag.
    pub is_muted: Option<bool>,
    /// Pinned-to-top flag.
    pub is_pinned: Option<bool>,
    /// Archived flag.
    pub is_archived: Option<bool>,
}

impl SettingsUpdate {
    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        self.is_close_friend.is_none()
            && self.is_muted.is_none()
            && self.is_pinned.is_none()
            && self.is_archived.is_none()
    }
}

/// Partial update of group metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupInfoUpdate {
    /// New name.
    pub name: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New avatar URL.
    pub avatar: Option<String>,
    /// New permission toggles (admins only).
    pub settings: Option<GroupSettings>,
}

impl GroupInfoUpdate {
    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.avatar.is_none()
            && self.settings.is_none()
    }
}

fn empty_conversation(
    id: ConversationId,
    kind: ConversationKind,
    created_by: UserId,
    now: Timestamp,
) -> Conversation {
    Conversation {
        id,
        kind,
        participants: BTreeSet::new(),
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
        created_by,
        created_at: now,
        updated_at: now,
    }
}

/// Build the direct conversation between `a` and `b`.
pub fn new_direct(
    a: (UserId, ParticipantProfile),
    b: (UserId, ParticipantProfile),
    now: Timestamp,
) -> Result<Conversation, ChatError> {
    if a.0 == b.0 {
        return Err(ChatError::validation(
            "A direct conversation needs two different users",
        ));
    }
    let id = ConversationId::direct(&a.0, &b.0);
    let mut conv = empty_conversation(id, ConversationKind::Direct, a.0.clone(), now);
    init_participant(&mut conv, a.0, a.1, now);
    init_participant(&mut conv, b.0, b.1, now);
    Ok(conv)
}

/// Build a group owned by `creator`, who becomes its first admin.
pub fn new_group(
    id: ConversationId,
    creator: (UserId, ParticipantProfile),
    members: Vec<(UserId, ParticipantProfile)>,
    name: &str,
    settings: GroupSettings,
    now: Timestamp,
) -> Result<Conversation, ChatError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::validation("Group name cannot be empty"));
    }
    let kind = ConversationKind::Group(GroupInfo {
        name: name.to_string(),
        description: None,
        avatar: None,
        admins: [creator.0.clone()].into_iter().collect(),
        settings,
    });
    let mut conv = empty_conversation(id, kind, creator.0.clone(), now);
    init_participant(&mut conv, creator.0, creator.1, now);
    for (user, profile) in members {
        if !conv.is_participant(&user) {
            init_participant(&mut conv, user, profile, now);
        }
    }
    if conv.participants.len() < 2 {
        return Err(ChatError::validation("A group needs at least one other member"));
    }
    Ok(conv)
}

/// Add `user` and initialize every per-participant map entry.
pub fn init_participant(
    conv: &mut Conversation,
    user: UserId,
    profile: ParticipantProfile,
    now: Timestamp,
) {
    conv.participant_details.insert(user.clone(), profile);
    conv.unread_count.insert(user.clone(), 0);
    conv.last_read_timestamp.insert(user.clone(), now);
    conv.is_archived.insert(user.clone(), false);
    conv.is_muted.insert(user.clone(), false);
    conv.is_pinned.insert(user.clone(), false);
    conv.is_close_friend.insert(user.clone(), false);
    conv.participants.insert(user);
}

/// Remove `user` and every per-participant map entry, including admin rights.
fn drop_participant(conv: &mut Conversation, user: &UserId) {
    conv.participants.remove(user);
    conv.participant_details.remove(user);
    conv.unread_count.remove(user);
    conv.last_read_timestamp.remove(user);
    conv.is_archived.remove(user);
    conv.is_muted.remove(user);
    conv.is_pinned.remove(user);
    conv.is_close_friend.remove(user);
    conv.typing_users.remove(user);
    if let Some(group) = conv.group_mut() {
        group.admins.remove(user);
    }
}

/// List preview text for a message.
pub fn preview_text(message: &Message) -> String {
    if message.encrypted.is_some() && message.text.is_empty() {
        "Encrypted message".to_string()
    } else if message.text.is_empty() && !message.attachments.is_empty() {
        "Attachment".to_string()
    } else {
        message.snippet(100)
    }
}

/// Apply a newly written message to the conversation.
///
/// Every participant other than the sender gets one more unread message
/// (system notices count for nobody). The last-message summary only moves
/// forward in time. Returns whether the summary was replaced.
pub fn record_incoming_message(conv: &mut Conversation, message: &Message) -> bool {
    if message.kind != MessageKind::System {
        let recipients: Vec<UserId> = conv
            .participants
            .iter()
            .filter(|p| **p != message.sender_id)
            .cloned()
            .collect();
        for recipient in recipients {
            let unread = conv.unread_count.entry(recipient).or_insert(0);
            *unread = unread.saturating_add(1);
        }
        conv.typing_users.remove(&message.sender_id);
    }

    conv.updated_at = conv.updated_at.max(message.timestamp);
    let current = conv.last_message_time.unwrap_or(i64::MIN);
    if message.timestamp < current {
        return false;
    }
    conv.last_message = Some(LastMessage {
        message_id: message.id.clone(),
        text: preview_text(message),
        sender_id: message.sender_id.clone(),
        timestamp: message.timestamp,
        kind: message.kind,
    });
    conv.last_message_time = Some(message.timestamp);
    true
}

/// Refresh the summary when the summarized message was edited or deleted.
pub fn refresh_last_message(conv: &mut Conversation, message: &Message) {
    if let Some(last) = conv.last_message.as_mut() {
        if last.message_id == message.id {
            last.text = preview_text(message);
        }
    }
}

/// Zero `user`'s unread count and stamp their read time.
pub fn mark_read(conv: &mut Conversation, user: &UserId, now: Timestamp) -> Result<(), ChatError> {
    check_participant(conv, user)?;
    conv.unread_count.insert(user.clone(), 0);
    let last = conv.last_read_timestamp.entry(user.clone()).or_insert(now);
    *last = (*last).max(now);
    Ok(())
}

/// Move messages from others that `reader` has not read yet to `Read`.
///
/// Returns how many changed.
pub fn mark_messages_read<'a>(
    messages: impl IntoIterator<Item = &'a mut Message>,
    reader: &UserId,
) -> usize {
    let mut changed = 0;
    for message in messages {
        if message.sender_id != *reader
            && message.kind != MessageKind::System
            && message.status < MessageStatus::Read
        {
            message.status = MessageStatus::Read;
            changed += 1;
        }
    }
    changed
}

/// Apply a partial settings update for `user`.
pub fn apply_settings(
    conv: &mut Conversation,
    user: &UserId,
    update: &SettingsUpdate,
    now: Timestamp,
) -> Result<(), ChatError> {
    check_participant(conv, user)?;
    if update.is_empty() {
        return Err(ChatError::validation("No settings to update"));
    }
    if let Some(v) = update.is_close_friend {
        conv.is_close_friend.insert(user.clone(), v);
    }
    if let Some(v) = update.is_muted {
        conv.is_muted.insert(user.clone(), v);
    }
    if let Some(v) = update.is_pinned {
        conv.is_pinned.insert(user.clone(), v);
    }
    if let Some(v) = update.is_archived {
        conv.is_archived.insert(user.clone(), v);
    }
    conv.updated_at = conv.updated_at.max(now);
    Ok(())
}

/// Record or clear `user`'s typing indicator.
pub fn set_typing(
    conv: &mut Conversation,
    user: &UserId,
    typing: bool,
    now: Timestamp,
) -> Result<(), ChatError> {
    check_participant(conv, user)?;
    if typing {
        conv.typing_users.insert(user.clone(), now);
    } else {
        conv.typing_users.remove(user);
    }
    Ok(())
}

/// Users seen typing within `ttl_ms` of `now`, excluding `viewer`.
pub fn active_typers(conv: &Conversation, viewer: &UserId, now: Timestamp, ttl_ms: i64) -> Vec<UserId> {
    conv.typing_users
        .iter()
        .filter(|(user, at)| *user != viewer && now.saturating_sub(**at) <= ttl_ms)
        .map(|(user, _)| user.clone())
        .collect()
}

fn require_group(conv: &Conversation) -> Result<&GroupInfo, ChatError> {
    conv.group().ok_or_else(|| {
        ChatError::validation("This action is only available in group conversations")
    })
}

/// Add members to a group. Returns the system notice text.
pub fn add_participants(
    conv: &mut Conversation,
    actor: &UserId,
    new_members: Vec<(UserId, ParticipantProfile)>,
    now: Timestamp,
) -> Result<String, ChatError> {
    let group = require_group(conv)?;
    check_participant(conv, actor)?;
    if group.settings.only_admins_can_add_members && !group.admins.contains(actor) {
        return Err(ChatError::permission("Only admins can add members to this group"));
    }

    let fresh: Vec<_> = new_members
        .into_iter()
        .filter(|(user, _)| !conv.is_participant(user))
        .collect();
    if fresh.is_empty() {
        return Err(ChatError::validation(
            "All selected users are already members of this group",
        ));
    }

    let names: Vec<String> = fresh.iter().map(|(_, p)| p.name.clone()).collect();
    for (user, profile) in fresh {
        init_participant(conv, user, profile, now);
    }
    conv.updated_at = conv.updated_at.max(now);
    Ok(format!(
        "{} added {}",
        conv.display_name_of(actor),
        names.join(", ")
    ))
}

/// Remove `target` from a group, or let `actor` leave when they are the same.
///
/// If the last admin leaves, the first remaining participant is promoted.
/// Returns the system notice text.
pub fn remove_participant(
    conv: &mut Conversation,
    actor: &UserId,
    target: &UserId,
    now: Timestamp,
) -> Result<String, ChatError> {
    let group = require_group(conv)?;
    check_participant(conv, actor)?;
    if !conv.is_participant(target) {
        return Err(ChatError::validation("That user is not a member of this group"));
    }
    let leaving = actor == target;
    if !leaving && !group.admins.contains(actor) {
        return Err(ChatError::permission("Only admins can remove members"));
    }

    let actor_name = conv.display_name_of(actor);
    let target_name = conv.display_name_of(target);
    drop_participant(conv, target);

    let promote = match conv.group() {
        Some(g) if g.admins.is_empty() => conv.participants.iter().next().cloned(),
        _ => None,
    };
    if let (Some(next), Some(group)) = (promote, conv.group_mut()) {
        group.admins.insert(next);
    }
    conv.updated_at = conv.updated_at.max(now);

    Ok(if leaving {
        format!("{} left the group", actor_name)
    } else {
        format!("{} removed {}", actor_name, target_name)
    })
}

/// Update group name, description, avatar or settings. Returns the notice text.
pub fn update_group_info(
    conv: &mut Conversation,
    actor: &UserId,
    update: GroupInfoUpdate,
    now: Timestamp,
) -> Result<String, ChatError> {
    let group = require_group(conv)?;
    check_participant(conv, actor)?;
    if update.is_empty() {
        return Err(ChatError::validation("Nothing to update"));
    }
    let is_admin = group.admins.contains(actor);
    if group.settings.only_admins_can_edit_info && !is_admin {
        return Err(ChatError::permission("Only admins can edit group info"));
    }
    if update.settings.is_some() && !is_admin {
        return Err(ChatError::permission("Only admins can change group settings"));
    }
    let name = match update.name.as_deref().map(str::trim) {
        Some("") => return Err(ChatError::validation("Group name cannot be empty")),
        other => other.map(str::to_string),
    };

    let actor_name = conv.display_name_of(actor);
    let Some(group) = conv.group_mut() else {
        return Err(ChatError::validation(
            "This action is only available in group conversations",
        ));
    };
    let notice = match &name {
        Some(n) => format!("{} changed the group name to \"{}\"", actor_name, n),
        None => format!("{} updated the group info", actor_name),
    };
    if let Some(n) = name {
        group.name = n;
    }
    if let Some(d) = update.description {
        group.description = Some(d);
    }
    if let Some(a) = update.avatar {
        group.avatar = Some(a);
    }
    if let Some(s) = update.settings {
        group.settings = s;
    }
    conv.updated_at = conv.updated_at.max(now);
    Ok(notice)
}

/// Whether every per-participant map and the admin set are keyed by participants only.
pub fn check_invariants(conv: &Conversation) -> bool {
    fn within<V>(map: &BTreeMap<UserId, V>, participants: &BTreeSet<UserId>) -> bool {
        map.keys().all(|k| participants.contains(k))
    }
    let p = &conv.participants;
    within(&conv.participant_details, p)
        && within(&conv.unread_count, p)
        && within(&conv.last_read_timestamp, p)
        && within(&conv.is_archived, p)
        && within(&conv.is_muted, p)
        && within(&conv.is_pinned, p)
        && within(&conv.is_close_friend, p)
        && within(&conv.typing_users, p)
        && conv
            .group()
            .map_or(true, |g| g.admins.iter().all(|a| p.contains(a)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::MessageId;

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    fn member(id: &str) -> (UserId, ParticipantProfile) {
        (user(id), ParticipantProfile::named(id.to_uppercase()))
    }

    fn group() -> Conversation {
        new_group(
            ConversationId::new("g1"),
            member("alice"),
            vec![member("bob"), member("carol")],
            "Hikers",
            GroupSettings::default(),
            0,
        )
        .unwrap()
    }

    fn text(id: &str, sender: &str, ts: i64) -> Message {
        Message::new_text(
            MessageId::new(id),
            ConversationId::new("g1"),
            user(sender),
            sender,
            format!("msg {}", id),
            ts,
        )
    }

    // ===========================================
    // Creation Tests
    // ===========================================

    #[test]
    fn direct_conversation_initializes_both_participants() {
        let conv = new_direct(member("bob"), member("alice"), 10).unwrap();
        assert_eq!(conv.id, ConversationId::new("alice_bob"));
        assert_eq!(conv.unread_for(&user("alice")), 0);
        assert_eq!(conv.last_read_timestamp.get(&user("bob")), Some(&10));
        assert!(check_invariants(&conv));
    }

    #[test]
    fn direct_conversation_with_self_rejected() {
        assert!(new_direct(member("a"), member("a"), 0).is_err());
    }

    #[test]
    fn group_creator_is_admin() {
        let conv = group();
        assert!(conv.is_admin(&user("alice")));
        assert_eq!(conv.participants.len(), 3);
        assert!(check_invariants(&conv));
    }

    // ===========================================
    // Incoming Message Tests
    // ===========================================

    #[test]
    fn sender_unread_never_incremented() {
        let mut conv = group();
        record_incoming_message(&mut conv, &text("1", "alice", 100));
        record_incoming_message(&mut conv, &text("2", "alice", 200));

        assert_eq!(conv.unread_for(&user("alice")), 0);
        assert_eq!(conv.unread_for(&user("bob")), 2);
        assert_eq!(conv.unread_for(&user("carol")), 2);
    }

    #[test]
    fn last_message_time_never_decreases() {
        let mut conv = group();
        assert!(record_incoming_message(&mut conv, &text("new", "bob", 500)));
        assert!(!record_incoming_message(&mut conv, &text("old", "carol", 100)));

        assert_eq!(conv.last_message_time, Some(500));
        assert_eq!(conv.last_message.as_ref().unwrap().message_id, MessageId::new("new"));
        // Late arrival still counts as unread
        assert_eq!(conv.unread_for(&user("alice")), 2);
    }

    #[test]
    fn system_notices_do_not_count_as_unread() {
        let mut conv = group();
        let notice = Message::new_system(conv.id.clone(), "Bob joined", 50);
        record_incoming_message(&mut conv, &notice);
        assert_eq!(conv.unread_for(&user("bob")), 0);
        assert_eq!(conv.last_message.unwrap().text, "Bob joined");
    }

    #[test]
    fn sending_clears_sender_typing() {
        let mut conv = group();
        set_typing(&mut conv, &user("bob"), true, 10).unwrap();
        record_incoming_message(&mut conv, &text("1", "bob", 20));
        assert!(conv.typing_users.is_empty());
    }

    #[test]
    fn refresh_updates_summary_of_same_message_only() {
        let mut conv = group();
        let mut msg = text("1", "bob", 20);
        record_incoming_message(&mut conv, &msg);
        msg.text = "edited".into();
        refresh_last_message(&mut conv, &msg);
        assert_eq!(conv.last_message.as_ref().unwrap().text, "edited");

        let other = text("2", "bob", 10);
        refresh_last_message(&mut conv, &other);
        assert_eq!(conv.last_message.as_ref().unwrap().text, "edited");
    }

    // ===========================================
    // Read / Settings Tests
    // ===========================================

    #[test]
    fn mark_read_zeroes_unread_and_stamps_time() {
        let mut conv = group();
        record_incoming_message(&mut conv, &text("1", "alice", 100));
        mark_read(&mut conv, &user("bob"), 900).unwrap();

        assert_eq!(conv.unread_for(&user("bob")), 0);
        assert_eq!(conv.unread_for(&user("carol")), 1);
        assert_eq!(conv.last_read_timestamp.get(&user("bob")), Some(&900));
    }

    #[test]
    fn mark_messages_read_skips_own_messages() {
        let mut msgs = vec![text("1", "alice", 1), text("2", "bob", 2)];
        let changed = mark_messages_read(msgs.iter_mut(), &user("bob"));
        assert_eq!(changed, 1);
        assert_eq!(msgs[0].status, MessageStatus::Read);
        assert_eq!(msgs[1].status, MessageStatus::Sent);
    }

    #[test]
    fn settings_update_is_partial() {
        let mut conv = group();
        apply_settings(
            &mut conv,
            &user("bob"),
            &SettingsUpdate {
                is_muted: Some(true),
                is_pinned: Some(true),
                ..Default::default()
            },
            5,
        )
        .unwrap();
        apply_settings(
            &mut conv,
            &user("bob"),
            &SettingsUpdate {
                is_pinned: Some(false),
                ..Default::default()
            },
            6,
        )
        .unwrap();

        assert!(conv.muted_for(&user("bob")));
        assert_eq!(conv.is_pinned.get(&user("bob")), Some(&false));
        assert_eq!(conv.is_close_friend.get(&user("bob")), Some(&false));
        assert!(!conv.muted_for(&user("alice")));
    }

    #[test]
    fn settings_for_outsider_rejected() {
        let mut conv = group();
        let err = apply_settings(
            &mut conv,
            &user("zed"),
            &SettingsUpdate {
                is_muted: Some(true),
                ..Default::default()
            },
            0,
        )
        .unwrap_err();
        assert!(matches!(err, ChatError::Permission { .. }));
        assert!(check_invariants(&conv));
    }

    #[test]
    fn active_typers_respects_ttl_and_viewer() {
        let mut conv = group();
        set_typing(&mut conv, &user("bob"), true, 1_000).unwrap();
        set_typing(&mut conv, &user("carol"), true, 9_000).unwrap();
        let typers = active_typers(&conv, &user("carol"), 10_000, 5_000);
        assert!(typers.is_empty());
        let typers = active_typers(&conv, &user("alice"), 10_000, 5_000);
        assert_eq!(typers, vec![user("carol")]);
    }

    // ===========================================
    // Group Membership Tests
    // ===========================================

    #[test]
    fn add_participants_initializes_maps() {
        let mut conv = group();
        let notice = add_participants(&mut conv, &user("bob"), vec![member("dave")], 10).unwrap();

        assert_eq!(notice, "BOB added DAVE");
        assert!(conv.is_participant(&user("dave")));
        assert_eq!(conv.unread_for(&user("dave")), 0);
        assert!(conv.is_muted.contains_key(&user("dave")));
        assert!(check_invariants(&conv));
    }

    #[test]
    fn add_participants_respects_admin_only_setting() {
        let mut conv = group();
        conv.group_mut().unwrap().settings.only_admins_can_add_members = true;

        let err = add_participants(&mut conv, &user("bob"), vec![member("dave")], 10).unwrap_err();
        assert!(matches!(err, ChatError::Permission { .. }));
        assert!(!conv.is_participant(&user("dave")));

        add_participants(&mut conv, &user("alice"), vec![member("dave")], 10).unwrap();
        assert!(conv.is_participant(&user("dave")));
    }

    #[test]
    fn add_existing_members_rejected() {
        let mut conv = group();
        let err = add_participants(&mut conv, &user("alice"), vec![member("bob")], 10).unwrap_err();
        assert!(matches!(err, ChatError::Validation { .. }));
    }

    #[test]
    fn group_ops_rejected_on_direct_conversation() {
        let mut conv = new_direct(member("a"), member("b"), 0).unwrap();
        assert!(add_participants(&mut conv, &user("a"), vec![member("c")], 1).is_err());
        assert!(remove_participant(&mut conv, &user("a"), &user("b"), 1).is_err());
        assert!(update_group_info(
            &mut conv,
            &user("a"),
            GroupInfoUpdate {
                name: Some("x".into()),
                ..Default::default()
            },
            1
        )
        .is_err());
    }

    #[test]
    fn remove_participant_cleans_every_map() {
        let mut conv = group();
        record_incoming_message(&mut conv, &text("1", "alice", 5));
        set_typing(&mut conv, &user("carol"), true, 6).unwrap();

        let notice = remove_participant(&mut conv, &user("alice"), &user("carol"), 10).unwrap();

        assert_eq!(notice, "ALICE removed CAROL");
        assert!(!conv.is_participant(&user("carol")));
        assert!(!conv.unread_count.contains_key(&user("carol")));
        assert!(!conv.typing_users.contains_key(&user("carol")));
        assert!(check_invariants(&conv));
    }

    #[test]
    fn non_admin_cannot_remove_others_but_can_leave() {
        let mut conv = group();
        let err = remove_participant(&mut conv, &user("bob"), &user("carol"), 1).unwrap_err();
        assert!(matches!(err, ChatError::Permission { .. }));

        let notice = remove_participant(&mut conv, &user("bob"), &user("bob"), 1).unwrap();
        assert_eq!(notice, "BOB left the group");
    }

    #[test]
    fn last_admin_leaving_promotes_someone() {
        let mut conv = group();
        remove_participant(&mut conv, &user("alice"), &user("alice"), 1).unwrap();
        let admins = &conv.group().unwrap().admins;
        assert_eq!(admins.len(), 1);
        assert!(admins.contains(&user("bob")));
        assert!(check_invariants(&conv));
    }

    #[test]
    fn update_group_info_gated_by_settings() {
        let mut conv = group();
        let notice = update_group_info(
            &mut conv,
            &user("bob"),
            GroupInfoUpdate {
                name: Some("  Climbers ".into()),
                ..Default::default()
            },
            3,
        )
        .unwrap();
        assert_eq!(notice, "BOB changed the group name to \"Climbers\"");
        assert_eq!(conv.group().unwrap().name, "Climbers");

        conv.group_mut().unwrap().settings.only_admins_can_edit_info = true;
        let err = update_group_info(
            &mut conv,
            &user("bob"),
            GroupInfoUpdate {
                description: Some("x".into()),
                ..Default::default()
            },
            4,
        )
        .unwrap_err();
        assert!(matches!(err, ChatError::Permission { .. }));
    }

    #[test]
    fn settings_change_requires_admin() {
        let mut conv = group();
        let err = update_group_info(
            &mut conv,
            &user("bob"),
            GroupInfoUpdate {
                settings: Some(GroupSettings {
                    only_admins_can_message: true,
                    ..Default::default()
                }),
                ..Default::default()
            },
            1,
        )
        .unwrap_err();
        assert!(matches!(err, ChatError::Permission { .. }));
    }
}
