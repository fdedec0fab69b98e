//! Domain views built from raw store snapshots.

use parley_types::{Conversation, Message, UserId};
use std::cmp::Reverse;

/// Conversation list for `user`: archived ones dropped, newest activity
/// first. A missing `last_message_time` sorts as epoch zero; ties break on
/// id so the order is stable across snapshots.
pub fn conversation_view(
    conversations: impl IntoIterator<Item = Conversation>,
    user: &UserId,
) -> Vec<Conversation> {
    let mut view: Vec<Conversation> = conversations
        .into_iter()
        .filter(|c| c.is_participant(user) && !c.archived_for(user))
        .collect();
    view.sort_by(|a, b| {
        let key = |c: &Conversation| Reverse(c.last_message_time.unwrap_or(0));
        key(a).cmp(&key(b)).then_with(|| a.id.cmp(&b.id))
    });
    view
}

/// Archived conversations for `user`, in the same order as the main list.
pub fn archived_view(
    conversations: impl IntoIterator<Item = Conversation>,
    user: &UserId,
) -> Vec<Conversation> {
    let mut view: Vec<Conversation> = conversations
        .into_iter()
        .filter(|c| c.is_participant(user) && c.archived_for(user))
        .collect();
    view.sort_by(|a, b| {
        b.last_message_time
            .unwrap_or(0)
            .cmp(&a.last_message_time.unwrap_or(0))
            .then_with(|| a.id.cmp(&b.id))
    });
    view
}

/// Live message list for a conversation, oldest first.
///
/// Tombstones stay in the list so the UI can render "deleted" bubbles.
pub fn message_view(messages: impl IntoIterator<Item = Message>) -> Vec<Message> {
    let mut view: Vec<Message> = messages.into_iter().collect();
    view.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
    view
}

/// Drop messages `viewer` deleted for themselves.
pub fn visible_to(messages: Vec<Message>, viewer: &UserId) -> Vec<Message> {
    messages
        .into_iter()
        .filter(|m| m.is_visible_to(viewer))
        .collect()
}

/// Total unread count across `conversations` for `user`, skipping muted ones.
pub fn total_unread(conversations: &[Conversation], user: &UserId) -> u32 {
    conversations
        .iter()
        .filter(|c| !c.muted_for(user))
        .map(|c| c.unread_for(user))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::new_direct;
    use parley_types::{ConversationId, MessageId, ParticipantProfile};

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    fn conv(other: &str, last: Option<i64>) -> Conversation {
        let mut c = new_direct(
            (user("me"), ParticipantProfile::named("Me")),
            (user(other), ParticipantProfile::named(other)),
            0,
        )
        .unwrap();
        c.last_message_time = last;
        c
    }

    fn msg(id: &str, ts: i64) -> Message {
        Message::new_text(
            MessageId::new(id),
            ConversationId::new("c"),
            user("me"),
            "Me",
            id,
            ts,
        )
    }

    #[test]
    fn conversations_sorted_newest_first_missing_time_last() {
        let view = conversation_view(
            vec![conv("a", Some(10)), conv("b", None), conv("c", Some(30))],
            &user("me"),
        );
        let ids: Vec<&str> = view.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c_me", "a_me", "b_me"]);
    }

    #[test]
    fn archived_conversations_filtered_per_user() {
        let mut archived = conv("a", Some(10));
        archived.is_archived.insert(user("me"), true);
        let view = conversation_view(vec![archived.clone(), conv("b", Some(5))], &user("me"));
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id.as_str(), "b_me");

        // Still listed for the other participant
        let theirs = conversation_view(vec![archived.clone()], &user("a"));
        assert_eq!(theirs.len(), 1);

        let archive = archived_view(vec![archived], &user("me"));
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn ties_break_on_id() {
        let view = conversation_view(vec![conv("z", Some(1)), conv("b", Some(1))], &user("me"));
        assert_eq!(view[0].id.as_str(), "b_me");
    }

    #[test]
    fn messages_sorted_oldest_first_with_id_tiebreak() {
        let view = message_view(vec![msg("m3", 30), msg("m2", 10), msg("m1", 10)]);
        let ids: Vec<&str> = view.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn visible_to_hides_deleted_for_me() {
        let mut hidden = msg("m1", 1);
        hidden.deleted_for.insert(user("me"));
        let view = visible_to(vec![hidden, msg("m2", 2)], &user("me"));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn total_unread_skips_muted() {
        let mut a = conv("a", None);
        a.unread_count.insert(user("me"), 3);
        let mut b = conv("b", None);
        b.unread_count.insert(user("me"), 4);
        b.is_muted.insert(user("me"), true);
        assert_eq!(total_unread(&[a, b], &user("me")), 3);
    }
}
