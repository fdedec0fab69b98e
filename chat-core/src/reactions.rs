//! Reaction toggling.
//!
//! A message carries a list of reaction groups, one per emoji. Toggling
//! flips one user's membership in one group:
//! - group exists and user is in it: remove the user, drop the group if empty
//! - group exists without the user: add the user
//! - no group: create a single-user group
//!
//! `count` is always recomputed from the set, never incremented blindly, so
//! replaying a toggle against fresher state cannot drift the count.
//!
//! Groups are kept sorted by emoji. A group that empties out and comes back
//! lands where it was, so a double toggle leaves the list exactly as found.

use parley_types::{Reaction, UserId};
use std::collections::BTreeSet;

/// What a toggle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionChange {
    /// The user now reacts with the emoji.
    Added,
    /// The user no longer reacts with the emoji.
    Removed,
}

/// Toggle `user`'s `emoji` reaction in place.
pub fn toggle_reaction(reactions: &mut Vec<Reaction>, emoji: &str, user: &UserId) -> ReactionChange {
    reactions.sort_by(|a, b| a.emoji.cmp(&b.emoji));
    match reactions.binary_search_by(|r| r.emoji.as_str().cmp(emoji)) {
        Ok(index) => {
            let group = &mut reactions[index];
            let change = if group.user_ids.remove(user) {
                ReactionChange::Removed
            } else {
                group.user_ids.insert(user.clone());
                ReactionChange::Added
            };
            group.count = group.user_ids.len() as u32;
            if group.user_ids.is_empty() {
                reactions.remove(index);
            }
            change
        }
        Err(index) => {
            let mut user_ids = BTreeSet::new();
            user_ids.insert(user.clone());
            reactions.insert(
                index,
                Reaction {
                    emoji: emoji.to_string(),
                    user_ids,
                    count: 1,
                },
            );
            ReactionChange::Added
        }
    }
}

/// Whether every group's count matches its set and no group is empty.
pub fn reactions_consistent(reactions: &[Reaction]) -> bool {
    reactions
        .iter()
        .all(|r| !r.user_ids.is_empty() && r.count as usize == r.user_ids.len())
}
