//! # parley-types
//!
//! Document models shared by every Parley crate.
//!
//! This crate provides:
//! - [`UserId`], [`ConversationId`], [`MessageId`], [`OutboxId`] - identifiers
//! - [`Conversation`] and [`Message`] - the documents held by the remote store
//! - [`ChatError`] - the error taxonomy surfaced to UI callers

#![warn(missing_docs)]
#![warn(clippy::all)]

mod conversation;
mod error;
mod ids;
mod message;

pub use conversation::{
    Conversation, ConversationKind, GroupInfo, GroupSettings, Identity, LastMessage,
    ParticipantProfile,
};
pub use error::{ChatError, ErrorKind};
pub use ids::{ConversationId, MessageId, OutboxId, Timestamp, UserId};
pub use message::{
    Attachment, EditRecord, EncryptedPayload, ForwardProvenance, Message, MessageKind,
    MessageStatus, Reaction, ReplyRef,
};
