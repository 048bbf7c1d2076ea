//! Conversation model shared by the chatmirror node and its presentation clients.
//!
//! Everything in here is transport- and storage-agnostic: the node crate turns
//! mirror rows into [`Message`] and [`Reaction`] values and folds them into a
//! [`ChatAggregate`], which keeps them ordered and reconciles optimistic sends.

pub mod attachment;
pub mod chat;
pub mod message;
pub mod reaction;
pub mod store;
pub mod transport;

pub use attachment::Attachment;
pub use chat::{ChatAggregate, ChatRecord, GROUP_STYLE};
pub use message::{split_parts, Message, MessagePart, Receivable, Received, ATTACHMENT_PLACEHOLDER};
pub use reaction::{Reaction, ReactionKind, ReactionType};
pub use store::OrderedMessageStore;
pub use transport::{
    OutboundTransport, OutgoingMessage, ReactionTarget, ReceiptStatus, SendReceipt,
    TransportError,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Errors raised while building or addressing conversation entities.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("{0} row has no identifier")]
    MissingIdentifier(&'static str),
    #[error("unknown reaction code {0}")]
    UnknownReactionCode(i64),
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Current wall-clock time in unix seconds, the unit every mirror timestamp uses.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
