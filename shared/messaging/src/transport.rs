//! Outbound side: how a conversation asks the remote host to send something.

use crate::reaction::ReactionType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("remote host unreachable: {0}")]
    Unreachable(String),
    #[error("remote host rejected the request: {0}")]
    Rejected(String),
    #[error("remote command failed: {0}")]
    Command(String),
    #[error("message {0} cannot be addressed")]
    UnknownTarget(i64),
}

/// A text message headed for the remote host.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingMessage<'a> {
    /// `None` when the conversation does not exist upstream yet.
    pub chat_id: Option<i64>,
    pub text: &'a str,
    pub recipients: &'a [String],
}

impl OutgoingMessage<'_> {
    /// Recipients in the comma separated form the remote side expects.
    pub fn recipient_string(&self) -> String {
        self.recipients.join(", ")
    }
}

/// The message a reaction is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionTarget {
    pub message_id: i64,
    pub guid: String,
    pub part: u32,
}

impl ReactionTarget {
    /// Associated guid in the `p:<part>/<guid>` form used by the source.
    pub fn associated_guid(&self) -> String {
        format!("p:{}/{}", self.part, self.guid)
    }
}

/// Implemented by anything able to drive the remote host's messaging app.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn send_message(&self, message: OutgoingMessage<'_>) -> Result<(), TransportError>;

    async fn send_reaction(
        &self,
        chat_id: i64,
        target: &ReactionTarget,
        reaction_type: ReactionType,
    ) -> Result<(), TransportError>;

    /// Lightweight reachability check.
    async fn ping(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    /// Handed to the transport; waiting for the confirmed copy to sync back.
    Queued,
    /// The transport call failed. The pending entry stays until reconciled.
    Failed,
}

/// Result of an optimistic send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub temp_id: i64,
    pub status: ReceiptStatus,
    pub queued_at: i64,
}
