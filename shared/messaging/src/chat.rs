//! Per-conversation aggregate: confirmed messages, pending sends and reconciliation.

use crate::message::{Message, Receivable, Received};
use crate::reaction::{Reaction, ReactionType};
use crate::store::OrderedMessageStore;
use crate::transport::{
    OutboundTransport, OutgoingMessage, ReactionTarget, ReceiptStatus, SendReceipt,
    TransportError,
};
use crate::unix_now;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// `chat.style` value the source uses for group conversations.
pub const GROUP_STYLE: i64 = 43;

/// Conversation metadata as stored in the mirror's `chat` table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatRecord {
    pub rowid: i64,
    pub chat_identifier: String,
    pub display_name: Option<String>,
    pub style: i64,
    pub service_name: Option<String>,
}

impl ChatRecord {
    pub fn new(rowid: i64) -> Self {
        Self {
            rowid,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct ChatState {
    messages: OrderedMessageStore<Message>,
    outgoing: OrderedMessageStore<Message>,
    latest_reaction: Option<Reaction>,
    recipients: Vec<String>,
    checkpoint: i64,
    dirty: bool,
    next_temp_id: i64,
}

/// One conversation as presented to clients.
///
/// A single mutex guards both stores so reconciliation, which touches both,
/// is atomic with respect to every other mutation. Readers take the same
/// lock and receive owned snapshots.
#[derive(Debug)]
pub struct ChatAggregate {
    record: ChatRecord,
    is_temporary: bool,
    state: Mutex<ChatState>,
}

impl ChatAggregate {
    pub fn new(record: ChatRecord) -> Self {
        Self {
            record,
            is_temporary: false,
            state: Mutex::new(ChatState {
                messages: OrderedMessageStore::new(),
                outgoing: OrderedMessageStore::new(),
                latest_reaction: None,
                recipients: Vec::new(),
                checkpoint: 0,
                dirty: false,
                next_temp_id: -1,
            }),
        }
    }

    /// A conversation the local user started that does not exist upstream yet.
    pub fn temporary(rowid: i64) -> Self {
        let mut chat = Self::new(ChatRecord::new(rowid));
        chat.is_temporary = true;
        chat
    }

    fn lock(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> i64 {
        self.record.rowid
    }

    pub fn record(&self) -> &ChatRecord {
        &self.record
    }

    pub fn is_group(&self) -> bool {
        self.record.style == GROUP_STYLE
    }

    pub fn is_imessage(&self) -> bool {
        self.record.service_name.as_deref() == Some("iMessage")
    }

    pub fn is_temporary(&self) -> bool {
        self.is_temporary
    }

    /// Adds every non-empty recipient; returns false if any was empty.
    pub fn add_recipients<I, S>(&self, recipients: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.lock();
        let mut all_added = true;
        for recipient in recipients {
            let recipient = recipient.into();
            if recipient.is_empty() {
                all_added = false;
            } else {
                state.recipients.push(recipient);
            }
        }
        all_added
    }

    pub fn recipients(&self) -> Vec<String> {
        self.lock().recipients.clone()
    }

    /// Display name, falling back to the recipient list.
    pub fn name(&self) -> String {
        match self.record.display_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.lock().recipients.join(", "),
        }
    }

    pub fn checkpoint(&self) -> i64 {
        self.lock().checkpoint
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Read and clear the local-send flag.
    pub fn take_dirty(&self) -> bool {
        std::mem::take(&mut self.lock().dirty)
    }

    pub fn add_message(&self, entity: Received, new_checkpoint: i64) {
        self.add_messages(std::iter::once(entity), new_checkpoint);
    }

    /// Fold mirror entities into the conversation and advance its checkpoint.
    pub fn add_messages<I>(&self, entities: I, new_checkpoint: i64)
    where
        I: IntoIterator<Item = Received>,
    {
        let mut state = self.lock();
        for entity in entities {
            match entity {
                Received::Reaction(reaction) => state.apply_reaction(reaction),
                Received::Message(message) => {
                    let rowid = message.rowid();
                    state.messages.insert(message);
                    if state
                        .messages
                        .get(rowid)
                        .is_some_and(|stored| stored.is_from_me)
                    {
                        state.reconcile(rowid);
                    }
                }
            }
        }
        state.checkpoint = state.checkpoint.max(new_checkpoint);
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.iter().cloned().collect()
    }

    pub fn message(&self, rowid: i64) -> Option<Message> {
        self.lock().messages.get(rowid).cloned()
    }

    pub fn pending(&self) -> Vec<Message> {
        self.lock().outgoing.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().outgoing.len()
    }

    /// Newest activity in the conversation, message or reaction.
    pub fn most_recent_message(&self) -> Option<Received> {
        let state = self.lock();
        let message = state.messages.most_recent();
        match (message, state.latest_reaction.as_ref()) {
            (Some(message), Some(reaction)) if reaction.is_newer(message) => {
                Some(Received::Reaction(reaction.clone()))
            }
            (Some(message), _) => Some(Received::Message(message.clone())),
            (None, reaction) => reaction.cloned().map(Received::Reaction),
        }
    }

    /// Send through the transport and show the message optimistically.
    ///
    /// The pending copy is created even when the transport fails; it is
    /// retired once the confirmed copy syncs back.
    pub async fn send_message<T>(
        &self,
        transport: &T,
        text: &str,
        recipients: &[String],
    ) -> SendReceipt
    where
        T: OutboundTransport + ?Sized,
    {
        let outgoing = OutgoingMessage {
            chat_id: (!self.is_temporary).then_some(self.record.rowid),
            text,
            recipients,
        };
        let status = match transport.send_message(outgoing).await {
            Ok(()) => ReceiptStatus::Queued,
            Err(err) => {
                warn!(chat_id = self.record.rowid, %err, "outbound send failed");
                ReceiptStatus::Failed
            }
        };

        let queued_at = unix_now();
        let mut state = self.lock();
        let temp_id = state.next_temp_id;
        state.next_temp_id -= 1;
        let message = Message::pending(temp_id, text, queued_at);
        state.messages.insert(message.clone());
        state.outgoing.insert(message);
        state.dirty = true;
        debug!(chat_id = self.record.rowid, temp_id, ?status, "pending send recorded");

        SendReceipt {
            temp_id,
            status,
            queued_at,
        }
    }

    /// Ask the remote host to react to a message. Nothing is applied locally;
    /// the reaction arrives through sync like any other.
    pub async fn send_reaction<T>(
        &self,
        transport: &T,
        message_id: i64,
        reaction_type: ReactionType,
    ) -> Result<(), TransportError>
    where
        T: OutboundTransport + ?Sized,
    {
        let target = {
            let state = self.lock();
            let message = state
                .messages
                .get(message_id)
                .filter(|message| !message.is_temporary())
                .ok_or(TransportError::UnknownTarget(message_id))?;
            ReactionTarget {
                message_id,
                guid: message.guid.clone(),
                part: 0,
            }
        };
        transport
            .send_reaction(self.record.rowid, &target, reaction_type)
            .await
    }
}

impl ChatState {
    fn apply_reaction(&mut self, reaction: Reaction) {
        let newest = self
            .latest_reaction
            .as_ref()
            .map_or(true, |current| reaction.is_newer(current));
        if newest {
            self.latest_reaction = Some(reaction.clone());
        }
        let (rowid, target) = (reaction.rowid(), reaction.target_message_id());
        if !self.messages.add_reaction(reaction) {
            debug!(rowid, target, "reaction not applied");
        }
    }

    /// Retire the pending send a confirmed self-sent message stands for.
    ///
    /// Identical texts retire in send order; the oldest send holds the
    /// largest temporary id.
    fn reconcile(&mut self, confirmed_id: i64) {
        let Some(confirmed) = self.messages.get(confirmed_id) else {
            return;
        };
        if confirmed.removed_temp_id.is_some() {
            return;
        }
        let temp_id = self
            .outgoing
            .iter()
            .filter(|pending| pending.text == confirmed.text && pending.rowid() != confirmed_id)
            .map(|pending| pending.rowid())
            .max();
        let Some(temp_id) = temp_id else {
            return;
        };

        if let Some(confirmed) = self.messages.get_mut(confirmed_id) {
            confirmed.removed_temp_id = Some(temp_id);
        }
        self.messages.remove(temp_id);
        self.outgoing.remove(temp_id);
        debug!(confirmed_id, temp_id, "pending send reconciled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaction::ReactionKind;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingTransport {
        fail: bool,
        sent: StdMutex<Vec<(Option<i64>, String, String)>>,
        reactions: StdMutex<Vec<(i64, ReactionTarget, i64)>>,
    }

    #[async_trait]
    impl OutboundTransport for RecordingTransport {
        async fn send_message(&self, message: OutgoingMessage<'_>) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((
                message.chat_id,
                message.text.to_string(),
                message.recipient_string(),
            ));
            if self.fail {
                Err(TransportError::Unreachable("offline".into()))
            } else {
                Ok(())
            }
        }

        async fn send_reaction(
            &self,
            chat_id: i64,
            target: &ReactionTarget,
            reaction_type: ReactionType,
        ) -> Result<(), TransportError> {
            self.reactions
                .lock()
                .unwrap()
                .push((chat_id, target.clone(), reaction_type.code()));
            Ok(())
        }

        async fn ping(&self) -> bool {
            !self.fail
        }
    }

    fn confirmed(rowid: i64, text: &str, from_me: bool) -> Received {
        Message::new(rowid, 100).with_text(text).from_me(from_me).into()
    }

    fn reaction(rowid: i64, target: i64, code: i64, date: i64) -> Received {
        Reaction::new(rowid, target, ReactionType::from_code(code).unwrap(), date)
            .with_handle(9, "+15555550100")
            .into()
    }

    fn ids(chat: &ChatAggregate) -> Vec<i64> {
        chat.messages().iter().map(|m| m.rowid()).collect()
    }

    #[test]
    fn new_chat_defaults() {
        let chat = ChatAggregate::new(ChatRecord::new(1));
        assert_eq!(chat.checkpoint(), 0);
        assert!(!chat.is_dirty());
        assert!(!chat.is_temporary());
        assert!(chat.messages().is_empty());
        assert!(chat.most_recent_message().is_none());
    }

    #[test]
    fn group_flag_follows_style() {
        let mut record = ChatRecord::new(1);
        record.style = GROUP_STYLE;
        assert!(ChatAggregate::new(record).is_group());
        assert!(!ChatAggregate::new(ChatRecord::new(2)).is_group());
    }

    #[test]
    fn checkpoint_only_moves_forward() {
        let chat = ChatAggregate::new(ChatRecord::new(1));
        chat.add_messages(vec![confirmed(1, "a", false)], 10);
        assert_eq!(chat.checkpoint(), 10);
        chat.add_messages(vec![confirmed(2, "b", false)], 3);
        assert_eq!(chat.checkpoint(), 10);
        assert_eq!(ids(&chat), vec![1, 2]);
    }

    #[test]
    fn end_to_end_ordering_and_reactions() {
        let chat = ChatAggregate::new(ChatRecord::new(1));
        chat.add_message(Message::new(1, 10).into(), 0);
        chat.add_message(Message::new(2, 5).into(), 0);
        assert_eq!(ids(&chat), vec![2, 1]);

        chat.add_message(reaction(3, 1, 2000, 20), 0);
        let message = chat.message(1).unwrap();
        let current = message.reaction(9, 0).unwrap();
        assert!(current.is_addition());
        assert_eq!(message.active_reactions().count(), 1);

        chat.add_message(reaction(4, 1, 3000, 21), 0);
        let message = chat.message(1).unwrap();
        let current = message.reaction(9, 0).unwrap();
        assert_eq!(current.reaction_type(), ReactionType::removal(ReactionKind::Love));
        assert_eq!(message.active_reactions().count(), 0);

        // the reaction is the newest activity in the conversation
        assert!(matches!(
            chat.most_recent_message(),
            Some(Received::Reaction(r)) if r.rowid() == 4
        ));
    }

    #[test]
    fn reaction_for_unknown_message_is_dropped() {
        let chat = ChatAggregate::new(ChatRecord::new(1));
        chat.add_message(reaction(3, 77, 2001, 20), 0);
        assert!(chat.messages().is_empty());
    }

    #[tokio::test]
    async fn confirmed_copy_retires_pending_send() {
        let chat = ChatAggregate::new(ChatRecord::new(1));
        let transport = RecordingTransport::default();

        let receipt = chat.send_message(&transport, "hi", &[]).await;
        assert_eq!(receipt.temp_id, -1);
        assert_eq!(receipt.status, ReceiptStatus::Queued);
        assert!(chat.take_dirty());
        assert_eq!(ids(&chat), vec![-1]);
        assert_eq!(chat.pending().len(), 1);

        chat.add_messages(vec![confirmed(500, "hi", true)], 0);

        assert_eq!(chat.pending_len(), 0);
        assert_eq!(ids(&chat), vec![500]);
        assert_eq!(chat.message(500).unwrap().removed_temp_id, Some(-1));
    }

    #[tokio::test]
    async fn reconciliation_requires_matching_text_and_self() {
        let chat = ChatAggregate::new(ChatRecord::new(1));
        let transport = RecordingTransport::default();
        chat.send_message(&transport, "hi", &[]).await;

        chat.add_messages(vec![confirmed(500, "bye", true)], 0);
        chat.add_messages(vec![confirmed(501, "hi", false)], 0);

        assert_eq!(chat.pending().len(), 1);
        assert!(chat.message(-1).is_some());
        assert_eq!(chat.message(500).unwrap().removed_temp_id, None);
    }

    #[tokio::test]
    async fn already_claimed_message_does_not_reconcile_again() {
        let chat = ChatAggregate::new(ChatRecord::new(1));
        let transport = RecordingTransport::default();
        chat.send_message(&transport, "same", &[]).await;
        chat.send_message(&transport, "same", &[]).await;

        chat.add_messages(vec![confirmed(500, "same", true)], 0);
        assert_eq!(chat.pending().len(), 1);
        assert_eq!(chat.message(500).unwrap().removed_temp_id, Some(-1));

        // a re-delivered copy of 500 must not claim the second pending send
        chat.add_messages(vec![confirmed(500, "same", true)], 0);
        assert_eq!(chat.pending().len(), 1);

        chat.add_messages(vec![confirmed(501, "same", true)], 0);
        assert!(chat.pending().is_empty());
        assert_eq!(chat.message(501).unwrap().removed_temp_id, Some(-2));
    }

    #[tokio::test]
    async fn identical_sends_retire_oldest_first() {
        let chat = ChatAggregate::new(ChatRecord::new(1));
        let transport = RecordingTransport::default();
        for _ in 0..3 {
            chat.send_message(&transport, "ok", &[]).await;
        }

        chat.add_messages(vec![confirmed(600, "ok", true)], 0);
        chat.add_messages(vec![confirmed(601, "ok", true)], 0);
        assert_eq!(chat.message(600).unwrap().removed_temp_id, Some(-1));
        assert_eq!(chat.message(601).unwrap().removed_temp_id, Some(-2));
        let left: Vec<_> = chat.pending().iter().map(|p| p.rowid()).collect();
        assert_eq!(left, vec![-3]);
    }

    #[tokio::test]
    async fn failed_send_still_creates_pending_entry() {
        let chat = ChatAggregate::new(ChatRecord::new(4));
        let transport = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        let receipt = chat.send_message(&transport, "offline", &[]).await;
        assert_eq!(receipt.status, ReceiptStatus::Failed);
        assert_eq!(chat.pending().len(), 1);
        assert!(chat.is_dirty());
    }

    #[tokio::test]
    async fn temporary_chat_sends_by_recipient() {
        let chat = ChatAggregate::temporary(-1);
        let recipients = vec!["+15555550100".to_string(), "a@example.com".to_string()];
        assert!(chat.add_recipients(recipients.clone()));
        chat.send_message(&transport_ok(), "hello", &recipients).await;
        assert_eq!(chat.name(), "+15555550100, a@example.com");
    }

    fn transport_ok() -> RecordingTransport {
        RecordingTransport::default()
    }

    #[tokio::test]
    async fn outgoing_message_carries_chat_address() {
        let transport = RecordingTransport::default();
        let recipients = vec!["+15555550100".to_string()];

        ChatAggregate::temporary(-3)
            .send_message(&transport, "new", &recipients)
            .await;
        ChatAggregate::new(ChatRecord::new(12))
            .send_message(&transport, "existing", &recipients)
            .await;

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent[0], (None, "new".into(), "+15555550100".into()));
        assert_eq!(sent[1], (Some(12), "existing".into(), "+15555550100".into()));
    }

    #[tokio::test]
    async fn send_reaction_is_transport_only() {
        let chat = ChatAggregate::new(ChatRecord::new(1));
        let mut message = Message::new(7, 1);
        message.guid = "495488E4-10A7-4BA2-A070-DE82AB2C2401".into();
        chat.add_message(message.into(), 0);
        let transport = RecordingTransport::default();

        chat.send_reaction(&transport, 7, ReactionType::addition(ReactionKind::Love))
            .await
            .unwrap();

        let sent = transport.reactions.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.associated_guid(), "p:0/495488E4-10A7-4BA2-A070-DE82AB2C2401");
        assert_eq!(sent[0].2, 2000);
        assert!(chat.message(7).unwrap().reactions.is_empty());
        assert!(chat.pending().is_empty());
    }

    #[tokio::test]
    async fn send_reaction_to_unknown_message_fails() {
        let chat = ChatAggregate::new(ChatRecord::new(1));
        let result = chat
            .send_reaction(&transport_ok(), 3, ReactionType::addition(ReactionKind::Like))
            .await;
        assert!(matches!(result, Err(TransportError::UnknownTarget(3))));
    }

    #[test]
    fn name_prefers_display_name() {
        let mut record = ChatRecord::new(1);
        record.display_name = Some("Book club".into());
        let chat = ChatAggregate::new(record);
        chat.add_recipients(["+15555550100"]);
        assert_eq!(chat.name(), "Book club");
        assert!(!chat.add_recipients(["", "x"]));
        assert_eq!(chat.recipients(), vec!["+15555550100", "x"]);
    }
}
