use crate::attachment::Attachment;
use crate::reaction::Reaction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Object replacement character the source embeds once per attachment.
pub const ATTACHMENT_PLACEHOLDER: char = '\u{FFFC}';

/// Anything that can live in an ordered store: identified and timestamped.
pub trait Receivable: Clone {
    fn rowid(&self) -> i64;

    fn date(&self) -> i64;

    /// Fold the mutable fields of a newer copy of the same row into `self`.
    fn merge(&mut self, newer: &Self);

    /// Ordering is by date, then by identifier (larger is newer).
    fn is_newer<R: Receivable>(&self, other: &R) -> bool {
        (self.date(), self.rowid()) > (other.date(), other.rowid())
    }

    fn is_temporary(&self) -> bool {
        self.rowid() < 0
    }
}

/// One renderable piece of a message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePart {
    Text(String),
    /// A placeholder slot; `None` until the attachment row has been joined.
    Attachment(Option<Attachment>),
}

/// Split message text into ordered text spans and attachment slots.
///
/// Attachments are assigned to placeholders by position. Attachments beyond
/// the last placeholder get slots of their own at the end.
pub fn split_parts(text: &str, attachments: &[Attachment]) -> Vec<MessagePart> {
    let mut parts = Vec::new();
    let mut slot = 0;
    for (index, span) in text.split(ATTACHMENT_PLACEHOLDER).enumerate() {
        if index > 0 {
            parts.push(MessagePart::Attachment(attachments.get(slot).cloned()));
            slot += 1;
        }
        if !span.is_empty() {
            parts.push(MessagePart::Text(span.to_string()));
        }
    }
    parts.extend(
        attachments
            .iter()
            .skip(slot)
            .cloned()
            .map(|attachment| MessagePart::Attachment(Some(attachment))),
    );
    parts
}

/// A chat message as mirrored from the source (or synthesized for a pending send).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    rowid: i64,
    date: i64,
    pub guid: String,
    pub text: Option<String>,
    pub handle_id: i64,
    pub handle_name: String,
    pub service: Option<String>,
    pub date_read: i64,
    pub date_delivered: i64,
    pub is_delivered: bool,
    pub is_finished: bool,
    pub is_from_me: bool,
    pub is_read: bool,
    pub is_sent: bool,
    pub message_update_date: i64,
    pub parts: Vec<MessagePart>,
    /// handle id -> reaction class -> current winning reaction
    pub reactions: BTreeMap<i64, BTreeMap<i64, Reaction>>,
    /// Pending send this confirmed message replaced, if any.
    pub removed_temp_id: Option<i64>,
}

impl Message {
    pub fn new(rowid: i64, date: i64) -> Self {
        Self {
            rowid,
            date,
            guid: String::new(),
            text: None,
            handle_id: 0,
            handle_name: String::new(),
            service: None,
            date_read: 0,
            date_delivered: 0,
            is_delivered: false,
            is_finished: false,
            is_from_me: false,
            is_read: false,
            is_sent: false,
            message_update_date: 0,
            parts: Vec::new(),
            reactions: BTreeMap::new(),
            removed_temp_id: None,
        }
    }

    /// The optimistic copy of a message the local user just sent.
    pub fn pending(rowid: i64, text: &str, date: i64) -> Self {
        let mut message = Self::new(rowid, date).with_text(text);
        message.is_from_me = true;
        message.service = Some("iMessage".to_string());
        message
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.parts = split_parts(&text, &[]);
        self.text = Some(text);
        self
    }

    pub fn with_attachments(mut self, attachments: &[Attachment]) -> Self {
        self.parts = split_parts(self.text.as_deref().unwrap_or_default(), attachments);
        self
    }

    pub fn from_me(mut self, is_from_me: bool) -> Self {
        self.is_from_me = is_from_me;
        self
    }

    pub fn attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.parts.iter().filter_map(|part| match part {
            MessagePart::Attachment(Some(attachment)) => Some(attachment),
            _ => None,
        })
    }

    pub fn has_attachments(&self) -> bool {
        self.attachments().next().is_some()
    }

    /// Keep the reaction if it is the newest for its (handle, class) slot.
    ///
    /// Returns whether the reaction was stored.
    pub fn add_reaction(&mut self, reaction: Reaction) -> bool {
        let class = reaction.class();
        let slots = self.reactions.entry(reaction.handle_id).or_default();
        let stale = slots
            .get(&class)
            .is_some_and(|current| !reaction.is_newer(current));
        if stale {
            return false;
        }
        slots.insert(class, reaction);
        true
    }

    /// Current winners that are additions, i.e. what a client should display.
    pub fn active_reactions(&self) -> impl Iterator<Item = &Reaction> {
        self.reactions
            .values()
            .flat_map(|slots| slots.values())
            .filter(|reaction| reaction.is_addition())
    }

    pub fn reaction(&self, handle_id: i64, class: i64) -> Option<&Reaction> {
        self.reactions.get(&handle_id)?.get(&class)
    }
}

impl Receivable for Message {
    fn rowid(&self) -> i64 {
        self.rowid
    }

    fn date(&self) -> i64 {
        self.date
    }

    fn merge(&mut self, newer: &Self) {
        self.date_read = newer.date_read;
        self.date_delivered = newer.date_delivered;
        self.is_delivered = newer.is_delivered;
        self.is_finished = newer.is_finished;
        self.is_read = newer.is_read;
        self.is_sent = newer.is_sent;
        self.message_update_date = newer.message_update_date;
        self.service = newer.service.clone();
        if self.removed_temp_id.is_none() {
            self.removed_temp_id = newer.removed_temp_id;
        }
        if newer.has_attachments() {
            self.parts = newer.parts.clone();
        }
    }
}

/// Either kind of row a conversation receives from the mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Received {
    Message(Message),
    Reaction(Reaction),
}

impl Received {
    pub fn rowid(&self) -> i64 {
        match self {
            Received::Message(message) => message.rowid(),
            Received::Reaction(reaction) => reaction.rowid(),
        }
    }

    pub fn date(&self) -> i64 {
        match self {
            Received::Message(message) => message.date(),
            Received::Reaction(reaction) => reaction.date(),
        }
    }

    pub fn is_reaction(&self) -> bool {
        matches!(self, Received::Reaction(_))
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Received::Message(message) => Some(message),
            Received::Reaction(_) => None,
        }
    }
}

impl From<Message> for Received {
    fn from(message: Message) -> Self {
        Received::Message(message)
    }
}

impl From<Reaction> for Received {
    fn from(reaction: Reaction) -> Self {
        Received::Reaction(reaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaction::{ReactionKind, ReactionType};

    fn love(rowid: i64, handle: i64, date: i64) -> Reaction {
        Reaction::new(rowid, 1, ReactionType::addition(ReactionKind::Love), date)
            .with_handle(handle, "")
    }

    fn unlove(rowid: i64, handle: i64, date: i64) -> Reaction {
        Reaction::new(rowid, 1, ReactionType::removal(ReactionKind::Love), date)
            .with_handle(handle, "")
    }

    #[test]
    fn negative_ids_are_temporary() {
        assert!(Message::new(-1, 0).is_temporary());
        assert!(!Message::new(0, 0).is_temporary());
    }

    #[test]
    fn newer_breaks_date_ties_by_rowid() {
        let older = Message::new(1, 1);
        let newer = Message::new(2, 1);
        assert!(newer.is_newer(&older));
        assert!(!older.is_newer(&newer));
        assert!(Message::new(1, 2).is_newer(&newer));
    }

    #[test]
    fn split_parts_keeps_placeholder_order() {
        let first = Attachment::new(10);
        let second = Attachment::new(11);
        let text = format!("hi{0}there{0}", ATTACHMENT_PLACEHOLDER);
        let parts = split_parts(&text, &[first.clone(), second.clone()]);
        assert_eq!(
            parts,
            vec![
                MessagePart::Text("hi".into()),
                MessagePart::Attachment(Some(first)),
                MessagePart::Text("there".into()),
                MessagePart::Attachment(Some(second)),
            ]
        );
    }

    #[test]
    fn split_parts_leaves_unresolved_slots_empty() {
        let text = format!("{}caption", ATTACHMENT_PLACEHOLDER);
        let parts = split_parts(&text, &[]);
        assert_eq!(
            parts,
            vec![
                MessagePart::Attachment(None),
                MessagePart::Text("caption".into())
            ]
        );
    }

    #[test]
    fn latest_reaction_wins_in_either_order() {
        let first = love(1, 9, 10);
        let second = unlove(2, 9, 10);

        let mut forward = Message::new(1, 0);
        forward.add_reaction(first.clone());
        forward.add_reaction(second.clone());

        let mut backward = Message::new(1, 0);
        backward.add_reaction(second.clone());
        assert!(!backward.add_reaction(first));

        assert_eq!(forward.reaction(9, 0), Some(&second));
        assert_eq!(backward.reaction(9, 0), Some(&second));
    }

    #[test]
    fn reactions_are_kept_per_handle_and_class() {
        let mut message = Message::new(1, 0);
        message.add_reaction(love(1, 1, 5));
        message.add_reaction(love(2, 2, 5));
        message.add_reaction(
            Reaction::new(3, 1, ReactionType::addition(ReactionKind::Like), 6).with_handle(1, ""),
        );
        assert_eq!(message.reactions.len(), 2);
        assert_eq!(message.reactions[&1].len(), 2);
        assert_eq!(message.active_reactions().count(), 3);
    }

    #[test]
    fn removal_winner_is_not_active() {
        let mut message = Message::new(1, 0);
        message.add_reaction(love(1, 9, 20));
        message.add_reaction(unlove(2, 9, 21));
        assert_eq!(message.active_reactions().count(), 0);
        assert_eq!(message.reaction(9, 0).map(|r| r.rowid()), Some(2));
    }

    #[test]
    fn merge_updates_mutable_fields_only() {
        let mut stored = Message::new(1, 0).with_text("original");
        stored.service = Some("iMessage".into());
        let mut update = Message::new(1, 5).with_text("edited");
        update.date_read = 1;
        update.date_delivered = 1;
        update.is_delivered = true;
        update.is_read = true;
        update.is_sent = true;
        update.message_update_date = 1;
        update.service = Some("SMS".into());

        stored.merge(&update);

        assert_eq!(stored.date(), 0);
        assert_eq!(stored.text.as_deref(), Some("original"));
        assert_eq!(stored.date_read, 1);
        assert!(stored.is_delivered && stored.is_read && stored.is_sent);
        assert_eq!(stored.service.as_deref(), Some("SMS"));
    }

    #[test]
    fn merge_keeps_first_removed_temp_id() {
        let mut stored = Message::new(1, 0);
        let mut update = Message::new(1, 0);
        update.removed_temp_id = Some(-1);
        stored.merge(&update);
        assert_eq!(stored.removed_temp_id, Some(-1));

        update.removed_temp_id = Some(-7);
        stored.merge(&update);
        assert_eq!(stored.removed_temp_id, Some(-1));
    }

    #[test]
    fn merge_takes_attachments_when_present() {
        let attachment = Attachment::new(1).with_uti("public.png");
        let mut stored = Message::new(1, 0).with_text(ATTACHMENT_PLACEHOLDER.to_string());
        let update = Message::new(1, 0)
            .with_text(ATTACHMENT_PLACEHOLDER.to_string())
            .with_attachments(&[attachment.clone()]);
        stored.merge(&update);
        assert_eq!(stored.attachments().collect::<Vec<_>>(), vec![&attachment]);
    }
}
