//! Change-feed rows as the remote source serializes them.
//!
//! Each table arrives as a list of JSON objects keyed by column name. Columns
//! the mirror does not keep are ignored, missing ones take their defaults, and
//! rows without a `ROWID` (the source emits `{}` for rows it could not find)
//! are skipped on merge.

use serde::{Deserialize, Deserializer, Serialize};

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub attachment: Vec<AttachmentRow>,
    #[serde(default)]
    pub message_attachment_join: Vec<MessageAttachmentJoin>,
    #[serde(default)]
    pub chat: Vec<ChatRow>,
    #[serde(default)]
    pub handle: Vec<HandleRow>,
    #[serde(default)]
    pub message: Vec<MessageRow>,
    #[serde(default)]
    pub chat_handle_join: Vec<ChatHandleJoin>,
    #[serde(default)]
    pub chat_message_join: Vec<ChatMessageJoin>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.attachment.is_empty()
            && self.message_attachment_join.is_empty()
            && self.chat.is_empty()
            && self.handle.is_empty()
            && self.message.is_empty()
            && self.chat_handle_join.is_empty()
            && self.chat_message_join.is_empty()
    }

    /// Newest change time carried by the feed, used as the next remote checkpoint.
    ///
    /// Rows without an update date fall back to their latest timestamp.
    pub fn checkpoint(&self) -> Option<i64> {
        self.message
            .iter()
            .filter(|row| row.rowid.is_some())
            .map(MessageRow::changed_at)
            .max()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    #[serde(rename = "ROWID", default)]
    pub rowid: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub guid: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub handle_id: i64,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub error: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub date: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub date_read: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub date_delivered: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub is_delivered: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub is_finished: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub is_from_me: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub is_read: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub is_sent: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub cache_has_attachments: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub item_type: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub other_handle: i64,
    #[serde(default)]
    pub group_title: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub group_action_type: i64,
    #[serde(default)]
    pub associated_message_guid: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub associated_message_type: i64,
    #[serde(default)]
    pub message_update_date: Option<i64>,
}

impl MessageRow {
    fn changed_at(&self) -> i64 {
        self.message_update_date
            .unwrap_or_else(|| self.date.max(self.date_read).max(self.date_delivered))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRow {
    #[serde(rename = "ROWID", default)]
    pub rowid: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub guid: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub uti: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRow {
    #[serde(rename = "ROWID", default)]
    pub rowid: Option<i64>,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub style: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub state: i64,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub chat_identifier: String,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub account_login: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandleRow {
    #[serde(rename = "ROWID", default)]
    pub rowid: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub id: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub uncanonicalized_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessageJoin {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatHandleJoin {
    pub chat_id: i64,
    pub handle_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttachmentJoin {
    pub message_id: i64,
    pub attachment_id: i64,
}
