//! Read side of the mirror: turns rows into conversation entities.

use super::{MirrorDb, MirrorError, MirrorResult};
use chatmirror_messaging::{
    Attachment, ChatRecord, Message, Reaction, ReactionType, Received,
};
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::debug;

/// Length of a message guid; reaction targets are the trailing 36 characters
/// of `associated_message_guid`.
const GUID_LEN: usize = 36;

macro_rules! message_select {
    () => {
        "SELECT m.ROWID, m.guid, m.text, m.handle_id, m.service, m.date, m.date_read,
                m.date_delivered, m.is_delivered, m.is_finished, m.is_from_me, m.is_read,
                m.is_sent, m.associated_message_guid, m.associated_message_type,
                COALESCE(u.message_update_date, 0), COALESCE(h.id, '')
         FROM message AS m
             INNER JOIN chat_message_join AS cmj ON cmj.message_id = m.ROWID
             LEFT JOIN message_update_date_join AS u ON u.message_id = m.ROWID
             LEFT JOIN handle AS h ON h.ROWID = m.handle_id"
    };
}

const MESSAGES_SINCE_SQL: &str = concat!(
    message_select!(),
    " WHERE cmj.chat_id = ?1 AND u.message_update_date > ?2 ORDER BY m.date, m.ROWID"
);

const MESSAGE_BY_ID_SQL: &str = concat!(
    message_select!(),
    " WHERE cmj.chat_id = ?1 AND m.ROWID = ?2"
);

const MESSAGES_NEWEST_FIRST_SQL: &str = concat!(
    message_select!(),
    " WHERE cmj.chat_id = ?1 ORDER BY m.date DESC, m.ROWID DESC"
);

const ATTACHMENTS_SQL: &str = "SELECT a.ROWID, a.guid, COALESCE(a.local_path, a.filename), a.uti
FROM attachment AS a
    INNER JOIN message_attachment_join AS maj
        ON a.ROWID = maj.attachment_id
        AND maj.message_id = ?1
ORDER BY a.ROWID";

const MESSAGE_BY_GUID_SQL: &str = "SELECT ROWID FROM message WHERE guid = ?1";

const CHANGED_CHATS_SQL: &str = "SELECT cmj.chat_id, MAX(u.message_update_date)
FROM chat_message_join AS cmj
    INNER JOIN message_update_date_join AS u
        ON u.message_id = cmj.message_id
        AND u.message_update_date > ?1
GROUP BY cmj.chat_id
ORDER BY cmj.chat_id";

const CHAT_SQL: &str = "SELECT ROWID, chat_identifier, display_name, style, service_name
FROM chat
    WHERE ROWID = ?1";

const CHATS_SQL: &str = "SELECT ROWID, chat_identifier, display_name, style, service_name
FROM chat
    WHERE EXISTS (SELECT 1 FROM chat_message_join WHERE chat_id = chat.ROWID)
ORDER BY ROWID";

const RECIPIENTS_SQL: &str = "SELECT h.id
FROM handle AS h
    INNER JOIN chat_handle_join AS chj
        ON h.ROWID = chj.handle_id
        AND chj.chat_id = ?1
ORDER BY h.ROWID";

/// Entities read for one conversation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fetched {
    /// Messages and reactions in ascending (date, rowid) order.
    pub entities: Vec<Received>,
    /// Largest update revision among the rows read, or the caller's checkpoint.
    pub checkpoint: i64,
    /// Reaction rows whose target message is not in the mirror yet.
    pub unresolved: Vec<i64>,
}

/// One `message` row before it is classified as message or reaction.
struct MessageRecord {
    rowid: i64,
    guid: String,
    text: Option<String>,
    handle_id: i64,
    service: Option<String>,
    date: i64,
    date_read: i64,
    date_delivered: i64,
    is_delivered: bool,
    is_finished: bool,
    is_from_me: bool,
    is_read: bool,
    is_sent: bool,
    associated_message_guid: Option<String>,
    associated_message_type: i64,
    message_update_date: i64,
    handle_name: String,
}

impl MessageRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            rowid: row.get(0)?,
            guid: row.get(1)?,
            text: row.get(2)?,
            handle_id: row.get(3)?,
            service: row.get(4)?,
            date: row.get(5)?,
            date_read: row.get(6)?,
            date_delivered: row.get(7)?,
            is_delivered: row.get(8)?,
            is_finished: row.get(9)?,
            is_from_me: row.get(10)?,
            is_read: row.get(11)?,
            is_sent: row.get(12)?,
            associated_message_guid: row.get(13)?,
            associated_message_type: row.get(14)?,
            message_update_date: row.get(15)?,
            handle_name: row.get(16)?,
        })
    }

    fn reaction_guid(&self) -> Option<&str> {
        self.associated_message_guid
            .as_deref()
            .filter(|guid| !guid.is_empty())
    }

    fn into_message(self, attachments: &[Attachment]) -> Message {
        let mut message = Message::new(self.rowid, self.date);
        if let Some(text) = self.text {
            message = message.with_text(text);
        }
        message = message.with_attachments(attachments);
        message.guid = self.guid;
        message.handle_id = self.handle_id;
        message.handle_name = self.handle_name;
        message.service = self.service;
        message.date_read = self.date_read;
        message.date_delivered = self.date_delivered;
        message.is_delivered = self.is_delivered;
        message.is_finished = self.is_finished;
        message.is_from_me = self.is_from_me;
        message.is_read = self.is_read;
        message.is_sent = self.is_sent;
        message.message_update_date = self.message_update_date;
        message
    }
}

/// Splits `p:N/GUID` into the part index and the trailing guid.
fn parse_associated_guid(associated: &str) -> (u32, &str) {
    let start = associated.len().saturating_sub(GUID_LEN);
    let guid = associated.get(start..).unwrap_or(associated);
    let part = associated
        .strip_prefix("p:")
        .and_then(|rest| rest.split_once('/'))
        .and_then(|(index, _)| index.parse().ok())
        .unwrap_or(0);
    (part, guid)
}

enum Classified {
    Entity(Received),
    Unresolved(i64),
    Skipped,
}

/// Query layer over the mirror.
#[derive(Clone)]
pub struct MessageRepository {
    db: MirrorDb,
}

impl MessageRepository {
    pub fn new(db: MirrorDb) -> Self {
        Self { db }
    }

    /// Every message and reaction of a chat whose update revision is newer than `checkpoint`.
    pub fn fetch_since(&self, chat_id: i64, checkpoint: i64) -> MirrorResult<Fetched> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(MESSAGES_SINCE_SQL)?;
        let records = stmt
            .query_map((chat_id, checkpoint), MessageRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut fetched = Fetched {
            checkpoint,
            ..Fetched::default()
        };
        for record in records {
            fetched.checkpoint = fetched.checkpoint.max(record.message_update_date);
            match classify(&conn, record)? {
                Classified::Entity(entity) => fetched.entities.push(entity),
                Classified::Unresolved(rowid) => fetched.unresolved.push(rowid),
                Classified::Skipped => {}
            }
        }
        Ok(fetched)
    }

    /// Re-read specific rows regardless of their update revision.
    pub fn fetch_rows(&self, chat_id: i64, rowids: &[i64]) -> MirrorResult<Fetched> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(MESSAGE_BY_ID_SQL)?;
        let mut fetched = Fetched::default();
        for &rowid in rowids {
            let Some(record) = stmt
                .query_row((chat_id, rowid), MessageRecord::from_row)
                .optional()?
            else {
                continue;
            };
            fetched.checkpoint = fetched.checkpoint.max(record.message_update_date);
            match classify(&conn, record)? {
                Classified::Entity(entity) => fetched.entities.push(entity),
                Classified::Unresolved(rowid) => fetched.unresolved.push(rowid),
                Classified::Skipped => {}
            }
        }
        fetched.entities.sort_by_key(|entity| (entity.date(), entity.rowid()));
        Ok(fetched)
    }

    /// Newest message or resolvable reaction in a chat.
    pub fn fetch_most_recent(&self, chat_id: i64) -> MirrorResult<Option<Received>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(MESSAGES_NEWEST_FIRST_SQL)?;
        let mut rows = stmt.query([chat_id])?;
        while let Some(row) = rows.next()? {
            let record = MessageRecord::from_row(row)?;
            if let Classified::Entity(entity) = classify(&conn, record)? {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// Chats with rows newer than `checkpoint`, and the newest revision among them.
    pub fn list_chats_with_changes(&self, checkpoint: i64) -> MirrorResult<(Vec<i64>, i64)> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(CHANGED_CHATS_SQL)?;
        let mut chat_ids = Vec::new();
        let mut newest = checkpoint;
        let mut rows = stmt.query([checkpoint])?;
        while let Some(row) = rows.next()? {
            chat_ids.push(row.get(0)?);
            newest = newest.max(row.get(1)?);
        }
        Ok((chat_ids, newest))
    }

    pub fn load_chat(&self, chat_id: i64) -> MirrorResult<ChatRecord> {
        let conn = self.db.lock();
        conn.query_row(CHAT_SQL, [chat_id], chat_record)
            .optional()?
            .ok_or(MirrorError::ChatGone(chat_id))
    }

    /// Chats that have at least one message.
    pub fn list_chats(&self) -> MirrorResult<Vec<ChatRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(CHATS_SQL)?;
        let chats = stmt
            .query_map([], chat_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chats)
    }

    pub fn recipients(&self, chat_id: i64) -> MirrorResult<Vec<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(RECIPIENTS_SQL)?;
        let recipients = stmt
            .query_map([chat_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(recipients)
    }
}

fn chat_record(row: &Row<'_>) -> rusqlite::Result<ChatRecord> {
    Ok(ChatRecord {
        rowid: row.get(0)?,
        chat_identifier: row.get(1)?,
        display_name: row.get(2)?,
        style: row.get(3)?,
        service_name: row.get(4)?,
    })
}

fn classify(conn: &Connection, record: MessageRecord) -> MirrorResult<Classified> {
    let Some(associated) = record.reaction_guid() else {
        let attachments = load_attachments(conn, record.rowid)?;
        return Ok(Classified::Entity(record.into_message(&attachments).into()));
    };

    let reaction_type = match ReactionType::from_code(record.associated_message_type) {
        Ok(reaction_type) => reaction_type,
        Err(err) => {
            debug!(rowid = record.rowid, %err, "skipping associated message");
            return Ok(Classified::Skipped);
        }
    };

    let (part, target_guid) = parse_associated_guid(associated);
    let target: Option<i64> = conn
        .prepare_cached(MESSAGE_BY_GUID_SQL)?
        .query_row([target_guid], |row| row.get(0))
        .optional()?;
    let Some(target) = target else {
        debug!(rowid = record.rowid, target_guid, "reaction target not mirrored yet");
        return Ok(Classified::Unresolved(record.rowid));
    };

    let mut reaction = Reaction::new(record.rowid, target, reaction_type, record.date)
        .with_handle(record.handle_id, record.handle_name)
        .with_guid(record.guid)
        .with_target_part(part);
    reaction.is_from_me = record.is_from_me;
    reaction.text = record.text;
    Ok(Classified::Entity(reaction.into()))
}

fn load_attachments(conn: &Connection, message_id: i64) -> MirrorResult<Vec<Attachment>> {
    let mut stmt = conn.prepare_cached(ATTACHMENTS_SQL)?;
    let attachments = stmt
        .query_map([message_id], |row| {
            let mut attachment = Attachment::new(row.get(0)?).with_guid(row.get::<_, String>(1)?);
            attachment.filename = row.get(2)?;
            attachment.uti = row.get(3)?;
            Ok(attachment)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(attachments)
}
