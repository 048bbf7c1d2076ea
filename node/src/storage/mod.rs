//! Local relational mirror of the remote conversation database.

mod repository;
mod rows;
mod schema;

pub use repository::{Fetched, MessageRepository};
pub use rows::{
    AttachmentRow, ChangeSet, ChatHandleJoin, ChatMessageJoin, ChatRow, HandleRow,
    MessageAttachmentJoin, MessageRow,
};

use chatmirror_messaging::ModelError;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

pub type MirrorResult<T> = Result<T, MirrorError>;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("chat {0} no longer exists in the mirror")]
    ChatGone(i64),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a merge wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Newest local change revision after this merge.
    pub revision: i64,
    pub messages: usize,
    pub chats: usize,
    pub handles: usize,
    pub attachments: usize,
    pub joins: usize,
    /// Rows dropped for lacking a `ROWID`.
    pub skipped: usize,
}

impl MergeSummary {
    /// Whether any row was inserted or actually changed.
    pub fn has_changes(&self) -> bool {
        self.messages + self.chats + self.handles + self.attachments + self.joins > 0
    }
}

/// Shared handle to the mirror database.
///
/// One connection sits behind a mutex; the sync engine writes through it and
/// the repository reads through it.
#[derive(Clone)]
pub struct MirrorDb {
    conn: Arc<Mutex<Connection>>,
}

impl MirrorDb {
    pub fn open(path: impl AsRef<Path>) -> MirrorResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> MirrorResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> MirrorResult<Self> {
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Highest local change revision written so far.
    pub fn revision(&self) -> MirrorResult<i64> {
        let conn = self.lock();
        let revision = conn.query_row(REVISION_SQL, [], |row| row.get(0))?;
        Ok(revision)
    }

    /// Write a change set in one transaction.
    ///
    /// Entity rows are inserted, or updated when a column differs; join rows
    /// are only added. New and changed message rows get a fresh local revision
    /// so readers can ask for "everything changed since revision N". A change
    /// set the mirror already holds leaves the revision where it was.
    pub fn apply_changes(&self, changes: &ChangeSet) -> MirrorResult<MergeSummary> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let revision = tx.query_row(REVISION_SQL, [], |row| row.get::<_, i64>(0))? + 1;

        let mut skipped = 0;
        let mut summary = MergeSummary {
            chats: upsert_chats(&tx, &changes.chat, &mut skipped)?,
            handles: upsert_handles(&tx, &changes.handle, &mut skipped)?,
            attachments: upsert_attachments(&tx, &changes.attachment, &mut skipped)?,
            messages: upsert_messages(&tx, &changes.message, revision, &mut skipped)?,
            joins: insert_joins(&tx, changes, revision)?,
            ..MergeSummary::default()
        };
        summary.skipped = skipped;
        summary.revision = tx.query_row(REVISION_SQL, [], |row| row.get(0))?;
        tx.commit()?;

        debug!(
            revision = summary.revision,
            messages = summary.messages,
            chats = summary.chats,
            attachments = summary.attachments,
            skipped = summary.skipped,
            "mirror merge committed"
        );
        Ok(summary)
    }

    /// Point an attachment row at its locally cached file.
    pub fn set_attachment_path(&self, attachment_id: i64, path: &str) -> MirrorResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE attachment SET local_path = ?2 WHERE ROWID = ?1",
            params![attachment_id, path],
        )?;
        Ok(())
    }

    /// Local file recorded for an attachment, if it has been cached.
    pub fn attachment_path(&self, attachment_id: i64) -> MirrorResult<Option<String>> {
        let conn = self.lock();
        let path = conn
            .query_row(
                "SELECT local_path FROM attachment WHERE ROWID = ?1",
                [attachment_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(path.flatten())
    }
}

const CHAT_COLUMNS: &[&str] = &[
    "ROWID",
    "guid",
    "style",
    "state",
    "account_id",
    "chat_identifier",
    "service_name",
    "room_name",
    "account_login",
    "display_name",
    "group_id",
];

const HANDLE_COLUMNS: &[&str] = &["ROWID", "id", "country", "service", "uncanonicalized_id"];

const ATTACHMENT_COLUMNS: &[&str] = &["ROWID", "guid", "filename", "uti"];

const MESSAGE_COLUMNS: &[&str] = &[
    "ROWID",
    "guid",
    "text",
    "handle_id",
    "service",
    "error",
    "date",
    "date_read",
    "date_delivered",
    "is_delivered",
    "is_finished",
    "is_from_me",
    "is_read",
    "is_sent",
    "cache_has_attachments",
    "item_type",
    "other_handle",
    "group_title",
    "group_action_type",
    "associated_message_guid",
    "associated_message_type",
];

const STAMP_SQL: &str = "INSERT OR REPLACE INTO message_update_date_join (message_id, message_update_date)
VALUES (?1, ?2)";

const REVISION_SQL: &str =
    "SELECT COALESCE(MAX(message_update_date), 0) FROM message_update_date_join";

/// Insert a row, or update it only when some column differs.
///
/// A row that arrives again unchanged reports zero affected rows.
fn upsert_sql(table: &str, columns: &[&str]) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let values = &columns[1..];
    let assignments: Vec<String> = values.iter().map(|c| format!("{c} = excluded.{c}")).collect();
    let differs: Vec<String> = values
        .iter()
        .map(|c| format!("{table}.{c} IS NOT excluded.{c}"))
        .collect();
    format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT(ROWID) DO UPDATE SET {} WHERE {}",
        columns.join(", "),
        placeholders.join(", "),
        assignments.join(", "),
        differs.join(" OR "),
    )
}

fn row_id<R: std::fmt::Debug>(
    table: &'static str,
    rowid: Option<i64>,
    row: &R,
    skipped: &mut usize,
) -> Option<i64> {
    if rowid.is_none() {
        let err = ModelError::MissingIdentifier(table);
        warn!(%err, ?row, "dropping change-feed row");
        *skipped += 1;
    }
    rowid
}

fn upsert_chats(tx: &Transaction<'_>, rows: &[ChatRow], skipped: &mut usize) -> MirrorResult<usize> {
    let mut stmt = tx.prepare_cached(&upsert_sql("chat", CHAT_COLUMNS))?;
    let mut written = 0;
    for row in rows {
        let Some(rowid) = row_id("chat", row.rowid, row, skipped) else {
            continue;
        };
        written += stmt.execute(params![
            rowid,
            row.guid,
            row.style,
            row.state,
            row.account_id,
            row.chat_identifier,
            row.service_name,
            row.room_name,
            row.account_login,
            row.display_name,
            row.group_id,
        ])?;
    }
    Ok(written)
}

fn upsert_handles(
    tx: &Transaction<'_>,
    rows: &[HandleRow],
    skipped: &mut usize,
) -> MirrorResult<usize> {
    let mut stmt = tx.prepare_cached(&upsert_sql("handle", HANDLE_COLUMNS))?;
    let mut written = 0;
    for row in rows {
        let Some(rowid) = row_id("handle", row.rowid, row, skipped) else {
            continue;
        };
        written += stmt.execute(params![
            rowid,
            row.id,
            row.country,
            row.service,
            row.uncanonicalized_id
        ])?;
    }
    Ok(written)
}

fn upsert_attachments(
    tx: &Transaction<'_>,
    rows: &[AttachmentRow],
    skipped: &mut usize,
) -> MirrorResult<usize> {
    let mut stmt = tx.prepare_cached(&upsert_sql("attachment", ATTACHMENT_COLUMNS))?;
    let mut written = 0;
    for row in rows {
        let Some(rowid) = row_id("attachment", row.rowid, row, skipped) else {
            continue;
        };
        written += stmt.execute(params![rowid, row.guid, row.filename, row.uti])?;
    }
    Ok(written)
}

/// Only rows that were new or changed get the merge revision.
fn upsert_messages(
    tx: &Transaction<'_>,
    rows: &[MessageRow],
    revision: i64,
    skipped: &mut usize,
) -> MirrorResult<usize> {
    let mut message = tx.prepare_cached(&upsert_sql("message", MESSAGE_COLUMNS))?;
    let mut stamp = tx.prepare_cached(STAMP_SQL)?;
    let mut written = 0;
    for row in rows {
        let Some(rowid) = row_id("message", row.rowid, row, skipped) else {
            continue;
        };
        let changed = message.execute(params![
            rowid,
            row.guid,
            row.text,
            row.handle_id,
            row.service,
            row.error,
            row.date,
            row.date_read,
            row.date_delivered,
            row.is_delivered,
            row.is_finished,
            row.is_from_me,
            row.is_read,
            row.is_sent,
            row.cache_has_attachments,
            row.item_type,
            row.other_handle,
            row.group_title,
            row.group_action_type,
            row.associated_message_guid,
            row.associated_message_type,
        ])?;
        if changed > 0 {
            stamp.execute(params![rowid, revision])?;
            written += 1;
        }
    }
    Ok(written)
}

/// Join rows are only ever added. A message newly joined to a chat is
/// re-stamped so readers of that chat pick it up.
fn insert_joins(tx: &Transaction<'_>, changes: &ChangeSet, revision: i64) -> MirrorResult<usize> {
    let mut inserted = 0;
    let mut chat_message = tx.prepare_cached(
        "INSERT OR IGNORE INTO chat_message_join (chat_id, message_id) VALUES (?1, ?2)",
    )?;
    let mut stamp = tx.prepare_cached(STAMP_SQL)?;
    for join in &changes.chat_message_join {
        if chat_message.execute(params![join.chat_id, join.message_id])? > 0 {
            stamp.execute(params![join.message_id, revision])?;
            inserted += 1;
        }
    }

    let mut chat_handle = tx.prepare_cached(
        "INSERT OR IGNORE INTO chat_handle_join (chat_id, handle_id) VALUES (?1, ?2)",
    )?;
    for join in &changes.chat_handle_join {
        inserted += chat_handle.execute(params![join.chat_id, join.handle_id])?;
    }

    let mut message_attachment = tx.prepare_cached(
        "INSERT OR IGNORE INTO message_attachment_join (message_id, attachment_id) VALUES (?1, ?2)",
    )?;
    for join in &changes.message_attachment_join {
        inserted += message_attachment.execute(params![join.message_id, join.attachment_id])?;
    }
    Ok(inserted)
}
