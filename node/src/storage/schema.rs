//! Mirror schema. Column names follow the source database so change-feed rows
//! can be written without translation.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chat (
    ROWID INTEGER PRIMARY KEY,
    guid TEXT,
    style INTEGER NOT NULL DEFAULT 0,
    state INTEGER NOT NULL DEFAULT 0,
    account_id TEXT,
    chat_identifier TEXT NOT NULL DEFAULT '',
    service_name TEXT,
    room_name TEXT,
    account_login TEXT,
    display_name TEXT,
    group_id TEXT
);

CREATE TABLE IF NOT EXISTS handle (
    ROWID INTEGER PRIMARY KEY,
    id TEXT NOT NULL DEFAULT '',
    country TEXT,
    service TEXT,
    uncanonicalized_id TEXT
);

CREATE TABLE IF NOT EXISTS message (
    ROWID INTEGER PRIMARY KEY,
    guid TEXT NOT NULL DEFAULT '',
    text TEXT,
    handle_id INTEGER NOT NULL DEFAULT 0,
    service TEXT,
    error INTEGER NOT NULL DEFAULT 0,
    date INTEGER NOT NULL DEFAULT 0,
    date_read INTEGER NOT NULL DEFAULT 0,
    date_delivered INTEGER NOT NULL DEFAULT 0,
    is_delivered INTEGER NOT NULL DEFAULT 0,
    is_finished INTEGER NOT NULL DEFAULT 0,
    is_from_me INTEGER NOT NULL DEFAULT 0,
    is_read INTEGER NOT NULL DEFAULT 0,
    is_sent INTEGER NOT NULL DEFAULT 0,
    cache_has_attachments INTEGER NOT NULL DEFAULT 0,
    item_type INTEGER NOT NULL DEFAULT 0,
    other_handle INTEGER NOT NULL DEFAULT 0,
    group_title TEXT,
    group_action_type INTEGER NOT NULL DEFAULT 0,
    associated_message_guid TEXT,
    associated_message_type INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS message_guid_idx ON message (guid);

CREATE TABLE IF NOT EXISTS attachment (
    ROWID INTEGER PRIMARY KEY,
    guid TEXT NOT NULL DEFAULT '',
    filename TEXT,
    uti TEXT,
    local_path TEXT
);

CREATE TABLE IF NOT EXISTS chat_message_join (
    chat_id INTEGER NOT NULL,
    message_id INTEGER NOT NULL,
    PRIMARY KEY (chat_id, message_id)
);
CREATE INDEX IF NOT EXISTS chat_message_join_message_idx ON chat_message_join (message_id);

CREATE TABLE IF NOT EXISTS chat_handle_join (
    chat_id INTEGER NOT NULL,
    handle_id INTEGER NOT NULL,
    PRIMARY KEY (chat_id, handle_id)
);

CREATE TABLE IF NOT EXISTS message_attachment_join (
    message_id INTEGER NOT NULL,
    attachment_id INTEGER NOT NULL,
    PRIMARY KEY (message_id, attachment_id)
);

CREATE TABLE IF NOT EXISTS message_update_date_join (
    message_id INTEGER PRIMARY KEY,
    message_update_date INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS message_update_date_idx
    ON message_update_date_join (message_update_date);
"#;
