//! The set of conversations the daemon keeps in memory.

use crate::storage::{Fetched, MessageRepository, MirrorError, MirrorResult};
use crate::sync::SyncEvent;
use chatmirror_messaging::{ChatAggregate, Received};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Refreshes a reaction row is retried for before its missing target is given up on.
pub const MAX_DEFERRED_ATTEMPTS: u32 = 5;

#[derive(Default)]
struct DirectoryState {
    chats: HashMap<i64, Arc<ChatAggregate>>,
    /// Chats whose full history has been read, not just the newest entity.
    loaded: HashSet<i64>,
    /// Mirror revision the directory has folded in.
    checkpoint: i64,
    /// Reaction rows per chat whose target message was missing, with retry counts.
    deferred: HashMap<i64, BTreeMap<i64, u32>>,
    next_temporary_id: i64,
}

/// Keeps one [`ChatAggregate`] per mirrored conversation and folds new mirror
/// rows into them after every merge.
pub struct ChatDirectory {
    repository: MessageRepository,
    state: Mutex<DirectoryState>,
}

impl ChatDirectory {
    pub fn new(repository: MessageRepository) -> Self {
        Self {
            repository,
            state: Mutex::new(DirectoryState {
                next_temporary_id: -1,
                ..DirectoryState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn checkpoint(&self) -> i64 {
        self.lock().checkpoint
    }

    pub fn len(&self) -> usize {
        self.lock().chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seed every conversation that has messages with its newest entity.
    ///
    /// Full history is read when a chat is first opened.
    pub fn load_all(&self) -> MirrorResult<usize> {
        let (_, revision) = self.repository.list_chats_with_changes(0)?;
        let records = self.repository.list_chats()?;
        let mut loaded = Vec::with_capacity(records.len());
        for record in records {
            loaded.push(Arc::new(self.seed(record.rowid, revision)?));
        }

        let count = loaded.len();
        let mut state = self.lock();
        for chat in loaded {
            state.chats.insert(chat.id(), chat);
        }
        state.checkpoint = state.checkpoint.max(revision);
        info!(chats = count, revision, "chat directory loaded");
        Ok(count)
    }

    pub fn get(&self, chat_id: i64) -> Option<Arc<ChatAggregate>> {
        self.lock().chats.get(&chat_id).cloned()
    }

    /// Conversations ordered by their newest activity, newest first.
    pub fn chats_by_recent(&self) -> Vec<Arc<ChatAggregate>> {
        let chats: Vec<_> = self.lock().chats.values().cloned().collect();
        let mut keyed: Vec<_> = chats
            .into_iter()
            .map(|chat| (chat.most_recent_message().as_ref().map(activity_key), chat))
            .collect();
        keyed.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id().cmp(&b.1.id())));
        keyed.into_iter().map(|(_, chat)| chat).collect()
    }

    /// The chat for `chat_id` with its full history, read from the mirror on first use.
    pub fn open(&self, chat_id: i64) -> MirrorResult<Arc<ChatAggregate>> {
        let chat = match self.get(chat_id) {
            Some(chat) if self.lock().loaded.contains(&chat_id) => return Ok(chat),
            Some(chat) => chat,
            None => {
                let chat = Arc::new(self.new_aggregate(chat_id)?);
                self.lock().chats.entry(chat_id).or_insert(chat).clone()
            }
        };
        let fetched = self.repository.fetch_since(chat_id, 0)?;
        let unresolved = self.fold(&chat, fetched);
        self.defer(chat_id, unresolved.into_iter().map(|rowid| (rowid, 0)));
        self.lock().loaded.insert(chat_id);
        debug!(chat_id, messages = chat.messages().len(), "chat history loaded");
        Ok(chat)
    }

    /// A new local conversation with no upstream chat yet.
    ///
    /// It is handed to the caller and not tracked; the real chat appears on a
    /// later refresh once the host has created it.
    pub fn start_conversation<I, S>(&self, recipients: I) -> Arc<ChatAggregate>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let temp_id = {
            let mut state = self.lock();
            let id = state.next_temporary_id;
            state.next_temporary_id -= 1;
            id
        };
        let chat = ChatAggregate::temporary(temp_id);
        chat.add_recipients(recipients);
        Arc::new(chat)
    }

    /// Fold every mirror change since the last refresh into the known chats.
    ///
    /// Chats with local sends are re-read even without new rows. Returns the
    /// ids of the chats that were touched.
    pub fn refresh(&self) -> MirrorResult<Vec<i64>> {
        let checkpoint = self.checkpoint();
        let (changed, revision) = self.repository.list_chats_with_changes(checkpoint)?;

        let mut targets: BTreeSet<i64> = changed.into_iter().collect();
        {
            let state = self.lock();
            targets.extend(
                state
                    .chats
                    .values()
                    .filter(|chat| chat.is_dirty())
                    .map(|chat| chat.id()),
            );
            targets.extend(state.deferred.keys().copied());
        }

        let mut touched = Vec::with_capacity(targets.len());
        for chat_id in targets {
            match self.refresh_chat(chat_id, revision) {
                Ok(()) => touched.push(chat_id),
                Err(MirrorError::ChatGone(id)) => {
                    warn!(chat_id = id, "chat deleted upstream, dropping it");
                    let mut state = self.lock();
                    state.chats.remove(&id);
                    state.loaded.remove(&id);
                    state.deferred.remove(&id);
                }
                Err(err) => return Err(err),
            }
        }

        let mut state = self.lock();
        state.checkpoint = state.checkpoint.max(revision);
        debug!(revision, chats = touched.len(), "chat directory refreshed");
        Ok(touched)
    }

    fn refresh_chat(&self, chat_id: i64, revision: i64) -> MirrorResult<()> {
        let Some(chat) = self.get(chat_id) else {
            let chat = Arc::new(self.seed(chat_id, revision)?);
            self.lock().chats.entry(chat_id).or_insert(chat);
            return Ok(());
        };
        // Surface deletions even for chats that only had local activity.
        self.repository.load_chat(chat_id)?;
        chat.take_dirty();

        let retrying = self.lock().deferred.remove(&chat_id).unwrap_or_default();
        let fetched = self.repository.fetch_since(chat_id, chat.checkpoint())?;
        let unresolved = self.fold(&chat, fetched);
        self.defer(chat_id, unresolved.into_iter().map(|rowid| (rowid, 0)));
        if retrying.is_empty() {
            return Ok(());
        }

        // Retried rows are older than the chat checkpoint; do not move it back.
        let rowids: Vec<i64> = retrying.keys().copied().collect();
        let mut retried = self.repository.fetch_rows(chat_id, &rowids)?;
        retried.checkpoint = chat.checkpoint();
        let still_missing = self.fold(&chat, retried);
        let kept = still_missing.into_iter().filter_map(|rowid| {
            let attempts = retrying.get(&rowid).copied().unwrap_or(0) + 1;
            if attempts >= MAX_DEFERRED_ATTEMPTS {
                debug!(chat_id, rowid, attempts, "reaction target never arrived, giving up");
                None
            } else {
                Some((rowid, attempts))
            }
        });
        self.defer(chat_id, kept);
        Ok(())
    }

    /// Chat record and recipients, with no messages yet.
    fn new_aggregate(&self, chat_id: i64) -> MirrorResult<ChatAggregate> {
        let record = self.repository.load_chat(chat_id)?;
        let chat = ChatAggregate::new(record);
        chat.add_recipients(self.repository.recipients(chat_id)?);
        Ok(chat)
    }

    fn seed(&self, chat_id: i64, revision: i64) -> MirrorResult<ChatAggregate> {
        let chat = self.new_aggregate(chat_id)?;
        let newest = self.repository.fetch_most_recent(chat_id)?;
        chat.add_messages(newest, revision);
        Ok(chat)
    }

    /// Fold fetched rows into `chat`, returning the reaction rows left unresolved.
    fn fold(&self, chat: &ChatAggregate, fetched: Fetched) -> Vec<i64> {
        let Fetched {
            entities,
            checkpoint,
            unresolved,
        } = fetched;
        if !entities.is_empty() {
            debug!(chat_id = chat.id(), count = entities.len(), "folding mirror rows");
        }
        chat.add_messages(entities, checkpoint);
        unresolved
    }

    fn defer(&self, chat_id: i64, rows: impl IntoIterator<Item = (i64, u32)>) {
        let mut rows = rows.into_iter().peekable();
        if rows.peek().is_none() {
            return;
        }
        let mut state = self.lock();
        let pending = state.deferred.entry(chat_id).or_default();
        for (rowid, attempts) in rows {
            let slot = pending.entry(rowid).or_insert(attempts);
            *slot = (*slot).max(attempts);
        }
    }

    pub fn deferred_len(&self) -> usize {
        self.lock().deferred.values().map(BTreeMap::len).sum()
    }

    /// Refresh after every mirror merge until the event stream closes or `stop` flips.
    pub fn follow(
        self: Arc<Self>,
        mut events: broadcast::Receiver<SyncEvent>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(SyncEvent::Merged { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            if let Err(err) = self.refresh() {
                                warn!(%err, "chat directory refresh failed");
                            }
                        }
                        Ok(SyncEvent::Failed { .. }) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Most recent entity of a chat as a (date, rowid) key, for callers sorting by activity.
pub fn activity_key(entity: &Received) -> (i64, i64) {
    (entity.date(), entity.rowid())
}
