//! In-process doubles for the remote host.

use crate::storage::ChangeSet;
use crate::sync::{RemoteSource, SyncError};
use async_trait::async_trait;
use chatmirror_messaging::{
    OutboundTransport, OutgoingMessage, ReactionTarget, ReactionType, TransportError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct FakeRemote {
    queued: Mutex<VecDeque<ChangeSet>>,
    files: Mutex<HashMap<i64, Vec<u8>>>,
    fail_next: AtomicBool,
    update_requests: Mutex<Vec<i64>>,
    file_requests: Mutex<Vec<i64>>,
}

impl FakeRemote {
    pub fn with_file(self, attachment_id: i64, bytes: &[u8]) -> Self {
        self.add_file(attachment_id, bytes);
        self
    }

    pub fn add_file(&self, attachment_id: i64, bytes: &[u8]) {
        self.files.lock().unwrap().insert(attachment_id, bytes.to_vec());
    }

    pub fn push_changes(&self, changes: ChangeSet) {
        self.queued.lock().unwrap().push_back(changes);
    }

    pub fn fail_next_update(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn update_requests(&self) -> Vec<i64> {
        self.update_requests.lock().unwrap().clone()
    }

    pub fn file_requests(&self) -> Vec<i64> {
        self.file_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn fetch_changes(&self, since: i64) -> Result<ChangeSet, SyncError> {
        self.update_requests.lock().unwrap().push(since);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SyncError::Remote("connection refused".into()));
        }
        Ok(self.queued.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn fetch_attachment(&self, attachment_id: i64) -> Result<Vec<u8>, SyncError> {
        self.file_requests.lock().unwrap().push(attachment_id);
        self.files
            .lock()
            .unwrap()
            .get(&attachment_id)
            .cloned()
            .ok_or_else(|| SyncError::Remote(format!("no file for ROWID {attachment_id}")))
    }
}

/// Outbound transport that records calls and answers pings from a switch.
#[derive(Default)]
pub struct ScriptedTransport {
    reachable: AtomicBool,
    pub messages: Mutex<Vec<(Option<i64>, String, String)>>,
    pub reactions: Mutex<Vec<(i64, String, i64)>>,
}

impl ScriptedTransport {
    pub fn reachable(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            ..Default::default()
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl OutboundTransport for ScriptedTransport {
    async fn send_message(&self, message: OutgoingMessage<'_>) -> Result<(), TransportError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("scripted outage".into()));
        }
        self.messages.lock().unwrap().push((
            message.chat_id,
            message.text.to_string(),
            message.recipient_string(),
        ));
        Ok(())
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
            .push((chat_id, target.associated_guid(), reaction_type.code()));
        Ok(())
    }

    async fn ping(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}
