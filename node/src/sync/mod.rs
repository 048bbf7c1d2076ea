//! Background synchronization: remote change feed -> mirror -> subscribers.

mod attachments;
mod checkpoint;
mod liveness;
mod remote;

pub use attachments::AttachmentCache;
pub use checkpoint::CheckpointStore;
pub use liveness::{Connectivity, ConnectivityTracker, LivenessMonitor, FAILURE_THRESHOLD};
pub use remote::{HttpRemoteSource, RemoteSource};

use crate::storage::{MergeSummary, MirrorDb, MirrorError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("remote source failed: {0}")]
    Remote(String),
    #[error("mirror write failed: {0}")]
    Mirror(#[from] MirrorError),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Remote(err.to_string())
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay between change-feed polls.
    pub poll_interval: Duration,
    /// Where downloaded attachments are kept.
    pub attachment_dir: PathBuf,
    /// Remote checkpoint file.
    pub checkpoint_path: PathBuf,
}

impl SyncConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.attachment_dir = dir.join("attachments");
        self.checkpoint_path = dir.join("lastAccess.json");
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            attachment_dir: PathBuf::from("data/attachments"),
            checkpoint_path: PathBuf::from("data/lastAccess.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A change set was written to the mirror.
    Merged {
        revision: i64,
        checkpoint: i64,
        messages: usize,
    },
    /// A tick failed; the checkpoint was left where it was.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The feed had nothing new.
    Idle,
    Merged(MergeSummary),
}

/// Pulls the remote change feed into the mirror on a fixed cadence.
pub struct SyncEngine {
    remote: Arc<dyn RemoteSource>,
    db: MirrorDb,
    attachments: AttachmentCache,
    checkpoints: CheckpointStore,
    poll_interval: Duration,
    checkpoint: i64,
    event_tx: broadcast::Sender<SyncEvent>,
    checkpoint_tx: watch::Sender<i64>,
}

impl SyncEngine {
    /// Build an engine, resuming from the persisted checkpoint.
    pub async fn new(config: SyncConfig, remote: Arc<dyn RemoteSource>, db: MirrorDb) -> Self {
        let checkpoints = CheckpointStore::new(&config.checkpoint_path);
        let checkpoint = checkpoints.load().await;
        let (event_tx, _rx) = broadcast::channel(128);
        let (checkpoint_tx, _rx) = watch::channel(checkpoint);
        info!(checkpoint, "sync engine resuming");
        Self {
            remote,
            db,
            attachments: AttachmentCache::new(&config.attachment_dir),
            checkpoints,
            poll_interval: config.poll_interval,
            checkpoint,
            event_tx,
            checkpoint_tx,
        }
    }

    pub fn checkpoint(&self) -> i64 {
        self.checkpoint
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub fn watch_checkpoint(&self) -> watch::Receiver<i64> {
        self.checkpoint_tx.subscribe()
    }

    /// One fetch -> merge -> checkpoint pass.
    ///
    /// The checkpoint only moves after the mirror transaction and every
    /// attachment download succeeded. The feed is inclusive of the
    /// checkpoint, so rows already mirrored come back; a pass that changed
    /// no rows and did not advance the checkpoint is `Idle`.
    pub async fn tick(&mut self) -> SyncResult<TickOutcome> {
        let changes = self.remote.fetch_changes(self.checkpoint).await?;
        if changes.is_empty() {
            debug!(checkpoint = self.checkpoint, "no remote changes");
            return Ok(TickOutcome::Idle);
        }

        let summary = self.db.apply_changes(&changes)?;
        self.attachments
            .sync(self.remote.as_ref(), &self.db, &changes.attachment)
            .await?;

        let previous = self.checkpoint;
        if let Some(next) = changes.checkpoint() {
            self.checkpoint = self.checkpoint.max(next);
        }
        if !summary.has_changes() && self.checkpoint == previous {
            debug!(checkpoint = self.checkpoint, "remote changes already mirrored");
            return Ok(TickOutcome::Idle);
        }
        self.checkpoints.save(self.checkpoint).await?;
        self.checkpoint_tx.send_replace(self.checkpoint);

        let _ = self.event_tx.send(SyncEvent::Merged {
            revision: summary.revision,
            checkpoint: self.checkpoint,
            messages: summary.messages,
        });
        Ok(TickOutcome::Merged(summary))
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(%err, checkpoint = self.checkpoint, "sync tick failed");
                        let _ = self.event_tx.send(SyncEvent::Failed {
                            reason: err.to_string(),
                        });
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(err) = self.checkpoints.save(self.checkpoint).await {
            warn!(%err, "failed to persist checkpoint at shutdown");
        }
        info!(checkpoint = self.checkpoint, "sync engine stopped");
    }

    pub fn spawn(self) -> SyncHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        SyncHandle { stop_tx, task }
    }
}

/// Running engine task.
pub struct SyncHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub async fn shutdown(self) -> SyncResult<()> {
        let _ = self.stop_tx.send(true);
        self.task
            .await
            .map_err(|e| SyncError::Checkpoint(format!("sync task join error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fixtures::{chat, message, push_message};
    use crate::storage::{AttachmentRow, ChangeSet, MessageAttachmentJoin};
    use crate::testing::FakeRemote;

    fn config(dir: &std::path::Path) -> SyncConfig {
        SyncConfig::default()
            .with_data_dir(dir)
            .with_poll_interval(Duration::from_millis(10))
    }

    fn feed(rowid: i64, date: i64) -> ChangeSet {
        let mut changes = ChangeSet::default();
        changes.chat.push(chat(1, "+15555550100"));
        push_message(&mut changes, message(rowid, 1, "hi", date));
        changes
    }

    #[tokio::test]
    async fn tick_merges_and_persists_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.push_changes(feed(10, 1700));
        let db = MirrorDb::open_in_memory().unwrap();

        let mut engine = SyncEngine::new(config(dir.path()), remote.clone(), db.clone()).await;
        let mut events = engine.subscribe();
        assert_eq!(engine.checkpoint(), 0);

        let outcome = engine.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Merged(ref s) if s.messages == 1));
        assert_eq!(engine.checkpoint(), 1700);
        assert_eq!(remote.update_requests(), vec![0]);
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::Merged {
                revision: 1,
                checkpoint: 1700,
                messages: 1
            }
        );

        assert_eq!(engine.tick().await.unwrap(), TickOutcome::Idle);
        assert_eq!(remote.update_requests(), vec![0, 1700]);

        let resumed = SyncEngine::new(config(dir.path()), remote, db).await;
        assert_eq!(resumed.checkpoint(), 1700);
    }

    /// Serves every row dated at or after `since`, like the host does.
    struct InclusiveFeed {
        dates: Vec<(i64, i64)>,
    }

    #[async_trait::async_trait]
    impl RemoteSource for InclusiveFeed {
        async fn fetch_changes(&self, since: i64) -> Result<ChangeSet, SyncError> {
            let mut changes = ChangeSet::default();
            for &(rowid, date) in self.dates.iter().filter(|(_, date)| *date >= since) {
                if changes.chat.is_empty() {
                    changes.chat.push(chat(1, "+15555550100"));
                }
                push_message(&mut changes, message(rowid, 1, "hi", date));
            }
            Ok(changes)
        }

        async fn fetch_attachment(&self, attachment_id: i64) -> Result<Vec<u8>, SyncError> {
            Err(SyncError::Remote(format!("no attachment {attachment_id}")))
        }
    }

    #[tokio::test]
    async fn redelivered_rows_leave_the_engine_idle() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(InclusiveFeed {
            dates: vec![(10, 1700), (11, 1800)],
        });
        let db = MirrorDb::open_in_memory().unwrap();
        let mut engine = SyncEngine::new(config(dir.path()), remote, db.clone()).await;
        let mut events = engine.subscribe();
        let mut checkpoint = engine.watch_checkpoint();

        let outcome = engine.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Merged(ref s) if s.messages == 2));
        assert_eq!(engine.checkpoint(), 1800);
        assert!(checkpoint.has_changed().unwrap());
        let _ = checkpoint.borrow_and_update();
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Merged { .. }));

        for _ in 0..3 {
            assert_eq!(engine.tick().await.unwrap(), TickOutcome::Idle);
        }
        assert_eq!(engine.checkpoint(), 1800);
        assert!(!checkpoint.has_changed().unwrap());
        assert!(events.try_recv().is_err());
        assert_eq!(db.revision().unwrap(), 1);
    }

    #[tokio::test]
    async fn failures_hold_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::default());
        let db = MirrorDb::open_in_memory().unwrap();
        let mut engine = SyncEngine::new(config(dir.path()), remote.clone(), db).await;

        remote.push_changes(feed(10, 1700));
        engine.tick().await.unwrap();

        remote.fail_next_update();
        assert!(matches!(engine.tick().await, Err(SyncError::Remote(_))));
        assert_eq!(engine.checkpoint(), 1700);

        // attachment download failure: rows land, checkpoint stays
        let mut changes = feed(11, 1800);
        changes.attachment.push(AttachmentRow {
            rowid: Some(5),
            filename: Some("a.png".into()),
            ..Default::default()
        });
        changes.message_attachment_join.push(MessageAttachmentJoin {
            message_id: 11,
            attachment_id: 5,
        });
        remote.push_changes(changes.clone());
        assert!(engine.tick().await.is_err());
        assert_eq!(engine.checkpoint(), 1700);

        remote.add_file(5, b"img");
        remote.push_changes(changes);
        engine.tick().await.unwrap();
        assert_eq!(engine.checkpoint(), 1800);
    }

    #[tokio::test]
    async fn spawned_engine_stops_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.push_changes(feed(10, 1700));
        let db = MirrorDb::open_in_memory().unwrap();

        let engine = SyncEngine::new(config(dir.path()), remote, db).await;
        let mut checkpoint = engine.watch_checkpoint();
        let handle = engine.spawn();

        checkpoint.changed().await.unwrap();
        assert_eq!(*checkpoint.borrow(), 1700);
        handle.shutdown().await.unwrap();

        let stored = CheckpointStore::new(dir.path().join("lastAccess.json"));
        assert_eq!(stored.load().await, 1700);
    }
}
