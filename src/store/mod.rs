//! Public handle onto the task store: open/close a journal directory and
//! dispatch requests to the single-threaded serializer handler.

mod handler;
mod overlay;
mod request;
mod snapshot;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::warn;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, StoreError};
use crate::fs::{Fs, RealFs};
use crate::index::GroupIndex;
use crate::journal::{recovery, Journal};
use crate::task::Task;

pub use request::{ChangeTask, NewTask};
use request::Request;

/// The crate's only configuration surface: a plain constructor-time struct,
/// not a file format. Loading this from a config file, if an embedder wants
/// one, is that embedder's concern.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub directory: PathBuf,
    /// Strict mode fsyncs every journal append before an `update` or
    /// `claim` reports success; opportunistic mode applies the change to
    /// memory and replies immediately, journaling asynchronously.
    pub strict: bool,
    /// Number of successful transactions between automatic snapshots.
    /// Any value in the tens of thousands is appropriate; this defaults
    /// to 50,000.
    pub snapshot_threshold: u64,
    /// Bounded number of overlay/tombstone entries folded back into the
    /// base map per update and per idle tick once a snapshot settles.
    pub drain_batch: usize,
    /// Bound on the request channel between callers and the handler.
    pub channel_bound: usize,
}

impl StoreOptions {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            strict: true,
            snapshot_threshold: 50_000,
            drain_batch: 64,
            channel_bound: 256,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn snapshot_threshold(mut self, n: u64) -> Self {
        self.snapshot_threshold = n;
        self
    }

    pub fn drain_batch(mut self, n: usize) -> Self {
        self.drain_batch = n;
        self
    }

    pub fn channel_bound(mut self, n: usize) -> Self {
        self.channel_bound = n;
        self
    }
}

/// A handle onto an open task store. Cheaply `Clone`-able; every clone
/// posts to the same serializer handler. Dropping every clone without
/// calling [`TaskStore::close`] leaves the journal's advisory lock held
/// until the handler task itself is dropped.
#[derive(Clone)]
pub struct TaskStore {
    req_tx: mpsc::Sender<Request>,
}

impl TaskStore {
    /// Opens (or creates) a task store journal directory on the real
    /// filesystem, recovers its state, and spawns the serializer handler.
    pub async fn open(options: StoreOptions) -> Result<Self> {
        Self::open_with_fs(options, Arc::new(RealFs)).await
    }

    /// Like [`TaskStore::open`], but against an arbitrary [`Fs`]
    /// implementation — used by tests to substitute [`crate::fs::MemFs`].
    pub async fn open_with_fs(options: StoreOptions, fs: Arc<dyn Fs>) -> Result<Self> {
        let recovered = recovery::recover(fs.as_ref(), &options.directory)?;
        for warning in &recovered.warnings {
            warn!("{}", warning);
        }

        let journal = Journal::open(options.directory.clone(), fs, options.strict)?;

        let mut groups: HashMap<String, GroupIndex> = HashMap::new();
        for task in recovered.base.values() {
            groups
                .entry(task.group.clone())
                .or_insert_with(GroupIndex::new)
                .push(task.clone());
        }

        let (req_tx, req_rx) = mpsc::channel(options.channel_bound);
        let handler = handler::Handler::new(
            recovered.base,
            groups,
            journal,
            recovered.next_id,
            options.strict,
            options.snapshot_threshold,
            options.drain_batch,
            req_rx,
        );
        tokio::spawn(handler.run());

        Ok(Self { req_tx })
    }

    pub async fn update(
        &self,
        owner: u64,
        adds: Vec<NewTask>,
        changes: Vec<ChangeTask>,
        deletes: Vec<u64>,
        depends: Vec<u64>,
    ) -> Result<Vec<Task>> {
        let (reply, rx) = oneshot::channel();
        self.req_tx
            .send(Request::Update { owner, adds, changes, deletes, depends, reply })
            .await
            .map_err(|_| StoreError::NotOpen)?;
        rx.await.map_err(|_| StoreError::NotOpen)?
    }

    pub async fn claim(&self, owner: u64, groups: Vec<String>, duration_ms: u64) -> Result<Vec<Task>> {
        let (reply, rx) = oneshot::channel();
        self.req_tx
            .send(Request::Claim { owner, groups, duration_ms, reply })
            .await
            .map_err(|_| StoreError::NotOpen)?;
        rx.await.map_err(|_| StoreError::NotOpen)?
    }

    pub async fn list_group(&self, name: impl Into<String>, limit: i64, allow_owned: bool) -> Vec<Task> {
        let (reply, rx) = oneshot::channel();
        if self
            .req_tx
            .send(Request::ListGroup { name: name.into(), limit, allow_owned, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn groups(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.req_tx.send(Request::Groups { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn tasks(&self, ids: Vec<u64>) -> Vec<Option<Task>> {
        let len = ids.len();
        let (reply, rx) = oneshot::channel();
        if self.req_tx.send(Request::Tasks { ids, reply }).await.is_err() {
            return vec![None; len];
        }
        rx.await.unwrap_or_else(|_| vec![None; len])
    }

    /// Forces a snapshot to start if one is not already in progress. Does
    /// not wait for the snapshot to finish — only for it to have started.
    pub async fn snapshot(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.req_tx
            .send(Request::Snapshot { reply })
            .await
            .map_err(|_| StoreError::NotOpen)?;
        rx.await.map_err(|_| StoreError::NotOpen)?
    }

    /// Gracefully stops the handler: flushes and freezes the current
    /// journal segment and releases the advisory lock. Every clone of this
    /// handle (and any future operation on them) subsequently fails with
    /// [`StoreError::NotOpen`].
    pub async fn close(self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.req_tx
            .send(Request::Close { reply })
            .await
            .map_err(|_| StoreError::NotOpen)?;
        rx.await.map_err(|_| StoreError::NotOpen)?
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use crate::fs::MemFs;

    use super::*;

    fn opts() -> StoreOptions {
        StoreOptions::new(PathBuf::from("/store")).snapshot_threshold(4)
    }

    async fn open(fs: Arc<dyn Fs>) -> TaskStore {
        TaskStore::open_with_fs(opts(), fs).await.unwrap()
    }

    fn new_task(group: &str) -> NewTask {
        NewTask { group: group.to_string(), availability: 0, payload: Vec::new() }
    }

    #[tokio::test]
    async fn update_assigns_increasing_ids() {
        let store = open(Arc::new(MemFs::new())).await;
        let created = store
            .update(1, vec![new_task("a"), new_task("a"), new_task("b")], vec![], vec![], vec![])
            .await
            .unwrap();
        let ids: Vec<u64> = created.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn claim_removes_task_from_group_listing() {
        let store = open(Arc::new(MemFs::new())).await;
        store.update(1, vec![new_task("work")], vec![], vec![], vec![]).await.unwrap();

        let claimed = store.claim(2, vec!["work".to_string()], 60_000).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // not visible to non-owners once claimed.
        let visible = store.list_group("work", -1, false).await;
        assert!(visible.is_empty());
        // still visible with allow_owned.
        let all = store.list_group("work", -1, true).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].owner, 2);

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn claim_with_no_eligible_task_fails_and_touches_nothing() {
        let store = open(Arc::new(MemFs::new())).await;
        let err = store.claim(1, vec!["empty".to_string()], 1000).await.unwrap_err();
        assert!(matches!(err, StoreError::NoEligibleTask(_)));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_task_from_group() {
        let store = open(Arc::new(MemFs::new())).await;
        let created = store.update(1, vec![new_task("a")], vec![], vec![], vec![]).await.unwrap();
        let id = created[0].id;

        store.update(1, vec![], vec![], vec![id], vec![]).await.unwrap();
        assert!(store.list_group("a", -1, true).await.is_empty());
        assert!(store.tasks(vec![id]).await[0].is_none());

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn automatic_snapshot_does_not_lose_or_duplicate_tasks() {
        let fs: Arc<dyn Fs> = Arc::new(MemFs::new());
        let store = open(fs.clone()).await;

        // snapshot_threshold is 4: the fifth update triggers a snapshot while
        // later updates keep flowing through the overlay.
        for i in 0..8u64 {
            store.update(1, vec![new_task("g")], vec![], vec![], vec![]).await.unwrap();
            let _ = i;
        }
        store.close().await.unwrap();

        let reopened = TaskStore::open_with_fs(opts(), fs).await.unwrap();
        let listed = reopened.list_group("g", -1, true).await;
        assert_eq!(listed.len(), 8);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn opportunistic_mode_survives_restart() {
        let fs: Arc<dyn Fs> = Arc::new(MemFs::new());
        let options = opts().strict(false);
        let store = TaskStore::open_with_fs(options.clone(), fs.clone()).await.unwrap();
        store.update(1, vec![new_task("g")], vec![], vec![], vec![]).await.unwrap();
        store.close().await.unwrap();

        let reopened = TaskStore::open_with_fs(options, fs).await.unwrap();
        assert_eq!(reopened.list_group("g", -1, true).await.len(), 1);
        reopened.close().await.unwrap();
    }
}
