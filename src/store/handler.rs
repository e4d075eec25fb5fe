//! The single-threaded serializer: one task owns every mutable index and
//! is reached only by posting [`Request`]s on a channel. No lock guards the
//! indexes themselves — the channel is the synchronization primitive.
//!
//! Blocking journal I/O (fsync'd appends, rotation, snapshot retirement)
//! runs on `tokio::task::spawn_blocking`, the standard off-executor pattern
//! for blocking storage calls inside an async runtime. The
//! `Journal` is handed into and back out of each blocking closure by value
//! (`Option::take`/reassign) so that exactly one such call is ever in
//! flight, preserving single-writer discipline even though the I/O itself
//! runs on a borrowed blocking thread rather than the handler's own task.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, StoreError};
use crate::index::GroupIndex;
use crate::journal::segment::SegmentName;
use crate::journal::Journal;
use crate::store::overlay::Overlay;
use crate::store::request::{ChangeTask, NewTask, Request};
use crate::store::snapshot;
use crate::task::{Diff, DiffKind, Task, Transaction};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// Resolves the availability sentinel convention: zero means
/// "now", negative means "now plus the absolute value" (an offset), and any
/// other value is an absolute epoch-millisecond timestamp already.
fn resolve_availability(requested: i64, now: u64) -> u64 {
    if requested == 0 {
        now
    } else if requested < 0 {
        now.saturating_add(requested.unsigned_abs())
    } else {
        requested as u64
    }
}

/// Polls the in-flight snapshot receiver, if any, as a plain function
/// taking a reborrow of the single field rather than a closure capturing
/// `self` — edition 2018 closures and async blocks capture whole variables,
/// not individual fields, so this keeps the `tokio::select!` arm below from
/// conflicting with the other arms' borrows of `self.req_rx`/`self.opp_rx`.
async fn poll_snapshot(rx: &mut Option<oneshot::Receiver<Result<SegmentName>>>) -> Result<SegmentName> {
    match rx {
        Some(rx) => rx
            .await
            .unwrap_or_else(|_| Err(StoreError::SnapshotFailed("snapshot producer task was dropped".into()))),
        None => std::future::pending().await,
    }
}

pub(crate) struct Handler {
    base: HashMap<u64, Task>,
    overlay: Overlay,
    groups: HashMap<String, GroupIndex>,
    journal: Option<Journal>,
    next_id: u64,

    strict: bool,
    snapshot_threshold: u64,
    drain_batch: usize,

    txn_count: u64,
    snapshotting: bool,
    snapshot_rx: Option<oneshot::Receiver<Result<SegmentName>>>,
    refuse_writes: bool,

    req_rx: mpsc::Receiver<Request>,
    opp_tx: mpsc::UnboundedSender<Transaction>,
    opp_rx: mpsc::UnboundedReceiver<Transaction>,
}

impl Handler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        base: HashMap<u64, Task>,
        groups: HashMap<String, GroupIndex>,
        journal: Journal,
        next_id: u64,
        strict: bool,
        snapshot_threshold: u64,
        drain_batch: usize,
        req_rx: mpsc::Receiver<Request>,
    ) -> Self {
        let (opp_tx, opp_rx) = mpsc::unbounded_channel();
        Self {
            base,
            overlay: Overlay::new(),
            groups,
            journal: Some(journal),
            next_id,
            strict,
            snapshot_threshold,
            drain_batch,
            txn_count: 0,
            snapshotting: false,
            snapshot_rx: None,
            refuse_writes: false,
            req_rx,
            opp_tx,
            opp_rx,
        }
    }

    fn get(&self, id: u64) -> Option<&Task> {
        self.overlay.get(id, &self.base)
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id - 1
    }

    /// Apply every diff of an already-journaled transaction to the
    /// in-memory indexes: the group indexes are always updated in place;
    /// the id-keyed map goes to the overlay while a snapshot is running and
    /// straight to base otherwise.
    fn apply_transaction(&mut self, txn: &Transaction) {
        for diff in &txn.diffs {
            if diff.old != 0 {
                if let Some(old) = self.get(diff.old).cloned() {
                    if let Some(idx) = self.groups.get_mut(&old.group) {
                        idx.pop_by_key(diff.old);
                        if idx.is_empty() {
                            self.groups.remove(&old.group);
                        }
                    }
                }
                if self.snapshotting {
                    self.overlay.delete(diff.old);
                } else {
                    self.base.remove(&diff.old);
                }
            }
            if let DiffKind::Put(task) = &diff.kind {
                if self.snapshotting {
                    self.overlay.put(task.clone());
                } else {
                    self.base.insert(task.id, task.clone());
                }
                self.groups
                    .entry(task.group.clone())
                    .or_insert_with(GroupIndex::new)
                    .push(task.clone());
            }
        }
    }

    /// Journal `txn` and apply it to memory, honoring strict vs.
    /// opportunistic durability. Strict mode fsyncs synchronously before
    /// the diffs are applied or the caller sees success; opportunistic
    /// mode applies immediately and forwards the append to the same
    /// serializer's distinct opportunistic-writer channel, preserving
    /// ordering.
    async fn commit(&mut self, txn: Transaction) -> Result<()> {
        if txn.is_empty() {
            return Ok(());
        }
        if self.refuse_writes {
            return Err(StoreError::DurabilityFailed(
                "store is refusing writes after a prior opportunistic durability failure".into(),
            ));
        }

        if self.strict {
            self.append_blocking(txn.clone(), true).await?;
            self.apply_transaction(&txn);
        } else {
            self.apply_transaction(&txn);
            // Ordering is preserved because this send and every future
            // opportunistic append are both only ever issued by this same
            // handler loop.
            let _ = self.opp_tx.send(txn);
        }

        self.txn_count += 1;
        if !self.snapshotting {
            self.overlay.drain_some(&mut self.base, self.drain_batch);
        }
        if self.txn_count >= self.snapshot_threshold && !self.snapshotting {
            self.txn_count = 0;
            self.start_snapshot().await;
        }
        Ok(())
    }

    /// Hand the journal to a blocking thread for the append, then take it
    /// back. Only one such call is ever outstanding at a time.
    async fn append_blocking(&mut self, txn: Transaction, fsync: bool) -> Result<()> {
        let mut journal = self.journal.take().expect("journal present while store is open");
        let (journal, result) = tokio::task::spawn_blocking(move || {
            let r = journal.append(&txn, fsync);
            (journal, r)
        })
        .await
        .expect("journal append task panicked");
        self.journal = Some(journal);
        result
    }

    fn handle_update(
        &mut self,
        owner: u64,
        adds: Vec<NewTask>,
        changes: Vec<ChangeTask>,
        deletes: Vec<u64>,
        depends: Vec<u64>,
    ) -> Result<(Transaction, Vec<Task>)> {
        let now = now_ms();
        let mut errors = Vec::new();

        for id in &depends {
            if self.get(*id).is_none() {
                errors.push(format!("dependency {} does not exist", id));
            }
        }
        for change in &changes {
            match self.get(change.id) {
                None => errors.push(format!("task {} does not exist", change.id)),
                Some(t) if !t.may_be_mutated_by(owner, now) => {
                    errors.push(format!(
                        "task {} is owned by {} until {}",
                        change.id, t.owner, t.availability
                    ));
                }
                Some(_) => {}
            }
        }
        for id in &deletes {
            match self.get(*id) {
                None => errors.push(format!("task {} does not exist", id)),
                Some(t) if !t.may_be_mutated_by(owner, now) => {
                    errors.push(format!("task {} is owned by {} until {}", id, t.owner, t.availability));
                }
                Some(_) => {}
            }
        }
        for add in &adds {
            if add.group.is_empty() {
                errors.push("add with an empty group name".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(StoreError::PreconditionFailed(errors));
        }

        let mut txn = Transaction::new();
        let mut new_tasks = Vec::with_capacity(adds.len() + changes.len());

        for add in adds {
            let id = self.alloc_id();
            let availability = resolve_availability(add.availability, now);
            let task = Task { id, owner, group: add.group, availability, payload: add.payload };
            txn.push(Diff { old: 0, kind: DiffKind::Put(task.clone()) });
            new_tasks.push(task);
        }
        for change in changes {
            let old = self.get(change.id).expect("validated above").clone();
            let id = self.alloc_id();
            let availability = resolve_availability(change.availability, now);
            let payload = change.payload.unwrap_or(old.payload);
            let task = Task { id, owner, group: old.group, availability, payload };
            txn.push(Diff { old: change.id, kind: DiffKind::Put(task.clone()) });
            new_tasks.push(task);
        }
        for id in deletes {
            txn.push(Diff { old: id, kind: DiffKind::Delete });
        }

        Ok((txn, new_tasks))
    }

    /// Puts every popped-but-unused task back into its group index. Used
    /// when a claim request cannot be satisfied for every requested group —
    /// no task may be consumed in that case.
    fn rollback_popped(&mut self, popped: Vec<(String, Task)>) {
        for (group, task) in popped {
            self.groups.entry(group).or_insert_with(GroupIndex::new).push(task);
        }
    }

    fn handle_claim(
        &mut self,
        owner: u64,
        groups: Vec<String>,
        duration_ms: u64,
    ) -> Result<(Transaction, Vec<Task>)> {
        let mut seen = HashSet::new();
        for g in &groups {
            if !seen.insert(g.clone()) {
                return Err(StoreError::PreconditionFailed(vec![format!(
                    "duplicate group {:?} in claim request",
                    g
                )]));
            }
        }

        let now = now_ms();
        let mut popped: Vec<(String, Task)> = Vec::with_capacity(groups.len());

        for group in &groups {
            let picked = self.groups.get_mut(group).and_then(|idx| idx.pop_random_available(now));
            match picked {
                Some(task) => {
                    if self.groups.get(group).map_or(true, |idx| idx.is_empty()) {
                        self.groups.remove(group);
                    }
                    popped.push((group.clone(), task));
                }
                None => {
                    self.rollback_popped(popped);
                    return Err(StoreError::NoEligibleTask(group.clone()));
                }
            }
        }

        let mut txn = Transaction::new();
        let mut new_tasks = Vec::with_capacity(popped.len());
        for (group, old_task) in popped {
            let id = self.alloc_id();
            let new_task = Task {
                id,
                owner,
                group,
                availability: now.saturating_add(duration_ms),
                payload: old_task.payload,
            };
            txn.push(Diff { old: old_task.id, kind: DiffKind::Put(new_task.clone()) });
            new_tasks.push(new_task);
        }

        Ok((txn, new_tasks))
    }

    fn handle_list_group(&self, name: &str, limit: i64, allow_owned: bool) -> Vec<Task> {
        let now = now_ms();
        let idx = match self.groups.get(name) {
            Some(idx) => idx,
            None => return Vec::new(),
        };
        let mut out: Vec<Task> = idx
            .iter()
            .filter(|t| allow_owned || !t.is_owned_at(now))
            .cloned()
            .collect();
        if limit > 0 {
            out.truncate(limit as usize);
        }
        out
    }

    async fn start_snapshot(&mut self) {
        if self.snapshotting {
            return;
        }
        self.overlay.drain_all(&mut self.base);
        let tasks: Vec<Task> = self.base.values().cloned().collect();

        let mut journal = self.journal.take().expect("journal present while store is open");
        let (journal, rotated) = tokio::task::spawn_blocking(move || {
            let r = journal.rotate();
            (journal, r)
        })
        .await
        .expect("journal rotate task panicked");
        self.journal = Some(journal);

        let rotated = match rotated {
            Ok(r) => r,
            Err(e) => {
                warn!("snapshot rotate failed, snapshot not started: {}", e);
                return;
            }
        };

        let journal_ref = self.journal.as_ref().expect("journal present while store is open");
        let rx = snapshot::spawn(journal_ref.fs(), journal_ref.dir(), rotated.frozen.ts, tasks);
        self.snapshot_rx = Some(rx);
        self.snapshotting = true;
        debug!("snapshot started after rotating to {}", rotated.frozen.file_name());
    }

    async fn finish_snapshot(&mut self, result: Result<SegmentName>) {
        self.snapshotting = false;
        self.snapshot_rx = None;

        let name = match result {
            Ok(name) => name,
            Err(e) => {
                warn!("snapshot failed: {}", e);
                return;
            }
        };

        let ts = name.ts;
        let mut journal = self.journal.take().expect("journal present while store is open");
        let (journal, retired) = tokio::task::spawn_blocking(move || {
            let r = journal.retire_segments_at_or_before(ts);
            (journal, r)
        })
        .await
        .expect("journal retire task panicked");
        self.journal = Some(journal);

        match retired {
            Ok(()) => info!("snapshot {} completed", name.file_name()),
            Err(e) => warn!("snapshot {} completed but retiring old segments failed: {}", name.file_name(), e),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut idle = tokio::time::interval(Duration::from_secs(3));
        idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_req = self.req_rx.recv() => {
                    let req = match maybe_req {
                        Some(req) => req,
                        None => {
                            debug!("request channel closed, shutting handler down");
                            return;
                        }
                    };
                    if self.dispatch(req).await {
                        return;
                    }
                }
                Some(txn) = self.opp_rx.recv() => {
                    if self.refuse_writes {
                        continue;
                    }
                    if let Err(e) = self.append_blocking(txn, false).await {
                        warn!("opportunistic journal append failed, refusing further writes: {}", e);
                        self.refuse_writes = true;
                    }
                }
                result = poll_snapshot(&mut self.snapshot_rx), if self.snapshot_rx.is_some() => {
                    self.finish_snapshot(result).await;
                }
                _ = idle.tick() => {
                    if !self.snapshotting {
                        self.overlay.drain_some(&mut self.base, self.drain_batch);
                    }
                }
            }
        }
    }

    /// Handles one request. Returns `true` if the handler should shut down
    /// after this call (only `Close` does this).
    async fn dispatch(&mut self, req: Request) -> bool {
        match req {
            Request::Update { owner, adds, changes, deletes, depends, reply } => {
                debug!("update request from owner {}", owner);
                let result = match self.handle_update(owner, adds, changes, deletes, depends) {
                    Ok((txn, new_tasks)) => match self.commit(txn).await {
                        Ok(()) => Ok(new_tasks),
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Request::Claim { owner, groups, duration_ms, reply } => {
                debug!("claim request from owner {} for {} group(s)", owner, groups.len());
                let result = match self.handle_claim(owner, groups, duration_ms) {
                    Ok((txn, new_tasks)) => match self.commit(txn).await {
                        Ok(()) => Ok(new_tasks),
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Request::ListGroup { name, limit, allow_owned, reply } => {
                let _ = reply.send(self.handle_list_group(&name, limit, allow_owned));
            }
            Request::Groups { reply } => {
                let _ = reply.send(self.groups.keys().cloned().collect());
            }
            Request::Tasks { ids, reply } => {
                let tasks = ids.iter().map(|id| self.get(*id).cloned()).collect();
                let _ = reply.send(tasks);
            }
            Request::Snapshot { reply } => {
                if self.snapshotting {
                    let _ = reply.send(Err(StoreError::SnapshotFailed(
                        "a snapshot is already in progress".into(),
                    )));
                } else {
                    self.start_snapshot().await;
                    let _ = reply.send(Ok(()));
                }
            }
            Request::Close { reply } => {
                let journal = self.journal.take().expect("journal present while store is open");
                let result = tokio::task::spawn_blocking(move || journal.close())
                    .await
                    .expect("journal close task panicked");
                if let Err(e) = &result {
                    warn!("error closing journal: {}", e);
                } else {
                    info!("store closed");
                }
                let _ = reply.send(result);
                return true;
            }
        }
        false
    }
}
