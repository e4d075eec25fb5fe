//! The snapshot driver: runs the slow encode-and-rename step on a blocking
//! thread so the handler keeps serving requests while it completes.
//!
//! Mirrors the pattern other embedded task stores use to keep blocking
//! storage calls off the async executor (`tokio::task::spawn_blocking`),
//! adapted to this crate's single-writer
//! discipline: the handler hands off ownership of exactly the pieces the
//! blocking task needs (the filesystem handle, the directory, the
//! just-rotated segment's timestamp, and a snapshot of the base map) and
//! gets a one-shot reply back when the file is written and renamed.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::Result;
use crate::fs::Fs;
use crate::journal::segment::{Kind, SegmentName};
use crate::journal::{self};
use crate::task::Task;

/// Spawn the blocking encode+rename step and return a receiver that
/// resolves to the finished snapshot's segment name.
pub(crate) fn spawn(
    fs: Arc<dyn Fs>,
    dir: PathBuf,
    frozen_log_ts: u64,
    tasks: Vec<Task>,
) -> oneshot::Receiver<Result<SegmentName>> {
    let (tx, rx) = oneshot::channel();
    let name = SegmentName::new(frozen_log_ts, journal::pid(), Kind::Snapshot).working(true);
    tokio::task::spawn_blocking(move || {
        let result = journal::write_snapshot_file(fs.as_ref(), &dir, name, tasks.into_iter());
        let _ = tx.send(result);
    });
    rx
}
