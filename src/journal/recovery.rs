//! Recovery: replay the most recent snapshot plus any newer journal
//! segments to reconstruct in-memory state at store open.

use std::collections::HashMap;
use std::path::Path;

use log::warn;

use crate::error::{Result, StoreError};
use crate::fs::Fs;
use crate::journal::record;
use crate::journal::segment::{self, Kind, SegmentName};
use crate::task::{DiffKind, Task};

pub struct Recovered {
    pub base: HashMap<u64, Task>,
    pub next_id: u64,
    pub warnings: Vec<String>,
}

/// Replay the most recent snapshot (if any) plus every live log segment
/// newer than it, in ascending timestamp order.
pub fn recover(fs: &dyn Fs, dir: &Path) -> Result<Recovered> {
    let segments = segment::list(fs, dir).map_err(StoreError::Io)?;

    let snapshot = segments
        .iter()
        .filter(|s| s.kind == Kind::Snapshot && s.is_live() && !s.working)
        .max_by_key(|s| s.ts)
        .cloned();

    let mut base = HashMap::new();
    let mut max_id = 0u64;
    let mut warnings = Vec::new();

    if let Some(snap) = &snapshot {
        let path = snap.path_in(dir);
        let mut reader = fs.open_read(&path).map_err(StoreError::Io)?;
        loop {
            match record::read_task(&mut reader) {
                Ok(Some(task)) => {
                    max_id = max_id.max(task.id);
                    base.insert(task.id, task);
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(StoreError::RecoveryCorruption(format!(
                        "snapshot {} failed to decode: {}",
                        snap.file_name(),
                        e
                    )));
                }
            }
        }
    }

    let snapshot_ts = snapshot.as_ref().map(|s| s.ts);

    let mut logs: Vec<SegmentName> = segments
        .into_iter()
        .filter(|s| s.kind == Kind::Log && s.is_live())
        .filter(|s| snapshot_ts.map_or(true, |ts| s.ts > ts))
        .collect();
    logs.sort_by_key(|s| (s.ts, s.pid, s.working));

    for seg in &logs {
        let path = seg.path_in(dir);
        let mut reader = fs.open_read(&path).map_err(StoreError::Io)?;
        loop {
            match record::read_transaction(&mut reader) {
                Ok(Some(txn)) => {
                    for diff in txn.diffs {
                        if diff.old != 0 {
                            base.remove(&diff.old);
                        }
                        if let DiffKind::Put(task) = diff.kind {
                            max_id = max_id.max(task.id);
                            base.insert(task.id, task);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    let msg = format!(
                        "segment {} ended with a partial trailing record: {}",
                        seg.file_name(),
                        e
                    );
                    warn!("{}", msg);
                    warnings.push(msg);
                    break;
                }
                Err(e) => {
                    return Err(StoreError::RecoveryCorruption(format!(
                        "segment {} failed to decode: {}",
                        seg.file_name(),
                        e
                    )));
                }
            }
        }
    }

    Ok(Recovered { base, next_id: max_id + 1, warnings })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::MemFs;
    use crate::journal::segment::SegmentName;
    use crate::task::{Diff, Transaction};
    use std::io::Write;
    use std::path::PathBuf;

    fn task(id: u64) -> Task {
        Task { id, owner: 1, group: "g".into(), availability: 0, payload: vec![id as u8] }
    }

    #[test]
    fn recovers_empty_store() {
        let fs = MemFs::new();
        let dir = PathBuf::from("/d");
        let r = recover(&fs, &dir).unwrap();
        assert!(r.base.is_empty());
        assert_eq!(r.next_id, 1);
        assert!(r.warnings.is_empty());
    }

    #[test]
    fn recovers_snapshot_plus_segments() {
        let fs = MemFs::new();
        let dir = PathBuf::from("/d");

        let snap = SegmentName::new(100, 1, Kind::Snapshot);
        {
            let mut w = fs.create_new(&snap.path_in(&dir)).unwrap();
            record::write_task(&mut w, &task(1)).unwrap();
            record::write_task(&mut w, &task(2)).unwrap();
        }

        let seg = SegmentName::new(200, 1, Kind::Log);
        {
            let mut w = fs.create_new(&seg.path_in(&dir)).unwrap();
            let mut txn = Transaction::new();
            txn.push(Diff { old: 0, kind: DiffKind::Put(task(3)) });
            record::write_transaction(&mut w, &txn).unwrap();
        }

        let r = recover(&fs, &dir).unwrap();
        assert_eq!(r.base.len(), 3);
        assert_eq!(r.next_id, 4);
        assert!(r.warnings.is_empty());
    }

    #[test]
    fn tolerates_trailing_partial_record() {
        let fs = MemFs::new();
        let dir = PathBuf::from("/d");
        let seg = SegmentName::new(200, 1, Kind::Log);
        {
            let mut w = fs.create_new(&seg.path_in(&dir)).unwrap();
            let mut txn = Transaction::new();
            txn.push(Diff { old: 0, kind: DiffKind::Put(task(1)) });
            record::write_transaction(&mut w, &txn).unwrap();
            w.write_all(&[1, 2, 3]).unwrap(); // truncated trailing record
        }

        let r = recover(&fs, &dir).unwrap();
        assert_eq!(r.base.len(), 1);
        assert_eq!(r.warnings.len(), 1);
    }

    #[test]
    fn corrupt_snapshot_is_fatal() {
        let fs = MemFs::new();
        let dir = PathBuf::from("/d");
        let snap = SegmentName::new(100, 1, Kind::Snapshot);
        {
            let mut w = fs.create_new(&snap.path_in(&dir)).unwrap();
            w.write_all(&[9, 9, 9]).unwrap();
        }
        let err = recover(&fs, &dir).unwrap_err();
        assert!(matches!(err, StoreError::RecoveryCorruption(_)));
    }

    #[test]
    fn segments_at_or_before_snapshot_are_ignored() {
        let fs = MemFs::new();
        let dir = PathBuf::from("/d");
        let snap = SegmentName::new(200, 1, Kind::Snapshot);
        {
            let mut w = fs.create_new(&snap.path_in(&dir)).unwrap();
            record::write_task(&mut w, &task(1)).unwrap();
        }
        // an older, already-incorporated segment must not be replayed again
        let seg = SegmentName::new(100, 1, Kind::Log);
        {
            let mut w = fs.create_new(&seg.path_in(&dir)).unwrap();
            let mut txn = Transaction::new();
            txn.push(Diff { old: 0, kind: DiffKind::Put(task(2)) });
            record::write_transaction(&mut w, &txn).unwrap();
        }
        let r = recover(&fs, &dir).unwrap();
        assert_eq!(r.base.len(), 1);
        assert!(r.base.contains_key(&1));
    }
}
