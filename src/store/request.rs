//! Messages posted to the single-threaded serializer handler.
//!
//! Every public [`crate::TaskStore`] method is a thin wrapper that builds
//! one of these, posts it on the request channel, and awaits the reply on
//! a one-shot channel — a worker-task message-passing shape, generalized
//! here to be the *only* synchronization primitive around the in-memory
//! state.

use tokio::sync::oneshot;

use crate::error::Result;
use crate::task::Task;

/// One task to add. `availability` follows the sentinel
/// convention: zero means "now", a negative value means "now plus the
/// absolute value" (an offset), a positive value is an absolute
/// epoch-millisecond timestamp.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub group: String,
    pub availability: i64,
    pub payload: Vec<u8>,
}

/// One existing task to change. `payload: None` keeps the task's previous
/// payload; `availability` uses the same convention as [`NewTask`].
#[derive(Clone, Debug)]
pub struct ChangeTask {
    pub id: u64,
    pub availability: i64,
    pub payload: Option<Vec<u8>>,
}

pub(crate) enum Request {
    Update {
        owner: u64,
        adds: Vec<NewTask>,
        changes: Vec<ChangeTask>,
        deletes: Vec<u64>,
        depends: Vec<u64>,
        reply: oneshot::Sender<Result<Vec<Task>>>,
    },
    Claim {
        owner: u64,
        groups: Vec<String>,
        duration_ms: u64,
        reply: oneshot::Sender<Result<Vec<Task>>>,
    },
    ListGroup {
        name: String,
        limit: i64,
        allow_owned: bool,
        reply: oneshot::Sender<Vec<Task>>,
    },
    Groups {
        reply: oneshot::Sender<Vec<String>>,
    },
    Tasks {
        ids: Vec<u64>,
        reply: oneshot::Sender<Vec<Option<Task>>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}
