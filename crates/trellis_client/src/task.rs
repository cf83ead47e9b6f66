//! In-flight task registry.
//!
//! Every user request becomes an id-keyed task in the pool until it
//! completes or times out. The pool enforces at-most-one completion per
//! task: both the response path and the timeout path must `pop` the task
//! first, and only the winner holds the completion slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use trellis_proto::error::{ErrorCode, SdkResult};
use trellis_proto::messages::{
    Mutation, RowReaderInfo, RowResult, ScanTabletRequest, ScanTabletResponse,
};
use trellis_proto::status::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Mutation,
    Read,
    Scan,
}

/// Final disposition of a mutation task.
#[derive(Debug)]
pub struct MutationOutcome {
    pub result: SdkResult<()>,
    pub retry_times: u32,
    pub commit_times: u32,
}

/// Final disposition of a read task.
#[derive(Debug)]
pub struct ReadOutcome {
    pub result: SdkResult<RowResult>,
    pub retry_times: u32,
    pub commit_times: u32,
}

/// Final disposition of one scan round-trip.
#[derive(Debug)]
pub struct ScanOutcome {
    pub result: SdkResult<ScanTabletResponse>,
    pub retry_times: u32,
}

pub enum TaskPayload {
    Mutation {
        mutations: Vec<Mutation>,
        done: Option<oneshot::Sender<MutationOutcome>>,
    },
    Read {
        info: RowReaderInfo,
        snapshot_id: u64,
        done: Option<oneshot::Sender<ReadOutcome>>,
    },
    Scan {
        request: ScanTabletRequest,
        done: Option<oneshot::Sender<ScanOutcome>>,
    },
}

pub struct TaskInner {
    pub payload: TaskPayload,
    /// Meta-cache freshness stamp observed at routing time.
    pub meta_timestamp_ms: i64,
    /// Last error observed from a server or the transport.
    pub internal_error: StatusCode,
    pub retry_times: u32,
    pub commit_times: u32,
}

pub struct SdkTask {
    pub id: u64,
    pub row: Vec<u8>,
    pub kind: TaskKind,
    pub is_sync: bool,
    /// Effective deadline; <= 0 means no deadline.
    pub timeout_ms: i64,
    pub inner: Mutex<TaskInner>,
}

impl SdkTask {
    pub fn new(
        id: u64,
        row: Vec<u8>,
        is_sync: bool,
        timeout_ms: i64,
        payload: TaskPayload,
    ) -> Arc<Self> {
        let kind = match &payload {
            TaskPayload::Mutation { .. } => TaskKind::Mutation,
            TaskPayload::Read { .. } => TaskKind::Read,
            TaskPayload::Scan { .. } => TaskKind::Scan,
        };
        Arc::new(Self {
            id,
            row,
            kind,
            is_sync,
            timeout_ms,
            inner: Mutex::new(TaskInner {
                payload,
                meta_timestamp_ms: 0,
                internal_error: StatusCode::Ok,
                retry_times: 0,
                commit_times: 0,
            }),
        })
    }

    pub fn mutation_count(&self) -> i64 {
        match &self.inner.lock().unwrap().payload {
            TaskPayload::Mutation { mutations, .. } => mutations.len() as i64,
            _ => 0,
        }
    }

    pub fn set_meta_timestamp(&self, ts_ms: i64) {
        self.inner.lock().unwrap().meta_timestamp_ms = ts_ms;
    }

    pub fn meta_timestamp(&self) -> i64 {
        self.inner.lock().unwrap().meta_timestamp_ms
    }

    pub fn set_internal_error(&self, status: StatusCode) {
        self.inner.lock().unwrap().internal_error = status;
    }

    pub fn internal_error(&self) -> StatusCode {
        self.inner.lock().unwrap().internal_error
    }

    pub fn inc_retry_times(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.retry_times += 1;
        inner.retry_times
    }

    pub fn retry_times(&self) -> u32 {
        self.inner.lock().unwrap().retry_times
    }

    pub fn add_commit_times(&self) {
        self.inner.lock().unwrap().commit_times += 1;
    }

    /// Complete a mutation task. The completion slot is consumed; a second
    /// call is a no-op by construction.
    pub fn complete_mutation(&self, result: SdkResult<()>) {
        let mut inner = self.inner.lock().unwrap();
        let (retry_times, commit_times) = (inner.retry_times, inner.commit_times);
        if let TaskPayload::Mutation { done, .. } = &mut inner.payload {
            if let Some(tx) = done.take() {
                let _ = tx.send(MutationOutcome {
                    result,
                    retry_times,
                    commit_times,
                });
            }
        }
    }

    pub fn complete_read(&self, result: SdkResult<RowResult>) {
        let mut inner = self.inner.lock().unwrap();
        let (retry_times, commit_times) = (inner.retry_times, inner.commit_times);
        if let TaskPayload::Read { done, .. } = &mut inner.payload {
            if let Some(tx) = done.take() {
                let _ = tx.send(ReadOutcome {
                    result,
                    retry_times,
                    commit_times,
                });
            }
        }
    }

    pub fn complete_scan(&self, result: SdkResult<ScanTabletResponse>) {
        let mut inner = self.inner.lock().unwrap();
        let retry_times = inner.retry_times;
        if let TaskPayload::Scan { done, .. } = &mut inner.payload {
            if let Some(tx) = done.take() {
                let _ = tx.send(ScanOutcome { result, retry_times });
            }
        }
    }

    /// Fail the task with the canonical timeout/system error derived from its
    /// retry history, mirroring the deadline path.
    pub fn complete_expired(&self, default_timeout_ms: i64) {
        let (retry_times, commit_times, last) = {
            let inner = self.inner.lock().unwrap();
            (inner.retry_times, inner.commit_times, inner.internal_error)
        };
        let err = if retry_times == 0 {
            ErrorCode::timeout(format!(
                "commit {commit_times} times, retry 0 times, in {default_timeout_ms} ms"
            ))
        } else {
            ErrorCode::system(format!(
                "commit {commit_times} times, retry {retry_times} times, in {default_timeout_ms} ms, last error: {last}"
            ))
        };
        match self.kind {
            TaskKind::Mutation => self.complete_mutation(Err(err)),
            TaskKind::Read => self.complete_read(Err(err)),
            TaskKind::Scan => self.complete_scan(Err(err)),
        }
    }
}

/// Monotonic-id task registry.
#[derive(Default)]
pub struct TaskPool {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, Arc<SdkTask>>>,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn put(&self, task: Arc<SdkTask>) {
        self.tasks.lock().unwrap().insert(task.id, task);
    }

    /// Shared peek; the task stays owned by the pool.
    pub fn get(&self, id: u64) -> Option<Arc<SdkTask>> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    /// Remove and return; the caller becomes the sole completer.
    pub fn pop(&self, id: u64) -> Option<Arc<SdkTask>> {
        self.tasks.lock().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutation_task(pool: &TaskPool, row: &[u8]) -> (Arc<SdkTask>, oneshot::Receiver<MutationOutcome>) {
        let (tx, rx) = oneshot::channel();
        let task = SdkTask::new(
            pool.next_id(),
            row.to_vec(),
            false,
            1000,
            TaskPayload::Mutation {
                mutations: Vec::new(),
                done: Some(tx),
            },
        );
        pool.put(task.clone());
        (task, rx)
    }

    #[tokio::test]
    async fn pop_makes_the_caller_sole_completer() {
        let pool = TaskPool::new();
        let (task, rx) = mutation_task(&pool, b"r1");
        let winner = pool.pop(task.id).expect("first pop wins");
        assert!(pool.pop(task.id).is_none(), "second pop loses");
        winner.complete_mutation(Ok(()));
        // A late completion attempt must not reach the receiver twice.
        winner.complete_mutation(Err(ErrorCode::system("late")));
        let outcome = rx.await.unwrap();
        assert!(outcome.result.is_ok());
    }

    #[tokio::test]
    async fn expired_task_without_retries_reports_timeout() {
        let pool = TaskPool::new();
        let (task, rx) = mutation_task(&pool, b"r1");
        let task = pool.pop(task.id).unwrap();
        task.complete_expired(50);
        let outcome = rx.await.unwrap();
        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind, trellis_proto::error::ErrorKind::Timeout);
        assert_eq!(outcome.retry_times, 0);
        assert_eq!(outcome.commit_times, 0);
    }

    #[tokio::test]
    async fn expired_task_with_retries_reports_system() {
        let pool = TaskPool::new();
        let (task, rx) = mutation_task(&pool, b"r1");
        task.set_internal_error(StatusCode::ConnectError);
        task.inc_retry_times();
        let task = pool.pop(task.id).unwrap();
        task.complete_expired(50);
        let outcome = rx.await.unwrap();
        assert_eq!(
            outcome.result.unwrap_err().kind,
            trellis_proto::error::ErrorKind::System
        );
        assert_eq!(outcome.retry_times, 1);
    }

    #[test]
    fn ids_are_monotonic() {
        let pool = TaskPool::new();
        let a = pool.next_id();
        let b = pool.next_id();
        assert!(b > a);
    }
}
