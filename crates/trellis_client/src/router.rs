//! Request router and batching engine.
//!
//! Tasks are bucketed per target server. A batch flushes on the first of:
//! payload bytes reaching the RPC ceiling, the last task of a distribution
//! pass when any peer is synchronous or the row count reaches `batch_size`,
//! or the batch timer expiring. Batch timers are canceled non-blocking; a
//! timer that already fired observes its bucket gone (or re-sequenced) and
//! returns without effect.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use trellis_proto::error::ErrorCode;
use trellis_proto::messages::{
    ReadTabletRequest, RowMutationSequence, ScanTabletRequest, WriteTabletRequest,
};
use trellis_proto::status::StatusCode;

use crate::delay::CancelResult;
use crate::table::TableCore;
use crate::task::{SdkTask, TaskKind, TaskPayload};

/// Sequence-tagged per-server bucket of task ids.
pub(crate) struct TaskBatch {
    pub sequence_num: u64,
    pub row_ids: Vec<u64>,
    pub byte_size: usize,
    pub timer_id: u64,
}

fn task_byte_size(task: &SdkTask) -> usize {
    let inner = task.inner.lock().unwrap();
    match &inner.payload {
        TaskPayload::Mutation { mutations, .. } => {
            task.row.len()
                + mutations
                    .iter()
                    .map(|m| m.family.len() + m.qualifier.len() + m.value.len() + 24)
                    .sum::<usize>()
        }
        _ => task.row.len(),
    }
}

/// Map a terminal server status onto the user-facing error space.
fn status_error(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::KeyNotExist => ErrorCode::not_found("not found"),
        StatusCode::SnapshotNotExist => ErrorCode::not_found("snapshot not found"),
        StatusCode::TxnFail => ErrorCode::new(
            trellis_proto::error::ErrorKind::TxnFail,
            "transaction commit fail",
        ),
        other => ErrorCode::system(format!("server status: {other}")),
    }
}

impl TableCore {
    // -----------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------

    pub(crate) async fn distribute_mutations(
        self: &Arc<Self>,
        tasks: Vec<Arc<SdkTask>>,
        called_by_user: bool,
    ) {
        // Synchronous peers of one pass share the smallest of their deadlines.
        let mut sync_min_timeout = -1i64;
        if called_by_user {
            for task in tasks.iter().filter(|t| t.is_sync) {
                if task.timeout_ms > 0 && (sync_min_timeout <= 0 || task.timeout_ms < sync_min_timeout)
                {
                    sync_min_timeout = task.timeout_ms;
                }
            }
        }

        let mut buckets: HashMap<String, (Vec<Arc<SdkTask>>, bool)> = HashMap::new();
        for task in tasks {
            if called_by_user {
                let effective_timeout = if task.is_sync {
                    sync_min_timeout
                } else {
                    task.timeout_ms
                };
                self.task_pool.put(task.clone());
                if effective_timeout > 0 {
                    let core = Arc::clone(self);
                    let id = task.id;
                    self.delay
                        .schedule(Duration::from_millis(effective_timeout as u64), move || {
                            core.task_timeout(id, effective_timeout);
                        });
                }

                let slots = task.mutation_count();
                let pending = self.commit_pending.fetch_add(slots, Ordering::AcqRel) + slots;
                if pending > self.config.max_mutation_pending_num && !task.is_sync {
                    if self.config.async_blocking_enabled {
                        self.wait_for_mutation_slots().await;
                    } else {
                        self.commit_pending.fetch_sub(slots, Ordering::AcqRel);
                        self.commit_pending_changed.notify_waiters();
                        if let Some(task) = self.task_pool.pop(task.id) {
                            task.complete_mutation(Err(ErrorCode::busy(
                                "pending too many mutations, try it later",
                            )));
                        }
                        continue;
                    }
                }
            }

            let Some(server_addr) = self.tablet_addr_or_schedule_update(&task) else {
                continue;
            };
            let bucket = buckets.entry(server_addr).or_insert_with(|| (Vec::new(), false));
            if task.is_sync {
                bucket.1 = true;
            }
            bucket.0.push(task);
        }

        for (server_addr, (list, flush)) in buckets {
            self.pack_mutations(&server_addr, list, flush);
        }
    }

    async fn wait_for_mutation_slots(&self) {
        loop {
            if self.commit_pending.load(Ordering::Acquire) <= self.config.max_mutation_pending_num {
                return;
            }
            let notified = self.commit_pending_changed.notified();
            if self.commit_pending.load(Ordering::Acquire) <= self.config.max_mutation_pending_num {
                return;
            }
            notified.await;
        }
    }

    pub(crate) async fn distribute_mutations_by_id(self: &Arc<Self>, ids: Vec<u64>) {
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            match self.task_pool.get(id) {
                Some(task) => tasks.push(task),
                None => tracing::trace!(task = id, "mutation expired before retry"),
            }
        }
        self.distribute_mutations(tasks, false).await;
    }

    pub(crate) fn pack_mutations(
        self: &Arc<Self>,
        server_addr: &str,
        tasks: Vec<Arc<SdkTask>>,
        flush: bool,
    ) {
        let mut to_commit: Vec<Vec<u64>> = Vec::new();
        {
            let mut batches = self.mutation_batches.lock().unwrap();
            let task_count = tasks.len();
            for (index, task) in tasks.into_iter().enumerate() {
                let batch = batches.entry(server_addr.to_string()).or_insert_with(|| {
                    let sequence_num = self.mutation_batch_seq.fetch_add(1, Ordering::Relaxed);
                    let core = Arc::clone(self);
                    let addr = server_addr.to_string();
                    let timer_id = self.delay.schedule(
                        Duration::from_millis(self.config.write_send_interval_ms),
                        move || core.mutation_batch_timeout(&addr, sequence_num),
                    );
                    TaskBatch {
                        sequence_num,
                        row_ids: Vec::new(),
                        byte_size: 0,
                        timer_id,
                    }
                });
                batch.row_ids.push(task.id);
                batch.byte_size += task_byte_size(&task);

                let oversized = batch.byte_size >= crate::config::MAX_RPC_BYTE_SIZE;
                let last = index + 1 == task_count;
                if oversized || (last && (flush || batch.row_ids.len() >= self.config.batch_size)) {
                    let batch = batches
                        .remove(server_addr)
                        .expect("bucket exists while packing");
                    if self.delay.cancel(batch.timer_id) == CancelResult::Running {
                        // The timer callback is already running; it will see
                        // this bucket gone and return without effect.
                    }
                    to_commit.push(batch.row_ids);
                }
            }
        }
        for ids in to_commit {
            self.commit_mutations_by_id(server_addr, ids);
        }
    }

    pub(crate) fn mutation_batch_timeout(self: &Arc<Self>, server_addr: &str, batch_seq: u64) {
        let row_ids = {
            let mut batches = self.mutation_batches.lock().unwrap();
            let sequence_matches = batches
                .get(server_addr)
                .map(|batch| batch.sequence_num == batch_seq)
                .unwrap_or(false);
            if sequence_matches {
                batches.remove(server_addr).map(|batch| batch.row_ids)
            } else {
                // A pack beat this timer to the bucket; nothing to flush.
                None
            }
        };
        if let Some(ids) = row_ids {
            self.commit_mutations_by_id(server_addr, ids);
        }
    }

    fn commit_mutations_by_id(self: &Arc<Self>, server_addr: &str, ids: Vec<u64>) {
        let mut kept_ids = Vec::with_capacity(ids.len());
        let mut row_list = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(task) = self.task_pool.get(id) else {
                tracing::trace!(task = id, "mutation expired before commit");
                continue;
            };
            let mutations = {
                let inner = task.inner.lock().unwrap();
                match &inner.payload {
                    TaskPayload::Mutation { mutations, .. } => mutations.clone(),
                    _ => continue,
                }
            };
            row_list.push(RowMutationSequence {
                row_key: task.row.clone(),
                mutations,
            });
            task.add_commit_times();
            kept_ids.push(id);
        }
        if kept_ids.is_empty() {
            return;
        }

        let request = WriteTabletRequest {
            sequence_id: self.next_sequence_id(),
            tablet_name: self.name.clone(),
            is_sync: self.config.write_sync,
            row_list,
        };
        tracing::trace!(
            server = server_addr,
            rows = kept_ids.len(),
            "committing mutation batch"
        );
        let node = self.connector.tablet_node(server_addr);
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let result = node.write_tablet(request).await;
            core.mutate_callback(kept_ids, result).await;
        });
    }

    async fn mutate_callback(
        self: &Arc<Self>,
        ids: Vec<u64>,
        result: Result<trellis_proto::messages::WriteTabletResponse, trellis_proto::rpc::RpcFault>,
    ) {
        let row_status = |index: usize| -> StatusCode {
            match &result {
                Err(fault) => fault.status(),
                Ok(response) if !response.status.is_node_ok() => response.status,
                Ok(response) => response
                    .row_status_list
                    .get(index)
                    .copied()
                    .unwrap_or(StatusCode::RpcError),
            }
        };

        let mut retry_groups: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
        let mut not_in_range: Vec<Arc<SdkTask>> = Vec::new();
        for (index, id) in ids.iter().copied().enumerate() {
            let status = row_status(index);
            if status.is_node_ok() || status == StatusCode::TxnFail {
                let Some(task) = self.task_pool.pop(id) else {
                    tracing::trace!(task = id, "mutation finished but already timed out");
                    continue;
                };
                self.release_mutation_slots(&task);
                if status.is_node_ok() {
                    task.complete_mutation(Ok(()));
                } else {
                    task.complete_mutation(Err(status_error(status)));
                }
                continue;
            }

            tracing::debug!(table = %self.name, task = id, %status, "mutation failed");
            let Some(task) = self.task_pool.get(id) else {
                continue;
            };
            task.set_internal_error(status);
            let retries = task.inc_retry_times();
            if status == StatusCode::KeyNotInRange {
                not_in_range.push(task);
            } else if retries > self.config.retry_times {
                let Some(task) = self.task_pool.pop(id) else {
                    continue;
                };
                self.release_mutation_slots(&task);
                task.complete_mutation(Err(ErrorCode::system(format!(
                    "retry {retries} times, last error: {status}"
                ))));
            } else {
                retry_groups.entry(retries).or_default().push(id);
            }
        }

        if !not_in_range.is_empty() {
            self.distribute_mutations(not_in_range, false).await;
        }
        for (retries, group) in retry_groups {
            let backoff = self.config.retry_backoff_ms(retries);
            let core = Arc::clone(self);
            self.delay.schedule(Duration::from_millis(backoff), move || {
                tokio::spawn(async move { core.distribute_mutations_by_id(group).await });
            });
        }
    }

    fn release_mutation_slots(&self, task: &SdkTask) {
        self.commit_pending
            .fetch_sub(task.mutation_count(), Ordering::AcqRel);
        self.commit_pending_changed.notify_waiters();
    }

    // -----------------------------------------------------------------
    // Readers
    // -----------------------------------------------------------------

    pub(crate) async fn distribute_readers(
        self: &Arc<Self>,
        tasks: Vec<Arc<SdkTask>>,
        called_by_user: bool,
    ) {
        let mut sync_min_timeout = -1i64;
        if called_by_user {
            for task in tasks.iter().filter(|t| t.is_sync) {
                if task.timeout_ms > 0 && (sync_min_timeout <= 0 || task.timeout_ms < sync_min_timeout)
                {
                    sync_min_timeout = task.timeout_ms;
                }
            }
        }

        let mut buckets: HashMap<String, Vec<Arc<SdkTask>>> = HashMap::new();
        for task in tasks {
            if called_by_user {
                let effective_timeout = if task.is_sync {
                    sync_min_timeout
                } else {
                    task.timeout_ms
                };
                self.task_pool.put(task.clone());
                if effective_timeout > 0 {
                    let core = Arc::clone(self);
                    let id = task.id;
                    self.delay
                        .schedule(Duration::from_millis(effective_timeout as u64), move || {
                            core.task_timeout(id, effective_timeout);
                        });
                }

                let pending = self.reader_pending.fetch_add(1, Ordering::AcqRel) + 1;
                if pending > self.config.max_reader_pending_num && !task.is_sync {
                    if self.config.async_blocking_enabled {
                        self.wait_for_reader_slots().await;
                    } else {
                        self.reader_pending.fetch_sub(1, Ordering::AcqRel);
                        self.reader_pending_changed.notify_waiters();
                        if let Some(task) = self.task_pool.pop(task.id) {
                            task.complete_read(Err(ErrorCode::busy(
                                "pending too many readers, try it later",
                            )));
                        }
                        continue;
                    }
                }
            }

            let Some(server_addr) = self.tablet_addr_or_schedule_update(&task) else {
                continue;
            };
            buckets.entry(server_addr).or_default().push(task);
        }

        for (server_addr, list) in buckets {
            self.pack_readers(&server_addr, list);
        }
    }

    async fn wait_for_reader_slots(&self) {
        loop {
            if self.reader_pending.load(Ordering::Acquire) <= self.config.max_reader_pending_num {
                return;
            }
            let notified = self.reader_pending_changed.notified();
            if self.reader_pending.load(Ordering::Acquire) <= self.config.max_reader_pending_num {
                return;
            }
            notified.await;
        }
    }

    pub(crate) async fn distribute_readers_by_id(self: &Arc<Self>, ids: Vec<u64>) {
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            match self.task_pool.get(id) {
                Some(task) => tasks.push(task),
                None => tracing::trace!(task = id, "reader expired before retry"),
            }
        }
        self.distribute_readers(tasks, false).await;
    }

    pub(crate) fn pack_readers(self: &Arc<Self>, server_addr: &str, tasks: Vec<Arc<SdkTask>>) {
        let mut to_commit: Vec<Vec<u64>> = Vec::new();
        {
            let mut batches = self.reader_batches.lock().unwrap();
            let batch = batches.entry(server_addr.to_string()).or_insert_with(|| {
                let sequence_num = self.reader_batch_seq.fetch_add(1, Ordering::Relaxed);
                let core = Arc::clone(self);
                let addr = server_addr.to_string();
                let timer_id = self.delay.schedule(
                    Duration::from_millis(self.config.read_send_interval_ms),
                    move || core.reader_batch_timeout(&addr, sequence_num),
                );
                TaskBatch {
                    sequence_num,
                    row_ids: Vec::new(),
                    byte_size: 0,
                    timer_id,
                }
            });
            for task in tasks {
                batch.row_ids.push(task.id);
            }
            if batch.row_ids.len() >= self.config.batch_size {
                let batch = batches
                    .remove(server_addr)
                    .expect("bucket exists while packing");
                if self.delay.cancel(batch.timer_id) == CancelResult::Running {
                    // Fired timer observes the removed bucket; no-op there.
                }
                to_commit.push(batch.row_ids);
            }
        }
        for ids in to_commit {
            self.commit_readers_by_id(server_addr, ids);
        }
    }

    pub(crate) fn reader_batch_timeout(self: &Arc<Self>, server_addr: &str, batch_seq: u64) {
        let row_ids = {
            let mut batches = self.reader_batches.lock().unwrap();
            let sequence_matches = batches
                .get(server_addr)
                .map(|batch| batch.sequence_num == batch_seq)
                .unwrap_or(false);
            if sequence_matches {
                batches.remove(server_addr).map(|batch| batch.row_ids)
            } else {
                None
            }
        };
        if let Some(ids) = row_ids {
            self.commit_readers_by_id(server_addr, ids);
        }
    }

    fn commit_readers_by_id(self: &Arc<Self>, server_addr: &str, ids: Vec<u64>) {
        let mut kept_ids = Vec::with_capacity(ids.len());
        let mut row_info_list = Vec::with_capacity(ids.len());
        let mut snapshot_id = 0;
        for id in ids {
            let Some(task) = self.task_pool.get(id) else {
                tracing::trace!(task = id, "reader expired before commit");
                continue;
            };
            {
                let inner = task.inner.lock().unwrap();
                match &inner.payload {
                    TaskPayload::Read {
                        info,
                        snapshot_id: snap,
                        ..
                    } => {
                        row_info_list.push(info.clone());
                        snapshot_id = *snap;
                    }
                    _ => continue,
                }
            }
            task.add_commit_times();
            kept_ids.push(id);
        }
        if kept_ids.is_empty() {
            return;
        }

        let request = ReadTabletRequest {
            sequence_id: self.next_sequence_id(),
            tablet_name: self.name.clone(),
            row_info_list,
            snapshot_id,
            client_timeout_ms: self.config.pending_timeout_ms,
        };
        tracing::trace!(
            server = server_addr,
            rows = kept_ids.len(),
            "committing reader batch"
        );
        let node = self.connector.tablet_node(server_addr);
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let result = node.read_tablet(request).await;
            core.reader_callback(kept_ids, result).await;
        });
    }

    async fn reader_callback(
        self: &Arc<Self>,
        ids: Vec<u64>,
        result: Result<trellis_proto::messages::ReadTabletResponse, trellis_proto::rpc::RpcFault>,
    ) {
        let row_status = |index: usize| -> StatusCode {
            match &result {
                Err(fault) => fault.status(),
                Ok(response) if !response.status.is_node_ok() => response.status,
                Ok(response) => response
                    .detail
                    .status_list
                    .get(index)
                    .copied()
                    .unwrap_or(StatusCode::RpcError),
            }
        };

        let mut retry_groups: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
        let mut not_in_range: Vec<Arc<SdkTask>> = Vec::new();
        let mut row_result_index = 0usize;
        for (index, id) in ids.iter().copied().enumerate() {
            let status = row_status(index);
            if status.is_node_ok()
                || status == StatusCode::KeyNotExist
                || status == StatusCode::SnapshotNotExist
            {
                let Some(task) = self.task_pool.pop(id) else {
                    if status.is_node_ok() {
                        // The result belongs to a timed-out reader; discard it
                        // but keep the result cursor aligned.
                        row_result_index += 1;
                    }
                    tracing::trace!(task = id, "reader finished but already timed out");
                    continue;
                };
                self.release_reader_slot();
                if status.is_node_ok() {
                    let row = match &result {
                        Ok(response) => response
                            .detail
                            .row_results
                            .get(row_result_index)
                            .cloned()
                            .unwrap_or_default(),
                        Err(_) => Default::default(),
                    };
                    row_result_index += 1;
                    task.complete_read(Ok(row));
                } else {
                    task.complete_read(Err(status_error(status)));
                }
                continue;
            }

            tracing::debug!(table = %self.name, task = id, %status, "read failed");
            let Some(task) = self.task_pool.get(id) else {
                continue;
            };
            task.set_internal_error(status);
            let retries = task.inc_retry_times();
            if status == StatusCode::KeyNotInRange {
                not_in_range.push(task);
            } else if retries > self.config.retry_times {
                let Some(task) = self.task_pool.pop(id) else {
                    continue;
                };
                self.release_reader_slot();
                task.complete_read(Err(ErrorCode::system(format!(
                    "retry {retries} times, last error: {status}"
                ))));
            } else {
                retry_groups.entry(retries).or_default().push(id);
            }
        }

        if !not_in_range.is_empty() {
            self.distribute_readers(not_in_range, false).await;
        }
        for (retries, group) in retry_groups {
            let backoff = self.config.retry_backoff_ms(retries);
            let core = Arc::clone(self);
            self.delay.schedule(Duration::from_millis(backoff), move || {
                tokio::spawn(async move { core.distribute_readers_by_id(group).await });
            });
        }
    }

    fn release_reader_slot(&self) {
        self.reader_pending.fetch_sub(1, Ordering::AcqRel);
        self.reader_pending_changed.notify_waiters();
    }

    // -----------------------------------------------------------------
    // Scans
    // -----------------------------------------------------------------

    pub(crate) fn scan_tablet_async(self: &Arc<Self>, task: Arc<SdkTask>, called_by_user: bool) {
        if called_by_user {
            self.task_pool.put(task.clone());
        }
        if let Some(server_addr) = self.tablet_addr_or_schedule_update(&task) {
            self.commit_scan(task, &server_addr);
        }
    }

    pub(crate) fn commit_scan(self: &Arc<Self>, task: Arc<SdkTask>, server_addr: &str) {
        let mut request = {
            let inner = task.inner.lock().unwrap();
            match &inner.payload {
                TaskPayload::Scan { request, .. } => request.clone(),
                _ => return,
            }
        };
        request.sequence_id = self.next_sequence_id();
        let node = self.connector.tablet_node(server_addr);
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let result = node.scan_tablet(request).await;
            core.scan_callback(task, result);
        });
    }

    pub(crate) fn scan_callback(
        self: &Arc<Self>,
        task: Arc<SdkTask>,
        result: Result<trellis_proto::messages::ScanTabletResponse, trellis_proto::rpc::RpcFault>,
    ) {
        let status = match &result {
            Err(fault) => fault.status(),
            Ok(response) => response.status,
        };
        if !status.is_node_ok() && status != StatusCode::SnapshotNotExist {
            tracing::debug!(table = %self.name, %status, "scan round failed");
        }
        task.set_internal_error(status);

        let finished = status.is_node_ok()
            || status == StatusCode::SnapshotNotExist
            || task.retry_times() >= self.config.retry_times;
        if finished {
            if status == StatusCode::KeyNotInRange || status == StatusCode::ConnectError {
                self.schedule_update_meta(&task.row.clone(), task.meta_timestamp());
            }
            let Some(task) = self.task_pool.pop(task.id) else {
                return;
            };
            if status.is_node_ok() {
                if let Ok(response) = result {
                    task.complete_scan(Ok(response));
                }
            } else {
                task.complete_scan(Err(status_error(status)));
            }
        } else {
            let retries = task.inc_retry_times();
            let backoff = self.config.retry_backoff_ms(retries.saturating_sub(1));
            let core = Arc::clone(self);
            self.delay.schedule(Duration::from_millis(backoff), move || {
                core.scan_tablet_async(task, false);
            });
        }
    }

    // -----------------------------------------------------------------
    // Deadlines
    // -----------------------------------------------------------------

    /// Per-task deadline: fires at most once and guarantees no further
    /// callbacks by removing the task from the pool first.
    pub(crate) fn task_timeout(self: &Arc<Self>, id: u64, timeout_ms: i64) {
        let Some(task) = self.task_pool.pop(id) else {
            return;
        };
        let status = task.internal_error();
        if status == StatusCode::KeyNotInRange || status == StatusCode::ConnectError {
            self.schedule_update_meta(&task.row.clone(), task.meta_timestamp());
        }
        match task.kind {
            TaskKind::Mutation => self.release_mutation_slots(&task),
            TaskKind::Read => self.release_reader_slot(),
            TaskKind::Scan => {}
        }
        tracing::debug!(table = %self.name, task = id, timeout_ms, "task deadline fired");
        task.complete_expired(timeout_ms);
    }

    /// Build a scan request with this table's defaults applied.
    pub(crate) fn new_scan_request(&self, start: Vec<u8>, end: Vec<u8>) -> ScanTabletRequest {
        ScanTabletRequest {
            table_name: self.name.clone(),
            start,
            end,
            buffer_limit: self.config.scan_buffer_limit,
            ..Default::default()
        }
    }
}
