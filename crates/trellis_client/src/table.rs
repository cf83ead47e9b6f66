//! User-facing table handle and the shared client core.
//!
//! `TableCore` owns everything one opened table needs: the meta cache, the
//! per-server batches, the task pool, flow-control counters and the delayed
//! task scheduler. The router, meta cache and cookie store are impl blocks
//! over this core in their own modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};

use trellis_proto::error::{ErrorCode, ErrorKind, SdkResult};
use trellis_proto::messages::{
    ColumnSpec, Mutation, MutationOp, ReadTabletRequest, RowReaderInfo, RowResult, TimeRange,
};
use trellis_proto::meta::{MetaRecord, TableMeta, TabletMeta};
use trellis_proto::rpc::TabletNodeConnector;
use trellis_proto::status::StatusCode;
use trellis_proto::{make_table_meta_key, unix_time_ms};

use crate::cluster::ClusterFinder;
use crate::config::SdkConfig;
use crate::delay::DelayScheduler;
use crate::meta_cache::MetaState;
use crate::router::TaskBatch;
use crate::task::{
    MutationOutcome, ReadOutcome, SdkTask, TaskPayload, TaskPool,
};

/// Table schema and identity read from the meta table at open time.
#[derive(Default)]
pub(crate) struct TableInfo {
    pub schema: trellis_proto::schema::TableSchema,
    pub create_time: i64,
}

pub struct TableCore {
    pub(crate) name: String,
    pub(crate) config: SdkConfig,
    pub(crate) cluster: Arc<ClusterFinder>,
    pub(crate) connector: Arc<dyn TabletNodeConnector>,
    pub(crate) task_pool: TaskPool,
    pub(crate) delay: DelayScheduler,
    pub(crate) meta: Mutex<MetaState>,
    pub(crate) table_info: Mutex<TableInfo>,
    pub(crate) mutation_batches: Mutex<HashMap<String, TaskBatch>>,
    pub(crate) reader_batches: Mutex<HashMap<String, TaskBatch>>,
    pub(crate) mutation_batch_seq: AtomicU64,
    pub(crate) reader_batch_seq: AtomicU64,
    pub(crate) sequence_id: AtomicU64,
    pub(crate) commit_pending: AtomicI64,
    pub(crate) reader_pending: AtomicI64,
    pub(crate) commit_pending_changed: Notify,
    pub(crate) reader_pending_changed: Notify,
}

impl TableCore {
    pub(crate) fn new(
        name: String,
        config: SdkConfig,
        cluster: Arc<ClusterFinder>,
        connector: Arc<dyn TabletNodeConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            config,
            cluster,
            connector,
            task_pool: TaskPool::new(),
            delay: DelayScheduler::new(),
            meta: Mutex::new(MetaState::default()),
            table_info: Mutex::new(TableInfo::default()),
            mutation_batches: Mutex::new(HashMap::new()),
            reader_batches: Mutex::new(HashMap::new()),
            mutation_batch_seq: AtomicU64::new(0),
            reader_batch_seq: AtomicU64::new(0),
            sequence_id: AtomicU64::new(0),
            commit_pending: AtomicI64::new(0),
            reader_pending: AtomicI64::new(0),
            commit_pending_changed: Notify::new(),
            reader_pending_changed: Notify::new(),
        })
    }

    pub(crate) fn next_sequence_id(&self) -> u64 {
        self.sequence_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn create_time(&self) -> i64 {
        self.table_info.lock().unwrap().create_time
    }

    /// Read this table's descriptor row from the meta tablet, with the retry
    /// envelope applied. Fills schema and create_time on success.
    pub(crate) async fn update_table_meta(self: &Arc<Self>) -> SdkResult<()> {
        let mut force_registry = false;
        for attempt in 0..=self.config.retry_times {
            let addr = {
                let addr = self.cluster.root_table_addr(force_registry).await;
                if addr.is_empty() && !force_registry {
                    self.cluster.root_table_addr(true).await
                } else {
                    addr
                }
            };
            if addr.is_empty() {
                tracing::debug!(table = %self.name, attempt, "root tablet address unknown");
                force_registry = true;
                tokio::time::sleep(Duration::from_millis(
                    self.config.retry_backoff_ms(attempt),
                ))
                .await;
                continue;
            }
            let request = ReadTabletRequest {
                sequence_id: self.next_sequence_id(),
                tablet_name: trellis_proto::META_TABLE_NAME.to_string(),
                row_info_list: vec![RowReaderInfo {
                    key: make_table_meta_key(&self.name),
                    ..Default::default()
                }],
                snapshot_id: 0,
                client_timeout_ms: self.config.pending_timeout_ms,
            };
            let node = self.connector.tablet_node(&addr);
            let status = match node.read_tablet(request).await {
                Ok(response) => {
                    let status = if response.status.is_node_ok() {
                        response
                            .detail
                            .status_list
                            .first()
                            .copied()
                            .unwrap_or(StatusCode::KeyNotExist)
                    } else {
                        response.status
                    };
                    if status.is_node_ok() {
                        let row = response
                            .detail
                            .row_results
                            .first()
                            .and_then(|r| r.key_values.first())
                            .ok_or_else(|| ErrorCode::not_found("table meta row is empty"))?;
                        let record =
                            trellis_proto::meta::parse_meta_record(&row.key, &row.value)
                                .map_err(|e| ErrorCode::system(e.to_string()))?;
                        let MetaRecord::Table(meta) = record else {
                            return Err(ErrorCode::system("unexpected meta record type"));
                        };
                        let mut info = self.table_info.lock().unwrap();
                        info.schema = meta.schema;
                        info.create_time = meta.create_time;
                        return Ok(());
                    }
                    status
                }
                Err(fault) => fault.status(),
            };
            if matches!(status, StatusCode::KeyNotExist | StatusCode::SnapshotNotExist) {
                return Err(ErrorCode::not_found(format!("no such table: {}", self.name)));
            }
            tracing::debug!(table = %self.name, %status, attempt, "table meta read failed");
            force_registry = true;
            tokio::time::sleep(Duration::from_millis(self.config.retry_backoff_ms(attempt)))
                .await;
        }
        Err(ErrorCode::system(format!(
            "table meta unavailable after {} attempts",
            self.config.retry_times + 1
        )))
    }
}

/// One row mutation to apply.
#[derive(Debug, Clone)]
pub struct RowMutationRequest {
    pub row_key: Vec<u8>,
    pub mutations: Vec<Mutation>,
    /// Per-task deadline; `None` uses the client default.
    pub timeout_ms: Option<i64>,
}

impl RowMutationRequest {
    pub fn new(row_key: impl Into<Vec<u8>>) -> Self {
        Self {
            row_key: row_key.into(),
            mutations: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn put(
        mut self,
        family: impl Into<String>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.mutations.push(Mutation {
            op: MutationOp::Put,
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp: -1,
            value: value.into(),
            ttl_secs: 0,
        });
        self
    }

    pub fn put_if_absent(
        mut self,
        family: impl Into<String>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.mutations.push(Mutation {
            op: MutationOp::PutIfAbsent,
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp: -1,
            value: value.into(),
            ttl_secs: 0,
        });
        self
    }

    pub fn append(
        mut self,
        family: impl Into<String>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.mutations.push(Mutation {
            op: MutationOp::Append,
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp: -1,
            value: value.into(),
            ttl_secs: 0,
        });
        self
    }

    pub fn delete_row(mut self) -> Self {
        self.mutations.push(Mutation {
            op: MutationOp::DeleteRow,
            family: String::new(),
            qualifier: Vec::new(),
            timestamp: -1,
            value: Bytes::new(),
            ttl_secs: 0,
        });
        self
    }

    pub fn add(
        mut self,
        family: impl Into<String>,
        qualifier: impl Into<Vec<u8>>,
        delta: i64,
    ) -> Self {
        self.mutations.push(Mutation {
            op: MutationOp::Add,
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp: -1,
            value: Bytes::from(trellis_proto::meta::encode_counter(delta)),
            ttl_secs: 0,
        });
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// One row read to issue.
#[derive(Debug, Clone, Default)]
pub struct RowReadRequest {
    pub row_key: Vec<u8>,
    pub cf_list: Vec<ColumnSpec>,
    pub time_range: Option<TimeRange>,
    pub max_versions: u32,
    pub snapshot_id: u64,
    pub timeout_ms: Option<i64>,
}

impl RowReadRequest {
    pub fn new(row_key: impl Into<Vec<u8>>) -> Self {
        Self {
            row_key: row_key.into(),
            max_versions: 1,
            ..Default::default()
        }
    }

    pub fn column(mut self, family: impl Into<String>, qualifier: impl Into<Vec<u8>>) -> Self {
        self.cf_list.push(ColumnSpec {
            family: family.into(),
            qualifiers: vec![qualifier.into()],
        });
        self
    }

    pub fn snapshot(mut self, snapshot_id: u64) -> Self {
        self.snapshot_id = snapshot_id;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Handle to an opened table.
#[derive(Clone)]
pub struct Table {
    pub(crate) core: Arc<TableCore>,
}

impl Table {
    /// Open a table: read its descriptor, then restore the cookie if enabled.
    pub async fn open(
        name: impl Into<String>,
        config: SdkConfig,
        cluster: Arc<ClusterFinder>,
        connector: Arc<dyn TabletNodeConnector>,
    ) -> SdkResult<Self> {
        let core = TableCore::new(name.into(), config, cluster, connector);
        core.update_table_meta().await?;
        if core.config.cookie_enabled {
            core.restore_cookie();
            core.start_cookie_timer();
        }
        tracing::info!(table = %core.name, cluster = %core.cluster.cluster_id(), "table opened");
        Ok(Self { core })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Submit one mutation for asynchronous, batched execution. The returned
    /// receiver resolves exactly once with the task's outcome.
    pub async fn submit_mutation(
        &self,
        request: RowMutationRequest,
        sync: bool,
    ) -> oneshot::Receiver<MutationOutcome> {
        let (tx, rx) = oneshot::channel();
        let timeout_ms = request.timeout_ms.unwrap_or(self.core.config.timeout_ms);
        let task = SdkTask::new(
            self.core.task_pool.next_id(),
            request.row_key,
            sync,
            timeout_ms,
            TaskPayload::Mutation {
                mutations: request.mutations,
                done: Some(tx),
            },
        );
        self.core.distribute_mutations(vec![task], true).await;
        rx
    }

    /// Apply one mutation and wait for its outcome (flush semantics).
    pub async fn apply_mutation(&self, request: RowMutationRequest) -> SdkResult<()> {
        let rx = self.submit_mutation(request, true).await;
        match rx.await {
            Ok(outcome) => outcome.result,
            Err(_) => Err(ErrorCode::system("client shut down before completion")),
        }
    }

    /// Single-cell put with flush semantics.
    pub async fn put(
        &self,
        row_key: impl Into<Vec<u8>>,
        family: impl Into<String>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Bytes>,
    ) -> SdkResult<()> {
        self.apply_mutation(RowMutationRequest::new(row_key).put(family, qualifier, value))
            .await
    }

    /// Submit one read for asynchronous, batched execution.
    pub async fn submit_read(
        &self,
        request: RowReadRequest,
        sync: bool,
    ) -> oneshot::Receiver<ReadOutcome> {
        let (tx, rx) = oneshot::channel();
        let timeout_ms = request.timeout_ms.unwrap_or(self.core.config.timeout_ms);
        let info = RowReaderInfo {
            key: request.row_key.clone(),
            cf_list: request.cf_list,
            time_range: request.time_range,
            max_versions: request.max_versions,
        };
        let task = SdkTask::new(
            self.core.task_pool.next_id(),
            request.row_key,
            sync,
            timeout_ms,
            TaskPayload::Read {
                info,
                snapshot_id: request.snapshot_id,
                done: Some(tx),
            },
        );
        self.core.distribute_readers(vec![task], true).await;
        rx
    }

    /// Read one row and wait for the result.
    pub async fn read_row(&self, request: RowReadRequest) -> SdkResult<RowResult> {
        let rx = self.submit_read(request, true).await;
        match rx.await {
            Ok(outcome) => outcome.result,
            Err(_) => Err(ErrorCode::system("client shut down before completion")),
        }
    }

    /// Single-cell get. `Ok(None)` when the key does not exist.
    pub async fn get(
        &self,
        row_key: impl Into<Vec<u8>>,
        family: impl Into<String>,
        qualifier: impl Into<Vec<u8>>,
    ) -> SdkResult<Option<Bytes>> {
        let request = RowReadRequest::new(row_key).column(family, qualifier);
        match self.read_row(request).await {
            Ok(result) => Ok(result.key_values.into_iter().next().map(|kv| kv.value)),
            Err(err) if err.kind == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Read a counter cell written by [`RowMutationRequest::add`].
    pub async fn get_counter(
        &self,
        row_key: impl Into<Vec<u8>>,
        family: impl Into<String>,
        qualifier: impl Into<Vec<u8>>,
    ) -> SdkResult<Option<i64>> {
        match self.get(row_key, family, qualifier).await? {
            None => Ok(None),
            Some(value) => trellis_proto::meta::decode_counter(&value)
                .map(Some)
                .ok_or_else(|| ErrorCode::system("malformed counter cell")),
        }
    }

    /// Snapshot of the cached tablet location covering `key`, if any.
    pub fn cached_tablet_for_key(&self, key: &[u8]) -> Option<TabletMeta> {
        self.core.cached_tablet_for_key(key)
    }

    /// Cancel every delayed task and dump the cookie one last time.
    pub fn close(&self) {
        if self.core.config.cookie_enabled {
            self.core.dump_cookie();
        }
        self.core.delay.clear();
        tracing::debug!(table = %self.core.name, "table closed");
    }
}

/// Fold the descriptor row for tests and tools.
pub fn table_meta_of(table: &Table) -> TableMeta {
    let info = table.core.table_info.lock().unwrap();
    TableMeta {
        name: table.core.name.clone(),
        alias: table.core.name.clone(),
        schema: info.schema.clone(),
        create_time: info.create_time,
        ..Default::default()
    }
}

pub(crate) fn now_ms() -> i64 {
    unix_time_ms()
}
