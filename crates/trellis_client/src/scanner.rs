//! Result stream over tablet scans.
//!
//! Each round trip fetches up to one buffer of cells from the tablet
//! covering the cursor; `complete=false` continues from the returned end
//! key, possibly on a different tablet. Retries and range movement are
//! handled by the router underneath.

use std::sync::Arc;

use tokio::sync::oneshot;

use trellis_proto::error::{ErrorCode, SdkResult};
use trellis_proto::messages::{ColumnSpec, FilterSpec, KeyValuePair, TimeRange};

use crate::table::{Table, TableCore};
use crate::task::{SdkTask, TaskPayload};

/// What to scan.
#[derive(Debug, Clone, Default)]
pub struct ScanDescriptor {
    pub start: Vec<u8>,
    /// Exclusive end; empty scans to the end of the table.
    pub end: Vec<u8>,
    pub snapshot_id: u64,
    pub cf_list: Vec<ColumnSpec>,
    /// Server-side filters, applied in order.
    pub filter_list: Vec<FilterSpec>,
    pub time_range: Option<TimeRange>,
    pub max_versions: u32,
    /// Cap on cells per round trip; 0 uses the server default.
    pub number_limit: u64,
}

impl ScanDescriptor {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            max_versions: 1,
            ..Default::default()
        }
    }

    pub fn snapshot(mut self, snapshot_id: u64) -> Self {
        self.snapshot_id = snapshot_id;
        self
    }

    pub fn family(mut self, family: impl Into<String>) -> Self {
        self.cf_list.push(ColumnSpec {
            family: family.into(),
            qualifiers: Vec::new(),
        });
        self
    }

    pub fn filter(mut self, filter: FilterSpec) -> Self {
        self.filter_list.push(filter);
        self
    }
}

pub struct ResultStream {
    core: Arc<TableCore>,
    desc: ScanDescriptor,
    cursor: Vec<u8>,
    finished: bool,
}

impl ResultStream {
    pub(crate) fn new(core: Arc<TableCore>, desc: ScanDescriptor) -> Self {
        let cursor = desc.start.clone();
        Self {
            core,
            desc,
            cursor,
            finished: false,
        }
    }

    /// Fetch the next buffer of cells. `Ok(None)` when the scan is done.
    pub async fn next_batch(&mut self) -> SdkResult<Option<Vec<KeyValuePair>>> {
        if self.finished {
            return Ok(None);
        }

        let mut request = self
            .core
            .new_scan_request(self.cursor.clone(), self.desc.end.clone());
        request.snapshot_id = self.desc.snapshot_id;
        request.cf_list = self.desc.cf_list.clone();
        request.filter_list = self.desc.filter_list.clone();
        request.time_range = self.desc.time_range;
        request.max_versions = self.desc.max_versions;
        request.number_limit = self.desc.number_limit;

        let (tx, rx) = oneshot::channel();
        let task = SdkTask::new(
            self.core.task_pool.next_id(),
            self.cursor.clone(),
            false,
            0,
            TaskPayload::Scan {
                request,
                done: Some(tx),
            },
        );
        self.core.scan_tablet_async(task, true);

        let outcome = rx
            .await
            .map_err(|_| ErrorCode::system("client shut down before scan completion"))?;
        match outcome.result {
            Err(error) => {
                self.finished = true;
                Err(error)
            }
            Ok(response) => {
                if response.complete || response.end.is_empty() {
                    self.finished = true;
                } else {
                    self.cursor = response.end;
                }
                Ok(Some(response.results.key_values))
            }
        }
    }

    /// Drain the stream into one vector. Intended for tests and small scans.
    pub async fn collect_all(&mut self) -> SdkResult<Vec<KeyValuePair>> {
        let mut cells = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            cells.extend(batch);
        }
        Ok(cells)
    }
}

impl Table {
    /// Start a scan over `[desc.start, desc.end)`.
    pub fn scan(&self, desc: ScanDescriptor) -> ResultStream {
        ResultStream::new(self.core.clone(), desc)
    }
}
