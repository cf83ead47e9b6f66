//! Tablet-location cache and meta scanner.
//!
//! A key-sorted interval map keyed by `key_start`. Lookups find the greatest
//! entry at or below the key and verify the end bound. Misses insert a
//! singleton probe range and trigger a meta scan; stale entries move through
//! `WaitUpdate`/`DelayUpdate` under a minimum refresh interval. A bounded
//! number of scans run concurrently; requests for ranges already being
//! refreshed park in a pending list and wake when their range turns `Normal`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use trellis_proto::messages::ScanTabletRequest;
use trellis_proto::meta::{MetaRecord, TabletMeta};
use trellis_proto::status::StatusCode;
use trellis_proto::{meta_table_scan_range, parse_meta_record, META_TABLE_NAME};

use crate::table::{now_ms, TableCore};
use crate::task::{SdkTask, TaskKind};

/// Total attempts rescanning one span from its original start before the
/// scanner gives up on strict coverage and continues from the returned end.
const META_SCAN_FULL_RETRY_MAX: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MetaNodeStatus {
    Normal,
    WaitUpdate,
    Updating,
    DelayUpdate,
}

#[derive(Clone)]
pub(crate) struct MetaNode {
    pub meta: TabletMeta,
    pub status: MetaNodeStatus,
    pub update_time_ms: i64,
}

#[derive(Default)]
pub(crate) struct MetaState {
    /// Interval map keyed by `key_start`.
    pub nodes: BTreeMap<Vec<u8>, MetaNode>,
    /// Parked task ids keyed by row.
    pub pending: BTreeMap<Vec<u8>, Vec<u64>>,
    /// Concurrent meta scans in flight.
    pub updating_count: u32,
}

impl MetaState {
    /// Greatest entry whose `key_start <= key` and whose end covers `key`.
    fn node_key_for(&self, key: &[u8]) -> Option<Vec<u8>> {
        let (start, node) = self.nodes.range(..=key.to_vec()).next_back()?;
        let end = &node.meta.key_range.key_end;
        if !end.is_empty() && end.as_slice() <= key {
            return None;
        }
        Some(start.clone())
    }

    fn insert_probe(&mut self, row: &[u8]) {
        let mut probe_end = row.to_vec();
        probe_end.push(0);
        let mut meta = TabletMeta::default();
        meta.key_range.key_start = row.to_vec();
        meta.key_range.key_end = probe_end;
        self.nodes.insert(
            row.to_vec(),
            MetaNode {
                meta,
                status: MetaNodeStatus::WaitUpdate,
                update_time_ms: 0,
            },
        );
    }
}

impl TableCore {
    /// Resolve the serving address for a task's row, or park the task and
    /// arrange a meta refresh. Mirrors the cache policy in §meta-cache:
    /// a miss inserts a probe; an abnormal entry parks the task; a retryable
    /// error whose stamp is not older than the entry schedules `WaitUpdate`
    /// now or `DelayUpdate` at `update_time + interval`.
    pub(crate) fn tablet_addr_or_schedule_update(
        self: &Arc<Self>,
        task: &Arc<SdkTask>,
    ) -> Option<String> {
        let mut state = self.meta.lock().unwrap();
        let Some(node_key) = state.node_key_for(&task.row) else {
            tracing::trace!(table = %self.name, "no meta for key, inserting probe");
            state.pending.entry(task.row.clone()).or_default().push(task.id);
            state.insert_probe(&task.row);
            self.update_meta_async(&mut state);
            return None;
        };

        let (status, update_time_ms, range_start, range_end) = {
            let node = &state.nodes[&node_key];
            (
                node.status,
                node.update_time_ms,
                node.meta.key_range.key_start.clone(),
                node.meta.key_range.key_end.clone(),
            )
        };

        if status != MetaNodeStatus::Normal {
            state.pending.entry(task.row.clone()).or_default().push(task.id);
            return None;
        }

        let internal = task.internal_error();
        if (internal == StatusCode::KeyNotInRange || internal == StatusCode::ConnectError)
            && task.meta_timestamp() >= update_time_ms
        {
            state.pending.entry(task.row.clone()).or_default().push(task.id);
            let refresh_in = update_time_ms + self.config.update_meta_interval_ms - now_ms();
            if refresh_in <= 0 {
                if let Some(node) = state.nodes.get_mut(&node_key) {
                    node.status = MetaNodeStatus::WaitUpdate;
                }
                self.update_meta_async(&mut state);
            } else {
                if let Some(node) = state.nodes.get_mut(&node_key) {
                    node.status = MetaNodeStatus::DelayUpdate;
                }
                let core = Arc::clone(self);
                self.delay
                    .schedule(Duration::from_millis(refresh_in as u64), move || {
                        core.delay_update_meta(range_start, range_end);
                    });
            }
            return None;
        }

        task.set_meta_timestamp(update_time_ms);
        Some(state.nodes[&node_key].meta.server_addr.clone())
    }

    /// Schedule a refresh for the range covering `row`, honoring the minimum
    /// refresh interval. Stale callers (`meta_timestamp < entry update time`)
    /// are ignored.
    pub(crate) fn schedule_update_meta(self: &Arc<Self>, row: &[u8], meta_timestamp_ms: i64) {
        let mut state = self.meta.lock().unwrap();
        let Some(node_key) = state.node_key_for(row) else {
            state.insert_probe(row);
            self.update_meta_async(&mut state);
            return;
        };
        let (status, update_time_ms, range_start, range_end) = {
            let node = &state.nodes[&node_key];
            (
                node.status,
                node.update_time_ms,
                node.meta.key_range.key_start.clone(),
                node.meta.key_range.key_end.clone(),
            )
        };
        if status == MetaNodeStatus::Normal && meta_timestamp_ms >= update_time_ms {
            let refresh_in = update_time_ms + self.config.update_meta_interval_ms - now_ms();
            if refresh_in <= 0 {
                if let Some(node) = state.nodes.get_mut(&node_key) {
                    node.status = MetaNodeStatus::WaitUpdate;
                }
                self.update_meta_async(&mut state);
            } else {
                if let Some(node) = state.nodes.get_mut(&node_key) {
                    node.status = MetaNodeStatus::DelayUpdate;
                }
                let core = Arc::clone(self);
                self.delay
                    .schedule(Duration::from_millis(refresh_in as u64), move || {
                        core.delay_update_meta(range_start, range_end);
                    });
            }
        }
    }

    /// Delayed-refresh timer target: promote `DelayUpdate` entries inside
    /// `[start, end]` back to `WaitUpdate` and kick the scanner.
    pub(crate) fn delay_update_meta(self: &Arc<Self>, start: Vec<u8>, end: Vec<u8>) {
        let mut state = self.meta.lock().unwrap();
        let keys: Vec<Vec<u8>> = state
            .nodes
            .range(start..)
            .take_while(|(_, node)| {
                end.is_empty()
                    || (!node.meta.key_range.key_end.is_empty()
                        && node.meta.key_range.key_end <= end)
            })
            .filter(|(_, node)| node.status == MetaNodeStatus::DelayUpdate)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(node) = state.nodes.get_mut(&key) {
                node.status = MetaNodeStatus::WaitUpdate;
            }
        }
        self.update_meta_async(&mut state);
    }

    /// Coalesce adjacent `WaitUpdate` runs into one scan and start it, up to
    /// the configured scan concurrency.
    pub(crate) fn update_meta_async(self: &Arc<Self>, state: &mut MetaState) {
        if state.updating_count >= self.config.update_meta_concurrency {
            return;
        }
        let mut need_update = false;
        let mut update_start = Vec::new();
        let mut update_end = Vec::new();
        // Scan slightly past the run so neighbouring tablets refresh too.
        let mut expand_end = Vec::new();
        let mut marked: Vec<Vec<u8>> = Vec::new();
        for (key, node) in state.nodes.iter() {
            let waiting = node.status == MetaNodeStatus::WaitUpdate;
            if !waiting && need_update {
                expand_end = node.meta.key_range.key_start.clone();
                break;
            } else if !waiting {
                continue;
            } else if !need_update {
                need_update = true;
                update_start = node.meta.key_range.key_start.clone();
                update_end = node.meta.key_range.key_end.clone();
            } else if node.meta.key_range.key_start == update_end {
                update_end = node.meta.key_range.key_end.clone();
            } else {
                expand_end = node.meta.key_range.key_start.clone();
                break;
            }
            marked.push(key.clone());
        }
        if !need_update {
            return;
        }
        for key in marked {
            if let Some(node) = state.nodes.get_mut(&key) {
                node.status = MetaNodeStatus::Updating;
            }
        }
        state.updating_count += 1;
        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.scan_meta_table(update_start, update_end, expand_end, false, 0)
                .await;
        });
    }

    /// One iterative scan step over the root tablet's meta region for
    /// `[table ++ 0 ++ key_start, table ++ 0 ++ expand_end)`.
    ///
    /// Returns a boxed future: the body recurses into itself (via
    /// `tokio::spawn`), which makes the naive `async fn` future type
    /// infinitely recursive for auto-trait (`Send`) checking. Boxing breaks
    /// the cycle without changing behavior.
    fn scan_meta_table(
        self: Arc<Self>,
        key_start: Vec<u8>,
        key_end: Vec<u8>,
        expand_end: Vec<u8>,
        force_registry: bool,
        stale_attempts: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
        let root_addr = {
            let addr = self.cluster.root_table_addr(force_registry).await;
            if addr.is_empty() && !force_registry {
                self.cluster.root_table_addr(true).await
            } else {
                addr
            }
        };
        if root_addr.is_empty() {
            tracing::debug!(table = %self.name, "root tablet address unknown, delaying meta scan");
            let core = Arc::clone(&self);
            self.delay.schedule(
                Duration::from_millis(self.config.update_meta_interval_ms.max(1) as u64),
                move || {
                    let inner = Arc::clone(&core);
                    tokio::spawn(async move {
                        inner
                            .scan_meta_table(key_start, key_end, expand_end, true, stale_attempts)
                            .await;
                    });
                },
            );
            return;
        }

        let (scan_start, scan_end) = meta_table_scan_range(&self.name, &key_start, &expand_end);
        let request = ScanTabletRequest {
            sequence_id: self.next_sequence_id(),
            table_name: META_TABLE_NAME.to_string(),
            start: scan_start,
            end: scan_end,
            buffer_limit: self.config.update_meta_buffer_limit,
            round_down: true,
            ..Default::default()
        };
        let node = self.connector.tablet_node(&root_addr);
        let response = match node.scan_tablet(request).await {
            Ok(response) if response.status.is_node_ok() => response,
            other => {
                let status = match other {
                    Ok(response) => response.status,
                    Err(fault) => fault.status(),
                };
                tracing::debug!(table = %self.name, %status, "meta scan failed");
                self.give_up_meta_update(&key_start, &key_end);
                return;
            }
        };

        let mut return_start = Vec::new();
        let mut return_end = Vec::new();
        let mut rows = 0usize;
        let record_count = response.results.key_values.len();
        for (index, kv) in response.results.key_values.iter().enumerate() {
            let record = match parse_meta_record(&kv.key, &kv.value) {
                Ok(record) => record,
                Err(error) => {
                    tracing::warn!(table = %self.name, %error, "undecodable meta row skipped");
                    continue;
                }
            };
            let MetaRecord::Tablet(meta) = record else {
                continue;
            };
            if index == 0 {
                return_start = meta.key_range.key_start.clone();
            }
            if index + 1 == record_count {
                return_end = meta.key_range.key_end.clone();
            }
            rows += 1;
            let mut state = self.meta.lock().unwrap();
            self.update_tablet_meta_list(&mut state, meta);
        }
        tracing::trace!(
            table = %self.name,
            rows,
            complete = response.complete,
            "meta scan step finished"
        );

        // Stale detection: nothing returned, a start past the request, or a
        // "complete" reply that stops short of the requested end.
        let scan_meta_error = rows == 0
            || return_start > key_start
            || (response.complete
                && !return_end.is_empty()
                && (key_end.is_empty() || return_end < key_end));

        if scan_meta_error {
            let attempts = stale_attempts + 1;
            tracing::warn!(
                table = %self.name,
                attempts,
                "meta scan returned inconsistent coverage"
            );
            if attempts < META_SCAN_FULL_RETRY_MAX {
                let core = Arc::clone(&self);
                tokio::spawn(async move {
                    core.scan_meta_table(key_start, key_end, expand_end, false, attempts)
                        .await;
                });
            } else if !return_end.is_empty() && return_end > key_start {
                // Strict coverage keeps failing; continue past what we got.
                let core = Arc::clone(&self);
                tokio::spawn(async move {
                    core.scan_meta_table(return_end, key_end, expand_end, false, 0)
                        .await;
                });
            } else {
                self.give_up_meta_update(&key_start, &key_end);
            }
            return;
        }

        if !return_end.is_empty() && (key_end.is_empty() || return_end < key_end) {
            let core = Arc::clone(&self);
            tokio::spawn(async move {
                core.scan_meta_table(return_end, key_end, expand_end, false, stale_attempts)
                    .await;
            });
            return;
        }

        let mut state = self.meta.lock().unwrap();
        state.updating_count = state.updating_count.saturating_sub(1);
        self.update_meta_async(&mut state);
        })
    }

    /// Scan failure: every range still being updated inside the span returns
    /// to `WaitUpdate`, dead pending entries are pruned, and a delayed
    /// refresh is armed. Pending tasks are not failed.
    fn give_up_meta_update(self: &Arc<Self>, key_start: &[u8], key_end: &[u8]) {
        let mut state = self.meta.lock().unwrap();
        let keys: Vec<Vec<u8>> = state
            .nodes
            .range(key_start.to_vec()..)
            .take_while(|(start, _)| key_end.is_empty() || start.as_slice() < key_end)
            .filter(|(_, node)| node.status == MetaNodeStatus::Updating)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(node) = state.nodes.get_mut(&key) {
                node.status = MetaNodeStatus::WaitUpdate;
            }
        }
        let rows: Vec<Vec<u8>> = state
            .pending
            .range(key_start.to_vec()..)
            .take_while(|(row, _)| key_end.is_empty() || row.as_slice() < key_end)
            .map(|(row, _)| row.clone())
            .collect();
        for row in rows {
            if let Some(ids) = state.pending.get_mut(&row) {
                ids.retain(|id| self.task_pool.get(*id).is_some());
                if ids.is_empty() {
                    state.pending.remove(&row);
                }
            }
        }
        state.updating_count = state.updating_count.saturating_sub(1);

        let core = Arc::clone(self);
        self.delay.schedule(
            Duration::from_millis(self.config.update_meta_interval_ms.max(1) as u64),
            move || {
                let mut state = core.meta.lock().unwrap();
                core.update_meta_async(&mut state);
            },
        );
    }

    /// Reconcile a returned tablet range against every overlapping cache
    /// entry, then insert it as `Normal` and wake parked tasks. The five
    /// boundary cases keep the map disjoint.
    pub(crate) fn update_tablet_meta_list(
        self: &Arc<Self>,
        state: &mut MetaState,
        new_meta: TabletMeta,
    ) {
        let new_start = new_meta.key_range.key_start.clone();
        let new_end = new_meta.key_range.key_end.clone();

        let iter_from = state
            .nodes
            .range(..=new_start.clone())
            .next_back()
            .map(|(k, _)| k.clone())
            .or_else(|| state.nodes.keys().next().cloned());
        if let Some(iter_from) = iter_from {
            let keys: Vec<Vec<u8>> = state.nodes.range(iter_from..).map(|(k, _)| k.clone()).collect();
            for old_key in keys {
                let (old_start, old_end) = {
                    let node = &state.nodes[&old_key];
                    (
                        node.meta.key_range.key_start.clone(),
                        node.meta.key_range.key_end.clone(),
                    )
                };
                if old_start < new_start {
                    if !old_end.is_empty() && old_end <= new_start {
                        // Disjoint on the left.
                    } else if new_end.is_empty() || (!old_end.is_empty() && old_end <= new_end) {
                        // Partial left overlap: shrink the old end.
                        if let Some(node) = state.nodes.get_mut(&old_key) {
                            node.meta.key_range.key_end = new_start.clone();
                        }
                    } else {
                        // New range contained: split the old entry in two.
                        let mut right = state.nodes[&old_key].clone();
                        right.meta.key_range.key_start = new_end.clone();
                        state.nodes.insert(new_end.clone(), right);
                        if let Some(node) = state.nodes.get_mut(&old_key) {
                            node.meta.key_range.key_end = new_start.clone();
                        }
                    }
                } else if new_end.is_empty() || old_start < new_end {
                    if new_end.is_empty() || (!old_end.is_empty() && old_end <= new_end) {
                        // Covered: drop the old entry.
                        state.nodes.remove(&old_key);
                    } else {
                        // Partial right overlap: shrink the old start.
                        let mut shrunk = state.nodes[&old_key].clone();
                        shrunk.meta.key_range.key_start = new_end.clone();
                        state.nodes.remove(&old_key);
                        state.nodes.insert(new_end.clone(), shrunk);
                    }
                } else {
                    break;
                }
            }
        }

        let update_time_ms = now_ms();
        tracing::trace!(
            table = %self.name,
            server = %new_meta.server_addr,
            "meta cache updated"
        );
        let server_addr = new_meta.server_addr.clone();
        state.nodes.insert(
            new_start.clone(),
            MetaNode {
                meta: new_meta,
                status: MetaNodeStatus::Normal,
                update_time_ms,
            },
        );
        self.wake_up_pending(state, &new_start, &new_end, &server_addr, update_time_ms);
    }

    /// Resume tasks whose row now has a `Normal` range: reads and writes
    /// re-enter their packers, scans commit directly.
    fn wake_up_pending(
        self: &Arc<Self>,
        state: &mut MetaState,
        start: &[u8],
        end: &[u8],
        server_addr: &str,
        meta_timestamp_ms: i64,
    ) {
        let rows: Vec<Vec<u8>> = state
            .pending
            .range(start.to_vec()..)
            .take_while(|(row, _)| end.is_empty() || row.as_slice() < end)
            .map(|(row, _)| row.clone())
            .collect();
        let mut mutations = Vec::new();
        let mut readers = Vec::new();
        let mut scans = Vec::new();
        for row in rows {
            let Some(ids) = state.pending.remove(&row) else {
                continue;
            };
            for id in ids {
                let Some(task) = self.task_pool.get(id) else {
                    tracing::trace!(task = id, "parked task expired before meta arrived");
                    continue;
                };
                task.set_meta_timestamp(meta_timestamp_ms);
                match task.kind {
                    TaskKind::Mutation => mutations.push(task),
                    TaskKind::Read => readers.push(task),
                    TaskKind::Scan => scans.push(task),
                }
            }
        }
        if !mutations.is_empty() {
            self.pack_mutations(server_addr, mutations, false);
        }
        if !readers.is_empty() {
            self.pack_readers(server_addr, readers);
        }
        for task in scans {
            self.commit_scan(task, server_addr);
        }
    }

    /// Snapshot of the cached location covering `key`.
    pub(crate) fn cached_tablet_for_key(&self, key: &[u8]) -> Option<TabletMeta> {
        let state = self.meta.lock().unwrap();
        let node_key = state.node_key_for(key)?;
        Some(state.nodes[&node_key].meta.clone())
    }

    #[cfg(test)]
    pub(crate) fn meta_ranges(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let state = self.meta.lock().unwrap();
        state
            .nodes
            .values()
            .map(|n| {
                (
                    n.meta.key_range.key_start.clone(),
                    n.meta.key_range.key_end.clone(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SdkConfig;
    use trellis_proto::meta::KeyRange;

    fn test_core() -> Arc<TableCore> {
        crate::testutil::test_core(SdkConfig::default())
    }

    fn tablet(start: &[u8], end: &[u8], addr: &str) -> TabletMeta {
        TabletMeta {
            table_name: "orders".to_string(),
            key_range: KeyRange::new(start, end),
            server_addr: addr.to_string(),
            ..Default::default()
        }
    }

    fn assert_disjoint(ranges: &[(Vec<u8>, Vec<u8>)]) {
        for window in ranges.windows(2) {
            let (_, prev_end) = &window[0];
            let (next_start, _) = &window[1];
            assert!(
                !prev_end.is_empty() && prev_end <= next_start,
                "overlap between {window:?}"
            );
        }
    }

    #[tokio::test]
    async fn lookup_honors_end_bound() {
        let core = test_core();
        {
            let mut state = core.meta.lock().unwrap();
            core.update_tablet_meta_list(&mut state, tablet(b"a", b"m", "s1"));
        }
        assert_eq!(
            core.cached_tablet_for_key(b"b").unwrap().server_addr,
            "s1"
        );
        assert!(core.cached_tablet_for_key(b"m").is_none());
        assert!(core.cached_tablet_for_key(b"Z").is_none());
    }

    #[tokio::test]
    async fn reconciliation_partial_left_shrinks_old_end() {
        let core = test_core();
        let mut state = core.meta.lock().unwrap();
        core.update_tablet_meta_list(&mut state, tablet(b"a", b"m", "s1"));
        core.update_tablet_meta_list(&mut state, tablet(b"f", b"m", "s2"));
        drop(state);
        let ranges = core.meta_ranges();
        assert_eq!(
            ranges,
            vec![(b"a".to_vec(), b"f".to_vec()), (b"f".to_vec(), b"m".to_vec())]
        );
        assert_disjoint(&ranges);
    }

    #[tokio::test]
    async fn reconciliation_contained_splits_old_entry() {
        let core = test_core();
        let mut state = core.meta.lock().unwrap();
        core.update_tablet_meta_list(&mut state, tablet(b"a", b"z", "s1"));
        core.update_tablet_meta_list(&mut state, tablet(b"f", b"m", "s2"));
        drop(state);
        let ranges = core.meta_ranges();
        assert_eq!(
            ranges,
            vec![
                (b"a".to_vec(), b"f".to_vec()),
                (b"f".to_vec(), b"m".to_vec()),
                (b"m".to_vec(), b"z".to_vec()),
            ]
        );
        assert_disjoint(&ranges);
        assert_eq!(core.cached_tablet_for_key(b"p").unwrap().server_addr, "s1");
        assert_eq!(core.cached_tablet_for_key(b"g").unwrap().server_addr, "s2");
    }

    #[tokio::test]
    async fn reconciliation_covering_drops_old_entries() {
        let core = test_core();
        let mut state = core.meta.lock().unwrap();
        core.update_tablet_meta_list(&mut state, tablet(b"c", b"f", "s1"));
        core.update_tablet_meta_list(&mut state, tablet(b"f", b"k", "s2"));
        core.update_tablet_meta_list(&mut state, tablet(b"a", b"z", "s3"));
        drop(state);
        let ranges = core.meta_ranges();
        assert_eq!(ranges, vec![(b"a".to_vec(), b"z".to_vec())]);
    }

    #[tokio::test]
    async fn reconciliation_partial_right_shrinks_old_start() {
        let core = test_core();
        let mut state = core.meta.lock().unwrap();
        core.update_tablet_meta_list(&mut state, tablet(b"f", b"z", "s1"));
        core.update_tablet_meta_list(&mut state, tablet(b"a", b"m", "s2"));
        drop(state);
        let ranges = core.meta_ranges();
        assert_eq!(
            ranges,
            vec![(b"a".to_vec(), b"m".to_vec()), (b"m".to_vec(), b"z".to_vec())]
        );
        assert_disjoint(&ranges);
    }

    #[tokio::test]
    async fn reconciliation_handles_infinite_ends() {
        let core = test_core();
        let mut state = core.meta.lock().unwrap();
        core.update_tablet_meta_list(&mut state, tablet(b"a", b"", "s1"));
        core.update_tablet_meta_list(&mut state, tablet(b"m", b"", "s2"));
        drop(state);
        let ranges = core.meta_ranges();
        assert_eq!(
            ranges,
            vec![(b"a".to_vec(), b"m".to_vec()), (b"m".to_vec(), Vec::new())]
        );
    }
}
