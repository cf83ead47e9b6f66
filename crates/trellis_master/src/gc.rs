//! Garbage collection of SSTables left behind by dead tablets.
//!
//! Both strategies hook the tablet-node query loop through the same
//! capability surface: `pre_query` snapshots candidates before the fan-out,
//! `process_query_response` folds each node's inherited-live-files report,
//! `post_query` deletes what no live tablet still references.
//!
//! Safety invariant: a file is deleted only when no live-inherited-files
//! report between the observation point and delete issuance includes it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use trellis_proto::env::{
    build_full_file_number, parse_full_file_number, parse_sst_file_name, sst_file_path,
    tablet_num_from_path, tablet_path_from_num, Env,
};
use trellis_proto::messages::QueryResponse;
use trellis_proto::meta::TableStatus;
use trellis_proto::{unix_time_ms, META_TABLE_NAME};

use crate::tablet_manager::TabletManager;

/// Strategy seam driven by the master's query loop.
pub trait GcStrategy: Send + Sync {
    /// Snapshot candidates; false skips this GC round entirely.
    fn pre_query(&self) -> bool;
    /// Fold one tablet node's query response into the candidate state.
    fn process_query_response(&self, response: &QueryResponse);
    /// Delete whatever survived every report this round.
    fn post_query(&self);
    /// Forget all state for one table (drop/disable).
    fn clear(&self, table_name: &str);
}

fn table_path(prefix: &str, table_name: &str) -> String {
    format!("{prefix}/{table_name}")
}

/// Walk one dead tablet's directory. Non-SST strays are deleted on sight;
/// SST numbers are handed to `sink` as full file numbers keyed by LG.
fn collect_dead_tablet_files(
    env: &dyn Env,
    table_dir: &str,
    tablet_num: u64,
    mut sink: impl FnMut(u32, u64),
) -> usize {
    let tablet_dir = format!("{table_dir}/{}", tablet_path_from_num(tablet_num));
    let children = env.get_children(&tablet_dir).unwrap_or_default();
    let mut listed = 0usize;
    for child in &children {
        let lg_path = format!("{tablet_dir}/{child}");
        let Ok(lg_no) = child.parse::<u32>() else {
            // A stray file (or unknown dir) directly under the tablet dir.
            if parse_sst_file_name(child).is_some() {
                let _ = env.delete_file(&lg_path);
            } else {
                tracing::warn!(path = %lg_path, "unknown entry under dead tablet");
            }
            continue;
        };
        let files = env.get_children(&lg_path).unwrap_or_default();
        if files.is_empty() {
            let _ = env.delete_dir(&lg_path);
            continue;
        }
        for file in files {
            let file_path = format!("{lg_path}/{file}");
            match parse_sst_file_name(&file) {
                Some(file_no) => {
                    listed += 1;
                    sink(lg_no, build_full_file_number(tablet_num, file_no));
                }
                None => {
                    // Only SSTs are kept for reference counting.
                    let _ = env.delete_file(&file_path);
                }
            }
        }
    }
    listed
}

// ---------------------------------------------------------------------------
// Batch strategy
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BatchGcInner {
    /// table -> (live tablets still to confirm, dead tablets).
    gc_tablets: HashMap<String, (BTreeSet<u64>, BTreeSet<u64>)>,
    /// table -> per-LG candidate full file numbers.
    gc_live_files: HashMap<String, Vec<BTreeSet<u64>>>,
    file_total: u64,
    file_deleted: u64,
}

/// Whole-cycle collection: every round starts from a fresh filesystem
/// listing and requires every tablet of the table to confirm.
pub struct BatchGcStrategy {
    tablet_manager: Arc<TabletManager>,
    env: Arc<dyn Env>,
    path_prefix: String,
    inner: Mutex<BatchGcInner>,
}

impl BatchGcStrategy {
    pub fn new(tablet_manager: Arc<TabletManager>, env: Arc<dyn Env>, path_prefix: &str) -> Self {
        Self {
            tablet_manager,
            env,
            path_prefix: path_prefix.trim_end_matches('/').to_string(),
            inner: Mutex::new(BatchGcInner::default()),
        }
    }
}

impl GcStrategy for BatchGcStrategy {
    fn pre_query(&self) -> bool {
        let start_ms = unix_time_ms();
        let mut inner = self.inner.lock().unwrap();
        inner.gc_tablets.clear();
        inner.gc_live_files.clear();
        inner.file_total = 0;

        for table in self.tablet_manager.tables() {
            if table.status() != TableStatus::Enable || table.name() == META_TABLE_NAME {
                continue;
            }
            let table_dir = table_path(&self.path_prefix, table.name());
            let gc = table.tablets_for_gc(self.env.as_ref(), &table_dir);
            if !gc.all_ready || gc.dead.is_empty() {
                continue;
            }
            let lg_count = table.schema().locality_group_count();
            let mut file_set = vec![BTreeSet::new(); lg_count];
            for &tablet_num in &gc.dead {
                let listed = collect_dead_tablet_files(
                    self.env.as_ref(),
                    &table_dir,
                    tablet_num,
                    |lg_no, full| {
                        if let Some(set) = file_set.get_mut(lg_no as usize) {
                            set.insert(full);
                        }
                    },
                );
                if listed == 0 {
                    let tablet_dir =
                        format!("{table_dir}/{}", tablet_path_from_num(tablet_num));
                    if self.env.get_children(&tablet_dir).unwrap_or_default().is_empty() {
                        tracing::info!(path = %tablet_dir, "deleting empty dead tablet dir");
                        let _ = self.env.delete_dir(&tablet_dir);
                    }
                }
            }
            inner.file_total += file_set.iter().map(|s| s.len() as u64).sum::<u64>();
            inner
                .gc_tablets
                .insert(table.name().to_string(), (gc.live, gc.dead));
            inner.gc_live_files.insert(table.name().to_string(), file_set);
        }

        tracing::info!(
            candidates = inner.file_total,
            cost_ms = unix_time_ms() - start_ms,
            "batch gc collected dead tablet files"
        );
        !inner.gc_tablets.is_empty()
    }

    fn process_query_response(&self, response: &QueryResponse) {
        let mut inner = self.inner.lock().unwrap();
        let reporting: BTreeSet<&str> = response
            .inh_live_files
            .iter()
            .map(|live| live.table_name.as_str())
            .collect();

        for meta in &response.tablet_meta_list {
            if !reporting.contains(meta.table_name.as_str()) {
                continue;
            }
            let Some(num) = tablet_num_from_path(&meta.path) else {
                continue;
            };
            if let Some((live_pending, _)) = inner.gc_tablets.get_mut(&meta.table_name) {
                live_pending.remove(&num);
            }
        }

        for live in &response.inh_live_files {
            let Some(file_set) = inner.gc_live_files.get_mut(&live.table_name) else {
                continue;
            };
            for lg in &live.lg_live_files {
                if let Some(set) = file_set.get_mut(lg.lg_no as usize) {
                    for file_number in &lg.file_numbers {
                        set.remove(file_number);
                    }
                }
            }
        }
    }

    fn post_query(&self) {
        let mut inner = self.inner.lock().unwrap();
        let unconfirmed = inner
            .gc_tablets
            .iter()
            .find(|(_, (live_pending, _))| !live_pending.is_empty());
        if let Some((table, _)) = unconfirmed {
            tracing::info!(table = %table, "gc skipped, not every live tablet reported");
            return;
        }

        inner.file_deleted = 0;
        let mut deleted = 0u64;
        for (table_name, file_set) in &inner.gc_live_files {
            let table_dir = table_path(&self.path_prefix, table_name);
            for (lg_no, files) in file_set.iter().enumerate() {
                for &full in files {
                    let (tablet_no, file_no) = parse_full_file_number(full);
                    let path = sst_file_path(&table_dir, tablet_no, lg_no as u32, file_no);
                    tracing::info!(%path, "gc deleting obsolete sst");
                    if self.env.delete_file(&path).is_ok() {
                        deleted += 1;
                    }
                }
            }
        }
        inner.file_deleted = deleted;
        tracing::info!(deleted, "batch gc finished");
    }

    fn clear(&self, _table_name: &str) {
        // Whole-cycle state is rebuilt from scratch every round.
    }
}

// ---------------------------------------------------------------------------
// Incremental strategy
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
struct LgFileSet {
    storage: BTreeSet<u64>,
    live: BTreeSet<u64>,
}

#[derive(Default, Clone)]
struct TabletFileSet {
    dead_time_ms: i64,
    ready_time_ms: i64,
    files: BTreeMap<u32, LgFileSet>,
}

#[derive(Default)]
struct IncrementalGcInner {
    dead: HashMap<String, BTreeMap<u64, TabletFileSet>>,
    live: HashMap<String, BTreeMap<u64, TabletFileSet>>,
}

/// Incremental collection: dead tablets keep their storage listing across
/// rounds; a dead tablet's files become deletable only once every live
/// tablet has reported after the death (`dead_time < min(ready_time)`).
pub struct IncrementalGcStrategy {
    tablet_manager: Arc<TabletManager>,
    env: Arc<dyn Env>,
    path_prefix: String,
    inner: Mutex<IncrementalGcInner>,
}

impl IncrementalGcStrategy {
    pub fn new(tablet_manager: Arc<TabletManager>, env: Arc<dyn Env>, path_prefix: &str) -> Self {
        Self {
            tablet_manager,
            env,
            path_prefix: path_prefix.trim_end_matches('/').to_string(),
            inner: Mutex::new(IncrementalGcInner::default()),
        }
    }

    fn delete_table_files(&self, inner: &mut IncrementalGcInner, table_name: &str) {
        let table_dir = table_path(&self.path_prefix, table_name);
        let earliest_ready_ms = inner
            .live
            .get(table_name)
            .map(|tablets| {
                tablets
                    .values()
                    .map(|t| t.ready_time_ms)
                    .min()
                    .unwrap_or(i64::MAX)
            })
            .unwrap_or(i64::MAX);

        let Some(dead_tablets) = inner.dead.get_mut(table_name) else {
            return;
        };
        let eligible: Vec<u64> = dead_tablets
            .iter()
            .filter(|(_, t)| t.dead_time_ms < earliest_ready_ms)
            .map(|(&num, _)| num)
            .collect();

        for tablet_num in eligible {
            let Some(tablet_files) = dead_tablets.get_mut(&tablet_num) else {
                continue;
            };
            let tablet_dir = format!("{table_dir}/{}", tablet_path_from_num(tablet_num));
            let mut empty_lgs = Vec::new();
            for (&lg_no, lg_files) in tablet_files.files.iter_mut() {
                let doomed: Vec<u64> = lg_files
                    .storage
                    .difference(&lg_files.live)
                    .copied()
                    .collect();
                for full in doomed {
                    let (owner_tablet, file_no) = parse_full_file_number(full);
                    let path = sst_file_path(&table_dir, owner_tablet, lg_no, file_no);
                    tracing::info!(%path, "gc deleting obsolete sst");
                    let _ = self.env.delete_file(&path);
                    lg_files.storage.remove(&full);
                }
                if lg_files.storage.is_empty() {
                    if !lg_files.live.is_empty() {
                        tracing::error!(
                            table = table_name,
                            tablet = tablet_num,
                            lg = lg_no,
                            "live files remain in an emptied storage set"
                        );
                        continue;
                    }
                    let lg_dir = format!("{tablet_dir}/{lg_no}");
                    tracing::info!(path = %lg_dir, "gc deleting empty lg dir");
                    let _ = self.env.delete_dir(&lg_dir);
                    empty_lgs.push(lg_no);
                }
            }
            for lg_no in empty_lgs {
                tablet_files.files.remove(&lg_no);
            }

            if tablet_files.files.is_empty() {
                tracing::info!(path = %tablet_dir, "gc deleting empty dead tablet dir");
                let _ = self.env.delete_dir(&tablet_dir);
                dead_tablets.remove(&tablet_num);
            } else {
                // Files survived this round; require a fresh full report
                // cycle before they can be considered again.
                for lg_files in tablet_files.files.values_mut() {
                    lg_files.live.clear();
                }
                tablet_files.dead_time_ms = unix_time_ms();
            }
        }
    }
}

impl GcStrategy for IncrementalGcStrategy {
    fn pre_query(&self) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        for table in self.tablet_manager.tables() {
            if table.name() == META_TABLE_NAME {
                continue;
            }
            let table_dir = table_path(&self.path_prefix, table.name());
            let gc = table.tablets_for_gc(self.env.as_ref(), &table_dir);
            let dead_map = inner.dead.entry(table.name().to_string()).or_default();
            let mut newly_dead = Vec::new();
            for &num in &gc.dead {
                if !dead_map.contains_key(&num) {
                    newly_dead.push(num);
                }
            }
            for num in newly_dead {
                tracing::debug!(table = table.name(), tablet = num, "newly dead tablet");
                let mut files: BTreeMap<u32, LgFileSet> = BTreeMap::new();
                collect_dead_tablet_files(self.env.as_ref(), &table_dir, num, |lg_no, full| {
                    files.entry(lg_no).or_default().storage.insert(full);
                });
                dead_map.insert(
                    num,
                    TabletFileSet {
                        dead_time_ms: unix_time_ms(),
                        ready_time_ms: 0,
                        files,
                    },
                );
            }

            let live_map = inner.live.entry(table.name().to_string()).or_default();
            let dead_snapshot: BTreeSet<u64> = inner.dead[table.name()].keys().copied().collect();
            live_map.retain(|num, _| !dead_snapshot.contains(num));
            for &num in &gc.live {
                live_map.entry(num).or_default();
            }
        }
        inner.dead.values().any(|tablets| !tablets.is_empty())
    }

    fn process_query_response(&self, response: &QueryResponse) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let reporting: BTreeSet<&str> = response
            .inh_live_files
            .iter()
            .map(|live| live.table_name.as_str())
            .collect();

        // (a) refresh live tablets' ready time.
        for meta in &response.tablet_meta_list {
            if meta.table_name == META_TABLE_NAME || !reporting.contains(meta.table_name.as_str())
            {
                continue;
            }
            let Some(num) = tablet_num_from_path(&meta.path) else {
                continue;
            };
            if let Some(live_map) = inner.live.get_mut(&meta.table_name) {
                if let Some(tablet) = live_map.get_mut(&num) {
                    tablet.ready_time_ms = unix_time_ms();
                }
            }
        }

        // (b) record which dead-tablet files live tablets still inherit.
        for live in &response.inh_live_files {
            if live.table_name == META_TABLE_NAME {
                continue;
            }
            let Some(dead_map) = inner.dead.get_mut(&live.table_name) else {
                continue;
            };
            for lg in &live.lg_live_files {
                for &file_number in &lg.file_numbers {
                    let (tablet_num, _) = parse_full_file_number(file_number);
                    let Some(tablet_files) = dead_map.get_mut(&tablet_num) else {
                        tracing::debug!(tablet = tablet_num, "inherited file of unseen tablet");
                        continue;
                    };
                    tablet_files
                        .files
                        .entry(lg.lg_no)
                        .or_default()
                        .live
                        .insert(file_number);
                }
            }
        }
    }

    fn post_query(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let tables: Vec<String> = inner.dead.keys().cloned().collect();
        for table_name in tables {
            self.delete_table_files(inner, &table_name);
        }
    }

    fn clear(&self, table_name: &str) {
        tracing::info!(table = table_name, "gc state cleared");
        let mut inner = self.inner.lock().unwrap();
        inner.dead.remove(table_name);
        inner.live.remove(table_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_proto::env::MemEnv;
    use trellis_proto::messages::{InheritedLiveFiles, LgInheritedLiveFiles};
    use trellis_proto::meta::{TableMeta, TabletMeta, TabletStatus};
    use trellis_proto::schema::TableSchema;

    const PREFIX: &str = "/trellis";

    fn fixture() -> (Arc<TabletManager>, Arc<MemEnv>) {
        let manager = TabletManager::new();
        let table = manager
            .add_table(TableMeta {
                name: "orders".to_string(),
                alias: "orders".to_string(),
                schema: TableSchema::with_families(&["cf"]),
                status: TableStatus::Enable,
                create_time: 1,
                ..Default::default()
            })
            .unwrap();
        for (num, start, end) in [(43u64, b"".to_vec(), b"m".to_vec()), (44, b"m".to_vec(), Vec::new())] {
            let tablet = manager
                .add_tablet(crate::tablet_manager::new_tablet_meta(
                    "orders",
                    start,
                    end,
                    tablet_path_from_num(num),
                    "node1:7070".to_string(),
                    TabletStatus::NotInit,
                    1,
                ))
                .unwrap();
            assert!(tablet.set_status(TabletStatus::WaitLoad));
            assert!(tablet.set_status(TabletStatus::OnLoad));
            assert!(tablet.set_status(TabletStatus::Ready));
        }
        let _ = table;
        let env = Arc::new(MemEnv::new());
        // Dead tablet 42 left two SSTs behind.
        env.add_file("/trellis/orders/tablet00000042/0/00000100.sst");
        env.add_file("/trellis/orders/tablet00000042/0/00000101.sst");
        (manager, env)
    }

    fn live_report(tablet_nums: &[u64], inherited: &[u64]) -> QueryResponse {
        QueryResponse {
            sequence_id: 0,
            status: trellis_proto::status::StatusCode::TabletNodeOk,
            tablet_meta_list: tablet_nums
                .iter()
                .map(|&num| TabletMeta {
                    table_name: "orders".to_string(),
                    path: tablet_path_from_num(num),
                    ..Default::default()
                })
                .collect(),
            tablet_counter_list: Vec::new(),
            node_stat: Default::default(),
            inh_live_files: vec![InheritedLiveFiles {
                table_name: "orders".to_string(),
                lg_live_files: vec![LgInheritedLiveFiles {
                    lg_no: 0,
                    file_numbers: inherited.to_vec(),
                }],
            }],
        }
    }

    #[test]
    fn incremental_gc_spares_inherited_files_until_reports_drop_them() {
        let (manager, env) = fixture();
        let gc = IncrementalGcStrategy::new(manager, env.clone(), PREFIX);
        assert!(gc.pre_query(), "a dead tablet exists");

        let inherited = build_full_file_number(42, 100);
        gc.process_query_response(&live_report(&[43, 44], &[inherited]));
        {
            // Pin the clock-dependent fields so eligibility is deterministic:
            // tablet 42 died at t=10, both live tablets reported at t=20.
            let mut inner = gc.inner.lock().unwrap();
            inner.dead.get_mut("orders").unwrap().get_mut(&42).unwrap().dead_time_ms = 10;
            for tablet in inner.live.get_mut("orders").unwrap().values_mut() {
                tablet.ready_time_ms = 20;
            }
        }
        gc.post_query();

        let files = env.files();
        assert!(
            !files.contains(&"/trellis/orders/tablet00000042/0/00000101.sst".to_string()),
            "unreferenced file is deleted"
        );
        assert!(
            files.contains(&"/trellis/orders/tablet00000042/0/00000100.sst".to_string()),
            "inherited file survives"
        );

        // Next cycle: tablet 43 no longer inherits file 100.
        assert!(gc.pre_query());
        gc.process_query_response(&live_report(&[43, 44], &[]));
        {
            let mut inner = gc.inner.lock().unwrap();
            inner.dead.get_mut("orders").unwrap().get_mut(&42).unwrap().dead_time_ms = 25;
            for tablet in inner.live.get_mut("orders").unwrap().values_mut() {
                tablet.ready_time_ms = 30;
            }
        }
        gc.post_query();

        assert!(
            !env.is_exist("/trellis/orders/tablet00000042"),
            "empty dead tablet dir is removed"
        );
        assert!(
            gc.inner.lock().unwrap().dead["orders"].is_empty(),
            "dead tablet entry dropped once its files are gone"
        );
    }

    #[test]
    fn incremental_gc_waits_for_every_live_tablet() {
        let (manager, env) = fixture();
        let gc = IncrementalGcStrategy::new(manager, env.clone(), PREFIX);
        assert!(gc.pre_query());

        // Only tablet 43 has reported since the death; 44 has not.
        gc.process_query_response(&live_report(&[43], &[]));
        {
            let mut inner = gc.inner.lock().unwrap();
            inner.dead.get_mut("orders").unwrap().get_mut(&42).unwrap().dead_time_ms = 10;
            inner
                .live
                .get_mut("orders")
                .unwrap()
                .get_mut(&43)
                .unwrap()
                .ready_time_ms = 20;
            // 44 keeps ready_time 0: it never reported after the death.
        }
        gc.post_query();
        assert_eq!(env.files().len(), 2, "nothing deleted before a full cycle");
    }

    #[test]
    fn batch_gc_requires_every_tablet_to_confirm() {
        let (manager, env) = fixture();
        let gc = BatchGcStrategy::new(manager, env.clone(), PREFIX);
        assert!(gc.pre_query());

        // Only tablet 43 confirms; 44 never shows up in a response.
        gc.process_query_response(&live_report(&[43], &[build_full_file_number(42, 100)]));
        gc.post_query();
        assert_eq!(env.files().len(), 2, "unconfirmed round deletes nothing");

        // A full round with both tablets: only the inherited file survives.
        assert!(gc.pre_query());
        gc.process_query_response(&live_report(&[43, 44], &[build_full_file_number(42, 100)]));
        gc.post_query();
        let files = env.files();
        assert_eq!(
            files,
            vec!["/trellis/orders/tablet00000042/0/00000100.sst".to_string()]
        );
    }
}
