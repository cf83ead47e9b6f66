//! In-memory table/tablet catalog and its state machine.
//!
//! The manager owns every catalog entry; tablets hold a non-owning
//! back-reference to their table and resolve it by upgrade. All state
//! changes that affect durability are paired by the caller with a meta-table
//! write that must succeed before the in-memory change is considered
//! committed.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use trellis_proto::env::{tablet_num_from_path, tablet_path_from_num, Env};
use trellis_proto::meta::{
    encode_table_meta, encode_tablet_meta, tablet_status_switch_ok, CompactStatus, KeyRange,
    TableMeta, TableStatus, TabletCounter, TabletMeta, TabletStatus,
};
use trellis_proto::schema::TableSchema;
use trellis_proto::status::StatusCode;
use trellis_proto::unix_time_ms;

/// Samples kept per tablet for the average counter.
const COUNTER_WINDOW: usize = 10;

struct TabletInner {
    meta: TabletMeta,
    update_time_ms: i64,
    load_time_ms: i64,
    server_id: String,
    expect_server_addr: String,
    counters: VecDeque<TabletCounter>,
    average: TabletCounter,
}

/// One tablet of one table.
pub struct Tablet {
    table: Weak<Table>,
    inner: Mutex<TabletInner>,
}

impl Tablet {
    fn new(meta: TabletMeta, table: &Arc<Table>) -> Arc<Self> {
        Arc::new(Self {
            table: Arc::downgrade(table),
            inner: Mutex::new(TabletInner {
                meta,
                update_time_ms: unix_time_ms(),
                load_time_ms: 0,
                server_id: String::new(),
                expect_server_addr: String::new(),
                counters: VecDeque::new(),
                average: TabletCounter::default(),
            }),
        })
    }

    pub fn table(&self) -> Option<Arc<Table>> {
        self.table.upgrade()
    }

    pub fn table_name(&self) -> String {
        self.inner.lock().unwrap().meta.table_name.clone()
    }

    pub fn key_start(&self) -> Vec<u8> {
        self.inner.lock().unwrap().meta.key_range.key_start.clone()
    }

    pub fn key_end(&self) -> Vec<u8> {
        self.inner.lock().unwrap().meta.key_range.key_end.clone()
    }

    pub fn key_range(&self) -> KeyRange {
        self.inner.lock().unwrap().meta.key_range.clone()
    }

    pub fn path(&self) -> String {
        self.inner.lock().unwrap().meta.path.clone()
    }

    pub fn tablet_num(&self) -> Option<u64> {
        tablet_num_from_path(&self.path())
    }

    pub fn server_addr(&self) -> String {
        self.inner.lock().unwrap().meta.server_addr.clone()
    }

    pub fn server_id(&self) -> String {
        self.inner.lock().unwrap().server_id.clone()
    }

    pub fn expect_server_addr(&self) -> String {
        self.inner.lock().unwrap().expect_server_addr.clone()
    }

    pub fn data_size(&self) -> i64 {
        self.inner.lock().unwrap().meta.data_size
    }

    pub fn status(&self) -> TabletStatus {
        self.inner.lock().unwrap().meta.status
    }

    pub fn qps(&self) -> i64 {
        self.inner.lock().unwrap().average.qps()
    }

    pub fn update_time_ms(&self) -> i64 {
        self.inner.lock().unwrap().update_time_ms
    }

    pub fn load_time_ms(&self) -> i64 {
        self.inner.lock().unwrap().load_time_ms
    }

    pub fn set_load_time_ms(&self, ts: i64) {
        self.inner.lock().unwrap().load_time_ms = ts;
    }

    pub fn set_server_id(&self, id: impl Into<String>) {
        self.inner.lock().unwrap().server_id = id.into();
    }

    pub fn set_expect_server_addr(&self, addr: impl Into<String>) {
        self.inner.lock().unwrap().expect_server_addr = addr.into();
    }

    pub fn set_addr(&self, addr: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.meta.server_addr = addr.into();
        inner.update_time_ms = unix_time_ms();
    }

    /// Gate a status change on the legal-transition table.
    pub fn set_status(&self, new_status: TabletStatus) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !tablet_status_switch_ok(inner.meta.status, new_status) {
            return false;
        }
        inner.meta.status = new_status;
        inner.update_time_ms = unix_time_ms();
        true
    }

    /// Compare-and-set: the change applies only from `if_status` and over a
    /// legal edge.
    pub fn set_status_if(&self, new_status: TabletStatus, if_status: TabletStatus) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.meta.status != if_status || !tablet_status_switch_ok(if_status, new_status) {
            return false;
        }
        inner.meta.status = new_status;
        inner.update_time_ms = unix_time_ms();
        true
    }

    pub fn set_addr_and_status_if(
        &self,
        addr: impl Into<String>,
        new_status: TabletStatus,
        if_status: TabletStatus,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.meta.status != if_status || !tablet_status_switch_ok(if_status, new_status) {
            return false;
        }
        inner.meta.server_addr = addr.into();
        inner.meta.status = new_status;
        inner.update_time_ms = unix_time_ms();
        true
    }

    /// Master-restart path: a node already serves this tablet, so the
    /// catalog entry jumps straight to `Ready` without replaying the load
    /// sequence.
    pub fn restore_ready(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.meta.status = TabletStatus::Ready;
        inner.update_time_ms = unix_time_ms();
    }

    /// Fold a node report into the durable size fields.
    pub fn update_size(&self, reported: &TabletMeta) {
        let mut inner = self.inner.lock().unwrap();
        inner.meta.data_size = reported.data_size;
        inner.meta.compact_status = reported.compact_status;
        inner.update_time_ms = unix_time_ms();
    }

    /// Push one load sample and refresh the sliding average.
    pub fn set_counter(&self, counter: TabletCounter) {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.push_back(counter);
        while inner.counters.len() > COUNTER_WINDOW {
            inner.counters.pop_front();
        }
        let n = inner.counters.len() as i64;
        let mut avg = TabletCounter::default();
        for c in &inner.counters {
            avg.read_rows += c.read_rows;
            avg.write_rows += c.write_rows;
            avg.scan_rows += c.scan_rows;
            avg.read_size += c.read_size;
            avg.write_size += c.write_size;
            avg.scan_size += c.scan_size;
        }
        if n > 0 {
            avg.read_rows /= n;
            avg.write_rows /= n;
            avg.scan_rows /= n;
            avg.read_size /= n;
            avg.write_size /= n;
            avg.scan_size /= n;
        }
        inner.average = avg;
    }

    pub fn average_counter(&self) -> TabletCounter {
        self.inner.lock().unwrap().average
    }

    pub fn to_meta(&self) -> TabletMeta {
        self.inner.lock().unwrap().meta.clone()
    }

    pub fn to_meta_record(&self) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
        encode_tablet_meta(&self.inner.lock().unwrap().meta)
    }

    /// Validate a node report against this tablet's identity.
    pub fn verify(&self, meta: &TabletMeta) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.meta.table_name == meta.table_name
            && inner.meta.key_range == meta.key_range
            && inner.meta.path == meta.path
    }

    pub fn add_snapshot(&self, snapshot_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.meta.snapshots.contains(&snapshot_id) {
            inner.meta.snapshots.push(snapshot_id);
        }
    }

    pub fn del_snapshot(&self, snapshot_id: u64) {
        self.inner
            .lock()
            .unwrap()
            .meta
            .snapshots
            .retain(|id| *id != snapshot_id);
    }

    pub fn debug_string(&self) -> String {
        let inner = self.inner.lock().unwrap();
        format!(
            "{}/{} [{:?}, {:?}) @{} {}",
            inner.meta.table_name,
            inner.meta.path,
            inner.meta.key_range.key_start,
            inner.meta.key_range.key_end,
            inner.meta.server_addr,
            inner.meta.status
        )
    }
}

struct TableInner {
    alias: String,
    schema: TableSchema,
    old_schema: Option<TableSchema>,
    schema_is_syncing: bool,
    status: TableStatus,
    tablets: BTreeMap<Vec<u8>, Arc<Tablet>>,
    snapshots: Vec<u64>,
    rollback_names: Vec<String>,
    create_time: i64,
    max_tablet_no: u64,
}

/// Live/dead tablet numbers for a GC round.
pub struct GcTablets {
    pub live: BTreeSet<u64>,
    pub dead: BTreeSet<u64>,
    pub all_ready: bool,
}

/// One table and its tablets, ordered by `key_start`.
pub struct Table {
    name: String,
    inner: Mutex<TableInner>,
}

fn table_status_switch_ok(old: TableStatus, new: TableStatus) -> bool {
    matches!(
        (old, new),
        (TableStatus::Enable, TableStatus::Disable)
            | (TableStatus::Disable, TableStatus::Enable)
            | (TableStatus::Disable, TableStatus::Deleted)
    )
}

impl Table {
    fn new(meta: TableMeta) -> Arc<Self> {
        Arc::new(Self {
            name: meta.name.clone(),
            inner: Mutex::new(TableInner {
                alias: if meta.alias.is_empty() {
                    meta.name
                } else {
                    meta.alias
                },
                schema: meta.schema,
                old_schema: None,
                schema_is_syncing: false,
                status: meta.status,
                tablets: BTreeMap::new(),
                snapshots: meta.snapshots,
                rollback_names: meta.rollback_names,
                create_time: meta.create_time,
                max_tablet_no: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> String {
        self.inner.lock().unwrap().alias.clone()
    }

    pub fn set_alias(&self, alias: impl Into<String>) {
        self.inner.lock().unwrap().alias = alias.into();
    }

    pub fn status(&self) -> TableStatus {
        self.inner.lock().unwrap().status
    }

    pub fn set_status(&self, new_status: TableStatus) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !table_status_switch_ok(inner.status, new_status) {
            return false;
        }
        inner.status = new_status;
        true
    }

    pub fn schema(&self) -> TableSchema {
        self.inner.lock().unwrap().schema.clone()
    }

    pub fn create_time(&self) -> i64 {
        self.inner.lock().unwrap().create_time
    }

    /// Stage a schema update; the old schema is kept for abort.
    pub fn prepare_update(&self, schema: TableSchema) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.schema_is_syncing {
            return false;
        }
        inner.old_schema = Some(std::mem::replace(&mut inner.schema, schema));
        inner.schema_is_syncing = true;
        true
    }

    pub fn abort_update(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.old_schema.take() {
            inner.schema = old;
        }
        inner.schema_is_syncing = false;
    }

    pub fn commit_update(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.old_schema = None;
        inner.schema_is_syncing = false;
    }

    pub fn schema_is_syncing(&self) -> bool {
        self.inner.lock().unwrap().schema_is_syncing
    }

    pub fn add_snapshot(&self, snapshot_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.snapshots.contains(&snapshot_id) {
            inner.snapshots.push(snapshot_id);
        }
    }

    pub fn del_snapshot(&self, snapshot_id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.snapshots.len();
        inner.snapshots.retain(|id| *id != snapshot_id);
        inner.snapshots.len() != before
    }

    pub fn snapshots(&self) -> Vec<u64> {
        self.inner.lock().unwrap().snapshots.clone()
    }

    pub fn add_rollback(&self, name: impl Into<String>) {
        self.inner.lock().unwrap().rollback_names.push(name.into());
    }

    /// Mint the next numeric tablet directory name.
    pub fn next_tablet_path(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.max_tablet_no += 1;
        tablet_path_from_num(inner.max_tablet_no)
    }

    pub fn tablets(&self) -> Vec<Arc<Tablet>> {
        self.inner.lock().unwrap().tablets.values().cloned().collect()
    }

    pub fn tablet_count(&self) -> usize {
        self.inner.lock().unwrap().tablets.len()
    }

    pub fn find_tablet(&self, key_start: &[u8]) -> Option<Arc<Tablet>> {
        self.inner.lock().unwrap().tablets.get(key_start).cloned()
    }

    /// Tablet whose `[start, end)` covers `key`.
    pub fn find_covering_tablet(&self, key: &[u8]) -> Option<Arc<Tablet>> {
        let inner = self.inner.lock().unwrap();
        let (_, tablet) = inner.tablets.range(..=key.to_vec()).next_back()?;
        let end = tablet.key_end();
        if !end.is_empty() && end.as_slice() <= key {
            return None;
        }
        Some(tablet.clone())
    }

    fn insert_tablet(self: &Arc<Self>, meta: TabletMeta) -> Result<Arc<Tablet>, StatusCode> {
        let mut inner = self.inner.lock().unwrap();
        let start = meta.key_range.key_start.clone();
        if inner.tablets.contains_key(&start) {
            return Err(StatusCode::TableExist);
        }
        if let Some(num) = tablet_num_from_path(&meta.path) {
            inner.max_tablet_no = inner.max_tablet_no.max(num);
        }
        let tablet = Tablet::new(meta, self);
        inner.tablets.insert(start, tablet.clone());
        Ok(tablet)
    }

    fn remove_tablet(&self, key_start: &[u8]) -> Option<Arc<Tablet>> {
        self.inner.lock().unwrap().tablets.remove(key_start)
    }

    /// Live and dead tablet numbers for GC: live from the catalog, dead from
    /// listing the table directory and removing the live set.
    pub fn tablets_for_gc(&self, env: &dyn Env, table_path: &str) -> GcTablets {
        let (live, all_ready) = {
            let inner = self.inner.lock().unwrap();
            let mut live = BTreeSet::new();
            let mut all_ready = true;
            for tablet in inner.tablets.values() {
                if tablet.status() != TabletStatus::Ready {
                    all_ready = false;
                }
                if let Some(num) = tablet.tablet_num() {
                    live.insert(num);
                }
            }
            (live, all_ready)
        };
        let mut dead = BTreeSet::new();
        if let Ok(children) = env.get_children(table_path) {
            for child in children {
                if let Some(num) = tablet_num_from_path(&child) {
                    if !live.contains(&num) {
                        dead.insert(num);
                    }
                }
            }
        }
        GcTablets {
            live,
            dead,
            all_ready,
        }
    }

    pub fn to_meta(&self) -> TableMeta {
        let inner = self.inner.lock().unwrap();
        TableMeta {
            name: self.name.clone(),
            alias: inner.alias.clone(),
            schema: inner.schema.clone(),
            status: inner.status,
            create_time: inner.create_time,
            snapshots: inner.snapshots.clone(),
            rollback_names: inner.rollback_names.clone(),
        }
    }

    pub fn to_meta_record(&self) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
        encode_table_meta(&self.to_meta())
    }
}

/// Catalog of every table.
#[derive(Default)]
pub struct TabletManager {
    tables: Mutex<BTreeMap<String, Arc<Table>>>,
}

impl TabletManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_table(&self, meta: TableMeta) -> Result<Arc<Table>, StatusCode> {
        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(&meta.name) {
            return Err(StatusCode::TableExist);
        }
        let name = meta.name.clone();
        let table = Table::new(meta);
        tables.insert(name, table.clone());
        Ok(table)
    }

    pub fn delete_table(&self, table_name: &str) -> Result<Arc<Table>, StatusCode> {
        self.tables
            .lock()
            .unwrap()
            .remove(table_name)
            .ok_or(StatusCode::TableNotExist)
    }

    pub fn add_tablet(&self, meta: TabletMeta) -> Result<Arc<Tablet>, StatusCode> {
        let table = self
            .find_table(&meta.table_name)
            .ok_or(StatusCode::TableNotExist)?;
        table.insert_tablet(meta)
    }

    pub fn delete_tablet(&self, table_name: &str, key_start: &[u8]) -> Option<Arc<Tablet>> {
        self.find_table(table_name)?.remove_tablet(key_start)
    }

    pub fn find_table(&self, table_name: &str) -> Option<Arc<Table>> {
        self.tables.lock().unwrap().get(table_name).cloned()
    }

    pub fn find_table_by_alias(&self, alias: &str) -> Option<Arc<Table>> {
        self.tables
            .lock()
            .unwrap()
            .values()
            .find(|t| t.alias() == alias)
            .cloned()
    }

    pub fn find_tablet(&self, table_name: &str, key_start: &[u8]) -> Option<Arc<Tablet>> {
        self.find_table(table_name)?.find_tablet(key_start)
    }

    pub fn find_covering_tablet(&self, table_name: &str, key: &[u8]) -> Option<Arc<Tablet>> {
        self.find_table(table_name)?.find_covering_tablet(key)
    }

    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.tables.lock().unwrap().values().cloned().collect()
    }

    pub fn all_tablets(&self) -> Vec<Arc<Tablet>> {
        self.tables()
            .into_iter()
            .flat_map(|t| t.tablets())
            .collect()
    }

    pub fn tablets_on_server(&self, server_addr: &str) -> Vec<Arc<Tablet>> {
        self.all_tablets()
            .into_iter()
            .filter(|t| t.server_addr() == server_addr)
            .collect()
    }

    pub fn table_count(&self) -> usize {
        self.tables.lock().unwrap().len()
    }

    pub fn all_tablets_count(&self) -> usize {
        self.tables()
            .iter()
            .map(|t| t.tablet_count())
            .sum()
    }

    /// Paginated listing for `ShowTables`: tables from `start_table_name`,
    /// tablets from `(start_table_name, start_tablet_key)`, both capped.
    pub fn show_table(
        &self,
        start_table_name: &str,
        start_tablet_key: &[u8],
        max_table: usize,
        max_tablet: usize,
    ) -> (Vec<TableMeta>, Vec<TabletMeta>, bool) {
        let tables = self.tables.lock().unwrap();
        let mut table_metas = Vec::new();
        let mut tablet_metas = Vec::new();
        let mut is_more = false;
        'outer: for (name, table) in tables.range(start_table_name.to_string()..) {
            if table_metas.len() < max_table {
                table_metas.push(table.to_meta());
            }
            if max_tablet == 0 {
                continue;
            }
            let from = if name == start_table_name {
                start_tablet_key.to_vec()
            } else {
                Vec::new()
            };
            for tablet in table.tablets() {
                if tablet.key_start() < from {
                    continue;
                }
                if tablet_metas.len() >= max_tablet {
                    is_more = true;
                    break 'outer;
                }
                tablet_metas.push(tablet.to_meta());
            }
        }
        (table_metas, tablet_metas, is_more)
    }

    /// Share of tablets currently without a serving node.
    pub fn offline_tablet_ratio(&self) -> f64 {
        let tablets = self.all_tablets();
        if tablets.is_empty() {
            return 0.0;
        }
        let offline = tablets
            .iter()
            .filter(|t| t.status() == TabletStatus::OffLine)
            .count();
        offline as f64 / tablets.len() as f64
    }

    /// Pick the smaller adjacent neighbour under the same table for a merge.
    pub fn pick_merge_tablet(&self, tablet: &Arc<Tablet>) -> Option<Arc<Tablet>> {
        let table = tablet.table()?;
        let inner = table.inner.lock().unwrap();
        let start = tablet.key_start();
        let mut prev: Option<Arc<Tablet>> = None;
        let mut next: Option<Arc<Tablet>> = None;
        for (key, candidate) in inner.tablets.iter() {
            if key.as_slice() < start.as_slice() {
                prev = Some(candidate.clone());
            } else if key.as_slice() > start.as_slice() {
                next = Some(candidate.clone());
                break;
            }
        }
        let usable = |t: &Arc<Tablet>| t.status() == TabletStatus::Ready;
        match (prev.filter(usable), next.filter(usable)) {
            (Some(a), Some(b)) => Some(if a.data_size() <= b.data_size() { a } else { b }),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Restore one meta-table record into the catalog (master restart path).
    pub fn load_meta_record(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        match trellis_proto::parse_meta_record(key, value)? {
            trellis_proto::meta::MetaRecord::Table(meta) => {
                if self.add_table(meta).is_err() {
                    anyhow::bail!("duplicate table record in meta");
                }
            }
            trellis_proto::meta::MetaRecord::Tablet(mut meta) => {
                // A restored tablet has no server until a node reports it.
                meta.status = TabletStatus::OffLine;
                if self.add_tablet(meta).is_err() {
                    anyhow::bail!("tablet record without table in meta");
                }
            }
        }
        Ok(())
    }

    /// Every durable record, for dumping the meta table.
    pub fn to_meta_records(&self) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut records = Vec::new();
        for table in self.tables() {
            records.push(table.to_meta_record()?);
            for tablet in table.tablets() {
                records.push(tablet.to_meta_record()?);
            }
        }
        Ok(records)
    }

    pub fn clear(&self) {
        self.tables.lock().unwrap().clear();
    }
}

/// Build the meta describing a fresh tablet.
pub fn new_tablet_meta(
    table_name: &str,
    key_start: Vec<u8>,
    key_end: Vec<u8>,
    path: String,
    server_addr: String,
    status: TabletStatus,
    data_size: i64,
) -> TabletMeta {
    TabletMeta {
        table_name: table_name.to_string(),
        key_range: KeyRange {
            key_start,
            key_end,
        },
        path,
        server_addr,
        status,
        data_size,
        compact_status: CompactStatus::NotCompact,
        snapshots: Vec::new(),
    }
}
