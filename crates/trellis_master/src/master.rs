//! Master: status machine, tablet lifecycle sequencing, placement and the
//! tablet-node query loop.
//!
//! Every durable catalog change pairs an in-memory transition with a meta
//! write; the write must succeed before the change is committed, otherwise
//! the transition is rolled back. Safe mode (`IsReadonly`) suspends moves
//! and destructive meta writes; it is entered automatically when the live
//! node ratio drops below the configured threshold and left manually or on
//! recovery.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};

use trellis_proto::messages::*;
use trellis_proto::meta::{
    KeyRange, TableMeta, TableStatus, TabletMeta, TabletStatus,
};
use trellis_proto::rpc::TabletNodeConnector;
use trellis_proto::schema::TableSchema;
use trellis_proto::status::StatusCode;
use trellis_proto::env::Env;
use trellis_proto::{unix_time_ms, META_TABLE_NAME};

use crate::availability::TabletAvailability;
use crate::gc::GcStrategy;
use crate::meta_writer::{MetaWriteRecord, MetaWriter};
use crate::registry_adapter::MasterRegistryAdapter;
use crate::scheduler::{find_best_node, find_best_tablet, Scheduler, SizeScheduler};
use crate::tablet_manager::{new_tablet_meta, Tablet, TabletManager};
use crate::tabletnode_manager::{NodeStatus, TabletNodeManager};
use crate::user_manager::UserManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterStatus {
    NotInited,
    IsSecondary,
    OnRestore,
    OnWait,
    IsRunning,
    IsReadonly,
}

fn master_status_switch_ok(old: MasterStatus, new: MasterStatus) -> bool {
    use MasterStatus::*;
    matches!(
        (old, new),
        (NotInited, IsSecondary)
            | (NotInited, OnRestore)
            | (IsSecondary, OnRestore)
            | (OnRestore, OnWait)
            | (OnRestore, IsRunning)
            | (OnRestore, IsReadonly)
            | (OnWait, OnRestore)
            | (IsRunning, IsReadonly)
            | (IsReadonly, IsRunning)
    )
}

impl MasterStatus {
    fn code(self) -> StatusCode {
        match self {
            MasterStatus::NotInited => StatusCode::MasterNotInited,
            MasterStatus::IsSecondary => StatusCode::MasterIsSecondary,
            MasterStatus::OnRestore => StatusCode::MasterOnRestore,
            MasterStatus::OnWait => StatusCode::MasterOnWait,
            MasterStatus::IsRunning => StatusCode::MasterIsRunning,
            MasterStatus::IsReadonly => StatusCode::MasterIsReadonly,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MasterConfig {
    /// Filesystem prefix under which every table directory lives.
    pub path_prefix: String,
    /// Moves allowed per rebalance round.
    pub max_move_num: usize,
    /// Rebalance passes per cycle.
    pub max_round_num: usize,
    /// Enter safe mode below this live-node ratio.
    pub safe_mode_node_ratio: f64,
    /// Tablet-node query cadence.
    pub query_interval_ms: u64,
    /// Retries for load/unload RPCs before giving up on a node.
    pub load_retry_times: u32,
    /// Consecutive query failures before a node is kicked.
    pub kick_after_query_fail: u32,
    /// Rename is only honored with internal-name indirection on.
    pub table_rename_enabled: bool,
    pub root_token: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            path_prefix: "/trellis".to_string(),
            max_move_num: 1,
            max_round_num: 10,
            safe_mode_node_ratio: 0.65,
            query_interval_ms: 10_000,
            load_retry_times: 3,
            kick_after_query_fail: 5,
            table_rename_enabled: true,
            root_token: "root".to_string(),
        }
    }
}

pub struct MasterImpl {
    config: MasterConfig,
    status: Mutex<MasterStatus>,
    pub tablet_manager: Arc<TabletManager>,
    pub tabletnode_manager: Arc<TabletNodeManager>,
    pub availability: TabletAvailability,
    user_manager: UserManager,
    scheduler: Box<dyn Scheduler>,
    gc: Arc<dyn GcStrategy>,
    meta_writer: Arc<dyn MetaWriter>,
    connector: Arc<dyn TabletNodeConnector>,
    registry: MasterRegistryAdapter,
    env: Arc<dyn Env>,
    sequence_id: AtomicU64,
    next_snapshot_id: AtomicU64,
    /// High-water node count, the denominator of the live ratio.
    expected_node_count: AtomicUsize,
    load_balance_enabled: AtomicBool,
}

impl MasterImpl {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MasterConfig,
        tablet_manager: Arc<TabletManager>,
        tabletnode_manager: Arc<TabletNodeManager>,
        gc: Arc<dyn GcStrategy>,
        meta_writer: Arc<dyn MetaWriter>,
        connector: Arc<dyn TabletNodeConnector>,
        registry: MasterRegistryAdapter,
        env: Arc<dyn Env>,
    ) -> Arc<Self> {
        let root_token = config.root_token.clone();
        Arc::new(Self {
            config,
            status: Mutex::new(MasterStatus::NotInited),
            tablet_manager,
            tabletnode_manager,
            availability: TabletAvailability::new(),
            user_manager: UserManager::new(root_token),
            scheduler: Box::new(SizeScheduler),
            gc,
            meta_writer,
            connector,
            registry,
            env,
            sequence_id: AtomicU64::new(0),
            next_snapshot_id: AtomicU64::new(1),
            expected_node_count: AtomicUsize::new(0),
            load_balance_enabled: AtomicBool::new(true),
        })
    }

    pub fn status(&self) -> MasterStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, new_status: MasterStatus) -> bool {
        let mut status = self.status.lock().unwrap();
        if !master_status_switch_ok(*status, new_status) {
            tracing::warn!(from = ?*status, to = ?new_status, "illegal master status switch");
            return false;
        }
        tracing::info!(from = ?*status, to = ?new_status, "master status switch");
        *status = new_status;
        true
    }

    fn next_sequence_id(&self) -> u64 {
        self.sequence_id.fetch_add(1, Ordering::Relaxed)
    }

    fn table_dir(&self, table_name: &str) -> String {
        format!("{}/{table_name}", self.config.path_prefix.trim_end_matches('/'))
    }

    /// Gate for operations that mutate durable state.
    fn writable_or_code(&self) -> Result<(), StatusCode> {
        let status = self.status();
        if status == MasterStatus::IsRunning {
            Ok(())
        } else {
            Err(status.code())
        }
    }

    fn permitted(&self, token: &str) -> bool {
        self.user_manager.is_root_token(token) || self.user_manager.user_for_token(token).is_some()
    }

    // -----------------------------------------------------------------
    // Bootstrap / restore
    // -----------------------------------------------------------------

    /// Take the master lock and restore the catalog from the meta table and
    /// the live nodes' reports.
    pub async fn init(self: &Arc<Self>, local_addr: &str) -> anyhow::Result<()> {
        self.registry.lock_master(local_addr).await?;
        anyhow::ensure!(self.set_status(MasterStatus::OnRestore), "status gate");

        let nodes = self.registry.tablet_node_list().await?;
        for (session_id, addr) in &nodes {
            self.tabletnode_manager.add_node(addr, session_id);
        }
        self.expected_node_count
            .fetch_max(nodes.len(), Ordering::Relaxed);

        if nodes.is_empty() {
            anyhow::ensure!(self.set_status(MasterStatus::OnWait), "status gate");
            tracing::warn!("no tablet nodes registered, waiting");
            return Ok(());
        }

        self.restore(&nodes).await?;
        anyhow::ensure!(self.set_status(MasterStatus::IsRunning), "status gate");
        Ok(())
    }

    async fn restore(self: &Arc<Self>, nodes: &[(String, String)]) -> anyhow::Result<()> {
        // Collect every node's report to find the meta tablet and the
        // user-tablet placements that survived the master restart.
        let mut reports: Vec<(String, QueryResponse)> = Vec::new();
        for (_, addr) in nodes {
            let request = QueryRequest {
                sequence_id: self.next_sequence_id(),
                is_gc_query: false,
            };
            match self.connector.tablet_node(addr).query(request).await {
                Ok(response) => reports.push((addr.clone(), response)),
                Err(fault) => {
                    tracing::warn!(addr = %addr, %fault, "node unreachable during restore");
                }
            }
        }

        let meta_addr = reports
            .iter()
            .find(|(_, response)| {
                response
                    .tablet_meta_list
                    .iter()
                    .any(|meta| meta.table_name == META_TABLE_NAME)
            })
            .map(|(addr, _)| addr.clone());
        let meta_addr = match meta_addr {
            Some(addr) => addr,
            None => {
                // Nobody serves the meta tablet; place it on the first node.
                let addr = reports
                    .first()
                    .map(|(addr, _)| addr.clone())
                    .unwrap_or_else(|| nodes[0].1.clone());
                let request = LoadTabletRequest {
                    sequence_id: self.next_sequence_id(),
                    tablet_name: META_TABLE_NAME.to_string(),
                    key_range: KeyRange::default(),
                    path: "tablet00000001".to_string(),
                    schema: TableSchema::default(),
                    session_id: String::new(),
                    snapshots: Vec::new(),
                };
                let response = self
                    .connector
                    .tablet_node(&addr)
                    .load_tablet(request)
                    .await
                    .map_err(|fault| anyhow::anyhow!("meta tablet load failed: {fault}"))?;
                anyhow::ensure!(
                    response.status.is_node_ok(),
                    "meta tablet load rejected: {}",
                    response.status
                );
                addr
            }
        };
        self.registry.publish_root_tablet(&meta_addr).await?;
        tracing::info!(addr = %meta_addr, "meta tablet located");

        self.load_meta_table(&meta_addr).await?;

        // Re-attach reported tablets, then load whatever is left offline.
        for (addr, response) in &reports {
            for meta in &response.tablet_meta_list {
                if meta.table_name == META_TABLE_NAME {
                    continue;
                }
                let Some(tablet) = self
                    .tablet_manager
                    .find_tablet(&meta.table_name, &meta.key_range.key_start)
                else {
                    tracing::warn!(table = %meta.table_name, "reported tablet unknown to meta");
                    continue;
                };
                if tablet.verify(meta) {
                    tablet.set_addr(addr.clone());
                    tablet.restore_ready();
                    self.availability.erase_not_ready(&tablet.path());
                }
            }
        }
        for tablet in self.tablet_manager.all_tablets() {
            if tablet.status() == TabletStatus::OffLine {
                self.availability.add_not_ready(&tablet.path());
                self.try_load_tablet(&tablet, "").await;
            }
        }
        Ok(())
    }

    async fn load_meta_table(&self, meta_addr: &str) -> anyhow::Result<()> {
        self.tablet_manager.clear();
        let mut start = Vec::new();
        loop {
            let request = ScanTabletRequest {
                sequence_id: self.next_sequence_id(),
                table_name: META_TABLE_NAME.to_string(),
                start: start.clone(),
                end: Vec::new(),
                buffer_limit: 1 << 20,
                ..Default::default()
            };
            let response = self
                .connector
                .tablet_node(meta_addr)
                .scan_tablet(request)
                .await
                .map_err(|fault| anyhow::anyhow!("meta scan failed: {fault}"))?;
            anyhow::ensure!(
                response.status.is_node_ok(),
                "meta scan rejected: {}",
                response.status
            );
            for kv in &response.results.key_values {
                if let Err(error) = self.tablet_manager.load_meta_record(&kv.key, &kv.value) {
                    tracing::warn!(%error, "skipping bad meta record");
                }
            }
            if response.complete || response.end.is_empty() {
                break;
            }
            start = response.end;
        }
        tracing::info!(
            tables = self.tablet_manager.table_count(),
            tablets = self.tablet_manager.all_tablets_count(),
            "meta table loaded"
        );
        Ok(())
    }

    // -----------------------------------------------------------------
    // Tablet lifecycle sequencing
    // -----------------------------------------------------------------

    /// Load one tablet, picking a destination when none is given.
    /// `NotInit/OffLine -> WaitLoad -> OnLoad -> Ready`, with the meta row
    /// updated before the load RPC is issued.
    pub async fn try_load_tablet(self: &Arc<Self>, tablet: &Arc<Tablet>, server_addr: &str) {
        let dest = if server_addr.is_empty() {
            let candidates = self.tabletnode_manager.ready_nodes();
            match find_best_node(self.scheduler.as_ref(), &candidates) {
                Some(index) => candidates[index].addr.clone(),
                None => {
                    tracing::warn!(tablet = %tablet.path(), "no node available for load");
                    self.availability.add_not_ready(&tablet.path());
                    return;
                }
            }
        } else {
            server_addr.to_string()
        };

        let from = tablet.status();
        if !matches!(from, TabletStatus::NotInit | TabletStatus::OffLine) {
            tracing::warn!(tablet = %tablet.path(), status = %from, "not loadable");
            return;
        }
        if !tablet.set_addr_and_status_if(dest.clone(), TabletStatus::WaitLoad, from) {
            return;
        }
        tablet.set_expect_server_addr(&dest);

        // The durable row must carry the new placement before the node
        // serves it, so a master restart re-learns the assignment.
        if let Err(status) = self.write_tablet_record(tablet).await {
            tracing::warn!(tablet = %tablet.path(), %status, "meta write for load failed");
            let _ = tablet.set_status_if(TabletStatus::OffLine, TabletStatus::WaitLoad);
            return;
        }
        self.issue_load(tablet, &dest).await;
    }

    /// Re-serve a tablet on the node recorded in its (unchanged) meta row.
    /// Used when an aborted merge or move leaves the placement as-is, so no
    /// meta write is needed.
    async fn reload_in_place(self: &Arc<Self>, tablet: &Arc<Tablet>, server_addr: &str) {
        if tablet.set_addr_and_status_if(server_addr, TabletStatus::WaitLoad, TabletStatus::OffLine)
        {
            self.issue_load(tablet, server_addr).await;
        }
    }

    /// `WaitLoad -> OnLoad -> Ready` with the load RPC retry envelope.
    async fn issue_load(self: &Arc<Self>, tablet: &Arc<Tablet>, dest: &str) {
        let table = match tablet.table() {
            Some(table) => table,
            None => return,
        };
        if !tablet.set_status_if(TabletStatus::OnLoad, TabletStatus::WaitLoad) {
            return;
        }
        let request = LoadTabletRequest {
            sequence_id: self.next_sequence_id(),
            tablet_name: tablet.table_name(),
            key_range: tablet.key_range(),
            path: tablet.path(),
            schema: table.schema(),
            session_id: String::new(),
            snapshots: table.snapshots(),
        };
        let mut attempts = 0;
        loop {
            match self.connector.tablet_node(&dest).load_tablet(request.clone()).await {
                Ok(response) if response.status.is_node_ok() => {
                    if tablet.set_status_if(TabletStatus::Ready, TabletStatus::OnLoad) {
                        tablet.set_load_time_ms(unix_time_ms());
                        self.availability.erase_not_ready(&tablet.path());
                        tracing::info!(tablet = %tablet.path(), node = %dest, "tablet loaded");
                    }
                    return;
                }
                Ok(response) => {
                    tracing::warn!(tablet = %tablet.path(), status = %response.status, "load rejected");
                }
                Err(fault) => {
                    tracing::warn!(tablet = %tablet.path(), %fault, "load rpc failed");
                }
            }
            attempts += 1;
            if attempts > self.config.load_retry_times {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200 * u64::from(attempts))).await;
        }
        let _ = tablet.set_status_if(TabletStatus::LoadFail, TabletStatus::OnLoad);
        let _ = tablet.set_status_if(TabletStatus::OffLine, TabletStatus::LoadFail);
        self.availability.add_not_ready(&tablet.path());
    }

    /// Unload one tablet: `Ready -> UnLoading -> OffLine`.
    pub async fn try_unload_tablet(self: &Arc<Self>, tablet: &Arc<Tablet>) -> bool {
        if !tablet.set_status_if(TabletStatus::UnLoading, TabletStatus::Ready) {
            return false;
        }
        let request = UnloadTabletRequest {
            sequence_id: self.next_sequence_id(),
            tablet_name: tablet.table_name(),
            key_range: tablet.key_range(),
        };
        let addr = tablet.server_addr();
        let mut attempts = 0;
        loop {
            match self
                .connector
                .tablet_node(&addr)
                .unload_tablet(request.clone())
                .await
            {
                Ok(response) if response.status.is_node_ok() => break,
                Ok(response) => {
                    tracing::warn!(tablet = %tablet.path(), status = %response.status, "unload rejected");
                }
                Err(fault) => {
                    tracing::warn!(tablet = %tablet.path(), %fault, "unload rpc failed");
                }
            }
            attempts += 1;
            if attempts > self.config.load_retry_times {
                // The registry fences the old server; proceed offline.
                break;
            }
            tokio::time::sleep(Duration::from_millis(200 * u64::from(attempts))).await;
        }
        let moved = tablet.set_status_if(TabletStatus::OffLine, TabletStatus::UnLoading);
        if moved {
            self.availability.add_not_ready(&tablet.path());
        }
        moved
    }

    /// Move one tablet to `dest_addr` (or the best node when empty).
    pub async fn try_move_tablet(self: &Arc<Self>, tablet: &Arc<Tablet>, dest_addr: &str) {
        if self.status() != MasterStatus::IsRunning {
            return;
        }
        let source = tablet.server_addr();
        if !self.try_unload_tablet(tablet).await {
            return;
        }
        tracing::info!(
            tablet = %tablet.path(),
            from = %source,
            to = %dest_addr,
            "moving tablet"
        );
        self.try_load_tablet(tablet, dest_addr).await;
    }

    /// Split one tablet at the node-chosen key. The meta batch (delete old
    /// row, add both children) must land before the catalog changes; on a
    /// write failure the source reverts and no phantom child exists.
    pub async fn try_split_tablet(self: &Arc<Self>, tablet: &Arc<Tablet>) -> Result<(), StatusCode> {
        self.writable_or_code()?;
        if !tablet.set_status_if(TabletStatus::OnSplit, TabletStatus::Ready) {
            return Err(StatusCode::TabletNotInit);
        }
        let request = SplitTabletRequest {
            sequence_id: self.next_sequence_id(),
            tablet_name: tablet.table_name(),
            key_range: tablet.key_range(),
        };
        let split_key = match self
            .connector
            .tablet_node(&tablet.server_addr())
            .split_tablet(request)
            .await
        {
            Ok(response) if response.status.is_node_ok() && !response.split_key.is_empty() => {
                response.split_key
            }
            Ok(response) => {
                tracing::warn!(tablet = %tablet.path(), status = %response.status, "split rejected");
                let _ = tablet.set_status_if(TabletStatus::Ready, TabletStatus::OnSplit);
                return Err(response.status);
            }
            Err(fault) => {
                let _ = tablet.set_status_if(TabletStatus::Ready, TabletStatus::OnSplit);
                return Err(fault.status());
            }
        };

        let range = tablet.key_range();
        if !range.contains(&split_key) {
            let _ = tablet.set_status_if(TabletStatus::Ready, TabletStatus::OnSplit);
            return Err(StatusCode::InvalidArgument);
        }
        let table = tablet.table().ok_or(StatusCode::TableNotFound)?;
        let table_name = tablet.table_name();
        let left_meta = new_tablet_meta(
            &table_name,
            range.key_start.clone(),
            split_key.clone(),
            table.next_tablet_path(),
            String::new(),
            TabletStatus::NotInit,
            tablet.data_size() / 2,
        );
        let right_meta = new_tablet_meta(
            &table_name,
            split_key.clone(),
            range.key_end.clone(),
            table.next_tablet_path(),
            String::new(),
            TabletStatus::NotInit,
            tablet.data_size() / 2,
        );

        let records = vec![
            MetaWriteRecord::delete(trellis_proto::make_tablet_meta_key(
                &table_name,
                &range.key_start,
            )),
            meta_put(&left_meta)?,
            meta_put(&right_meta)?,
        ];
        if let Err(status) = self.meta_writer.write(records).await {
            tracing::warn!(tablet = %tablet.path(), %status, "split meta write failed, reverting");
            let _ = tablet.set_status_if(TabletStatus::Ready, TabletStatus::OnSplit);
            return Err(status);
        }

        // Durable; now commit the catalog.
        let server_addr = tablet.server_addr();
        let _ = tablet.set_status_if(TabletStatus::Deleted, TabletStatus::OnSplit);
        self.tablet_manager
            .delete_tablet(&table_name, &range.key_start);
        let left = self
            .tablet_manager
            .add_tablet(left_meta)
            .map_err(|status| status)?;
        let right = self.tablet_manager.add_tablet(right_meta)?;
        tracing::info!(
            table = %table_name,
            at = ?split_key,
            "tablet split committed"
        );
        // Children load back onto the node that grew them.
        self.try_load_tablet(&left, &server_addr).await;
        self.try_load_tablet(&right, &server_addr).await;
        Ok(())
    }

    /// Merge two contiguous tablets of one table. Both are taken offline
    /// first; the meta batch carries both deletes and the single add, and a
    /// partial failure restores the originals.
    pub async fn try_merge_tablet(
        self: &Arc<Self>,
        left: &Arc<Tablet>,
        right: &Arc<Tablet>,
    ) -> Result<(), StatusCode> {
        self.writable_or_code()?;
        if left.table_name() != right.table_name() {
            return Err(StatusCode::InvalidArgument);
        }
        if left.key_end() != right.key_start() {
            return Err(StatusCode::InvalidArgument);
        }
        let left_addr = left.server_addr();
        let right_addr = right.server_addr();
        if !self.try_unload_tablet(left).await {
            return Err(StatusCode::TabletNotInit);
        }
        if !self.try_unload_tablet(right).await {
            // Re-serve the half we already took down.
            self.reload_in_place(left, &left_addr).await;
            return Err(StatusCode::TabletNotInit);
        }

        let table = left.table().ok_or(StatusCode::TableNotFound)?;
        let table_name = left.table_name();
        let merged_meta = new_tablet_meta(
            &table_name,
            left.key_start(),
            right.key_end(),
            table.next_tablet_path(),
            String::new(),
            TabletStatus::NotInit,
            left.data_size() + right.data_size(),
        );
        let records = vec![
            MetaWriteRecord::delete(trellis_proto::make_tablet_meta_key(
                &table_name,
                &left.key_start(),
            )),
            MetaWriteRecord::delete(trellis_proto::make_tablet_meta_key(
                &table_name,
                &right.key_start(),
            )),
            meta_put(&merged_meta)?,
        ];
        if let Err(status) = self.meta_writer.write(records).await {
            tracing::warn!(table = %table_name, %status, "merge meta write failed, restoring");
            self.reload_in_place(left, &left_addr).await;
            self.reload_in_place(right, &right_addr).await;
            return Err(status);
        }

        let _ = left.set_status_if(TabletStatus::Deleted, TabletStatus::OffLine);
        let _ = right.set_status_if(TabletStatus::Deleted, TabletStatus::OffLine);
        self.tablet_manager
            .delete_tablet(&table_name, &left.key_start());
        self.tablet_manager
            .delete_tablet(&table_name, &right.key_start());
        let merged = self.tablet_manager.add_tablet(merged_meta)?;
        tracing::info!(table = %table_name, "tablets merged");
        self.try_load_tablet(&merged, &left_addr).await;
        Ok(())
    }

    async fn write_tablet_record(&self, tablet: &Arc<Tablet>) -> Result<(), StatusCode> {
        let (key, value) = tablet
            .to_meta_record()
            .map_err(|_| StatusCode::ClientError)?;
        self.meta_writer
            .write(vec![MetaWriteRecord::put(key, value)])
            .await
    }

    // -----------------------------------------------------------------
    // Node membership, safe mode, rebalance
    // -----------------------------------------------------------------

    /// Reconcile the registered node list after a registry change.
    pub async fn refresh_tablet_node_list(self: &Arc<Self>, nodes: Vec<(String, String)>) {
        let mut known: std::collections::BTreeSet<String> = self
            .tabletnode_manager
            .nodes()
            .into_iter()
            .map(|n| n.addr.clone())
            .collect();
        for (session_id, addr) in &nodes {
            if !known.remove(addr) {
                self.tabletnode_manager.add_node(addr, session_id);
            }
        }
        // Whatever remains in `known` fell out of the registry.
        for addr in known {
            self.tabletnode_manager.del_node(&addr);
            for tablet in self.tablet_manager.tablets_on_server(&addr) {
                // The node is fenced by its session loss; its tablets are
                // offline no matter what it thinks.
                let status = tablet.status();
                let offline = match status {
                    TabletStatus::Ready => {
                        tablet.set_status_if(TabletStatus::OffLine, TabletStatus::Ready)
                    }
                    TabletStatus::OnLoad => {
                        tablet.set_status_if(TabletStatus::OffLine, TabletStatus::OnLoad)
                    }
                    TabletStatus::WaitLoad => {
                        tablet.set_status_if(TabletStatus::OffLine, TabletStatus::WaitLoad)
                    }
                    _ => false,
                };
                if offline {
                    self.availability.add_not_ready(&tablet.path());
                }
            }
        }

        let live = self.tabletnode_manager.node_count();
        let expected = self
            .expected_node_count
            .fetch_max(live, Ordering::Relaxed)
            .max(live);
        let ratio = if expected == 0 {
            1.0
        } else {
            live as f64 / expected as f64
        };
        if ratio < self.config.safe_mode_node_ratio {
            self.try_enter_safe_mode().await;
        } else {
            self.try_leave_safe_mode().await;
            if self.status() == MasterStatus::IsRunning {
                for tablet in self.tablet_manager.all_tablets() {
                    if tablet.status() == TabletStatus::OffLine {
                        self.try_load_tablet(&tablet, "").await;
                    }
                }
            }
        }
    }

    pub async fn try_enter_safe_mode(&self) {
        if self.status() != MasterStatus::IsRunning {
            return;
        }
        if self.set_status(MasterStatus::IsReadonly) {
            tracing::warn!("entering safe mode");
            if let Err(error) = self.registry.set_safemode_mark(true).await {
                tracing::warn!(%error, "safemode mark write failed");
            }
        }
    }

    pub async fn try_leave_safe_mode(&self) {
        if self.status() != MasterStatus::IsReadonly {
            return;
        }
        if self.set_status(MasterStatus::IsRunning) {
            tracing::info!("leaving safe mode");
            if let Err(error) = self.registry.set_safemode_mark(false).await {
                tracing::warn!(%error, "safemode mark delete failed");
            }
        }
    }

    /// One rebalance cycle: bounded rounds, bounded moves, suspended in
    /// safe mode.
    pub async fn load_balance(self: &Arc<Self>) {
        if self.status() != MasterStatus::IsRunning
            || !self.load_balance_enabled.load(Ordering::Relaxed)
        {
            return;
        }
        let average = self.tabletnode_manager.average_data_size();
        let mut moves = 0usize;
        for _ in 0..self.config.max_round_num {
            if moves >= self.config.max_move_num {
                break;
            }
            let nodes = self.tabletnode_manager.ready_nodes();
            let mut donor: Option<Arc<crate::tabletnode_manager::TabletNode>> = None;
            for node in &nodes {
                if !self.scheduler.need_schedule(node, average) {
                    continue;
                }
                let replace = donor
                    .as_ref()
                    .map(|best| self.scheduler.node_signal(node) > self.scheduler.node_signal(best))
                    .unwrap_or(true);
                if replace {
                    donor = Some(node.clone());
                }
            }
            let Some(donor) = donor else {
                break;
            };
            let tablets = self.tablet_manager.tablets_on_server(&donor.addr);
            let Some(tablet_index) = find_best_tablet(self.scheduler.as_ref(), &tablets) else {
                break;
            };
            let candidates: Vec<_> = nodes
                .iter()
                .filter(|n| n.addr != donor.addr)
                .cloned()
                .collect();
            let Some(node_index) = find_best_node(self.scheduler.as_ref(), &candidates) else {
                break;
            };
            let tablet = tablets[tablet_index].clone();
            let dest = candidates[node_index].addr.clone();
            tracing::info!(
                scheduler = self.scheduler.name(),
                tablet = %tablet.path(),
                to = %dest,
                "rebalance move"
            );
            self.try_move_tablet(&tablet, &dest).await;
            moves += 1;
        }
    }

    pub fn set_load_balance_enabled(&self, enabled: bool) {
        self.load_balance_enabled.store(enabled, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------
    // Query loop
    // -----------------------------------------------------------------

    /// Query every ready node once, fold reports into the catalog and feed
    /// the GC strategy.
    pub async fn query_tablet_nodes(self: &Arc<Self>) {
        let gc_round = self.gc.pre_query();
        let nodes = self.tabletnode_manager.ready_nodes();
        let mut pending = FuturesUnordered::new();
        for node in nodes {
            let connector = self.connector.clone();
            let request = QueryRequest {
                sequence_id: self.next_sequence_id(),
                is_gc_query: gc_round,
            };
            pending.push(async move {
                let result = connector.tablet_node(&node.addr).query(request).await;
                (node, result)
            });
        }

        while let Some((node, result)) = pending.next().await {
            match result {
                Ok(response) if response.status.is_node_ok() => {
                    node.update_from_query(
                        response.node_stat.clone(),
                        response.tablet_meta_list.len() as u32,
                    );
                    self.apply_tablet_reports(&node.addr, &response);
                    if gc_round {
                        self.gc.process_query_response(&response);
                    }
                }
                other => {
                    let status = match other {
                        Ok(response) => response.status,
                        Err(fault) => fault.status(),
                    };
                    let failures = node.record_query_fail();
                    tracing::warn!(addr = %node.addr, %status, failures, "query failed");
                    if failures >= self.config.kick_after_query_fail {
                        self.kick_tablet_node(&node.addr).await;
                    }
                }
            }
        }

        if gc_round {
            self.gc.post_query();
        }
        self.availability.log_availability();
    }

    fn apply_tablet_reports(&self, addr: &str, response: &QueryResponse) {
        for (index, meta) in response.tablet_meta_list.iter().enumerate() {
            if meta.table_name == META_TABLE_NAME {
                continue;
            }
            let Some(tablet) = self
                .tablet_manager
                .find_tablet(&meta.table_name, &meta.key_range.key_start)
            else {
                continue;
            };
            if !tablet.verify(meta) {
                tracing::warn!(
                    tablet = %tablet.path(),
                    "report does not match catalog, ignoring"
                );
                continue;
            }
            if tablet.server_addr() != addr {
                continue;
            }
            tablet.update_size(meta);
            if let Some(counter) = response.tablet_counter_list.get(index) {
                tablet.set_counter(*counter);
            }
        }
    }

    async fn kick_tablet_node(self: &Arc<Self>, addr: &str) {
        let Some(node) = self.tabletnode_manager.find_node(addr) else {
            return;
        };
        if self.status() == MasterStatus::IsReadonly {
            tracing::warn!(addr, "kick suppressed in safe mode");
            return;
        }
        node.set_status(NodeStatus::OnKick);
        if let Err(error) = self.registry.kick_tablet_node(&node.uuid).await {
            tracing::warn!(addr, %error, "kick mark write failed");
            return;
        }
        tracing::warn!(addr, "tablet node kicked");
        let nodes = self
            .registry
            .tablet_node_list()
            .await
            .unwrap_or_default();
        self.refresh_tablet_node_list(nodes).await;
    }

    /// Background ticker: node query plus one rebalance pass per interval.
    pub fn spawn_query_loop(self: &Arc<Self>) {
        let master = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(master.config.query_interval_ms));
            loop {
                ticker.tick().await;
                if matches!(
                    master.status(),
                    MasterStatus::IsRunning | MasterStatus::IsReadonly
                ) {
                    master.query_tablet_nodes().await;
                    master.load_balance().await;
                }
            }
        });
    }

    // -----------------------------------------------------------------
    // Table operations
    // -----------------------------------------------------------------

    pub async fn create_table(self: &Arc<Self>, request: &CreateTableRequest) -> StatusCode {
        if let Err(code) = self.writable_or_code() {
            return code;
        }
        if !self.permitted(&request.user_token) {
            return StatusCode::NotPermission;
        }
        if request.table_name.is_empty() || request.table_name == META_TABLE_NAME {
            return StatusCode::InvalidArgument;
        }
        let table_meta = TableMeta {
            name: request.table_name.clone(),
            alias: request.table_name.clone(),
            schema: request.schema.clone(),
            status: TableStatus::Enable,
            create_time: unix_time_ms() / 1000,
            snapshots: Vec::new(),
            rollback_names: Vec::new(),
        };
        let table = match self.tablet_manager.add_table(table_meta) {
            Ok(table) => table,
            Err(status) => return status,
        };

        // n delimiters make n+1 tablets covering the whole key space.
        let mut bounds = vec![Vec::new()];
        let mut delimiters = request.delimiters.clone();
        delimiters.sort();
        delimiters.dedup();
        bounds.extend(delimiters);
        let mut tablets = Vec::new();
        for (index, start) in bounds.iter().enumerate() {
            let end = bounds.get(index + 1).cloned().unwrap_or_default();
            let meta = new_tablet_meta(
                &request.table_name,
                start.clone(),
                end,
                table.next_tablet_path(),
                String::new(),
                TabletStatus::NotInit,
                0,
            );
            match self.tablet_manager.add_tablet(meta) {
                Ok(tablet) => tablets.push(tablet),
                Err(status) => {
                    self.tablet_manager.delete_table(&request.table_name).ok();
                    return status;
                }
            }
        }

        let mut records = vec![match table.to_meta_record() {
            Ok((key, value)) => MetaWriteRecord::put(key, value),
            Err(_) => return StatusCode::ClientError,
        }];
        for tablet in &tablets {
            match tablet.to_meta_record() {
                Ok((key, value)) => records.push(MetaWriteRecord::put(key, value)),
                Err(_) => return StatusCode::ClientError,
            }
        }
        if let Err(status) = self.meta_writer.write(records).await {
            tracing::warn!(table = %request.table_name, %status, "create meta write failed");
            self.tablet_manager.delete_table(&request.table_name).ok();
            return status;
        }

        for tablet in &tablets {
            self.try_load_tablet(tablet, "").await;
        }
        tracing::info!(table = %request.table_name, tablets = tablets.len(), "table created");
        StatusCode::MasterOk
    }

    pub async fn delete_table(self: &Arc<Self>, request: &SimpleTableRequest) -> StatusCode {
        if let Err(code) = self.writable_or_code() {
            return code;
        }
        if !self.user_manager.is_root_token(&request.user_token) {
            return StatusCode::NotPermission;
        }
        let Some(table) = self.tablet_manager.find_table(&request.table_name) else {
            return StatusCode::TableNotExist;
        };
        if table.status() != TableStatus::Disable {
            return StatusCode::TableStatusEnable;
        }
        let mut records = vec![MetaWriteRecord::delete(
            trellis_proto::make_table_meta_key(&request.table_name),
        )];
        for tablet in table.tablets() {
            records.push(MetaWriteRecord::delete(
                trellis_proto::make_tablet_meta_key(&request.table_name, &tablet.key_start()),
            ));
        }
        if let Err(status) = self.meta_writer.write(records).await {
            return status;
        }
        table.set_status(TableStatus::Deleted);
        self.tablet_manager.delete_table(&request.table_name).ok();
        self.gc.clear(&request.table_name);
        tracing::info!(table = %request.table_name, "table deleted");
        StatusCode::MasterOk
    }

    pub async fn disable_table(self: &Arc<Self>, request: &SimpleTableRequest) -> StatusCode {
        if let Err(code) = self.writable_or_code() {
            return code;
        }
        if !self.user_manager.is_root_token(&request.user_token) {
            return StatusCode::NotPermission;
        }
        let Some(table) = self.tablet_manager.find_table(&request.table_name) else {
            return StatusCode::TableNotExist;
        };
        if !table.set_status(TableStatus::Disable) {
            return StatusCode::TableStatusDisable;
        }
        if let Err(status) = self.write_table_record(&table).await {
            table.set_status(TableStatus::Enable);
            return status;
        }
        for tablet in table.tablets() {
            self.try_unload_tablet(&tablet).await;
        }
        StatusCode::MasterOk
    }

    pub async fn enable_table(self: &Arc<Self>, request: &SimpleTableRequest) -> StatusCode {
        if let Err(code) = self.writable_or_code() {
            return code;
        }
        if !self.user_manager.is_root_token(&request.user_token) {
            return StatusCode::NotPermission;
        }
        let Some(table) = self.tablet_manager.find_table(&request.table_name) else {
            return StatusCode::TableNotExist;
        };
        if !table.set_status(TableStatus::Enable) {
            return StatusCode::TableStatusEnable;
        }
        if let Err(status) = self.write_table_record(&table).await {
            table.set_status(TableStatus::Disable);
            return status;
        }
        for tablet in table.tablets() {
            if tablet.status() == TabletStatus::OffLine {
                self.try_load_tablet(&tablet, "").await;
            }
        }
        StatusCode::MasterOk
    }

    /// Online schema update: column-family changes apply to a live table;
    /// anything touching locality groups needs the table disabled.
    pub async fn update_table(self: &Arc<Self>, request: &UpdateTableRequest) -> StatusCode {
        if let Err(code) = self.writable_or_code() {
            return code;
        }
        if !self.user_manager.is_root_token(&request.user_token) {
            return StatusCode::NotPermission;
        }
        let Some(table) = self.tablet_manager.find_table(&request.table_name) else {
            return StatusCode::TableNotExist;
        };
        let cf_only = table.schema().is_cf_only_update(&request.schema);
        if !cf_only && table.status() != TableStatus::Disable {
            return StatusCode::TableStatusEnable;
        }
        if !table.prepare_update(request.schema.clone()) {
            return StatusCode::TableStatusEnable;
        }
        if let Err(status) = self.write_table_record(&table).await {
            table.abort_update();
            return status;
        }
        table.commit_update();
        StatusCode::MasterOk
    }

    pub fn update_check(&self, request: &UpdateCheckRequest) -> (StatusCode, bool) {
        match self.tablet_manager.find_table(&request.table_name) {
            Some(table) => (StatusCode::MasterOk, !table.schema_is_syncing()),
            None => (StatusCode::TableNotExist, false),
        }
    }

    /// Rename is only meaningful with internal-name indirection; without it
    /// the operation is rejected as a bad parameter.
    pub async fn rename_table(self: &Arc<Self>, request: &RenameTableRequest) -> StatusCode {
        if let Err(code) = self.writable_or_code() {
            return code;
        }
        if !self.user_manager.is_root_token(&request.user_token) {
            return StatusCode::NotPermission;
        }
        if !self.config.table_rename_enabled {
            return StatusCode::InvalidArgument;
        }
        if self
            .tablet_manager
            .find_table_by_alias(&request.new_table_name)
            .is_some()
        {
            return StatusCode::TableExist;
        }
        let Some(table) = self
            .tablet_manager
            .find_table_by_alias(&request.old_table_name)
        else {
            return StatusCode::TableNotExist;
        };
        let old_alias = table.alias();
        table.set_alias(&request.new_table_name);
        if let Err(status) = self.write_table_record(&table).await {
            table.set_alias(old_alias);
            return status;
        }
        StatusCode::MasterOk
    }

    pub fn show_tables(&self, request: &ShowTablesRequest) -> ShowTablesResponse {
        let max_table = if request.max_table_num == 0 {
            usize::MAX
        } else {
            request.max_table_num as usize
        };
        let max_tablet = if request.brief {
            0
        } else if request.max_tablet_num == 0 {
            usize::MAX
        } else {
            request.max_tablet_num as usize
        };
        let (tables, tablets, is_more) = self.tablet_manager.show_table(
            &request.start_table_name,
            &request.start_tablet_key,
            max_table,
            max_tablet,
        );
        ShowTablesResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::MasterOk,
            table_meta_list: tables,
            tablet_meta_list: tablets,
            is_more,
        }
    }

    pub fn show_tablet_nodes(&self, request: &ShowTabletNodesRequest) -> ShowTabletNodesResponse {
        let nodes = if request.is_showall {
            self.tabletnode_manager.nodes()
        } else {
            self.tabletnode_manager
                .find_node(&request.addr)
                .into_iter()
                .collect()
        };
        let tablet_meta_list = if request.is_showall {
            Vec::new()
        } else {
            self.tablet_manager
                .tablets_on_server(&request.addr)
                .iter()
                .map(|t| t.to_meta())
                .collect()
        };
        ShowTabletNodesResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::MasterOk,
            nodes: nodes.iter().map(|n| n.to_info()).collect(),
            tablet_meta_list,
        }
    }

    pub async fn get_snapshot(self: &Arc<Self>, request: &SnapshotRequest) -> (StatusCode, u64) {
        if let Err(code) = self.writable_or_code() {
            return (code, 0);
        }
        if !self.user_manager.is_root_token(&request.user_token) {
            return (StatusCode::NotPermission, 0);
        }
        let Some(table) = self.tablet_manager.find_table(&request.table_name) else {
            return (StatusCode::TableNotExist, 0);
        };
        let snapshot_id = self.next_snapshot_id.fetch_add(1, Ordering::Relaxed);
        table.add_snapshot(snapshot_id);
        for tablet in table.tablets() {
            tablet.add_snapshot(snapshot_id);
        }
        if let Err(status) = self.write_table_with_tablets(&table).await {
            table.del_snapshot(snapshot_id);
            for tablet in table.tablets() {
                tablet.del_snapshot(snapshot_id);
            }
            return (status, 0);
        }
        (StatusCode::MasterOk, snapshot_id)
    }

    pub async fn del_snapshot(self: &Arc<Self>, request: &SnapshotRequest) -> StatusCode {
        if let Err(code) = self.writable_or_code() {
            return code;
        }
        if !self.user_manager.is_root_token(&request.user_token) {
            return StatusCode::NotPermission;
        }
        let Some(table) = self.tablet_manager.find_table(&request.table_name) else {
            return StatusCode::TableNotExist;
        };
        if !table.del_snapshot(request.snapshot_id) {
            return StatusCode::SnapshotNotExist;
        }
        for tablet in table.tablets() {
            tablet.del_snapshot(request.snapshot_id);
        }
        if let Err(status) = self.write_table_with_tablets(&table).await {
            table.add_snapshot(request.snapshot_id);
            for tablet in table.tablets() {
                tablet.add_snapshot(request.snapshot_id);
            }
            return status;
        }
        StatusCode::MasterOk
    }

    pub async fn rollback(self: &Arc<Self>, request: &SnapshotRequest) -> StatusCode {
        if let Err(code) = self.writable_or_code() {
            return code;
        }
        if !self.user_manager.is_root_token(&request.user_token) {
            return StatusCode::NotPermission;
        }
        let Some(table) = self.tablet_manager.find_table(&request.table_name) else {
            return StatusCode::TableNotExist;
        };
        if !table.snapshots().contains(&request.snapshot_id) {
            return StatusCode::SnapshotNotExist;
        }
        table.add_rollback(&request.rollback_name);
        if let Err(status) = self.write_table_record(&table).await {
            return status;
        }
        StatusCode::MasterOk
    }

    pub async fn operate_user(
        self: &Arc<Self>,
        request: &OperateUserRequest,
    ) -> (StatusCode, Option<UserInfo>) {
        let Some(op) = request.op_type else {
            return (StatusCode::InvalidArgument, None);
        };
        match self
            .user_manager
            .operate(op, request.user_info.clone(), &request.user_token)
        {
            Ok(info) => (StatusCode::MasterOk, info),
            Err(status) => (status, None),
        }
    }

    /// Administrative control: safe mode, rebalance switch, tablet ops.
    pub async fn cmd_ctrl(self: &Arc<Self>, request: &CmdCtrlRequest) -> CmdCtrlResponse {
        let mut response = CmdCtrlResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::MasterOk,
            bool_result: false,
            str_result: String::new(),
        };
        if !self.user_manager.is_root_token(&request.user_token) {
            response.status = StatusCode::NotPermission;
            return response;
        }
        let arg0 = request.args.first().map(String::as_str).unwrap_or("");
        match (request.command.as_str(), arg0) {
            ("safemode", "enter") => {
                self.try_enter_safe_mode().await;
                response.bool_result = self.status() == MasterStatus::IsReadonly;
            }
            ("safemode", "leave") => {
                self.try_leave_safe_mode().await;
                response.bool_result = self.status() == MasterStatus::IsRunning;
            }
            ("safemode", "get") => {
                response.bool_result = self.status() == MasterStatus::IsReadonly;
            }
            ("loadbalance", "enable") => self.set_load_balance_enabled(true),
            ("loadbalance", "disable") => self.set_load_balance_enabled(false),
            ("tablet", "split") => {
                let (table, key) = (
                    request.args.get(1).cloned().unwrap_or_default(),
                    request.args.get(2).cloned().unwrap_or_default(),
                );
                match self
                    .tablet_manager
                    .find_covering_tablet(&table, key.as_bytes())
                {
                    Some(tablet) => {
                        response.status = match self.try_split_tablet(&tablet).await {
                            Ok(()) => StatusCode::MasterOk,
                            Err(status) => status,
                        };
                    }
                    None => response.status = StatusCode::TableNotFound,
                }
            }
            ("tablet", "move") => {
                let (table, key, dest) = (
                    request.args.get(1).cloned().unwrap_or_default(),
                    request.args.get(2).cloned().unwrap_or_default(),
                    request.args.get(3).cloned().unwrap_or_default(),
                );
                match self
                    .tablet_manager
                    .find_covering_tablet(&table, key.as_bytes())
                {
                    Some(tablet) => self.try_move_tablet(&tablet, &dest).await,
                    None => response.status = StatusCode::TableNotFound,
                }
            }
            ("tablet", "merge") => {
                let (table, key) = (
                    request.args.get(1).cloned().unwrap_or_default(),
                    request.args.get(2).cloned().unwrap_or_default(),
                );
                let Some(tablet) = self
                    .tablet_manager
                    .find_covering_tablet(&table, key.as_bytes())
                else {
                    response.status = StatusCode::TableNotFound;
                    return response;
                };
                let Some(peer) = self.tablet_manager.pick_merge_tablet(&tablet) else {
                    response.status = StatusCode::InvalidArgument;
                    return response;
                };
                let (left, right) = if tablet.key_start() < peer.key_start() {
                    (tablet, peer)
                } else {
                    (peer, tablet)
                };
                response.status = match self.try_merge_tablet(&left, &right).await {
                    Ok(()) => StatusCode::MasterOk,
                    Err(status) => status,
                };
            }
            _ => response.status = StatusCode::InvalidArgument,
        }
        response
    }

    async fn write_table_record(&self, table: &Arc<crate::tablet_manager::Table>) -> Result<(), StatusCode> {
        let (key, value) = table
            .to_meta_record()
            .map_err(|_| StatusCode::ClientError)?;
        self.meta_writer
            .write(vec![MetaWriteRecord::put(key, value)])
            .await
    }

    async fn write_table_with_tablets(
        &self,
        table: &Arc<crate::tablet_manager::Table>,
    ) -> Result<(), StatusCode> {
        let mut records = vec![table
            .to_meta_record()
            .map(|(k, v)| MetaWriteRecord::put(k, v))
            .map_err(|_| StatusCode::ClientError)?];
        for tablet in table.tablets() {
            records.push(
                tablet
                    .to_meta_record()
                    .map(|(k, v)| MetaWriteRecord::put(k, v))
                    .map_err(|_| StatusCode::ClientError)?,
            );
        }
        self.meta_writer.write(records).await
    }

    pub fn env(&self) -> &Arc<dyn Env> {
        &self.env
    }

    pub fn table_dir_of(&self, table_name: &str) -> String {
        self.table_dir(table_name)
    }
}

fn meta_put(meta: &TabletMeta) -> Result<MetaWriteRecord, StatusCode> {
    trellis_proto::meta::encode_tablet_meta(meta)
        .map(|(key, value)| MetaWriteRecord::put(key, value))
        .map_err(|_| StatusCode::ClientError)
}
