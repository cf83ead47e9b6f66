//! Master lifecycle scenarios against an in-process node mock: create,
//! split/merge with meta-write failure rollback, safe mode, and the admin
//! surface through the real client facade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use trellis_master::master::{MasterConfig, MasterImpl, MasterStatus};
use trellis_master::meta_writer::{MetaWriteRecord, MetaWriter};
use trellis_master::registry_adapter::MasterRegistryAdapter;
use trellis_master::{IncrementalGcStrategy, MasterService, TabletManager, TabletNodeManager};
use trellis_proto::env::MemEnv;
use trellis_proto::messages::*;
use trellis_proto::meta::TabletStatus;
use trellis_proto::registry::MemRegistry;
use trellis_proto::rpc::{RpcResult, TabletNodeConnector, TabletNodeRpc};
use trellis_proto::schema::TableSchema;
use trellis_proto::status::StatusCode;

const ROOT: &str = "root";

#[derive(Default)]
struct NodeMockState {
    split_key: Mutex<Vec<u8>>,
    loads: Mutex<Vec<(String, String)>>,
    unloads: Mutex<Vec<String>>,
}

struct NodeMock {
    addr: String,
    state: Arc<NodeMockState>,
}

#[async_trait]
impl TabletNodeRpc for NodeMock {
    async fn read_tablet(&self, request: ReadTabletRequest) -> RpcResult<ReadTabletResponse> {
        Ok(ReadTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::TabletNodeOk,
            detail: ReadDetail::default(),
        })
    }
    async fn write_tablet(&self, request: WriteTabletRequest) -> RpcResult<WriteTabletResponse> {
        Ok(WriteTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::TabletNodeOk,
            row_status_list: vec![StatusCode::TabletNodeOk; request.row_list.len()],
        })
    }
    async fn scan_tablet(&self, request: ScanTabletRequest) -> RpcResult<ScanTabletResponse> {
        Ok(ScanTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::TabletNodeOk,
            results: RowResult::default(),
            complete: true,
            end: Vec::new(),
        })
    }
    async fn query(&self, request: QueryRequest) -> RpcResult<QueryResponse> {
        Ok(QueryResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::TabletNodeOk,
            tablet_meta_list: Vec::new(),
            tablet_counter_list: Vec::new(),
            node_stat: TabletNodeStat::default(),
            inh_live_files: Vec::new(),
        })
    }
    async fn load_tablet(&self, request: LoadTabletRequest) -> RpcResult<LoadTabletResponse> {
        self.state
            .loads
            .lock()
            .unwrap()
            .push((self.addr.clone(), request.path.clone()));
        Ok(LoadTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::TabletNodeOk,
        })
    }
    async fn unload_tablet(&self, request: UnloadTabletRequest) -> RpcResult<UnloadTabletResponse> {
        self.state.unloads.lock().unwrap().push(self.addr.clone());
        Ok(UnloadTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::TabletNodeOk,
        })
    }
    async fn split_tablet(&self, request: SplitTabletRequest) -> RpcResult<SplitTabletResponse> {
        Ok(SplitTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::TabletNodeOk,
            split_key: self.state.split_key.lock().unwrap().clone(),
        })
    }
}

struct NodeMockConnector {
    state: Arc<NodeMockState>,
}

impl TabletNodeConnector for NodeMockConnector {
    fn tablet_node(&self, addr: &str) -> Arc<dyn TabletNodeRpc> {
        Arc::new(NodeMock {
            addr: addr.to_string(),
            state: self.state.clone(),
        })
    }
}

#[derive(Default)]
struct TestMetaWriter {
    fail: AtomicBool,
    batches: Mutex<Vec<Vec<MetaWriteRecord>>>,
}

#[async_trait]
impl MetaWriter for TestMetaWriter {
    async fn write(&self, records: Vec<MetaWriteRecord>) -> Result<(), StatusCode> {
        self.batches.lock().unwrap().push(records.clone());
        if self.fail.load(Ordering::Relaxed) {
            Err(StatusCode::RpcError)
        } else {
            Ok(())
        }
    }
}

struct Fixture {
    master: Arc<MasterImpl>,
    node_state: Arc<NodeMockState>,
    meta_writer: Arc<TestMetaWriter>,
}

fn fixture() -> Fixture {
    trellis_proto::logging::init();
    let tablet_manager = TabletManager::new();
    let tabletnode_manager = TabletNodeManager::new();
    let env = Arc::new(MemEnv::new());
    let node_state = Arc::new(NodeMockState::default());
    let meta_writer = Arc::new(TestMetaWriter::default());
    let gc = Arc::new(IncrementalGcStrategy::new(
        tablet_manager.clone(),
        env.clone(),
        "/trellis",
    ));
    let master = MasterImpl::new(
        MasterConfig::default(),
        tablet_manager,
        tabletnode_manager,
        gc,
        meta_writer.clone(),
        Arc::new(NodeMockConnector {
            state: node_state.clone(),
        }),
        MasterRegistryAdapter::new(MemRegistry::new()),
        env,
    );
    assert!(master.set_status(MasterStatus::OnRestore));
    assert!(master.set_status(MasterStatus::IsRunning));
    master.tabletnode_manager.add_node("node1:7070", "sess-1");
    Fixture {
        master,
        node_state,
        meta_writer,
    }
}

async fn create_orders_table(fixture: &Fixture, delimiters: Vec<Vec<u8>>) {
    let status = fixture
        .master
        .create_table(&CreateTableRequest {
            sequence_id: 1,
            table_name: "orders".to_string(),
            schema: TableSchema::with_families(&["cf"]),
            delimiters,
            user_token: ROOT.to_string(),
        })
        .await;
    assert_eq!(status, StatusCode::MasterOk);
}

#[tokio::test]
async fn create_table_persists_meta_and_loads_tablets() {
    let fixture = fixture();
    create_orders_table(&fixture, vec![b"m".to_vec()]).await;

    let table = fixture.master.tablet_manager.find_table("orders").unwrap();
    let tablets = table.tablets();
    assert_eq!(tablets.len(), 2);
    for tablet in &tablets {
        assert_eq!(tablet.status(), TabletStatus::Ready);
        assert_eq!(tablet.server_addr(), "node1:7070");
    }
    // First batch: one table record plus both tablet rows.
    let batches = fixture.meta_writer.batches.lock().unwrap();
    assert_eq!(batches[0].len(), 3);
    assert!(batches[0].iter().all(|r| r.value.is_some()));
    assert_eq!(fixture.node_state.loads.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn split_meta_failure_reverts_without_phantom_tablets() {
    let fixture = fixture();
    create_orders_table(&fixture, Vec::new()).await;
    *fixture.node_state.split_key.lock().unwrap() = b"m".to_vec();

    let tablet = fixture
        .master
        .tablet_manager
        .find_covering_tablet("orders", b"m")
        .unwrap();
    let batches_before = fixture.meta_writer.batches.lock().unwrap().len();

    fixture.meta_writer.fail.store(true, Ordering::Relaxed);
    let result = fixture.master.try_split_tablet(&tablet).await;
    assert_eq!(result.err(), Some(StatusCode::RpcError));

    // The attempted batch carried the delete plus both child adds.
    {
        let batches = fixture.meta_writer.batches.lock().unwrap();
        let attempted = &batches[batches_before];
        assert_eq!(attempted.len(), 3);
        assert!(attempted[0].value.is_none(), "old row delete");
        assert!(attempted[1].value.is_some() && attempted[2].value.is_some());
    }

    // In-memory state reverted: one tablet, back to Ready, same range.
    let table = fixture.master.tablet_manager.find_table("orders").unwrap();
    assert_eq!(table.tablet_count(), 1);
    assert_eq!(tablet.status(), TabletStatus::Ready);
    assert!(tablet.key_end().is_empty());

    // With the writer healthy the same split commits.
    fixture.meta_writer.fail.store(false, Ordering::Relaxed);
    fixture.master.try_split_tablet(&tablet).await.unwrap();
    let tablets = table.tablets();
    assert_eq!(tablets.len(), 2);
    assert_eq!(tablets[0].key_end(), b"m".to_vec());
    assert_eq!(tablets[1].key_start(), b"m".to_vec());
    for child in &tablets {
        assert_eq!(child.status(), TabletStatus::Ready);
    }
}

#[tokio::test]
async fn merge_meta_failure_restores_both_parents() {
    let fixture = fixture();
    create_orders_table(&fixture, vec![b"m".to_vec()]).await;
    let table = fixture.master.tablet_manager.find_table("orders").unwrap();
    let tablets = table.tablets();
    let (left, right) = (tablets[0].clone(), tablets[1].clone());

    fixture.meta_writer.fail.store(true, Ordering::Relaxed);
    let result = fixture.master.try_merge_tablet(&left, &right).await;
    assert_eq!(result.err(), Some(StatusCode::RpcError));
    assert_eq!(table.tablet_count(), 2);
    assert_eq!(left.status(), TabletStatus::Ready, "left restored");
    assert_eq!(right.status(), TabletStatus::Ready, "right restored");

    fixture.meta_writer.fail.store(false, Ordering::Relaxed);
    fixture.master.try_merge_tablet(&left, &right).await.unwrap();
    let merged = table.tablets();
    assert_eq!(merged.len(), 1);
    assert!(merged[0].key_start().is_empty());
    assert!(merged[0].key_end().is_empty());
    assert_eq!(merged[0].status(), TabletStatus::Ready);
}

#[tokio::test]
async fn node_churn_drives_safe_mode() {
    let fixture = fixture();
    let all_nodes = vec![
        ("sess-1".to_string(), "node1:7070".to_string()),
        ("sess-2".to_string(), "node2:7070".to_string()),
        ("sess-3".to_string(), "node3:7070".to_string()),
    ];
    fixture
        .master
        .refresh_tablet_node_list(all_nodes.clone())
        .await;
    assert_eq!(fixture.master.status(), MasterStatus::IsRunning);

    // Two of three nodes vanish: the ratio falls below the threshold.
    fixture
        .master
        .refresh_tablet_node_list(vec![all_nodes[0].clone()])
        .await;
    assert_eq!(fixture.master.status(), MasterStatus::IsReadonly);

    // Destructive operations are refused in safe mode.
    let status = fixture
        .master
        .create_table(&CreateTableRequest {
            sequence_id: 1,
            table_name: "blocked".to_string(),
            schema: TableSchema::with_families(&["cf"]),
            delimiters: Vec::new(),
            user_token: ROOT.to_string(),
        })
        .await;
    assert_eq!(status, StatusCode::MasterIsReadonly);

    // Ratio recovery leaves safe mode.
    fixture.master.refresh_tablet_node_list(all_nodes).await;
    assert_eq!(fixture.master.status(), MasterStatus::IsRunning);
}

#[tokio::test]
async fn node_loss_offlines_its_tablets() {
    let fixture = fixture();
    // Raise the expected-node high-water mark with a second node so a
    // single loss stays above the safe-mode threshold.
    fixture
        .master
        .refresh_tablet_node_list(vec![
            ("sess-1".to_string(), "node1:7070".to_string()),
            ("sess-2".to_string(), "node2:7070".to_string()),
        ])
        .await;
    create_orders_table(&fixture, Vec::new()).await;
    let tablet = fixture
        .master
        .tablet_manager
        .find_covering_tablet("orders", b"k")
        .unwrap();
    let owner = tablet.server_addr();
    let survivor = if owner == "node1:7070" {
        ("sess-2".to_string(), "node2:7070".to_string())
    } else {
        ("sess-1".to_string(), "node1:7070".to_string())
    };

    fixture
        .master
        .refresh_tablet_node_list(vec![survivor.clone()])
        .await;
    // The tablet either moved to the survivor or is offline awaiting one.
    let status = tablet.status();
    assert!(
        status == TabletStatus::Ready || status == TabletStatus::OffLine,
        "unexpected status {status:?}"
    );
    if status == TabletStatus::Ready {
        assert_eq!(tablet.server_addr(), survivor.1);
    }
}

#[tokio::test]
async fn table_lifecycle_status_codes() {
    let fixture = fixture();
    create_orders_table(&fixture, Vec::new()).await;
    let request = |name: &str| SimpleTableRequest {
        sequence_id: 9,
        table_name: name.to_string(),
        user_token: ROOT.to_string(),
    };

    // Delete requires disable first.
    assert_eq!(
        fixture.master.delete_table(&request("orders")).await,
        StatusCode::TableStatusEnable
    );
    assert_eq!(
        fixture.master.disable_table(&request("orders")).await,
        StatusCode::MasterOk
    );
    assert_eq!(
        fixture.master.delete_table(&request("orders")).await,
        StatusCode::MasterOk
    );
    assert_eq!(
        fixture.master.delete_table(&request("orders")).await,
        StatusCode::TableNotExist
    );
}

#[tokio::test]
async fn rename_requires_indirection_mode() {
    let tablet_manager = TabletManager::new();
    let env = Arc::new(MemEnv::new());
    let gc = Arc::new(IncrementalGcStrategy::new(
        tablet_manager.clone(),
        env.clone(),
        "/trellis",
    ));
    let master = MasterImpl::new(
        MasterConfig {
            table_rename_enabled: false,
            ..Default::default()
        },
        tablet_manager,
        TabletNodeManager::new(),
        gc,
        Arc::new(TestMetaWriter::default()),
        Arc::new(NodeMockConnector {
            state: Arc::new(NodeMockState::default()),
        }),
        MasterRegistryAdapter::new(MemRegistry::new()),
        env,
    );
    assert!(master.set_status(MasterStatus::OnRestore));
    assert!(master.set_status(MasterStatus::IsRunning));

    let status = master
        .rename_table(&RenameTableRequest {
            sequence_id: 1,
            old_table_name: "a".to_string(),
            new_table_name: "b".to_string(),
            user_token: ROOT.to_string(),
        })
        .await;
    assert_eq!(status, StatusCode::InvalidArgument);
}

#[tokio::test]
async fn admin_surface_through_the_client_facade() {
    let fixture = fixture();
    let registry = MemRegistry::new();
    let cluster = Arc::new(trellis_client::ClusterFinder::new(registry, "test"));
    let client = trellis_client::Client::new(
        Arc::new(MasterService::new(fixture.master.clone())),
        cluster,
        Arc::new(NodeMockConnector {
            state: fixture.node_state.clone(),
        }),
        trellis_client::SdkConfig::default(),
        ROOT,
    );

    client
        .create_table(
            "orders",
            TableSchema::with_families(&["cf"]),
            vec![b"m".to_vec()],
        )
        .await
        .unwrap();
    let (tables, tablets) = client.show_tables(false).await.unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tablets.len(), 2);

    let snapshot_id = client.get_snapshot("orders").await.unwrap();
    assert!(snapshot_id > 0);
    client.del_snapshot("orders", snapshot_id).await.unwrap();

    let (readonly, _) = client
        .cmd_ctrl("safemode", vec!["get".to_string()])
        .await
        .unwrap();
    assert!(!readonly);

    let err = client
        .create_table("orders", TableSchema::with_families(&["cf"]), Vec::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, trellis_client::ErrorKind::BadParam);
}
