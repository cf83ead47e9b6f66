//! End-to-end router scenarios against a scripted in-process cluster.
//!
//! The mock serves the meta table (descriptor reads and meta scans) and a
//! set of data servers whose write/scan outcomes are scripted per call, so
//! each scenario drives the real meta cache, batch engine and task pool.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use trellis_client::{
    ClusterFinder, ErrorKind, RowMutationRequest, RowReadRequest, ScanDescriptor, SdkConfig, Table,
};
use trellis_proto::messages::*;
use trellis_proto::meta::{
    encode_table_meta, encode_tablet_meta, KeyRange, TableMeta, TabletMeta,
};
use trellis_proto::registry::{MemRegistry, Registry, ROOT_TABLET_NODE_PATH};
use trellis_proto::rpc::{RpcFault, RpcResult, TabletNodeConnector, TabletNodeRpc};
use trellis_proto::schema::TableSchema;
use trellis_proto::status::StatusCode;
use trellis_proto::META_TABLE_NAME;

const ROOT_ADDR: &str = "10.0.0.9:7070";

#[derive(Default)]
struct MockState {
    /// Successive tablet sets returned by meta scans; the last set repeats.
    meta_rounds: Mutex<VecDeque<Vec<TabletMeta>>>,
    /// Per-server scripted write statuses, one per call, applied to all rows.
    write_scripts: Mutex<HashMap<String, VecDeque<StatusCode>>>,
    /// Scripted per-row statuses, one entry per write call, any server.
    write_row_scripts: Mutex<VecDeque<Vec<StatusCode>>>,
    /// Scripted data-table scan responses, one per call.
    scan_scripts: Mutex<VecDeque<ScanTabletResponse>>,
    /// Committed writes, per server.
    writes: Mutex<Vec<(String, usize)>>,
    /// When set, meta-table RPCs fail at the transport.
    meta_down: AtomicBool,
}

impl MockState {
    fn next_meta_round(&self) -> Vec<TabletMeta> {
        let mut rounds = self.meta_rounds.lock().unwrap();
        if rounds.len() > 1 {
            rounds.pop_front().unwrap()
        } else {
            rounds.front().cloned().unwrap_or_default()
        }
    }
}

struct MockNode {
    addr: String,
    state: Arc<MockState>,
}

fn table_meta() -> TableMeta {
    TableMeta {
        name: "orders".to_string(),
        alias: "orders".to_string(),
        schema: TableSchema::with_families(&["cf"]),
        create_time: 1_700_000_000,
        ..Default::default()
    }
}

fn tablet(start: &[u8], end: &[u8], addr: &str) -> TabletMeta {
    TabletMeta {
        table_name: "orders".to_string(),
        key_range: KeyRange::new(start, end),
        path: "tablet00000001".to_string(),
        server_addr: addr.to_string(),
        ..Default::default()
    }
}

#[async_trait]
impl TabletNodeRpc for MockNode {
    async fn read_tablet(&self, request: ReadTabletRequest) -> RpcResult<ReadTabletResponse> {
        if request.tablet_name == META_TABLE_NAME {
            if self.state.meta_down.load(Ordering::Relaxed) {
                return Err(RpcFault::ConnectionClosed);
            }
            let (key, value) = encode_table_meta(&table_meta()).expect("encode table meta");
            return Ok(ReadTabletResponse {
                sequence_id: request.sequence_id,
                status: StatusCode::TabletNodeOk,
                detail: ReadDetail {
                    status_list: vec![StatusCode::TabletNodeOk],
                    row_results: vec![RowResult {
                        key_values: vec![KeyValuePair {
                            key,
                            column_family: String::new(),
                            qualifier: Vec::new(),
                            timestamp: 0,
                            value: Bytes::from(value),
                        }],
                    }],
                },
            });
        }
        // Data reads are not scripted in these scenarios; report every row
        // as missing.
        Ok(ReadTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::TabletNodeOk,
            detail: ReadDetail {
                status_list: vec![StatusCode::KeyNotExist; request.row_info_list.len()],
                row_results: Vec::new(),
            },
        })
    }

    async fn write_tablet(&self, request: WriteTabletRequest) -> RpcResult<WriteTabletResponse> {
        self.state
            .writes
            .lock()
            .unwrap()
            .push((self.addr.clone(), request.row_list.len()));
        let row_status_list = match self.state.write_row_scripts.lock().unwrap().pop_front() {
            Some(mut statuses) => {
                statuses.resize(request.row_list.len(), StatusCode::TabletNodeOk);
                statuses
            }
            None => {
                let status = self
                    .state
                    .write_scripts
                    .lock()
                    .unwrap()
                    .get_mut(&self.addr)
                    .and_then(|q| q.pop_front())
                    .unwrap_or(StatusCode::TabletNodeOk);
                vec![status; request.row_list.len()]
            }
        };
        Ok(WriteTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::TabletNodeOk,
            row_status_list,
        })
    }

    async fn scan_tablet(&self, request: ScanTabletRequest) -> RpcResult<ScanTabletResponse> {
        if request.table_name == META_TABLE_NAME {
            if self.state.meta_down.load(Ordering::Relaxed) {
                return Err(RpcFault::ConnectionClosed);
            }
            let tablets = self.state.next_meta_round();
            let key_values = tablets
                .iter()
                .map(|meta| {
                    let (key, value) = encode_tablet_meta(meta).expect("encode tablet meta");
                    KeyValuePair {
                        key,
                        column_family: String::new(),
                        qualifier: Vec::new(),
                        timestamp: 0,
                        value: Bytes::from(value),
                    }
                })
                .collect();
            return Ok(ScanTabletResponse {
                sequence_id: request.sequence_id,
                status: StatusCode::TabletNodeOk,
                results: RowResult { key_values },
                complete: true,
                end: Vec::new(),
            });
        }
        match self.state.scan_scripts.lock().unwrap().pop_front() {
            Some(mut response) => {
                response.sequence_id = request.sequence_id;
                Ok(response)
            }
            None => Ok(ScanTabletResponse {
                sequence_id: request.sequence_id,
                status: StatusCode::TabletNodeOk,
                results: RowResult::default(),
                complete: true,
                end: Vec::new(),
            }),
        }
    }

    async fn query(&self, _request: QueryRequest) -> RpcResult<QueryResponse> {
        Err(RpcFault::Other)
    }
    async fn load_tablet(&self, _request: LoadTabletRequest) -> RpcResult<LoadTabletResponse> {
        Err(RpcFault::Other)
    }
    async fn unload_tablet(&self, _request: UnloadTabletRequest) -> RpcResult<UnloadTabletResponse> {
        Err(RpcFault::Other)
    }
    async fn split_tablet(&self, _request: SplitTabletRequest) -> RpcResult<SplitTabletResponse> {
        Err(RpcFault::Other)
    }
}

struct MockConnector {
    state: Arc<MockState>,
}

impl TabletNodeConnector for MockConnector {
    fn tablet_node(&self, addr: &str) -> Arc<dyn TabletNodeRpc> {
        Arc::new(MockNode {
            addr: addr.to_string(),
            state: self.state.clone(),
        })
    }
}

async fn open_table(state: Arc<MockState>, config: SdkConfig) -> Table {
    trellis_proto::logging::init();
    let registry = MemRegistry::new();
    registry
        .put(ROOT_TABLET_NODE_PATH, ROOT_ADDR.as_bytes())
        .await
        .unwrap();
    let cluster = Arc::new(ClusterFinder::new(registry, "mock-cluster"));
    Table::open("orders", config, cluster, Arc::new(MockConnector { state }))
        .await
        .expect("open table")
}

#[tokio::test(start_paused = true)]
async fn route_and_retry_recovers_from_range_movement() {
    let state = Arc::new(MockState::default());
    state.meta_rounds.lock().unwrap().extend([
        vec![tablet(b"a", b"z", "s1")],
        vec![tablet(b"a", b"n", "s1"), tablet(b"n", b"z", "s2")],
    ]);
    state
        .write_scripts
        .lock()
        .unwrap()
        .insert("s1".to_string(), VecDeque::from([StatusCode::KeyNotInRange]));

    let table = open_table(state.clone(), SdkConfig::default()).await;
    let rx = table
        .submit_mutation(
            RowMutationRequest::new(b"m".to_vec()).put("cf", b"q".to_vec(), "1"),
            false,
        )
        .await;
    let outcome = rx.await.expect("outcome delivered");

    assert!(outcome.result.is_ok(), "put succeeds after redistribution");
    assert_eq!(outcome.commit_times, 2);
    assert_eq!(outcome.retry_times, 1);

    let writes = state.writes.lock().unwrap().clone();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].0, "s1");
    assert_eq!(writes[1].0, "s1", "redistribution lands on the new owner of m");
    // The refreshed cache maps m to the narrower range.
    let cached = table.cached_tablet_for_key(b"m").expect("cache entry");
    assert_eq!(cached.key_range.key_start, b"a".to_vec());
    assert_eq!(cached.key_range.key_end, b"n".to_vec());
}

#[tokio::test(start_paused = true)]
async fn deadline_fires_when_meta_is_unreachable() {
    let state = Arc::new(MockState::default());
    state
        .meta_rounds
        .lock()
        .unwrap()
        .push_back(vec![tablet(b"a", b"z", "s1")]);
    let table = open_table(state.clone(), SdkConfig::default()).await;
    // After open, the scanner loses the meta tablet entirely.
    state.meta_down.store(true, Ordering::Relaxed);

    let rx = table
        .submit_read(
            RowReadRequest::new(b"k".to_vec())
                .column("cf", b"q".to_vec())
                .timeout_ms(50),
            true,
        )
        .await;
    let outcome = rx.await.expect("outcome delivered");
    let error = outcome.result.expect_err("deadline error");
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(outcome.retry_times, 0);
    assert_eq!(outcome.commit_times, 0);
}

#[tokio::test(start_paused = true)]
async fn flow_control_fails_fast_when_not_blocking() {
    let state = Arc::new(MockState::default());
    let config = SdkConfig {
        max_mutation_pending_num: 1,
        async_blocking_enabled: false,
        ..Default::default()
    };
    let table = open_table(state, config).await;

    let rx1 = table
        .submit_mutation(
            RowMutationRequest::new(b"a".to_vec()).put("cf", b"q".to_vec(), "1"),
            false,
        )
        .await;
    let mut rx2 = table
        .submit_mutation(
            RowMutationRequest::new(b"b".to_vec()).put("cf", b"q".to_vec(), "2"),
            false,
        )
        .await;

    let outcome = rx2.try_recv().expect("second put fails immediately");
    assert_eq!(outcome.result.expect_err("busy").kind, ErrorKind::Busy);
    drop(rx1);
}

#[tokio::test(start_paused = true)]
async fn partial_meta_scan_parks_tasks_instead_of_failing_them() {
    let state = Arc::new(MockState::default());
    // Every scan stops at m while claiming completeness; the row k parks
    // under the resulting probe and must never observe a scan error.
    state
        .meta_rounds
        .lock()
        .unwrap()
        .push_back(vec![tablet(b"a", b"m", "s1")]);

    let table = open_table(state.clone(), SdkConfig::default()).await;
    let rx = table
        .submit_read(
            RowReadRequest::new(b"p".to_vec())
                .column("cf", b"q".to_vec())
                .timeout_ms(3_000),
            false,
        )
        .await;
    let outcome = rx.await.expect("outcome delivered");
    let error = outcome.result.expect_err("parked read times out");
    assert_eq!(error.kind, ErrorKind::Timeout, "not failed by the meta error");
    assert_eq!(outcome.commit_times, 0, "never committed to a server");
}

#[tokio::test(start_paused = true)]
async fn batch_rows_fail_independently() {
    let state = Arc::new(MockState::default());
    state
        .meta_rounds
        .lock()
        .unwrap()
        .push_back(vec![tablet(b"", b"", "s1")]);
    state
        .write_row_scripts
        .lock()
        .unwrap()
        .push_back(vec![StatusCode::TabletNodeOk, StatusCode::TxnFail]);

    let table = open_table(state.clone(), SdkConfig::default()).await;
    let rx_a = table
        .submit_mutation(
            RowMutationRequest::new(b"a".to_vec()).put("cf", b"q".to_vec(), "1"),
            false,
        )
        .await;
    let rx_b = table
        .submit_mutation(
            RowMutationRequest::new(b"b".to_vec()).put("cf", b"q".to_vec(), "2"),
            false,
        )
        .await;

    let outcome_a = rx_a.await.expect("outcome delivered");
    let outcome_b = rx_b.await.expect("outcome delivered");
    assert!(outcome_a.result.is_ok(), "sibling failure does not leak");
    assert_eq!(
        outcome_b.result.expect_err("txn fail").kind,
        ErrorKind::TxnFail
    );

    // Both rows went out in one batch: row count equals responses attributed.
    let writes = state.writes.lock().unwrap().clone();
    assert_eq!(writes, vec![("s1".to_string(), 2)]);
}

#[tokio::test(start_paused = true)]
async fn scan_continues_across_buffers() {
    let state = Arc::new(MockState::default());
    state
        .meta_rounds
        .lock()
        .unwrap()
        .push_back(vec![tablet(b"", b"", "s1")]);
    let cell = |key: &[u8]| KeyValuePair {
        key: key.to_vec(),
        column_family: "cf".to_string(),
        qualifier: b"q".to_vec(),
        timestamp: 1,
        value: Bytes::from_static(b"v"),
    };
    state.scan_scripts.lock().unwrap().extend([
        ScanTabletResponse {
            sequence_id: 0,
            status: StatusCode::TabletNodeOk,
            results: RowResult {
                key_values: vec![cell(b"a"), cell(b"b")],
            },
            complete: false,
            end: b"c".to_vec(),
        },
        ScanTabletResponse {
            sequence_id: 0,
            status: StatusCode::TabletNodeOk,
            results: RowResult {
                key_values: vec![cell(b"c")],
            },
            complete: true,
            end: Vec::new(),
        },
    ]);

    let table = open_table(state, SdkConfig::default()).await;
    let mut stream = table.scan(ScanDescriptor::new(b"a".to_vec(), Vec::new()));
    let cells = stream.collect_all().await.expect("scan succeeds");
    let keys: Vec<&[u8]> = cells.iter().map(|c| c.key.as_slice()).collect();
    assert_eq!(keys, vec![b"a".as_slice(), b"b", b"c"]);
}
