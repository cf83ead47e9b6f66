//! RPC request/response messages for the tablet-node and master surfaces.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::meta::{KeyRange, TableMeta, TabletCounter, TabletMeta};
use crate::schema::TableSchema;
use crate::status::StatusCode;

/// Timestamp filter `[ts_start, ts_end]` applied to reads and scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub ts_start: i64,
    pub ts_end: i64,
}

/// One versioned cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValuePair {
    pub key: Vec<u8>,
    pub column_family: String,
    pub qualifier: Vec<u8>,
    pub timestamp: i64,
    pub value: Bytes,
}

/// Cells of one row (reads) or one scan buffer (scans).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowResult {
    pub key_values: Vec<KeyValuePair>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOp {
    Put,
    Add,
    PutIfAbsent,
    Append,
    DeleteColumn,
    DeleteColumns,
    DeleteFamily,
    DeleteRow,
}

/// One cell-level mutation within a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub op: MutationOp,
    pub family: String,
    pub qualifier: Vec<u8>,
    /// Cell timestamp; negative selects server-assigned time.
    pub timestamp: i64,
    pub value: Bytes,
    /// Cell TTL in seconds; 0 means no per-cell TTL.
    pub ttl_secs: i32,
}

/// All mutations of a single row, applied atomically on the tablet node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMutationSequence {
    pub row_key: Vec<u8>,
    pub mutations: Vec<Mutation>,
}

impl RowMutationSequence {
    pub fn byte_size(&self) -> usize {
        self.row_key.len()
            + self
                .mutations
                .iter()
                .map(|m| m.family.len() + m.qualifier.len() + m.value.len() + 24)
                .sum::<usize>()
    }
}

/// One server-side scan filter, optionally bound to a column. The tablet
/// node interprets `content` according to `filter_type`; the client carries
/// it opaquely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub filter_type: String,
    pub family: String,
    pub qualifier: Vec<u8>,
    pub content: Bytes,
}

/// Column selection for one row read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub family: String,
    /// Empty selects every qualifier of the family.
    pub qualifiers: Vec<Vec<u8>>,
}

/// One row read request entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowReaderInfo {
    pub key: Vec<u8>,
    pub cf_list: Vec<ColumnSpec>,
    pub time_range: Option<TimeRange>,
    pub max_versions: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadTabletRequest {
    pub sequence_id: u64,
    pub tablet_name: String,
    pub row_info_list: Vec<RowReaderInfo>,
    pub snapshot_id: u64,
    pub client_timeout_ms: i64,
}

/// Per-row read outcome; `row_result` aligns with the `Ok` statuses only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadDetail {
    pub status_list: Vec<StatusCode>,
    pub row_results: Vec<RowResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub detail: ReadDetail,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteTabletRequest {
    pub sequence_id: u64,
    pub tablet_name: String,
    pub is_sync: bool,
    pub row_list: Vec<RowMutationSequence>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub row_status_list: Vec<StatusCode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanTabletRequest {
    pub sequence_id: u64,
    pub table_name: String,
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub snapshot_id: u64,
    pub buffer_limit: u64,
    pub number_limit: u64,
    pub time_range: Option<TimeRange>,
    pub filter_list: Vec<FilterSpec>,
    pub cf_list: Vec<ColumnSpec>,
    pub start_family: String,
    pub start_qualifier: Vec<u8>,
    pub start_timestamp: i64,
    pub max_versions: u32,
    /// Ask the server to round the start down to the covering tablet start.
    pub round_down: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub results: RowResult,
    /// False when the server stopped at a buffer/number limit before `end`.
    pub complete: bool,
    pub end: Vec<u8>,
}

/// SST files a live tablet still depends on, grouped by locality group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LgInheritedLiveFiles {
    pub lg_no: u32,
    pub file_numbers: Vec<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InheritedLiveFiles {
    pub table_name: String,
    pub lg_live_files: Vec<LgInheritedLiveFiles>,
}

/// Aggregate node health carried in query responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TabletNodeStat {
    pub load: i64,
    pub data_size: i64,
    pub tablet_onload: u32,
    pub tablet_onsplit: u32,
    pub low_read_cell: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sequence_id: u64,
    pub is_gc_query: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub tablet_meta_list: Vec<TabletMeta>,
    pub tablet_counter_list: Vec<TabletCounter>,
    pub node_stat: TabletNodeStat,
    pub inh_live_files: Vec<InheritedLiveFiles>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadTabletRequest {
    pub sequence_id: u64,
    pub tablet_name: String,
    pub key_range: KeyRange,
    pub path: String,
    pub schema: TableSchema,
    pub session_id: String,
    pub snapshots: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnloadTabletRequest {
    pub sequence_id: u64,
    pub tablet_name: String,
    pub key_range: KeyRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SplitTabletRequest {
    pub sequence_id: u64,
    pub tablet_name: String,
    pub key_range: KeyRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    /// Split point chosen by the node; empty when the split was rejected.
    pub split_key: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Master surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTableRequest {
    pub sequence_id: u64,
    pub table_name: String,
    pub schema: TableSchema,
    /// Pre-split keys; n delimiters create n+1 tablets.
    pub delimiters: Vec<Vec<u8>>,
    pub user_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTableResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTableRequest {
    pub sequence_id: u64,
    pub table_name: String,
    pub schema: TableSchema,
    pub user_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTableResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCheckRequest {
    pub sequence_id: u64,
    pub table_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCheckResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub done: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimpleTableRequest {
    pub sequence_id: u64,
    pub table_name: String,
    pub user_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleTableResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserOperateType {
    CreateUser,
    DeleteUser,
    ChangePwd,
    ShowUser,
    AddToGroup,
    DeleteFromGroup,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_name: String,
    pub token: String,
    pub group_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperateUserRequest {
    pub sequence_id: u64,
    pub op_type: Option<UserOperateType>,
    pub user_info: UserInfo,
    pub user_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperateUserResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShowTablesRequest {
    pub sequence_id: u64,
    pub start_table_name: String,
    pub start_tablet_key: Vec<u8>,
    pub max_table_num: u32,
    pub max_tablet_num: u32,
    pub brief: bool,
    pub user_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowTablesResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub table_meta_list: Vec<TableMeta>,
    pub tablet_meta_list: Vec<TabletMeta>,
    pub is_more: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShowTabletNodesRequest {
    pub sequence_id: u64,
    /// Empty plus `is_showall` lists every node.
    pub addr: String,
    pub is_showall: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TabletNodeInfo {
    pub addr: String,
    pub uuid: String,
    pub status_label: String,
    pub tablet_total: u32,
    pub load: i64,
    pub data_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowTabletNodesResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub nodes: Vec<TabletNodeInfo>,
    pub tablet_meta_list: Vec<TabletMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub sequence_id: u64,
    pub table_name: String,
    pub snapshot_id: u64,
    pub rollback_name: String,
    pub user_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub snapshot_id: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CmdCtrlRequest {
    pub sequence_id: u64,
    pub command: String,
    pub args: Vec<String>,
    pub user_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdCtrlResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub bool_result: bool,
    pub str_result: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenameTableRequest {
    pub sequence_id: u64,
    pub old_table_name: String,
    pub new_table_name: String,
    pub user_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameTableResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
}
