//! RPC transport seams.
//!
//! The concrete transport lives outside this workspace; the SDK and master
//! talk to it through these traits. Transport-level failures surface as
//! `RpcFault` so callers can fold them into the status taxonomy before any
//! retry decision (the per-row statuses inside a response are orthogonal).

use std::sync::Arc;

use async_trait::async_trait;

use crate::messages::*;
use crate::status::StatusCode;

/// Transport-level failure, distinct from an application status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RpcFault {
    #[error("server shut down or unreachable")]
    ServerUnreachable,
    #[error("request canceled or send buffer full")]
    RequestCanceled,
    #[error("connection closed or address unresolvable")]
    ConnectionClosed,
    #[error("request timed out")]
    Timeout,
    #[error("rpc failed")]
    Other,
}

impl RpcFault {
    /// Fold a transport fault onto the shared status space.
    pub fn status(self) -> StatusCode {
        match self {
            RpcFault::ServerUnreachable => StatusCode::ServerError,
            RpcFault::RequestCanceled => StatusCode::ClientError,
            RpcFault::ConnectionClosed => StatusCode::ConnectError,
            RpcFault::Timeout => StatusCode::RpcTimeout,
            RpcFault::Other => StatusCode::RpcError,
        }
    }
}

pub type RpcResult<T> = Result<T, RpcFault>;

/// Data-path surface of one tablet node.
#[async_trait]
pub trait TabletNodeRpc: Send + Sync {
    async fn read_tablet(&self, request: ReadTabletRequest) -> RpcResult<ReadTabletResponse>;
    async fn write_tablet(&self, request: WriteTabletRequest) -> RpcResult<WriteTabletResponse>;
    async fn scan_tablet(&self, request: ScanTabletRequest) -> RpcResult<ScanTabletResponse>;
    async fn query(&self, request: QueryRequest) -> RpcResult<QueryResponse>;
    async fn load_tablet(&self, request: LoadTabletRequest) -> RpcResult<LoadTabletResponse>;
    async fn unload_tablet(&self, request: UnloadTabletRequest)
        -> RpcResult<UnloadTabletResponse>;
    async fn split_tablet(&self, request: SplitTabletRequest) -> RpcResult<SplitTabletResponse>;
}

/// Resolves a server address to a data-path client, one per target.
pub trait TabletNodeConnector: Send + Sync {
    fn tablet_node(&self, addr: &str) -> Arc<dyn TabletNodeRpc>;
}

/// Control-path surface of the master.
#[async_trait]
pub trait MasterRpc: Send + Sync {
    async fn create_table(&self, request: CreateTableRequest) -> RpcResult<CreateTableResponse>;
    async fn update_table(&self, request: UpdateTableRequest) -> RpcResult<UpdateTableResponse>;
    async fn update_check(&self, request: UpdateCheckRequest) -> RpcResult<UpdateCheckResponse>;
    async fn delete_table(&self, request: SimpleTableRequest) -> RpcResult<SimpleTableResponse>;
    async fn disable_table(&self, request: SimpleTableRequest) -> RpcResult<SimpleTableResponse>;
    async fn enable_table(&self, request: SimpleTableRequest) -> RpcResult<SimpleTableResponse>;
    async fn operate_user(&self, request: OperateUserRequest) -> RpcResult<OperateUserResponse>;
    async fn show_tables(&self, request: ShowTablesRequest) -> RpcResult<ShowTablesResponse>;
    async fn show_tablet_nodes(
        &self,
        request: ShowTabletNodesRequest,
    ) -> RpcResult<ShowTabletNodesResponse>;
    async fn get_snapshot(&self, request: SnapshotRequest) -> RpcResult<SnapshotResponse>;
    async fn del_snapshot(&self, request: SnapshotRequest) -> RpcResult<SnapshotResponse>;
    async fn rollback(&self, request: SnapshotRequest) -> RpcResult<SnapshotResponse>;
    async fn cmd_ctrl(&self, request: CmdCtrlRequest) -> RpcResult<CmdCtrlResponse>;
    async fn rename_table(&self, request: RenameTableRequest) -> RpcResult<RenameTableResponse>;
}
