//! `MasterRpc` service adapter over [`MasterImpl`].
//!
//! The transport hosts this adapter; in tests the client facade talks to it
//! directly, which exercises the same request path.

use std::sync::Arc;

use async_trait::async_trait;

use trellis_proto::messages::*;
use trellis_proto::rpc::{MasterRpc, RpcResult};

use crate::master::MasterImpl;

#[derive(Clone)]
pub struct MasterService {
    master: Arc<MasterImpl>,
}

impl MasterService {
    pub fn new(master: Arc<MasterImpl>) -> Self {
        Self { master }
    }
}

#[async_trait]
impl MasterRpc for MasterService {
    async fn create_table(&self, request: CreateTableRequest) -> RpcResult<CreateTableResponse> {
        let status = self.master.create_table(&request).await;
        Ok(CreateTableResponse {
            sequence_id: request.sequence_id,
            status,
        })
    }

    async fn update_table(&self, request: UpdateTableRequest) -> RpcResult<UpdateTableResponse> {
        let status = self.master.update_table(&request).await;
        Ok(UpdateTableResponse {
            sequence_id: request.sequence_id,
            status,
        })
    }

    async fn update_check(&self, request: UpdateCheckRequest) -> RpcResult<UpdateCheckResponse> {
        let (status, done) = self.master.update_check(&request);
        Ok(UpdateCheckResponse {
            sequence_id: request.sequence_id,
            status,
            done,
        })
    }

    async fn delete_table(&self, request: SimpleTableRequest) -> RpcResult<SimpleTableResponse> {
        let status = self.master.delete_table(&request).await;
        Ok(SimpleTableResponse {
            sequence_id: request.sequence_id,
            status,
        })
    }

    async fn disable_table(&self, request: SimpleTableRequest) -> RpcResult<SimpleTableResponse> {
        let status = self.master.disable_table(&request).await;
        Ok(SimpleTableResponse {
            sequence_id: request.sequence_id,
            status,
        })
    }

    async fn enable_table(&self, request: SimpleTableRequest) -> RpcResult<SimpleTableResponse> {
        let status = self.master.enable_table(&request).await;
        Ok(SimpleTableResponse {
            sequence_id: request.sequence_id,
            status,
        })
    }

    async fn operate_user(&self, request: OperateUserRequest) -> RpcResult<OperateUserResponse> {
        let (status, user_info) = self.master.operate_user(&request).await;
        Ok(OperateUserResponse {
            sequence_id: request.sequence_id,
            status,
            user_info,
        })
    }

    async fn show_tables(&self, request: ShowTablesRequest) -> RpcResult<ShowTablesResponse> {
        Ok(self.master.show_tables(&request))
    }

    async fn show_tablet_nodes(
        &self,
        request: ShowTabletNodesRequest,
    ) -> RpcResult<ShowTabletNodesResponse> {
        Ok(self.master.show_tablet_nodes(&request))
    }

    async fn get_snapshot(&self, request: SnapshotRequest) -> RpcResult<SnapshotResponse> {
        let (status, snapshot_id) = self.master.get_snapshot(&request).await;
        Ok(SnapshotResponse {
            sequence_id: request.sequence_id,
            status,
            snapshot_id,
        })
    }

    async fn del_snapshot(&self, request: SnapshotRequest) -> RpcResult<SnapshotResponse> {
        let status = self.master.del_snapshot(&request).await;
        Ok(SnapshotResponse {
            sequence_id: request.sequence_id,
            status,
            snapshot_id: request.snapshot_id,
        })
    }

    async fn rollback(&self, request: SnapshotRequest) -> RpcResult<SnapshotResponse> {
        let status = self.master.rollback(&request).await;
        Ok(SnapshotResponse {
            sequence_id: request.sequence_id,
            status,
            snapshot_id: request.snapshot_id,
        })
    }

    async fn cmd_ctrl(&self, request: CmdCtrlRequest) -> RpcResult<CmdCtrlResponse> {
        Ok(self.master.cmd_ctrl(&request).await)
    }

    async fn rename_table(&self, request: RenameTableRequest) -> RpcResult<RenameTableResponse> {
        let status = self.master.rename_table(&request).await;
        Ok(RenameTableResponse {
            sequence_id: request.sequence_id,
            status,
        })
    }
}
