//! Master-facing client facade: schema and admin operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use trellis_proto::error::{ErrorCode, SdkResult};
use trellis_proto::messages::*;
use trellis_proto::meta::{TableMeta, TabletMeta};
use trellis_proto::rpc::{MasterRpc, RpcFault, TabletNodeConnector};
use trellis_proto::schema::TableSchema;

use crate::cluster::ClusterFinder;
use crate::config::SdkConfig;
use crate::table::Table;

pub struct Client {
    master: Arc<dyn MasterRpc>,
    cluster: Arc<ClusterFinder>,
    connector: Arc<dyn TabletNodeConnector>,
    config: SdkConfig,
    user_token: String,
    sequence_id: AtomicU64,
}

fn fault_error(fault: RpcFault) -> ErrorCode {
    ErrorCode::system(format!("master rpc failed: {fault}"))
}

fn check(status: trellis_proto::status::StatusCode) -> SdkResult<()> {
    match ErrorCode::from_master_status(status) {
        None => Ok(()),
        Some(error) => Err(error),
    }
}

impl Client {
    pub fn new(
        master: Arc<dyn MasterRpc>,
        cluster: Arc<ClusterFinder>,
        connector: Arc<dyn TabletNodeConnector>,
        config: SdkConfig,
        user_token: impl Into<String>,
    ) -> Self {
        Self {
            master,
            cluster,
            connector,
            config,
            user_token: user_token.into(),
            sequence_id: AtomicU64::new(0),
        }
    }

    fn next_sequence_id(&self) -> u64 {
        self.sequence_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a table for data access.
    pub async fn open_table(&self, name: impl Into<String>) -> SdkResult<Table> {
        Table::open(
            name,
            self.config.clone(),
            self.cluster.clone(),
            self.connector.clone(),
        )
        .await
    }

    pub async fn create_table(
        &self,
        table_name: impl Into<String>,
        schema: TableSchema,
        delimiters: Vec<Vec<u8>>,
    ) -> SdkResult<()> {
        let request = CreateTableRequest {
            sequence_id: self.next_sequence_id(),
            table_name: table_name.into(),
            schema,
            delimiters,
            user_token: self.user_token.clone(),
        };
        let response = self.master.create_table(request).await.map_err(fault_error)?;
        check(response.status)
    }

    pub async fn update_table(
        &self,
        table_name: impl Into<String>,
        schema: TableSchema,
    ) -> SdkResult<()> {
        let request = UpdateTableRequest {
            sequence_id: self.next_sequence_id(),
            table_name: table_name.into(),
            schema,
            user_token: self.user_token.clone(),
        };
        let response = self.master.update_table(request).await.map_err(fault_error)?;
        check(response.status)
    }

    /// True when an online schema update has reached every tablet.
    pub async fn update_check(&self, table_name: impl Into<String>) -> SdkResult<bool> {
        let request = UpdateCheckRequest {
            sequence_id: self.next_sequence_id(),
            table_name: table_name.into(),
        };
        let response = self.master.update_check(request).await.map_err(fault_error)?;
        check(response.status)?;
        Ok(response.done)
    }

    async fn simple_table_op(
        &self,
        table_name: String,
        op: impl FnOnce(
            Arc<dyn MasterRpc>,
            SimpleTableRequest,
        ) -> futures_op::SimpleOpFuture,
    ) -> SdkResult<()> {
        let request = SimpleTableRequest {
            sequence_id: self.next_sequence_id(),
            table_name,
            user_token: self.user_token.clone(),
        };
        let response = op(self.master.clone(), request).await.map_err(fault_error)?;
        check(response.status)
    }

    pub async fn delete_table(&self, table_name: impl Into<String>) -> SdkResult<()> {
        self.simple_table_op(table_name.into(), |master, request| {
            Box::pin(async move { master.delete_table(request).await })
        })
        .await
    }

    pub async fn disable_table(&self, table_name: impl Into<String>) -> SdkResult<()> {
        self.simple_table_op(table_name.into(), |master, request| {
            Box::pin(async move { master.disable_table(request).await })
        })
        .await
    }

    pub async fn enable_table(&self, table_name: impl Into<String>) -> SdkResult<()> {
        self.simple_table_op(table_name.into(), |master, request| {
            Box::pin(async move { master.enable_table(request).await })
        })
        .await
    }

    async fn operate_user(
        &self,
        op_type: UserOperateType,
        user_info: UserInfo,
    ) -> SdkResult<Option<UserInfo>> {
        let request = OperateUserRequest {
            sequence_id: self.next_sequence_id(),
            op_type: Some(op_type),
            user_info,
            user_token: self.user_token.clone(),
        };
        let response = self.master.operate_user(request).await.map_err(fault_error)?;
        check(response.status)?;
        Ok(response.user_info)
    }

    pub async fn create_user(&self, user: &str, password: &str) -> SdkResult<()> {
        self.operate_user(
            UserOperateType::CreateUser,
            UserInfo {
                user_name: user.to_string(),
                token: password.to_string(),
                group_names: Vec::new(),
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn delete_user(&self, user: &str) -> SdkResult<()> {
        self.operate_user(
            UserOperateType::DeleteUser,
            UserInfo {
                user_name: user.to_string(),
                ..Default::default()
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn change_pwd(&self, user: &str, password: &str) -> SdkResult<()> {
        self.operate_user(
            UserOperateType::ChangePwd,
            UserInfo {
                user_name: user.to_string(),
                token: password.to_string(),
                group_names: Vec::new(),
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn show_user(&self, user: &str) -> SdkResult<Option<UserInfo>> {
        self.operate_user(
            UserOperateType::ShowUser,
            UserInfo {
                user_name: user.to_string(),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn add_user_to_group(&self, user: &str, group: &str) -> SdkResult<()> {
        self.operate_user(
            UserOperateType::AddToGroup,
            UserInfo {
                user_name: user.to_string(),
                token: String::new(),
                group_names: vec![group.to_string()],
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn delete_user_from_group(&self, user: &str, group: &str) -> SdkResult<()> {
        self.operate_user(
            UserOperateType::DeleteFromGroup,
            UserInfo {
                user_name: user.to_string(),
                token: String::new(),
                group_names: vec![group.to_string()],
            },
        )
        .await
        .map(|_| ())
    }

    /// List tables and their tablets, following the pagination cursor until
    /// the master reports no more entries.
    pub async fn show_tables(&self, brief: bool) -> SdkResult<(Vec<TableMeta>, Vec<TabletMeta>)> {
        let mut tables = Vec::new();
        let mut tablets = Vec::new();
        let mut start_table_name = String::new();
        let mut start_tablet_key = Vec::new();
        loop {
            let request = ShowTablesRequest {
                sequence_id: self.next_sequence_id(),
                start_table_name: start_table_name.clone(),
                start_tablet_key: start_tablet_key.clone(),
                max_table_num: self.config.show_max_num,
                max_tablet_num: self.config.show_max_num,
                brief,
                user_token: self.user_token.clone(),
            };
            let response = self.master.show_tables(request).await.map_err(fault_error)?;
            check(response.status)?;
            for table in &response.table_meta_list {
                if tables.last().map(|t: &TableMeta| &t.name) != Some(&table.name) {
                    tables.push(table.clone());
                }
            }
            let is_more = response.is_more;
            if let Some(last) = response.tablet_meta_list.last() {
                start_table_name = last.table_name.clone();
                start_tablet_key = last.key_range.key_end.clone();
            }
            tablets.extend(response.tablet_meta_list);
            if !is_more || start_tablet_key.is_empty() {
                return Ok((tables, tablets));
            }
        }
    }

    pub async fn show_tablet_nodes(&self, addr: &str, all: bool) -> SdkResult<Vec<TabletNodeInfo>> {
        let request = ShowTabletNodesRequest {
            sequence_id: self.next_sequence_id(),
            addr: addr.to_string(),
            is_showall: all,
        };
        let response = self
            .master
            .show_tablet_nodes(request)
            .await
            .map_err(fault_error)?;
        check(response.status)?;
        Ok(response.nodes)
    }

    pub async fn get_snapshot(&self, table_name: &str) -> SdkResult<u64> {
        let request = SnapshotRequest {
            sequence_id: self.next_sequence_id(),
            table_name: table_name.to_string(),
            user_token: self.user_token.clone(),
            ..Default::default()
        };
        let response = self.master.get_snapshot(request).await.map_err(fault_error)?;
        check(response.status)?;
        Ok(response.snapshot_id)
    }

    pub async fn del_snapshot(&self, table_name: &str, snapshot_id: u64) -> SdkResult<()> {
        let request = SnapshotRequest {
            sequence_id: self.next_sequence_id(),
            table_name: table_name.to_string(),
            snapshot_id,
            user_token: self.user_token.clone(),
            ..Default::default()
        };
        let response = self.master.del_snapshot(request).await.map_err(fault_error)?;
        check(response.status)
    }

    pub async fn rollback(
        &self,
        table_name: &str,
        snapshot_id: u64,
        rollback_name: &str,
    ) -> SdkResult<()> {
        let request = SnapshotRequest {
            sequence_id: self.next_sequence_id(),
            table_name: table_name.to_string(),
            snapshot_id,
            rollback_name: rollback_name.to_string(),
            user_token: self.user_token.clone(),
        };
        let response = self.master.rollback(request).await.map_err(fault_error)?;
        check(response.status)
    }

    pub async fn cmd_ctrl(&self, command: &str, args: Vec<String>) -> SdkResult<(bool, String)> {
        let request = CmdCtrlRequest {
            sequence_id: self.next_sequence_id(),
            command: command.to_string(),
            args,
            user_token: self.user_token.clone(),
        };
        let response = self.master.cmd_ctrl(request).await.map_err(fault_error)?;
        check(response.status)?;
        Ok((response.bool_result, response.str_result))
    }

    pub async fn rename_table(&self, old_name: &str, new_name: &str) -> SdkResult<()> {
        let request = RenameTableRequest {
            sequence_id: self.next_sequence_id(),
            old_table_name: old_name.to_string(),
            new_table_name: new_name.to_string(),
            user_token: self.user_token.clone(),
        };
        let response = self.master.rename_table(request).await.map_err(fault_error)?;
        check(response.status)
    }
}

mod futures_op {
    use trellis_proto::messages::SimpleTableResponse;
    use trellis_proto::rpc::RpcFault;

    pub type SimpleOpFuture = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<SimpleTableResponse, RpcFault>> + Send>,
    >;
}
