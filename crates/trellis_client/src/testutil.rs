//! Shared fixtures for unit tests.

use std::sync::Arc;

use async_trait::async_trait;

use trellis_proto::messages::*;
use trellis_proto::registry::MemRegistry;
use trellis_proto::rpc::{RpcFault, RpcResult, TabletNodeConnector, TabletNodeRpc};

use crate::cluster::ClusterFinder;
use crate::config::SdkConfig;
use crate::table::TableCore;

/// Tablet node whose every RPC fails with a closed connection.
pub(crate) struct NullNode;

#[async_trait]
impl TabletNodeRpc for NullNode {
    async fn read_tablet(&self, _request: ReadTabletRequest) -> RpcResult<ReadTabletResponse> {
        Err(RpcFault::ConnectionClosed)
    }
    async fn write_tablet(&self, _request: WriteTabletRequest) -> RpcResult<WriteTabletResponse> {
        Err(RpcFault::ConnectionClosed)
    }
    async fn scan_tablet(&self, _request: ScanTabletRequest) -> RpcResult<ScanTabletResponse> {
        Err(RpcFault::ConnectionClosed)
    }
    async fn query(&self, _request: QueryRequest) -> RpcResult<QueryResponse> {
        Err(RpcFault::ConnectionClosed)
    }
    async fn load_tablet(&self, _request: LoadTabletRequest) -> RpcResult<LoadTabletResponse> {
        Err(RpcFault::ConnectionClosed)
    }
    async fn unload_tablet(&self, _request: UnloadTabletRequest) -> RpcResult<UnloadTabletResponse> {
        Err(RpcFault::ConnectionClosed)
    }
    async fn split_tablet(&self, _request: SplitTabletRequest) -> RpcResult<SplitTabletResponse> {
        Err(RpcFault::ConnectionClosed)
    }
}

pub(crate) struct NullConnector;

impl TabletNodeConnector for NullConnector {
    fn tablet_node(&self, _addr: &str) -> Arc<dyn TabletNodeRpc> {
        Arc::new(NullNode)
    }
}

pub(crate) fn test_core(config: SdkConfig) -> Arc<TableCore> {
    let cluster = Arc::new(ClusterFinder::new(MemRegistry::new(), "test-cluster"));
    TableCore::new(
        "orders".to_string(),
        config,
        cluster,
        Arc::new(NullConnector),
    )
}
