//! Status taxonomy shared by every RPC surface.

use serde::{Deserialize, Serialize};

/// Per-request / per-row status carried in RPC responses.
///
/// The tablet-node and master sides share one status space; transport faults
/// are folded into this space by the client before any retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    KeyNotExist,
    KeyNotInRange,
    SnapshotNotExist,
    TxnFail,
    TabletNodeOk,
    TabletNodeIsBusy,
    ServerError,
    ClientError,
    ConnectError,
    RpcTimeout,
    RpcError,
    MasterOk,
    MasterNotInited,
    MasterIsSecondary,
    MasterIsReadonly,
    MasterIsRunning,
    MasterOnRestore,
    MasterOnWait,
    TableExist,
    TableNotExist,
    TableNotFound,
    TableStatusDisable,
    TableStatusEnable,
    TabletReady,
    TabletNotInit,
    InvalidArgument,
    NotPermission,
}

impl StatusCode {
    /// True for the statuses a healthy tablet node returns on success.
    pub fn is_node_ok(self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::TabletNodeOk)
    }

    /// True for transport-level faults that are retried with backoff.
    pub fn is_transport_fault(self) -> bool {
        matches!(
            self,
            StatusCode::ServerError
                | StatusCode::ClientError
                | StatusCode::ConnectError
                | StatusCode::RpcTimeout
                | StatusCode::RpcError
        )
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
