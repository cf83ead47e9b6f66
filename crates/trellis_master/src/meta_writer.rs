//! Durable meta-table writes.
//!
//! Every catalog change that must survive a master restart goes through the
//! `MetaWriter`: a batch of puts/deletes against the meta tablet that either
//! fully succeeds or leaves the caller to roll its in-memory change back.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use trellis_proto::messages::{Mutation, MutationOp, RowMutationSequence, WriteTabletRequest};
use trellis_proto::rpc::TabletNodeConnector;
use trellis_proto::status::StatusCode;
use trellis_proto::META_TABLE_NAME;

/// One meta-table mutation: a put (`value: Some`) or a row delete (`None`).
#[derive(Debug, Clone)]
pub struct MetaWriteRecord {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl MetaWriteRecord {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    pub fn delete(key: Vec<u8>) -> Self {
        Self { key, value: None }
    }
}

#[async_trait]
pub trait MetaWriter: Send + Sync {
    /// Apply the batch atomically from the caller's perspective: on any
    /// error the caller must treat the whole batch as not written.
    async fn write(&self, records: Vec<MetaWriteRecord>) -> Result<(), StatusCode>;
}

/// Production writer: one `WriteTablet` against the meta tablet.
pub struct TabletNodeMetaWriter {
    connector: Arc<dyn TabletNodeConnector>,
    meta_tablet_addr: std::sync::Mutex<String>,
}

impl TabletNodeMetaWriter {
    pub fn new(connector: Arc<dyn TabletNodeConnector>, meta_tablet_addr: String) -> Self {
        Self {
            connector,
            meta_tablet_addr: std::sync::Mutex::new(meta_tablet_addr),
        }
    }

    pub fn set_meta_tablet_addr(&self, addr: String) {
        *self.meta_tablet_addr.lock().unwrap() = addr;
    }

    pub fn meta_tablet_addr(&self) -> String {
        self.meta_tablet_addr.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetaWriter for TabletNodeMetaWriter {
    async fn write(&self, records: Vec<MetaWriteRecord>) -> Result<(), StatusCode> {
        let addr = self.meta_tablet_addr();
        if addr.is_empty() {
            return Err(StatusCode::ConnectError);
        }
        let row_list = records
            .into_iter()
            .map(|record| {
                let op = if record.value.is_some() {
                    MutationOp::Put
                } else {
                    MutationOp::DeleteRow
                };
                RowMutationSequence {
                    row_key: record.key,
                    mutations: vec![Mutation {
                        op,
                        family: String::new(),
                        qualifier: Vec::new(),
                        timestamp: -1,
                        value: Bytes::from(record.value.unwrap_or_default()),
                        ttl_secs: 0,
                    }],
                }
            })
            .collect::<Vec<_>>();
        let row_count = row_list.len();
        let request = WriteTabletRequest {
            sequence_id: 0,
            tablet_name: META_TABLE_NAME.to_string(),
            is_sync: true,
            row_list,
        };
        let response = self
            .connector
            .tablet_node(&addr)
            .write_tablet(request)
            .await
            .map_err(|fault| fault.status())?;
        if !response.status.is_node_ok() {
            return Err(response.status);
        }
        for status in response.row_status_list.iter().take(row_count) {
            if !status.is_node_ok() {
                return Err(*status);
            }
        }
        Ok(())
    }
}
