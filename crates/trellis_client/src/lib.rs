//! Client SDK for the trellis store.
//!
//! Reads, writes and scans route through a cached meta index: the meta cache
//! maps row keys to tablet locations, the batch engine groups tasks per
//! target server, and the task pool bounds every request with a deadline.
//! Range movement (`KeyNotInRange`) and transport faults recover locally via
//! meta refresh and bounded backoff; everything else surfaces to the caller
//! as an [`trellis_proto::error::ErrorCode`].

pub mod client;
pub mod cluster;
pub mod config;
pub mod cookie;
pub mod delay;
pub mod meta_cache;
pub mod router;
pub mod scanner;
pub mod table;
pub mod task;
#[cfg(test)]
pub(crate) mod testutil;

pub use client::Client;
pub use cluster::ClusterFinder;
pub use config::SdkConfig;
pub use scanner::{ResultStream, ScanDescriptor};
pub use table::{RowMutationRequest, RowReadRequest, Table};
pub use task::{MutationOutcome, ReadOutcome, ScanOutcome};

pub use trellis_proto::error::{ErrorCode, ErrorKind, SdkResult};
