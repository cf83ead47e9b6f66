//! Wire/schema types and collaborator interfaces shared by the trellis
//! client SDK and master.
//!
//! The store's external collaborators (RPC transport, distributed filesystem,
//! coordination service) are consumed through the traits defined here; the
//! concrete transports live outside this workspace.

pub mod env;
pub mod error;
pub mod logging;
pub mod messages;
pub mod meta;
pub mod registry;
pub mod rpc;
pub mod schema;
pub mod status;

use std::time::{SystemTime, UNIX_EPOCH};

pub use meta::{
    make_table_meta_key, make_tablet_meta_key, meta_table_scan_range, parse_meta_record,
    table_descriptor_scan_range,
};

/// Internal name of the system meta table.
pub const META_TABLE_NAME: &str = "meta_table";

/// Current wall clock in unix milliseconds.
pub fn unix_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as i64)
        .unwrap_or(0)
}

/// Current wall clock in unix seconds.
pub fn unix_time_sec() -> i64 {
    unix_time_ms() / 1000
}
