//! Meta-table records and their row encoding.
//!
//! The meta table is a single system table whose rows encode either a table
//! descriptor (`'@' + table_name`) or a tablet descriptor
//! (`table_name ++ 0x00 ++ key_start`). Lexicographic ordering colocates a
//! table's descriptor row with its tablet rows.

use serde::{Deserialize, Serialize};

use crate::schema::TableSchema;

/// Row-key range `[key_start, key_end)`; an empty `key_end` means +inf.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyRange {
    pub key_start: Vec<u8>,
    pub key_end: Vec<u8>,
}

impl KeyRange {
    pub fn new(key_start: impl Into<Vec<u8>>, key_end: impl Into<Vec<u8>>) -> Self {
        Self {
            key_start: key_start.into(),
            key_end: key_end.into(),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.key_start.as_slice() && (self.key_end.is_empty() || key < self.key_end.as_slice())
    }
}

/// Master-side tablet lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TabletStatus {
    #[default]
    NotInit,
    WaitLoad,
    OnLoad,
    LoadFail,
    Ready,
    OnSplit,
    OnMerge,
    UnLoading,
    UnLoadFail,
    OnCompact,
    OffLine,
    Deleted,
}

impl std::fmt::Display for TabletStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompactStatus {
    #[default]
    NotCompact,
    OnCompact,
    Compacted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TableStatus {
    #[default]
    Enable,
    Disable,
    Deleted,
}

/// Point-in-time load sample reported by a tablet node for one tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TabletCounter {
    pub read_rows: i64,
    pub write_rows: i64,
    pub scan_rows: i64,
    pub read_size: i64,
    pub write_size: i64,
    pub scan_size: i64,
    pub is_on_busy: bool,
}

impl TabletCounter {
    /// Combined read/write/scan row rate used as the tablet's qps signal.
    pub fn qps(&self) -> i64 {
        self.read_rows + self.write_rows + self.scan_rows
    }
}

/// Durable descriptor of one tablet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TabletMeta {
    pub table_name: String,
    pub key_range: KeyRange,
    /// Numeric directory under the table path, e.g. `tablet00000003`.
    pub path: String,
    pub server_addr: String,
    pub status: TabletStatus,
    pub data_size: i64,
    pub compact_status: CompactStatus,
    pub snapshots: Vec<u64>,
}

/// Durable descriptor of one table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableMeta {
    /// Internal, unique name. All meta rows key on this.
    pub name: String,
    /// User-visible alias; equals `name` unless renamed.
    pub alias: String,
    pub schema: TableSchema,
    pub status: TableStatus,
    pub create_time: i64,
    pub snapshots: Vec<u64>,
    pub rollback_names: Vec<String>,
}

/// One decoded meta-table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaRecord {
    Table(TableMeta),
    Tablet(TabletMeta),
}

/// Row key for a table-descriptor record: `'@' + internal name`.
pub fn make_table_meta_key(table_name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(table_name.len() + 1);
    key.push(b'@');
    key.extend_from_slice(table_name.as_bytes());
    key
}

/// Row key for a tablet record: `internal name ++ 0x00 ++ key_start`.
pub fn make_tablet_meta_key(table_name: &str, key_start: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(table_name.len() + 1 + key_start.len());
    key.extend_from_slice(table_name.as_bytes());
    key.push(0);
    key.extend_from_slice(key_start);
    key
}

/// Meta-table scan range covering all tablets of `table_name` whose tablet
/// keys fall in `[key_start, key_end)`. An empty `key_end` scans to the end
/// of the table's tablet region (`name ++ 0x01`).
pub fn meta_table_scan_range(
    table_name: &str,
    key_start: &[u8],
    key_end: &[u8],
) -> (Vec<u8>, Vec<u8>) {
    let start = make_tablet_meta_key(table_name, key_start);
    let end = if key_end.is_empty() {
        let mut end = Vec::with_capacity(table_name.len() + 1);
        end.extend_from_slice(table_name.as_bytes());
        end.push(1);
        end
    } else {
        make_tablet_meta_key(table_name, key_end)
    };
    (start, end)
}

/// Meta-table scan range covering the table-descriptor region.
pub fn table_descriptor_scan_range() -> (Vec<u8>, Vec<u8>) {
    (Vec::new(), b"@~".to_vec())
}

pub fn encode_table_meta(meta: &TableMeta) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let key = make_table_meta_key(&meta.name);
    let value = serde_json::to_vec(meta)?;
    Ok((key, value))
}

pub fn encode_tablet_meta(meta: &TabletMeta) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let key = make_tablet_meta_key(&meta.table_name, &meta.key_range.key_start);
    let value = serde_json::to_vec(meta)?;
    Ok((key, value))
}

/// Decode one meta-table row. The first key byte discriminates table rows
/// (`'@'`) from tablet rows; the value must round-trip against the key.
pub fn parse_meta_record(key: &[u8], value: &[u8]) -> anyhow::Result<MetaRecord> {
    if key.first() == Some(&b'@') {
        let meta: TableMeta = serde_json::from_slice(value)?;
        let expect = make_table_meta_key(&meta.name);
        anyhow::ensure!(expect == key, "table meta key mismatch");
        Ok(MetaRecord::Table(meta))
    } else {
        let meta: TabletMeta = serde_json::from_slice(value)?;
        let expect = make_tablet_meta_key(&meta.table_name, &meta.key_range.key_start);
        anyhow::ensure!(expect == key, "tablet meta key mismatch");
        Ok(MetaRecord::Tablet(meta))
    }
}

/// Counter cells encode as big-endian signed 64-bit.
pub fn encode_counter(counter: i64) -> Vec<u8> {
    counter.to_be_bytes().to_vec()
}

pub fn decode_counter(buf: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = buf.try_into().ok()?;
    Some(i64::from_be_bytes(bytes))
}

/// Legal master-side tablet status transitions. Every state setter validates
/// against this table; an illegal edge is rejected with the current status.
pub fn tablet_status_switch_ok(old: TabletStatus, new: TabletStatus) -> bool {
    use TabletStatus::*;
    matches!(
        (old, new),
        (NotInit, WaitLoad)
            | (NotInit, Deleted)
            | (WaitLoad, OnLoad)
            | (WaitLoad, OffLine)
            | (WaitLoad, Deleted)
            | (OnLoad, Ready)
            | (OnLoad, LoadFail)
            | (OnLoad, OffLine)
            | (OnLoad, WaitLoad)
            | (LoadFail, WaitLoad)
            | (LoadFail, OffLine)
            | (Ready, OnSplit)
            | (Ready, OnMerge)
            | (Ready, UnLoading)
            | (Ready, OnCompact)
            | (Ready, OffLine)
            | (OnCompact, Ready)
            | (OnCompact, OffLine)
            | (OnSplit, Ready)
            | (OnSplit, OffLine)
            | (OnSplit, Deleted)
            | (OnMerge, OffLine)
            | (OnMerge, Ready)
            | (OnMerge, Deleted)
            | (UnLoading, OffLine)
            | (UnLoading, UnLoadFail)
            | (UnLoading, WaitLoad)
            | (UnLoadFail, UnLoading)
            | (UnLoadFail, OffLine)
            | (OffLine, WaitLoad)
            | (OffLine, Deleted)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tablet(table: &str, start: &[u8], end: &[u8]) -> TabletMeta {
        TabletMeta {
            table_name: table.to_string(),
            key_range: KeyRange::new(start, end),
            path: "tablet00000001".to_string(),
            server_addr: "10.0.0.1:7070".to_string(),
            status: TabletStatus::Ready,
            data_size: 1 << 20,
            compact_status: CompactStatus::NotCompact,
            snapshots: Vec::new(),
        }
    }

    #[test]
    fn tablet_meta_round_trips_through_row_encoding() {
        let meta = tablet("orders", b"d", b"m");
        let (key, value) = encode_tablet_meta(&meta).unwrap();
        assert_eq!(key, make_tablet_meta_key("orders", b"d"));
        match parse_meta_record(&key, &value).unwrap() {
            MetaRecord::Tablet(parsed) => assert_eq!(parsed, meta),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn table_meta_round_trips_through_row_encoding() {
        let meta = TableMeta {
            name: "orders".to_string(),
            alias: "orders".to_string(),
            schema: TableSchema::with_families(&["cf"]),
            status: TableStatus::Enable,
            create_time: 1_700_000_000,
            snapshots: vec![7],
            rollback_names: vec!["rb1".to_string()],
        };
        let (key, value) = encode_table_meta(&meta).unwrap();
        assert_eq!(key[0], b'@');
        match parse_meta_record(&key, &value).unwrap() {
            MetaRecord::Table(parsed) => assert_eq!(parsed, meta),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn meta_rows_of_one_table_sort_contiguously() {
        let table_row = make_table_meta_key("orders");
        let (scan_start, scan_end) = meta_table_scan_range("orders", b"", b"");
        let t1 = make_tablet_meta_key("orders", b"");
        let t2 = make_tablet_meta_key("orders", b"zzz");
        assert!(table_row < t1, "descriptor region sorts before tablets");
        assert!(scan_start <= t1 && t1 < scan_end);
        assert!(scan_start <= t2 && t2 < scan_end);
        let other = make_tablet_meta_key("orders2", b"");
        assert!(other >= scan_end, "neighbour table is outside the range");
    }

    #[test]
    fn counter_coding_round_trips() {
        for value in [0i64, 1, -1, i64::MAX, i64::MIN, 123_456_789] {
            let encoded = encode_counter(value);
            assert_eq!(encoded.len(), 8);
            assert_eq!(decode_counter(&encoded), Some(value));
        }
        assert_eq!(decode_counter(b"short"), None);
    }

    #[test]
    fn status_switch_rejects_illegal_edges() {
        use TabletStatus::*;
        assert!(tablet_status_switch_ok(NotInit, WaitLoad));
        assert!(tablet_status_switch_ok(Ready, OnSplit));
        assert!(tablet_status_switch_ok(UnLoading, OffLine));
        assert!(!tablet_status_switch_ok(NotInit, Ready));
        assert!(!tablet_status_switch_ok(Deleted, WaitLoad));
        assert!(!tablet_status_switch_ok(OffLine, Ready));
    }
}
