//! Table schema: raw-key flavor, locality groups and column families.

use serde::{Deserialize, Serialize};

/// Encoding of the raw row key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RawKeyType {
    #[default]
    Binary,
    GeneralKv,
    TtlKv,
}

/// Physical storage partition within a tablet. Each locality group maps to
/// one opaque per-LG store on the tablet node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalityGroupSchema {
    pub id: u32,
    pub name: String,
    pub compress: bool,
    pub use_memtable_on_leveldb: bool,
}

impl LocalityGroupSchema {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            compress: false,
            use_memtable_on_leveldb: false,
        }
    }
}

/// Logical column group bound to exactly one locality group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFamilySchema {
    pub name: String,
    pub locality_group: String,
    pub max_versions: u32,
    /// Time-to-live in seconds; 0 means keep forever.
    pub ttl_secs: i64,
}

impl ColumnFamilySchema {
    pub fn new(name: impl Into<String>, locality_group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locality_group: locality_group.into(),
            max_versions: 1,
            ttl_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TableSchema {
    pub raw_key: RawKeyType,
    pub locality_groups: Vec<LocalityGroupSchema>,
    pub column_families: Vec<ColumnFamilySchema>,
}

impl TableSchema {
    /// Single-LG schema with the given column families, the common case.
    pub fn with_families(families: &[&str]) -> Self {
        Self {
            raw_key: RawKeyType::Binary,
            locality_groups: vec![LocalityGroupSchema::new(0, "lg0")],
            column_families: families
                .iter()
                .map(|name| ColumnFamilySchema::new(*name, "lg0"))
                .collect(),
        }
    }

    pub fn locality_group_count(&self) -> usize {
        self.locality_groups.len().max(1)
    }

    pub fn find_family(&self, name: &str) -> Option<&ColumnFamilySchema> {
        self.column_families.iter().find(|cf| cf.name == name)
    }

    /// True when `new` differs from this schema only in column families.
    /// Column-family changes are legal online; locality-group changes are
    /// only legal while the table is disabled.
    pub fn is_cf_only_update(&self, new: &TableSchema) -> bool {
        self.raw_key == new.raw_key && self.locality_groups == new.locality_groups
    }
}
