//! Filesystem seam and on-disk naming helpers.
//!
//! Layout consumed (not defined) by this workspace:
//! `<prefix>/<table>/<tablet_path>/<lg_no>/<file_no>.sst`.

use std::collections::BTreeSet;
use std::sync::Mutex;

/// Minimal filesystem surface needed by the GC engine.
pub trait Env: Send + Sync {
    fn get_children(&self, path: &str) -> anyhow::Result<Vec<String>>;
    fn delete_file(&self, path: &str) -> anyhow::Result<()>;
    fn delete_dir(&self, path: &str) -> anyhow::Result<()>;
    fn is_exist(&self, path: &str) -> bool;
}

/// Production impl over the local (or locally mounted) filesystem.
pub struct LocalEnv;

impl Env for LocalEnv {
    fn get_children(&self, path: &str) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn delete_file(&self, path: &str) -> anyhow::Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn delete_dir(&self, path: &str) -> anyhow::Result<()> {
        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    fn is_exist(&self, path: &str) -> bool {
        std::path::Path::new(path).exists()
    }
}

/// In-memory filesystem for GC tests: a flat set of `/`-separated paths where
/// directories are implied by their children.
#[derive(Default)]
pub struct MemEnv {
    paths: Mutex<BTreeSet<String>>,
}

impl MemEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: &str) {
        self.paths.lock().unwrap().insert(path.to_string());
    }

    pub fn files(&self) -> Vec<String> {
        self.paths.lock().unwrap().iter().cloned().collect()
    }
}

impl Env for MemEnv {
    fn get_children(&self, path: &str) -> anyhow::Result<Vec<String>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let paths = self.paths.lock().unwrap();
        let mut names = BTreeSet::new();
        for p in paths.iter() {
            if let Some(rest) = p.strip_prefix(&prefix) {
                let first = rest.split('/').next().unwrap_or_default();
                if !first.is_empty() {
                    names.insert(first.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn delete_file(&self, path: &str) -> anyhow::Result<()> {
        let mut paths = self.paths.lock().unwrap();
        if !paths.remove(path) {
            anyhow::bail!("no such file: {path}");
        }
        Ok(())
    }

    fn delete_dir(&self, path: &str) -> anyhow::Result<()> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut paths = self.paths.lock().unwrap();
        paths.retain(|p| !p.starts_with(&prefix) && p != path);
        Ok(())
    }

    fn is_exist(&self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let paths = self.paths.lock().unwrap();
        paths.contains(path) || paths.iter().any(|p| p.starts_with(&prefix))
    }
}

/// Numeric tablet directory name, e.g. `tablet00000017`.
pub fn tablet_path_from_num(num: u64) -> String {
    format!("tablet{num:08}")
}

pub fn tablet_num_from_path(path: &str) -> Option<u64> {
    path.rsplit('/')
        .next()?
        .strip_prefix("tablet")?
        .parse()
        .ok()
}

/// SST file name within a locality-group directory.
pub fn sst_file_name(file_no: u64) -> String {
    format!("{file_no:08}.sst")
}

pub fn parse_sst_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".sst")?.parse().ok()
}

/// Full file numbers pack the owning tablet so an inherited file remains
/// attributable after splits: `(tablet_no << 32) | file_no`.
pub fn build_full_file_number(tablet_no: u64, file_no: u64) -> u64 {
    (tablet_no << 32) | (file_no & 0xffff_ffff)
}

pub fn parse_full_file_number(full: u64) -> (u64, u64) {
    (full >> 32, full & 0xffff_ffff)
}

/// Absolute path of one SST file.
pub fn sst_file_path(table_path: &str, tablet_no: u64, lg_no: u32, file_no: u64) -> String {
    format!(
        "{table_path}/{}/{lg_no}/{}",
        tablet_path_from_num(tablet_no),
        sst_file_name(file_no)
    )
}
