//! Cookie store: on-disk snapshot of the meta cache for warm starts.
//!
//! The cookie is advisory. A stale entry only costs one extra round trip:
//! the first error against it schedules a meta refresh that corrects the
//! cache. Files are named `<table>-<create_time>-<hex8(cluster_hash)>` with
//! a `.LOCK` sibling guarding concurrent dumps, and framed with a crc32
//! trailer so torn writes read as "no cookie".

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use trellis_proto::meta::TabletMeta;

use crate::meta_cache::{MetaNode, MetaNodeStatus};
use crate::table::TableCore;

#[derive(Serialize, Deserialize)]
struct TabletCookie {
    meta: TabletMeta,
    update_time_ms: i64,
}

#[derive(Serialize, Deserialize)]
struct SdkCookie {
    table_name: String,
    tablets: Vec<TabletCookie>,
}

pub(crate) fn cookie_file_name(table_name: &str, cluster_id: &str, create_time: i64) -> String {
    let hash = crc32fast::hash(cluster_id.as_bytes());
    format!("{table_name}-{create_time}-{hash:08x}")
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = payload.to_vec();
    framed.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    framed
}

fn unframe(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 4 {
        return None;
    }
    let (payload, trailer) = data.split_at(data.len() - 4);
    let stored = u32::from_le_bytes(trailer.try_into().ok()?);
    (crc32fast::hash(payload) == stored).then_some(payload)
}

impl TableCore {
    fn cookie_file_path(&self) -> PathBuf {
        self.config.cookie_dir.join(cookie_file_name(
            &self.name,
            self.cluster.cluster_id(),
            self.create_time(),
        ))
    }

    fn cookie_lock_path(&self) -> PathBuf {
        let mut path = self.cookie_file_path().into_os_string();
        path.push(".LOCK");
        PathBuf::from(path)
    }

    /// Seed the meta cache from the cookie file, if one is present and sane.
    pub(crate) fn restore_cookie(self: &Arc<Self>) {
        let path = self.cookie_file_path();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(_) => return,
        };
        let Some(payload) = unframe(&data) else {
            tracing::info!(table = %self.name, ?path, "cookie checksum mismatch, ignoring");
            return;
        };
        let cookie: SdkCookie = match serde_json::from_slice(payload) {
            Ok(cookie) => cookie,
            Err(error) => {
                tracing::info!(table = %self.name, %error, "undecodable cookie, ignoring");
                return;
            }
        };
        if cookie.table_name != self.name {
            tracing::info!(
                table = %self.name,
                cookie_table = %cookie.table_name,
                "cookie belongs to another table, ignoring"
            );
            return;
        }

        let mut state = self.meta.lock().unwrap();
        let mut restored = 0usize;
        for tablet in cookie.tablets {
            if tablet.meta.table_name.is_empty() || tablet.meta.path.is_empty() {
                continue;
            }
            let start = tablet.meta.key_range.key_start.clone();
            state.nodes.insert(
                start,
                MetaNode {
                    meta: tablet.meta,
                    status: MetaNodeStatus::Normal,
                    update_time_ms: tablet.update_time_ms,
                },
            );
            restored += 1;
        }
        tracing::info!(table = %self.name, restored, "cookie restored");
    }

    /// Write the current meta cache to disk. Skipped when another process
    /// holds the lock file.
    pub(crate) fn dump_cookie(self: &Arc<Self>) {
        let cookie = {
            let state = self.meta.lock().unwrap();
            SdkCookie {
                table_name: self.name.clone(),
                tablets: state
                    .nodes
                    .values()
                    .filter(|n| !n.meta.table_name.is_empty() && !n.meta.path.is_empty())
                    .map(|n| TabletCookie {
                        meta: n.meta.clone(),
                        update_time_ms: n.update_time_ms,
                    })
                    .collect(),
            }
        };
        if let Err(error) = std::fs::create_dir_all(&self.config.cookie_dir) {
            tracing::warn!(%error, "cannot create cookie dir");
            return;
        }
        let lock_path = self.cookie_lock_path();
        let lock = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path);
        if lock.is_err() {
            tracing::debug!(table = %self.name, "cookie lock held elsewhere, skipping dump");
            return;
        }

        let payload = match serde_json::to_vec(&cookie) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "cookie encode failed");
                let _ = std::fs::remove_file(&lock_path);
                return;
            }
        };
        let path = self.cookie_file_path();
        let tmp_path = path.with_extension("tmp");
        let write = std::fs::write(&tmp_path, frame(&payload))
            .and_then(|_| std::fs::rename(&tmp_path, &path));
        if let Err(error) = write {
            tracing::warn!(%error, ?path, "cookie dump failed");
        } else {
            tracing::debug!(table = %self.name, tablets = cookie.tablets.len(), "cookie dumped");
        }
        let _ = std::fs::remove_file(&lock_path);
    }

    /// Arm the periodic cookie dump. The timer holds a weak reference so a
    /// dropped table stops dumping.
    pub(crate) fn start_cookie_timer(self: &Arc<Self>) {
        schedule_cookie_dump(Arc::downgrade(self));
    }
}

fn schedule_cookie_dump(weak: Weak<TableCore>) {
    let Some(core) = weak.upgrade() else {
        return;
    };
    let interval = Duration::from_millis(core.config.cookie_update_interval_ms.max(1000));
    let delay = core.delay.clone();
    delay.schedule(interval, move || {
        if let Some(core) = weak.upgrade() {
            core.dump_cookie();
            schedule_cookie_dump(Arc::downgrade(&core));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_file_name_embeds_cluster_hash() {
        let name = cookie_file_name("orders", "zk-cluster-1", 1_700_000_000);
        assert!(name.starts_with("orders-1700000000-"));
        let suffix = name.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert_ne!(
            name,
            cookie_file_name("orders", "zk-cluster-2", 1_700_000_000)
        );
    }

    #[test]
    fn frame_rejects_corruption() {
        let framed = frame(b"payload");
        assert_eq!(unframe(&framed), Some(&b"payload"[..]));
        let mut corrupted = framed.clone();
        corrupted[0] ^= 0xff;
        assert_eq!(unframe(&corrupted), None);
        assert_eq!(unframe(b"xy"), None);
    }

    #[tokio::test]
    async fn restore_of_a_dump_is_a_subset_of_the_cache() {
        use crate::config::SdkConfig;
        use trellis_proto::meta::KeyRange;

        let dir = tempfile::tempdir().unwrap();
        let config = SdkConfig {
            cookie_enabled: true,
            cookie_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let core = crate::testutil::test_core(config.clone());
        {
            let mut state = core.meta.lock().unwrap();
            for (start, end, path) in [
                (b"a".to_vec(), b"m".to_vec(), "tablet00000001"),
                (b"m".to_vec(), Vec::new(), "tablet00000002"),
            ] {
                let meta = TabletMeta {
                    table_name: "orders".to_string(),
                    key_range: KeyRange::new(start.clone(), end),
                    path: path.to_string(),
                    server_addr: "10.0.0.1:7070".to_string(),
                    ..Default::default()
                };
                state.nodes.insert(
                    start,
                    MetaNode {
                        meta,
                        status: MetaNodeStatus::Normal,
                        update_time_ms: 42,
                    },
                );
            }
            // A probe entry without a path must not be persisted.
            state.nodes.insert(
                b"zz".to_vec(),
                MetaNode {
                    meta: TabletMeta::default(),
                    status: MetaNodeStatus::WaitUpdate,
                    update_time_ms: 0,
                },
            );
        }
        core.dump_cookie();

        let restored = crate::testutil::test_core(config);
        restored.restore_cookie();
        let state = restored.meta.lock().unwrap();
        assert_eq!(state.nodes.len(), 2, "probe entries are not invented");
        let node = &state.nodes[&b"a".to_vec()];
        assert_eq!(node.meta.path, "tablet00000001");
        assert_eq!(node.update_time_ms, 42);
        assert_eq!(node.status, MetaNodeStatus::Normal);
    }
}
