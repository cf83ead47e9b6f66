//! Coordination-service seam.
//!
//! The registry is the authoritative fencing mechanism: a tablet server lives
//! exactly as long as its ephemeral node, and the master kicks a server by
//! creating its kick mark. RPC alone never fences.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

/// Well-known node paths inside the registry root.
pub const MASTER_NODE_PATH: &str = "/master-lock";
pub const ROOT_TABLET_NODE_PATH: &str = "/root_table";
pub const SAFEMODE_NODE_PATH: &str = "/safemode";
pub const TS_LIST_PATH: &str = "/ts";
pub const KICK_PATH: &str = "/kick";

/// Change notification for one watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Created,
    Deleted,
    ValueChanged(Vec<u8>),
}

/// Minimal coordination-service surface consumed by this workspace.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Create an ephemeral node bound to this session. Fails if it exists.
    async fn create_ephemeral(&self, path: &str, value: &[u8]) -> anyhow::Result<()>;
    /// Create a persistent node, overwriting any existing value.
    async fn put(&self, path: &str, value: &[u8]) -> anyhow::Result<()>;
    async fn read(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn delete(&self, path: &str) -> anyhow::Result<()>;
    async fn exists(&self, path: &str) -> anyhow::Result<bool>;
    /// Watch a path for create/delete/value changes. The returned receiver
    /// yields the latest event; watchers re-arm themselves.
    async fn watch(&self, path: &str) -> anyhow::Result<watch::Receiver<Option<RegistryEvent>>>;
    async fn list_children(&self, path: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>>;
}

/// In-process registry used by tests and single-process deployments.
///
/// Ephemeral semantics are approximated: `kill_session` drops every ephemeral
/// node at once, which is what failure-path tests need.
#[derive(Default)]
pub struct MemRegistry {
    inner: Mutex<MemRegistryInner>,
}

#[derive(Default)]
struct MemRegistryInner {
    nodes: BTreeMap<String, Vec<u8>>,
    ephemeral: Vec<String>,
    watchers: BTreeMap<String, Vec<watch::Sender<Option<RegistryEvent>>>>,
}

impl MemRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drop every ephemeral node, as a session expiry would.
    pub fn kill_session(&self) {
        let mut inner = self.inner.lock().unwrap();
        let paths = std::mem::take(&mut inner.ephemeral);
        for path in paths {
            inner.nodes.remove(&path);
            notify(&mut inner, &path, RegistryEvent::Deleted);
        }
    }
}

fn notify(inner: &mut MemRegistryInner, path: &str, event: RegistryEvent) {
    if let Some(senders) = inner.watchers.get_mut(path) {
        senders.retain(|tx| tx.send(Some(event.clone())).is_ok());
    }
}

#[async_trait]
impl Registry for MemRegistry {
    async fn create_ephemeral(&self, path: &str, value: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.nodes.contains_key(path) {
            anyhow::bail!("node already exists: {path}");
        }
        inner.nodes.insert(path.to_string(), value.to_vec());
        inner.ephemeral.push(path.to_string());
        notify(&mut inner, path, RegistryEvent::Created);
        Ok(())
    }

    async fn put(&self, path: &str, value: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let existed = inner.nodes.insert(path.to_string(), value.to_vec()).is_some();
        let event = if existed {
            RegistryEvent::ValueChanged(value.to_vec())
        } else {
            RegistryEvent::Created
        };
        notify(&mut inner, path, event);
        Ok(())
    }

    async fn read(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().unwrap().nodes.get(path).cloned())
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.remove(path);
        inner.ephemeral.retain(|p| p != path);
        notify(&mut inner, path, RegistryEvent::Deleted);
        Ok(())
    }

    async fn exists(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self.inner.lock().unwrap().nodes.contains_key(path))
    }

    async fn watch(&self, path: &str) -> anyhow::Result<watch::Receiver<Option<RegistryEvent>>> {
        let (tx, rx) = watch::channel(None);
        self.inner
            .lock()
            .unwrap()
            .watchers
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn list_children(&self, path: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_nodes_die_with_the_session() {
        let registry = MemRegistry::new();
        registry
            .create_ephemeral(&format!("{TS_LIST_PATH}/abc#0"), b"10.0.0.1:7070")
            .await
            .unwrap();
        registry.put(ROOT_TABLET_NODE_PATH, b"10.0.0.1:7070").await.unwrap();
        assert!(registry.exists(&format!("{TS_LIST_PATH}/abc#0")).await.unwrap());

        registry.kill_session();
        assert!(!registry.exists(&format!("{TS_LIST_PATH}/abc#0")).await.unwrap());
        // Persistent nodes survive the session.
        assert!(registry.exists(ROOT_TABLET_NODE_PATH).await.unwrap());
    }

    #[tokio::test]
    async fn watch_sees_kick_mark_creation() {
        let registry = MemRegistry::new();
        let kick_path = format!("{KICK_PATH}/abc#0");
        let mut rx = registry.watch(&kick_path).await.unwrap();
        registry.put(&kick_path, b"").await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(RegistryEvent::Created));
    }

    #[tokio::test]
    async fn children_listing_is_flat() {
        let registry = MemRegistry::new();
        registry.put("/ts/a", b"1").await.unwrap();
        registry.put("/ts/b", b"2").await.unwrap();
        registry.put("/ts/b/nested", b"3").await.unwrap();
        let children = registry.list_children("/ts").await.unwrap();
        let names: Vec<_> = children.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
