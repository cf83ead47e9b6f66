//! Registry adapters: master lock, root-tablet publication and node fencing.
//!
//! The registry is the authoritative fencing mechanism. A tablet server
//! lives exactly as long as its ephemeral node; the master fences a server
//! by creating its kick mark, and a fenced server self-exits through the
//! `on_fenced` hook.

use std::sync::Arc;

use trellis_proto::registry::{
    Registry, RegistryEvent, KICK_PATH, MASTER_NODE_PATH, ROOT_TABLET_NODE_PATH,
    SAFEMODE_NODE_PATH, TS_LIST_PATH,
};

/// Master-side registry surface.
pub struct MasterRegistryAdapter {
    registry: Arc<dyn Registry>,
}

impl MasterRegistryAdapter {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// Take the master lock; failure means another master is alive.
    pub async fn lock_master(&self, local_addr: &str) -> anyhow::Result<()> {
        self.registry
            .create_ephemeral(MASTER_NODE_PATH, local_addr.as_bytes())
            .await
    }

    /// Publish where the root (meta) tablet is served.
    pub async fn publish_root_tablet(&self, addr: &str) -> anyhow::Result<()> {
        self.registry
            .put(ROOT_TABLET_NODE_PATH, addr.as_bytes())
            .await
    }

    /// Mark or clear cluster-wide safe mode.
    pub async fn set_safemode_mark(&self, enabled: bool) -> anyhow::Result<()> {
        if enabled {
            self.registry.put(SAFEMODE_NODE_PATH, b"").await
        } else {
            self.registry.delete(SAFEMODE_NODE_PATH).await
        }
    }

    pub async fn safemode_marked(&self) -> anyhow::Result<bool> {
        self.registry.exists(SAFEMODE_NODE_PATH).await
    }

    /// Fence a tablet server by creating its kick mark.
    pub async fn kick_tablet_node(&self, session_id: &str) -> anyhow::Result<()> {
        self.registry
            .put(&format!("{KICK_PATH}/{session_id}"), b"")
            .await
    }

    /// Current `(session_id, addr)` list of registered tablet servers.
    pub async fn tablet_node_list(&self) -> anyhow::Result<Vec<(String, String)>> {
        Ok(self
            .registry
            .list_children(TS_LIST_PATH)
            .await?
            .into_iter()
            .map(|(name, value)| (name, String::from_utf8_lossy(&value).into_owned()))
            .collect())
    }
}

/// Tablet-server-side registry surface.
///
/// `register` creates the ephemeral serve node and arms two watches: one on
/// the serve node itself (deletion means the session died) and one on the
/// kick mark (creation means the master fenced us). Either fires `on_fenced`
/// exactly once; in production that hook exits the process.
pub struct TabletNodeRegistryAdapter {
    registry: Arc<dyn Registry>,
    session_id: String,
}

impl TabletNodeRegistryAdapter {
    pub fn new(registry: Arc<dyn Registry>, session_id: impl Into<String>) -> Self {
        Self {
            registry,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn register(
        &self,
        server_addr: &str,
        on_fenced: impl FnOnce() + Send + 'static,
    ) -> anyhow::Result<()> {
        let serve_path = format!("{TS_LIST_PATH}/{}", self.session_id);
        let kick_path = format!("{KICK_PATH}/{}", self.session_id);
        self.registry
            .create_ephemeral(&serve_path, server_addr.as_bytes())
            .await?;
        tracing::info!(session = %self.session_id, addr = server_addr, "serve node created");

        let mut self_watch = self.registry.watch(&serve_path).await?;
        let mut kick_watch = self.registry.watch(&kick_path).await?;
        if self.registry.exists(&kick_path).await? {
            tracing::warn!(session = %self.session_id, "kick mark already present");
            on_fenced();
            return Ok(());
        }

        let session = self.session_id.clone();
        tokio::spawn(async move {
            let mut on_fenced = Some(on_fenced);
            loop {
                tokio::select! {
                    changed = self_watch.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if matches!(*self_watch.borrow(), Some(RegistryEvent::Deleted)) {
                            tracing::error!(session = %session, "serve node deleted, fencing self");
                            if let Some(hook) = on_fenced.take() {
                                hook();
                            }
                            break;
                        }
                    }
                    changed = kick_watch.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if matches!(
                            *kick_watch.borrow(),
                            Some(RegistryEvent::Created) | Some(RegistryEvent::ValueChanged(_))
                        ) {
                            tracing::error!(session = %session, "kick mark created, fencing self");
                            if let Some(hook) = on_fenced.take() {
                                hook();
                            }
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    pub async fn unregister(&self) -> anyhow::Result<()> {
        self.registry
            .delete(&format!("{TS_LIST_PATH}/{}", self.session_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trellis_proto::registry::MemRegistry;

    #[tokio::test]
    async fn kick_mark_fences_the_node_once() {
        let registry = MemRegistry::new();
        let adapter = TabletNodeRegistryAdapter::new(registry.clone(), "sess-1#0");
        let fenced = Arc::new(AtomicUsize::new(0));
        let fenced2 = fenced.clone();
        adapter
            .register("10.0.0.1:7070", move || {
                fenced2.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        let master = MasterRegistryAdapter::new(registry.clone());
        let nodes = master.tablet_node_list().await.unwrap();
        assert_eq!(nodes, vec![("sess-1#0".to_string(), "10.0.0.1:7070".to_string())]);

        master.kick_tablet_node("sess-1#0").await.unwrap();
        // Deliver the watch on the spawned fencing task.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(fenced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_death_fences_the_node() {
        let registry = MemRegistry::new();
        let adapter = TabletNodeRegistryAdapter::new(registry.clone(), "sess-2#0");
        let fenced = Arc::new(AtomicUsize::new(0));
        let fenced2 = fenced.clone();
        adapter
            .register("10.0.0.2:7070", move || {
                fenced2.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        registry.kill_session();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(fenced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn master_lock_is_exclusive() {
        let registry = MemRegistry::new();
        let a = MasterRegistryAdapter::new(registry.clone());
        let b = MasterRegistryAdapter::new(registry.clone());
        a.lock_master("m1:8000").await.unwrap();
        assert!(b.lock_master("m2:8000").await.is_err());
    }
}
