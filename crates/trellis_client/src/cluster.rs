//! Registry-backed cluster discovery for the SDK.
//!
//! One cache layer over the root tablet's registry node, with one forced
//! re-read on miss. The registry is also where the cluster id comes from,
//! which keys the cookie file name.

use std::sync::{Arc, Mutex};

use trellis_proto::registry::{Registry, ROOT_TABLET_NODE_PATH};

pub struct ClusterFinder {
    registry: Arc<dyn Registry>,
    cluster_id: String,
    cached_root: Mutex<String>,
}

impl ClusterFinder {
    pub fn new(registry: Arc<dyn Registry>, cluster_id: impl Into<String>) -> Self {
        Self {
            registry,
            cluster_id: cluster_id.into(),
            cached_root: Mutex::new(String::new()),
        }
    }

    /// Address of the tablet node serving the root tablet, or empty when the
    /// registry has no root node yet. `force_fresh` bypasses the cache.
    pub async fn root_table_addr(&self, force_fresh: bool) -> String {
        if !force_fresh {
            let cached = self.cached_root.lock().unwrap().clone();
            if !cached.is_empty() {
                return cached;
            }
        }
        match self.registry.read(ROOT_TABLET_NODE_PATH).await {
            Ok(Some(value)) => {
                let addr = String::from_utf8_lossy(&value).into_owned();
                *self.cached_root.lock().unwrap() = addr.clone();
                addr
            }
            Ok(None) => String::new(),
            Err(error) => {
                tracing::warn!(%error, "registry read of root tablet node failed");
                String::new()
            }
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }
}
