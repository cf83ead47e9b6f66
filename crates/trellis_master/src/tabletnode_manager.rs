//! Tablet-node catalog: liveness, load and per-node aggregates.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use trellis_proto::messages::{TabletNodeInfo, TabletNodeStat};
use trellis_proto::unix_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Ready,
    Offline,
    WaitKick,
    OnKick,
}

struct NodeInner {
    status: NodeStatus,
    stat: TabletNodeStat,
    tablet_total: u32,
    query_fail_count: u32,
    update_time_ms: i64,
}

pub struct TabletNode {
    pub addr: String,
    pub uuid: String,
    inner: Mutex<NodeInner>,
}

impl TabletNode {
    fn new(addr: String, uuid: String) -> Arc<Self> {
        Arc::new(Self {
            addr,
            uuid,
            inner: Mutex::new(NodeInner {
                status: NodeStatus::Ready,
                stat: TabletNodeStat::default(),
                tablet_total: 0,
                query_fail_count: 0,
                update_time_ms: unix_time_ms(),
            }),
        })
    }

    pub fn status(&self) -> NodeStatus {
        self.inner.lock().unwrap().status
    }

    pub fn set_status(&self, status: NodeStatus) {
        self.inner.lock().unwrap().status = status;
    }

    pub fn data_size(&self) -> i64 {
        self.inner.lock().unwrap().stat.data_size
    }

    pub fn load(&self) -> i64 {
        self.inner.lock().unwrap().stat.load
    }

    pub fn tablet_total(&self) -> u32 {
        self.inner.lock().unwrap().tablet_total
    }

    pub fn onload_count(&self) -> u32 {
        self.inner.lock().unwrap().stat.tablet_onload
    }

    /// Fold one query response into the node aggregates.
    pub fn update_from_query(&self, stat: TabletNodeStat, tablet_total: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.stat = stat;
        inner.tablet_total = tablet_total;
        inner.query_fail_count = 0;
        inner.update_time_ms = unix_time_ms();
    }

    /// Count one failed query round; returns the new consecutive-failure
    /// count so the caller can decide on a kick.
    pub fn record_query_fail(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.query_fail_count += 1;
        inner.query_fail_count
    }

    pub fn to_info(&self) -> TabletNodeInfo {
        let inner = self.inner.lock().unwrap();
        TabletNodeInfo {
            addr: self.addr.clone(),
            uuid: self.uuid.clone(),
            status_label: format!("{:?}", inner.status),
            tablet_total: inner.tablet_total,
            load: inner.stat.load,
            data_size: inner.stat.data_size,
        }
    }
}

#[derive(Default)]
pub struct TabletNodeManager {
    nodes: Mutex<BTreeMap<String, Arc<TabletNode>>>,
}

impl TabletNodeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_node(&self, addr: &str, uuid: &str) -> Arc<TabletNode> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = TabletNode::new(addr.to_string(), uuid.to_string());
        nodes.insert(addr.to_string(), node.clone());
        tracing::info!(addr, uuid, "tablet node added");
        node
    }

    pub fn del_node(&self, addr: &str) -> Option<Arc<TabletNode>> {
        let node = self.nodes.lock().unwrap().remove(addr);
        if node.is_some() {
            tracing::info!(addr, "tablet node removed");
        }
        node
    }

    pub fn find_node(&self, addr: &str) -> Option<Arc<TabletNode>> {
        self.nodes.lock().unwrap().get(addr).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<TabletNode>> {
        self.nodes.lock().unwrap().values().cloned().collect()
    }

    pub fn ready_nodes(&self) -> Vec<Arc<TabletNode>> {
        self.nodes()
            .into_iter()
            .filter(|n| n.status() == NodeStatus::Ready)
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    /// Mean data size across ready nodes, the balance target.
    pub fn average_data_size(&self) -> f64 {
        let nodes = self.ready_nodes();
        if nodes.is_empty() {
            return 0.0;
        }
        nodes.iter().map(|n| n.data_size()).sum::<i64>() as f64 / nodes.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_success_resets_failure_streak() {
        let manager = TabletNodeManager::new();
        let node = manager.add_node("10.0.0.1:7070", "uuid-1");
        assert_eq!(node.record_query_fail(), 1);
        assert_eq!(node.record_query_fail(), 2);
        node.update_from_query(TabletNodeStat::default(), 3);
        assert_eq!(node.record_query_fail(), 1);
        assert_eq!(node.tablet_total(), 3);
    }

    #[test]
    fn average_size_covers_ready_nodes_only() {
        let manager = TabletNodeManager::new();
        let a = manager.add_node("a:1", "u1");
        let b = manager.add_node("b:1", "u2");
        a.update_from_query(
            TabletNodeStat {
                data_size: 100,
                ..Default::default()
            },
            1,
        );
        b.update_from_query(
            TabletNodeStat {
                data_size: 50,
                ..Default::default()
            },
            1,
        );
        assert_eq!(manager.average_data_size(), 75.0);
        b.set_status(NodeStatus::WaitKick);
        assert_eq!(manager.average_data_size(), 100.0);
    }
}
