//! Pluggable placement scheduler.
//!
//! A scheduler ranks `(node, tablet)` pairs by one signal. The size variant
//! balances bytes, the load variant balances row rates; the master runs one
//! of them per rebalance round.

use std::sync::Arc;

use crate::tablet_manager::Tablet;
use crate::tabletnode_manager::TabletNode;

/// Node-side pending work above which a node stops receiving tablets.
const MAX_ONLOAD_PENDING: u32 = 5;

pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Signal value of one node; lower receives, higher donates.
    fn node_signal(&self, node: &Arc<TabletNode>) -> i64;

    /// Signal value of one tablet on its current node.
    fn tablet_signal(&self, tablet: &Arc<Tablet>) -> i64;

    /// Whether a donor node is far enough above the average to act.
    fn need_schedule(&self, node: &Arc<TabletNode>, average: f64) -> bool;
}

/// Least-loaded candidate that can still accept work.
pub fn find_best_node(
    scheduler: &dyn Scheduler,
    candidates: &[Arc<TabletNode>],
) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, node)| node.onload_count() < MAX_ONLOAD_PENDING)
        .min_by_key(|(_, node)| scheduler.node_signal(node))
        .map(|(index, _)| index)
}

/// Highest-signal tablet on the donor that is currently movable.
pub fn find_best_tablet(
    scheduler: &dyn Scheduler,
    tablets: &[Arc<Tablet>],
) -> Option<usize> {
    tablets
        .iter()
        .enumerate()
        .filter(|(_, tablet)| {
            tablet.status() == trellis_proto::meta::TabletStatus::Ready
        })
        .max_by_key(|(_, tablet)| scheduler.tablet_signal(tablet))
        .map(|(index, _)| index)
}

/// Balances bytes per node.
pub struct SizeScheduler;

impl Scheduler for SizeScheduler {
    fn name(&self) -> &'static str {
        "size"
    }

    fn node_signal(&self, node: &Arc<TabletNode>) -> i64 {
        node.data_size()
    }

    fn tablet_signal(&self, tablet: &Arc<Tablet>) -> i64 {
        tablet.data_size()
    }

    fn need_schedule(&self, node: &Arc<TabletNode>, average: f64) -> bool {
        // Donate only when at least 10% above the mean.
        node.data_size() as f64 > average * 1.1
    }
}

/// Balances combined read/write/scan row rates per node.
pub struct LoadScheduler;

impl Scheduler for LoadScheduler {
    fn name(&self) -> &'static str {
        "load"
    }

    fn node_signal(&self, node: &Arc<TabletNode>) -> i64 {
        node.load()
    }

    fn tablet_signal(&self, tablet: &Arc<Tablet>) -> i64 {
        tablet.qps()
    }

    fn need_schedule(&self, node: &Arc<TabletNode>, average: f64) -> bool {
        node.load() as f64 > average * 1.2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tabletnode_manager::TabletNodeManager;
    use trellis_proto::messages::TabletNodeStat;

    #[test]
    fn best_node_is_the_smallest_that_accepts_load() {
        let manager = TabletNodeManager::new();
        let small = manager.add_node("small:1", "u1");
        let large = manager.add_node("large:1", "u2");
        small.update_from_query(
            TabletNodeStat {
                data_size: 10,
                ..Default::default()
            },
            1,
        );
        large.update_from_query(
            TabletNodeStat {
                data_size: 100,
                ..Default::default()
            },
            1,
        );
        let candidates = vec![large.clone(), small.clone()];
        let index = find_best_node(&SizeScheduler, &candidates).unwrap();
        assert_eq!(candidates[index].addr, "small:1");

        // A node drowning in pending loads is skipped even if smallest.
        small.update_from_query(
            TabletNodeStat {
                data_size: 10,
                tablet_onload: 16,
                ..Default::default()
            },
            1,
        );
        let index = find_best_node(&SizeScheduler, &candidates).unwrap();
        assert_eq!(candidates[index].addr, "large:1");
    }

    #[test]
    fn need_schedule_requires_margin_over_average() {
        let manager = TabletNodeManager::new();
        let node = manager.add_node("a:1", "u1");
        node.update_from_query(
            TabletNodeStat {
                data_size: 105,
                ..Default::default()
            },
            1,
        );
        assert!(!SizeScheduler.need_schedule(&node, 100.0));
        node.update_from_query(
            TabletNodeStat {
                data_size: 150,
                ..Default::default()
            },
            1,
        );
        assert!(SizeScheduler.need_schedule(&node, 100.0));
    }
}
