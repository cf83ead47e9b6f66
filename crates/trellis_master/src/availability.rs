//! Per-tablet availability tracking.
//!
//! Records when each tablet lost its server and publishes bucketed counters
//! for reporting. Advisory only: placement reads the catalog, not this.

use std::collections::HashMap;
use std::sync::Mutex;

use trellis_proto::unix_time_sec;

/// Buckets reported by `log_availability`, in seconds without a server.
const HALF_MINUTE: i64 = 30;
const ONE_MINUTE: i64 = 60;
const TEN_MINUTES: i64 = 600;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    pub not_available: usize,
    pub over_half_minute: usize,
    pub over_one_minute: usize,
    pub over_ten_minutes: usize,
}

#[derive(Default)]
pub struct TabletAvailability {
    /// Tablet path -> unix seconds when it became serverless.
    not_ready: Mutex<HashMap<String, i64>>,
}

impl TabletAvailability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a tablet as serverless. The first report wins so the window
    /// measures total time without a server.
    pub fn add_not_ready(&self, path: &str) {
        self.not_ready
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_insert_with(unix_time_sec);
    }

    /// Clear a tablet that is served again.
    pub fn erase_not_ready(&self, path: &str) {
        self.not_ready.lock().unwrap().remove(path);
    }

    pub fn snapshot(&self) -> AvailabilitySnapshot {
        let now = unix_time_sec();
        let not_ready = self.not_ready.lock().unwrap();
        let mut snapshot = AvailabilitySnapshot {
            not_available: not_ready.len(),
            ..Default::default()
        };
        for since in not_ready.values() {
            let window = now - since;
            if window >= HALF_MINUTE {
                snapshot.over_half_minute += 1;
            }
            if window >= ONE_MINUTE {
                snapshot.over_one_minute += 1;
            }
            if window >= TEN_MINUTES {
                snapshot.over_ten_minutes += 1;
            }
        }
        snapshot
    }

    /// Periodic availability report.
    pub fn log_availability(&self) {
        let snapshot = self.snapshot();
        if snapshot.not_available == 0 {
            tracing::debug!("all tablets available");
            return;
        }
        tracing::warn!(
            not_available = snapshot.not_available,
            over_half_minute = snapshot.over_half_minute,
            over_one_minute = snapshot.over_one_minute,
            over_ten_minutes = snapshot.over_ten_minutes,
            "tablets without a server"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_report_wins_and_erase_clears() {
        let availability = TabletAvailability::new();
        availability.add_not_ready("orders/tablet00000001");
        let first = *availability
            .not_ready
            .lock()
            .unwrap()
            .get("orders/tablet00000001")
            .unwrap();
        availability.add_not_ready("orders/tablet00000001");
        assert_eq!(
            *availability
                .not_ready
                .lock()
                .unwrap()
                .get("orders/tablet00000001")
                .unwrap(),
            first
        );
        assert_eq!(availability.snapshot().not_available, 1);

        availability.erase_not_ready("orders/tablet00000001");
        assert_eq!(availability.snapshot().not_available, 0);
    }

    #[test]
    fn buckets_count_long_outages() {
        let availability = TabletAvailability::new();
        availability
            .not_ready
            .lock()
            .unwrap()
            .insert("t/x".to_string(), unix_time_sec() - 400);
        let snapshot = availability.snapshot();
        assert_eq!(snapshot.over_half_minute, 1);
        assert_eq!(snapshot.over_one_minute, 1);
        assert_eq!(snapshot.over_ten_minutes, 0);

        availability
            .not_ready
            .lock()
            .unwrap()
            .insert("t/y".to_string(), unix_time_sec() - 700);
        let snapshot = availability.snapshot();
        assert_eq!(snapshot.over_one_minute, 2);
        assert_eq!(snapshot.over_ten_minutes, 1);
    }
}
