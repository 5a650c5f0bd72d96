use crate::registry::Registry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub machines_tracked: u32,
    pub machines_up: u32,
    pub machines_down: u32,
    pub sweeps_completed: u64,
    #[serde(with = "crate::models::optional_timestamp", default)]
    pub last_sweep_at: Option<OffsetDateTime>,
    pub notifications_sent: u64,
    /// Non livrées : échec du canal ou canal désactivé
    pub notifications_failed: u64,
    pub memory_usage_mb: Option<f32>,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    sweeps: Arc<AtomicU64>,
    notifications_sent: Arc<AtomicU64>,
    notifications_failed: Arc<AtomicU64>,
    last_sweep: Arc<Mutex<Option<OffsetDateTime>>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sweeps: Arc::new(AtomicU64::new(0)),
            notifications_sent: Arc::new(AtomicU64::new(0)),
            notifications_failed: Arc::new(AtomicU64::new(0)),
            last_sweep: Arc::new(Mutex::new(None)),
        }
    }

    pub fn record_sweep(&self, at: OffsetDateTime) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        *self.last_sweep.lock() = Some(at);
    }

    pub fn record_notification(&self, delivered: bool) {
        let counter = if delivered { &self.notifications_sent } else { &self.notifications_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// (envoyées, non livrées)
    pub fn notifications(&self) -> (u64, u64) {
        (
            self.notifications_sent.load(Ordering::Relaxed),
            self.notifications_failed.load(Ordering::Relaxed),
        )
    }

    pub fn sweeps_completed(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn get_health(&self, registry: &Registry) -> KernelHealth {
        let (up, down) = registry.status_counts();
        let (sent, failed) = self.notifications();

        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            machines_tracked: (up + down) as u32,
            machines_up: up as u32,
            machines_down: down as u32,
            sweeps_completed: self.sweeps_completed(),
            last_sweep_at: *self.last_sweep.lock(),
            notifications_sent: sent,
            notifications_failed: failed,
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

/// RSS du processus (Linux uniquement)
fn get_memory_usage_mb() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let kb = status
            .lines()
            .find(|line| line.starts_with("VmRSS:"))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()?;
        Some(kb as f32 / 1024.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MachineSpec, ProbeOutcome};
    use tempfile::TempDir;
    use time::macros::datetime;

    #[test]
    fn test_health_counts() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        for id in ["a", "b"] {
            registry
                .register(MachineSpec { id: Some(id.into()), address: Some("10.0.0.1".into()), ..Default::default() })
                .unwrap();
        }
        registry.record_probe("a", &ProbeOutcome::up(1)).unwrap();

        let tracker = HealthTracker::new();
        let at = datetime!(2025-06-01 12:15 UTC);
        tracker.record_sweep(at);
        tracker.record_notification(true);
        tracker.record_notification(false);
        tracker.record_notification(true);

        let health = tracker.get_health(&registry);
        assert_eq!(health.machines_tracked, 2);
        assert_eq!(health.machines_up, 1);
        assert_eq!(health.machines_down, 1);
        assert_eq!(health.sweeps_completed, 1);
        assert_eq!(health.last_sweep_at, Some(at));
        assert_eq!(health.notifications_sent, 2);
        assert_eq!(health.notifications_failed, 1);
    }

    #[test]
    fn test_health_serializes() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        let json = serde_json::to_value(HealthTracker::new().get_health(&registry)).unwrap();
        assert_eq!(json["machines_tracked"], 0);
        assert_eq!(json["last_sweep_at"], "");
    }
}
