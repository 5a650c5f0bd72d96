/*!
Notifier enregistreur pour tests sans webhook

Enregistre chaque transition annoncée par le moteur et permet d'attendre
l'arrivée des notifications (elles partent dans des tâches détachées).
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vigie_kernel::notifier::Notifier;
use vigie_kernel::{Machine, Status};

#[derive(Debug, Clone, PartialEq)]
pub struct NotifyCall {
    pub machine_id: String,
    pub name: String,
    pub old: Status,
    pub new: Status,
}

#[derive(Clone)]
pub struct RecordingNotifier {
    calls: Arc<Mutex<Vec<NotifyCall>>>,
    deliver: Arc<AtomicBool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            deliver: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simule un canal en panne : les appels sont enregistrés mais signalés non livrés
    pub fn set_failing(&self, failing: bool) {
        self.deliver.store(!failing, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<NotifyCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, machine_id: &str) -> Vec<NotifyCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.machine_id == machine_id)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Attend au moins `expected` appels ; false si le délai expire
    pub async fn wait_for_calls(&self, expected: usize, timeout_ms: u64) -> bool {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if self.count() >= expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tracing::warn!("[devkit] timeout waiting for {expected} notifications, got {}", self.count());
        self.count() >= expected
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, machine: &Machine, old: Status, new: Status) -> bool {
        self.calls.lock().push(NotifyCall {
            machine_id: machine.id.clone(),
            name: machine.name.clone(),
            old,
            new,
        });
        tracing::info!("[devkit] recorded {} {old} -> {new}", machine.id);
        self.deliver.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls() {
        let notifier = RecordingNotifier::new();
        let machine = Machine::new("pc-1", "10.0.0.1", time::OffsetDateTime::now_utc());

        assert!(notifier.notify(&machine, Status::Down, Status::Up).await);
        notifier.set_failing(true);
        assert!(!notifier.notify(&machine, Status::Up, Status::Down).await);

        assert!(notifier.wait_for_calls(2, 100).await);
        let calls = notifier.calls_for("pc-1");
        assert_eq!(calls[0].new, Status::Up);
        assert_eq!(calls[1].old, Status::Up);

        notifier.clear();
        assert_eq!(notifier.count(), 0);
        assert!(!notifier.wait_for_calls(1, 50).await);
    }
}
