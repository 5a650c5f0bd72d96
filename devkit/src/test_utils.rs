/*!
Test Harness pour le moteur Vigie

Facilite l'écriture de scénarios de bout en bout avec:
- Registre isolé dans un répertoire temporaire
- `Monitor` câblé sur les doublures (sondes scriptées, notifier enregistreur)
- Attentes sur les notifications et helpers d'attente
*/

use crate::clock_stub::ManualClock;
use crate::notifier_stub::RecordingNotifier;
use crate::probe_stub::ScriptedProber;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use time::OffsetDateTime;
use vigie_kernel::probes::{NetworkProber, Prober};
use vigie_kernel::{Machine, MachineSpec, Monitor, Registry};

pub struct TestHarness {
    pub monitor: Monitor,
    pub notifier: RecordingNotifier,
    pub prober: ScriptedProber,
    dir: TempDir,
    expected_notifications: Option<usize>,
}

impl TestHarness {
    /// Harness avec sondes scriptées
    pub fn new() -> Result<Self> {
        let prober = ScriptedProber::new();
        Self::build(prober.clone(), Arc::new(prober))
    }

    /// Harness avec les vraies sondes réseau (timeout court)
    pub fn with_network_prober(timeout_ms: u64) -> Result<Self> {
        let network = NetworkProber {
            timeout: Duration::from_millis(timeout_ms),
            grace: Duration::from_millis(timeout_ms),
        };
        Self::build(ScriptedProber::new(), Arc::new(network))
    }

    fn build(scripted: ScriptedProber, prober: Arc<dyn Prober>) -> Result<Self> {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("vigie_kernel=debug,vigie_devkit=debug")
            .try_init()
            .ok();

        let dir = TempDir::new()?;
        let registry = Arc::new(Registry::open(dir.path())?);
        let notifier = RecordingNotifier::new();
        let monitor = Monitor::new(registry, prober, Arc::new(notifier.clone()));

        Ok(Self {
            monitor,
            notifier,
            prober: scripted,
            dir,
            expected_notifications: None,
        })
    }

    /// Remplace l'horloge du `Monitor` par une horloge manuelle partant de `start`
    pub fn install_clock(&mut self, start: OffsetDateTime) -> ManualClock {
        let clock = ManualClock::new(start);
        self.monitor = self.monitor.clone().with_clock(Arc::new(clock.clone()));
        clock
    }

    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Rouvre le registre depuis le disque (vérifie la persistance)
    pub fn reopen_registry(&self) -> Result<Registry> {
        Ok(Registry::open(self.dir.path())?)
    }

    /// Enregistre sans vérification initiale (contrôle total de l'ordre des sondes)
    pub fn add_machine(&self, id: &str, address: &str) -> Result<Machine> {
        Ok(self.monitor.registry().register(MachineSpec {
            id: Some(id.to_string()),
            name: Some(format!("{id} station")),
            address: Some(address.to_string()),
            ..Default::default()
        })?)
    }

    pub fn add_tcp_machine(&self, id: &str, address: &str, port: u16) -> Result<Machine> {
        Ok(self.monitor.registry().register(MachineSpec {
            id: Some(id.to_string()),
            name: Some(format!("{id} service")),
            address: Some(address.to_string()),
            check: Some("tcp".to_string()),
            tcp_port: Some(port),
            ..Default::default()
        })?)
    }

    pub fn machine(&self, id: &str) -> Result<Machine> {
        self.monitor
            .machine(id)
            .ok_or_else(|| anyhow::anyhow!("machine not found: {id}"))
    }

    /// Attend qu'une condition sur la machine devienne vraie
    pub async fn wait_for_machine<F>(&self, id: &str, timeout_ms: u64, predicate: F) -> Result<Machine>
    where
        F: Fn(&Machine) -> bool,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(machine) = self.monitor.machine(id) {
                if predicate(&machine) {
                    return Ok(machine);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        anyhow::bail!("timeout waiting for condition on machine {id}");
    }

    /// Ajoute une attente : nombre exact de notifications à la vérification
    pub fn expect_notifications(&mut self, count: usize) -> &mut Self {
        self.expected_notifications = Some(count);
        self
    }

    /// Vérifie les attentes (laisse aux notifications détachées le temps d'arriver)
    pub async fn verify_expectations(&self) -> Result<()> {
        let Some(expected) = self.expected_notifications else {
            return Ok(());
        };
        self.notifier.wait_for_calls(expected, 1000).await;
        // laisse passer une éventuelle notification en trop
        tokio::time::sleep(Duration::from_millis(50)).await;

        let actual = self.notifier.count();
        if actual != expected {
            anyhow::bail!(
                "expected {expected} notifications, got {actual}: {:?}",
                self.notifier.calls()
            );
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.notifier.clear();
        self.expected_notifications = None;
    }
}
