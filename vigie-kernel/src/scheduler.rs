/**
 * PLANIFICATEUR - Balayages périodiques et déclenchements à la demande
 *
 * RÔLE : `Monitor` est la façade du moteur (registre + sondes + notifications + santé).
 * Le planificateur balaie toutes les machines à chaque quart d'heure UTC (:00, :15, :30, :45),
 * plus un balayage immédiat au démarrage. L'heure vient d'une `Clock` injectable.
 *
 * La première frontière est publiée avant le balayage initial : si celui-ci la
 * dépasse, le balayage planifié part dès qu'il se termine.
 *
 * FLUX D'UNE VÉRIFICATION :
 * 1. copie de la machine (verrou bref)
 * 2. sonde hors verrou, dans sa propre tâche (une panique reste confinée à cette machine)
 * 3. mise à jour registre (compteurs + snapshot + historique, sous verrou)
 * 4. si transition : notification détachée, après relâchement du verrou
 *
 * Un balayage est séquentiel ; l'échec d'une machine n'interrompt jamais les suivantes.
 */

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConf;
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{
    CheckReport, Floor, HistoryEntry, Machine, MachinePatch, MachineSpec, ProbeOutcome, SweepStats,
};
use crate::notifier::{self, Notifier};
use crate::probes::Prober;
use crate::registry::{ProbeUpdate, Registry, RegistryError};
use crate::state::SnapshotExport;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};

pub const SWEEP_PERIOD_SECS: i64 = 15 * 60;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("machine not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("probe task for {id} failed: {reason}")]
    ProbeTask { id: String, reason: String },
}

/// Prochaine frontière de quart d'heure UTC strictement après `now`
pub fn next_quarter_boundary(now: OffsetDateTime) -> OffsetDateTime {
    let next = (now.unix_timestamp().div_euclid(SWEEP_PERIOD_SECS) + 1) * SWEEP_PERIOD_SECS;
    OffsetDateTime::from_unix_timestamp(next).unwrap_or(now + Duration::seconds(SWEEP_PERIOD_SECS))
}

#[derive(Clone)]
pub struct Monitor {
    registry: Arc<Registry>,
    prober: Arc<dyn Prober>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    health: HealthTracker,
    next_sweep: Arc<Mutex<Option<OffsetDateTime>>>,
    conf: SchedulerConf,
}

impl Monitor {
    pub fn new(registry: Arc<Registry>, prober: Arc<dyn Prober>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            registry,
            prober,
            notifier,
            clock: Arc::new(SystemClock),
            health: HealthTracker::new(),
            next_sweep: Arc::new(Mutex::new(None)),
            conf: SchedulerConf::default(),
        }
    }

    pub fn with_scheduler_conf(mut self, conf: SchedulerConf) -> Self {
        self.conf = conf;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn health_tracker(&self) -> &HealthTracker {
        &self.health
    }

    /// Enregistre puis lance une première vérification en tâche de fond
    pub async fn register_machine(&self, spec: MachineSpec) -> Result<Machine, MonitorError> {
        let machine = self.registry.register(spec)?;
        let monitor = self.clone();
        let id = machine.id.clone();
        tokio::spawn(async move {
            if let Err(e) = monitor.check_machine(&id).await {
                warn!(machine_id = %id, "[scheduler] initial check failed: {e}");
            }
        });
        Ok(machine)
    }

    pub fn machine(&self, id: &str) -> Option<Machine> {
        self.registry.get(id)
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.registry.list()
    }

    pub fn update_machine(&self, id: &str, patch: MachinePatch) -> Result<Machine, MonitorError> {
        self.registry.update(id, patch).map_err(not_found)
    }

    pub fn delete_machine(&self, id: &str) -> Result<Machine, MonitorError> {
        self.registry.delete(id).map_err(not_found)
    }

    pub fn operational_machines(&self, floor_id: Option<&str>) -> Vec<Machine> {
        self.registry.list_operational(floor_id)
    }

    pub fn storage_machines(&self) -> Vec<Machine> {
        self.registry.list_storage()
    }

    pub fn floors(&self) -> Vec<Floor> {
        self.registry.floors()
    }

    pub fn export_snapshot(&self) -> SnapshotExport {
        self.registry.export()
    }

    pub fn import_snapshot(&self, doc: SnapshotExport) -> Result<usize, MonitorError> {
        Ok(self.registry.import(doc)?)
    }

    pub fn query_history(&self, id: &str, window: Duration) -> Vec<HistoryEntry> {
        self.registry.query_history(id, window)
    }

    pub fn health(&self) -> KernelHealth {
        self.health.get_health(&self.registry)
    }

    /// Prochain balayage planifié, toujours dans le futur
    pub fn next_scheduled_sweep(&self) -> OffsetDateTime {
        let now = self.clock.now();
        match *self.next_sweep.lock() {
            Some(next) if next > now => next,
            _ => next_quarter_boundary(now),
        }
    }

    /// Vérification immédiate d'une machine
    pub async fn check_now(&self, id: &str) -> Result<CheckReport, MonitorError> {
        self.check_machine(id)
            .await?
            .ok_or_else(|| MonitorError::NotFound(id.to_string()))
    }

    /// Balayage complet immédiat (séquentiel)
    pub async fn sweep_now(&self) -> SweepStats {
        let ids = self.registry.machine_ids();
        let mut stats = SweepStats::default();

        for id in ids {
            match self.check_machine(&id).await {
                Ok(Some(report)) if report.ok => stats.up += 1,
                Ok(Some(_)) => stats.down += 1,
                Ok(None) => debug!(machine_id = %id, "[scheduler] machine removed during sweep, skipped"),
                Err(e) => {
                    error!(machine_id = %id, "[scheduler] check failed: {e}");
                    stats.down += 1;
                }
            }
        }
        stats.total = stats.up + stats.down;

        self.health.record_sweep(self.clock.now());
        info!(
            up = stats.up,
            down = stats.down,
            total = stats.total,
            "[scheduler] sweep complete"
        );
        stats
    }

    /// `None` si la machine n'existe pas (ou plus) au moment de la mise à jour
    async fn check_machine(&self, id: &str) -> Result<Option<CheckReport>, MonitorError> {
        let Some(machine) = self.registry.get(id) else {
            return Ok(None);
        };

        let prober = Arc::clone(&self.prober);
        let outcome: ProbeOutcome = tokio::spawn(async move { prober.probe(&machine).await })
            .await
            .map_err(|e| MonitorError::ProbeTask {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        let Some(update) = self.registry.record_probe(id, &outcome)? else {
            return Ok(None);
        };
        let report = CheckReport {
            id: id.to_string(),
            ok: outcome.ok,
            rtt_ms: outcome.rtt_ms,
            status: update.machine.last_status,
            error: outcome.error,
        };
        self.announce(update);
        Ok(Some(report))
    }

    fn announce(&self, update: ProbeUpdate) {
        if !update.transitioned() {
            return;
        }
        let new = update.machine.last_status;
        info!(
            machine_id = %update.machine.id,
            "[scheduler] {} changed {} -> {}",
            update.machine.name,
            update.previous,
            new
        );
        notifier::dispatch(
            Arc::clone(&self.notifier),
            self.health.clone(),
            update.machine,
            update.previous,
            new,
        );
    }

    /// Démarre la boucle de balayage ; `None` si le planificateur est désactivé
    pub fn spawn_scheduler(&self) -> Option<JoinHandle<()>> {
        if !self.conf.enabled {
            info!("[scheduler] disabled by configuration");
            return None;
        }
        let monitor = self.clone();
        Some(tokio::spawn(async move { monitor.run().await }))
    }

    async fn run(self) {
        let mut next = self.publish_next(self.clock.now());

        if self.conf.initial_sweep {
            let stats = self.sweep_now().await;
            info!("[scheduler] initial sweep: {}/{} up", stats.up, stats.total);
        }

        loop {
            self.clock.sleep_until(next).await;
            self.sweep_now().await;

            let health = self.health();
            info!(
                machines = health.machines_tracked,
                up = health.machines_up,
                sweeps = health.sweeps_completed,
                notifications_sent = health.notifications_sent,
                "[scheduler] kernel health"
            );

            // jamais en arrière, même si l'horloge murale recule
            next = self.publish_next(self.clock.now().max(next));
        }
    }

    fn publish_next(&self, after: OffsetDateTime) -> OffsetDateTime {
        let next = next_quarter_boundary(after);
        *self.next_sweep.lock() = Some(next);
        info!("[scheduler] next sweep at {next}");
        next
    }
}

fn not_found(e: RegistryError) -> MonitorError {
    match e {
        RegistryError::NotFound(id) => MonitorError::NotFound(id),
        other => MonitorError::Registry(other),
    }
}
