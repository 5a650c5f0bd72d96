/**
 * REGISTRE DES MACHINES - Source de vérité du statut de chaque machine
 *
 * RÔLE : Collection machines + étages protégée par un verrou unique, persistée dans
 * `state.json` à chaque mutation. Contient la routine de mise à jour après sonde
 * (compteurs, statut, snapshot, ligne d'historique) et les opérations d'édition validées.
 *
 * DURABILITÉ : une mutation n'est visible que si le snapshot (et l'historique pour une
 * sonde) a été écrit ; en cas d'échec d'écriture l'état mémoire est restauré et l'erreur
 * remonte à l'appelant.
 *
 * VERROU : parking_lot::Mutex synchrone, jamais tenu à travers un `.await`.
 */

use crate::history::{HistoryError, HistoryLog};
use crate::models::{
    Category, CheckKind, Floor, HistoryEntry, Machine, MachinePatch, MachineSpec, ProbeOutcome,
    Status,
};
use crate::state::{LoadError, RegistryState, SnapshotExport};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("machine not found: {0}")]
    NotFound(String),
    #[error("machine already exists: {0}")]
    AlreadyExists(String),
    #[error("unknown floor: {0}")]
    UnknownFloor(String),
    #[error("invalid category '{0}' (expected global, apple, dzb or brightsign)")]
    InvalidCategory(String),
    #[error("invalid check '{0}' (expected icmp or tcp)")]
    InvalidCheck(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("history error: {0}")]
    History(#[from] HistoryError),
}

impl From<LoadError> for RegistryError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::Io(e) => RegistryError::Io(e),
            LoadError::Json(e) => RegistryError::Json(e),
        }
    }
}

/// Résultat d'une mise à jour après sonde
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeUpdate {
    pub machine: Machine,
    pub previous: Status,
}

impl ProbeUpdate {
    pub fn transitioned(&self) -> bool {
        self.previous != self.machine.last_status
    }
}

pub struct Registry {
    inner: Mutex<RegistryState>,
    state_file: PathBuf,
    history: HistoryLog,
}

impl Registry {
    /// Ouvre (ou initialise) le registre dans `data_dir` : state.json + logs/
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, RegistryError> {
        let data_dir = data_dir.as_ref();
        let logs_dir = data_dir.join("logs");
        fs::create_dir_all(&logs_dir)?;
        let state_file = data_dir.join("state.json");

        let mut state = match RegistryState::load(&state_file) {
            Ok(Some(state)) => state,
            Ok(None) => {
                info!("[registry] no existing state at {}, starting fresh", state_file.display());
                RegistryState::default()
            }
            Err(e) => {
                warn!("[registry] unreadable state at {}: {e}, starting fresh", state_file.display());
                RegistryState::default()
            }
        };
        state.normalize();
        state.save(&state_file)?;

        info!(
            "[registry] loaded {} machines, {} floors from {}",
            state.machines.len(),
            state.floors.len(),
            state_file.display()
        );

        Ok(Self {
            inner: Mutex::new(state),
            state_file,
            history: HistoryLog::new(logs_dir),
        })
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn register(&self, spec: MachineSpec) -> Result<Machine, RegistryError> {
        self.register_at(spec, OffsetDateTime::now_utc())
    }

    pub fn register_at(&self, spec: MachineSpec, now: OffsetDateTime) -> Result<Machine, RegistryError> {
        let category = parse_category(spec.category.as_deref())?.unwrap_or_default();
        let check = parse_check(spec.check.as_deref())?.unwrap_or_default();
        let name = spec.name.unwrap_or_default();
        let address = spec.address.unwrap_or_default().trim().to_string();

        let mut state = self.inner.lock();

        let floor_id = match spec.floor_id.filter(|f| !f.trim().is_empty()) {
            Some(floor_id) if state.has_floor(&floor_id) => floor_id,
            Some(floor_id) => return Err(RegistryError::UnknownFloor(floor_id)),
            None => state.default_floor_id.clone(),
        };

        let id = match spec.id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => generate_id(&name, &address),
        };
        if state.machines.contains_key(&id) {
            return Err(RegistryError::AlreadyExists(id));
        }

        let mut machine = Machine::new(id.clone(), address, now);
        machine.name = name;
        machine.serial = spec.serial.unwrap_or_default();
        machine.os = spec.os.unwrap_or_default();
        machine.grid = spec.grid.unwrap_or_default();
        machine.notes = spec.notes.unwrap_or_default();
        machine.floor_id = floor_id;
        machine.category = category;
        machine.check = check;
        machine.tcp_port = spec.tcp_port.unwrap_or(0);
        machine.operational = spec.operational.unwrap_or(true);
        if let (Some(x), Some(y)) = (spec.x, spec.y) {
            machine.x = Some(x);
            machine.y = Some(y);
        }

        state.machines.insert(id.clone(), machine.clone());
        if let Err(e) = state.save(&self.state_file) {
            state.machines.remove(&id);
            return Err(e.into());
        }

        info!(machine_id = %id, "[registry] registered {} ({})", machine.name, machine.address);
        Ok(machine)
    }

    pub fn get(&self, id: &str) -> Option<Machine> {
        self.inner.lock().machines.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().machines.contains_key(id)
    }

    pub fn list(&self) -> Vec<Machine> {
        self.inner.lock().machines.values().cloned().collect()
    }

    /// Machines affichées sur la carte (opérationnelles), éventuellement d'un seul étage
    pub fn list_operational(&self, floor_id: Option<&str>) -> Vec<Machine> {
        let floor_id = floor_id.filter(|f| !f.is_empty());
        self.inner
            .lock()
            .machines
            .values()
            .filter(|m| m.operational)
            .filter(|m| floor_id.map_or(true, |f| m.floor_id == f))
            .cloned()
            .collect()
    }

    pub fn list_storage(&self) -> Vec<Machine> {
        self.inner
            .lock()
            .machines
            .values()
            .filter(|m| !m.operational)
            .cloned()
            .collect()
    }

    pub fn machine_ids(&self) -> Vec<String> {
        self.inner.lock().machines.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (up, down)
    pub fn status_counts(&self) -> (usize, usize) {
        let state = self.inner.lock();
        let up = state
            .machines
            .values()
            .filter(|m| m.last_status == Status::Up)
            .count();
        (up, state.machines.len() - up)
    }

    pub fn floors(&self) -> Vec<Floor> {
        self.inner.lock().floors.clone()
    }

    pub fn floor(&self, floor_id: Option<&str>) -> Option<Floor> {
        self.inner.lock().floor(floor_id).cloned()
    }

    pub fn default_floor_id(&self) -> String {
        self.inner.lock().default_floor_id.clone()
    }

    /// Modifie les champs descriptifs ; le statut et les compteurs ne sont jamais touchés ici
    pub fn update(&self, id: &str, patch: MachinePatch) -> Result<Machine, RegistryError> {
        let category = parse_category(patch.category.as_deref())?;
        let check = parse_check(patch.check.as_deref())?;

        let mut state = self.inner.lock();

        let floor_id = patch.floor_id.filter(|f| !f.trim().is_empty());
        if let Some(floor_id) = &floor_id {
            if !state.has_floor(floor_id) {
                return Err(RegistryError::UnknownFloor(floor_id.clone()));
            }
        }

        let Some(current) = state.machines.get_mut(id) else {
            return Err(RegistryError::NotFound(id.to_string()));
        };
        let before = current.clone();

        if patch.clear_pos {
            current.x = None;
            current.y = None;
        }
        if let (Some(x), Some(y)) = (patch.x, patch.y) {
            current.x = Some(x);
            current.y = Some(y);
        }
        if let Some(name) = patch.name {
            current.name = name;
        }
        if let Some(address) = patch.address {
            current.address = address.trim().to_string();
        }
        if let Some(serial) = patch.serial {
            current.serial = serial;
        }
        if let Some(os) = patch.os {
            current.os = os;
        }
        if let Some(grid) = patch.grid {
            current.grid = grid;
        }
        if let Some(notes) = patch.notes {
            current.notes = notes;
        }
        if let Some(check) = check {
            current.check = check;
        }
        if let Some(port) = patch.tcp_port {
            current.tcp_port = port;
        }
        if let Some(floor_id) = floor_id {
            current.floor_id = floor_id;
        }
        if let Some(category) = category {
            current.category = category;
        }
        if let Some(operational) = patch.operational {
            current.operational = operational;
        }
        let updated = current.clone();

        if let Err(e) = state.save(&self.state_file) {
            state.machines.insert(id.to_string(), before);
            return Err(e.into());
        }
        Ok(updated)
    }

    /// Suppression immédiate ; l'historique de la machine est conservé
    pub fn delete(&self, id: &str) -> Result<Machine, RegistryError> {
        let mut state = self.inner.lock();
        let Some(removed) = state.machines.remove(id) else {
            return Err(RegistryError::NotFound(id.to_string()));
        };
        if let Err(e) = state.save(&self.state_file) {
            state.machines.insert(id.to_string(), removed);
            return Err(e.into());
        }
        info!(machine_id = %id, "[registry] deleted {}", removed.name);
        Ok(removed)
    }

    pub fn record_probe(&self, id: &str, outcome: &ProbeOutcome) -> Result<Option<ProbeUpdate>, RegistryError> {
        self.record_probe_at(id, outcome, OffsetDateTime::now_utc())
    }

    /// Routine de mise à jour après sonde.
    /// Snapshot + ligne d'historique écrits avant relâchement du verrou ; `None` si l'id a disparu.
    pub fn record_probe_at(
        &self,
        id: &str,
        outcome: &ProbeOutcome,
        now: OffsetDateTime,
    ) -> Result<Option<ProbeUpdate>, RegistryError> {
        let mut state = self.inner.lock();
        let Some(machine) = state.machines.get_mut(id) else {
            return Ok(None);
        };
        let before = machine.clone();
        machine.apply_probe(outcome, now);
        let updated = machine.clone();

        if let Err(e) = state.save(&self.state_file) {
            state.machines.insert(id.to_string(), before);
            return Err(e.into());
        }

        let entry = HistoryEntry::record(&updated, outcome, now);
        if let Err(e) = self.history.append(&entry) {
            state.machines.insert(id.to_string(), before);
            if let Err(save_err) = state.save(&self.state_file) {
                error!(machine_id = %id, "[registry] failed to restore snapshot after history error: {save_err}");
            }
            return Err(e.into());
        }

        Ok(Some(ProbeUpdate {
            machine: updated,
            previous: before.last_status,
        }))
    }

    pub fn query_history(&self, id: &str, window: Duration) -> Vec<HistoryEntry> {
        self.history.query(id, window)
    }

    pub fn export(&self) -> SnapshotExport {
        self.inner.lock().export(OffsetDateTime::now_utc())
    }

    /// Remplace le registre par un export ; retourne le nombre de machines prises du document.
    /// Listes vides (machines, étages) et défaut vide : valeurs courantes conservées.
    pub fn import(&self, doc: SnapshotExport) -> Result<usize, RegistryError> {
        let mut state = self.inner.lock();

        let floors = if doc.floors.is_empty() { state.floors.clone() } else { doc.floors };
        let default_floor_id = if doc.default_floor_id.is_empty() {
            state.default_floor_id.clone()
        } else {
            doc.default_floor_id
        };

        let mut imported = RegistryState {
            machines: Default::default(),
            floors,
            default_floor_id,
        };
        let mut count = 0;
        if doc.machines.is_empty() {
            for (id, machine) in &state.machines {
                let mut machine = machine.clone();
                // étage disparu : retour à l'étage par défaut
                if !imported.has_floor(&machine.floor_id) {
                    machine.floor_id.clear();
                }
                imported.machines.insert(id.clone(), machine);
            }
        }
        for machine in doc.machines {
            if machine.id.trim().is_empty() {
                warn!("[registry] import: skipping machine without id");
                continue;
            }
            if !machine.floor_id.is_empty() && !imported.has_floor(&machine.floor_id) {
                return Err(RegistryError::UnknownFloor(machine.floor_id));
            }
            imported.machines.insert(machine.id.clone(), machine);
            count += 1;
        }
        imported.normalize();
        imported.save(&self.state_file)?;

        *state = imported;
        info!("[registry] imported {count} machines");
        Ok(count)
    }
}

fn parse_category(raw: Option<&str>) -> Result<Option<Category>, RegistryError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| RegistryError::InvalidCategory(raw.to_string())),
        None => Ok(None),
    }
}

fn parse_check(raw: Option<&str>) -> Result<Option<CheckKind>, RegistryError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| RegistryError::InvalidCheck(raw.to_string())),
        None => Ok(None),
    }
}

fn slug(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();
    if slug.is_empty() {
        "pc".to_string()
    } else {
        slug
    }
}

/// `<slug(nom)>-<adresse avec . → _>-<8 hex>`
pub fn generate_id(name: &str, address: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", slug(name), address.replace('.', "_"), &suffix[..8])
}
