/**
 * SNAPSHOT DU REGISTRE - Document persisté dans state.json
 *
 * RÔLE : Forme sérialisée complète du registre (machines + étages + étage par défaut).
 * Normalisation au chargement et écriture atomique (fichier temporaire + rename).
 *
 * INVARIANT : le fichier sur disque est toujours un document complet ; une écriture
 * interrompue ne laisse jamais un state.json tronqué visible.
 */

use crate::models::{Floor, Machine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

fn default_floors() -> Vec<Floor> {
    vec![Floor::main()]
}

fn default_floor_id() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryState {
    #[serde(default)]
    pub machines: BTreeMap<String, Machine>,
    #[serde(default = "default_floors")]
    pub floors: Vec<Floor>,
    #[serde(default = "default_floor_id")]
    pub default_floor_id: String,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            machines: BTreeMap::new(),
            floors: default_floors(),
            default_floor_id: default_floor_id(),
        }
    }
}

impl RegistryState {
    /// Remet le document dans un état cohérent :
    /// - au moins un étage, étage par défaut existant
    /// - chaque machine rattachée à un étage (défaut sinon) et identifiée par sa clé
    /// - cartes dont le fichier a disparu oubliées
    pub fn normalize(&mut self) {
        if self.floors.is_empty() {
            self.floors = default_floors();
        }
        if !self.has_floor(&self.default_floor_id) {
            self.default_floor_id = self.floors[0].id.clone();
        }
        for floor in &mut self.floors {
            if floor.has_map() && !Path::new(&floor.map_file).exists() {
                floor.map_file.clear();
                floor.map_type.clear();
            }
        }
        let default_floor = self.default_floor_id.clone();
        for (key, machine) in &mut self.machines {
            if machine.id != *key {
                machine.id = key.clone();
            }
            if machine.floor_id.is_empty() {
                machine.floor_id = default_floor.clone();
            }
        }
    }

    pub fn has_floor(&self, floor_id: &str) -> bool {
        self.floors.iter().any(|f| f.id == floor_id)
    }

    /// Étage demandé, sinon l'étage par défaut, sinon le premier
    pub fn floor(&self, floor_id: Option<&str>) -> Option<&Floor> {
        let wanted = floor_id.filter(|id| !id.is_empty()).unwrap_or(&self.default_floor_id);
        self.floors
            .iter()
            .find(|f| f.id == wanted)
            .or_else(|| self.floors.first())
    }

    pub fn load(path: &Path) -> Result<Option<Self>, LoadError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let state = serde_json::from_str(&content)?;
        Ok(Some(state))
    }

    /// Sérialise puis remplace `path` atomiquement
    pub fn save(&self, path: &Path) -> Result<(), LoadError> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path, json.as_bytes())?;
        Ok(())
    }

    pub fn export(&self, at: time::OffsetDateTime) -> SnapshotExport {
        SnapshotExport {
            version: APP_VERSION.to_string(),
            export_timestamp: crate::models::format_timestamp(at),
            floors: self.floors.clone(),
            default_floor_id: self.default_floor_id.clone(),
            machines: self.machines.values().cloned().collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = Path::new(&tmp_name);

    let mut file = File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp, path)
}

/// Format d'export/import : machines en liste, horodatage d'export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotExport {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub export_timestamp: String,
    #[serde(default)]
    pub floors: Vec<Floor>,
    #[serde(default)]
    pub default_floor_id: String,
    #[serde(default)]
    pub machines: Vec<Machine>,
}
