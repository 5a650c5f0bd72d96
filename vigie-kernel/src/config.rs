use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    /// Préfixe des messages de notification
    pub app_name: String,
    /// Répertoire de state.json et logs/
    pub data_dir: PathBuf,
    pub probe: ProbeConf,
    pub notifier: NotifierConf,
    pub scheduler: SchedulerConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProbeConf {
    pub timeout_ms: u64,
    /// Marge ajoutée au timeout pour borner le sous-processus ping
    pub grace_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NotifierConf {
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct SchedulerConf {
    pub enabled: bool,
    pub initial_sweep: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            app_name: "Vigie".into(),
            data_dir: PathBuf::from("./data"),
            probe: ProbeConf::default(),
            notifier: NotifierConf::default(),
            scheduler: SchedulerConf::default(),
        }
    }
}

impl Default for ProbeConf {
    fn default() -> Self {
        Self { timeout_ms: 2000, grace_ms: 2000 }
    }
}

impl Default for NotifierConf {
    fn default() -> Self {
        Self { webhook_url: None, timeout_secs: 6 }
    }
}

impl Default for SchedulerConf {
    fn default() -> Self {
        Self { enabled: true, initial_sweep: true }
    }
}

/// YAML → config ; texte vide = défauts
pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

/// Surcharges d'environnement (VIGIE_DATA_DIR, APP_NAME, SLACK_WEBHOOK_URL, DISABLE_SCHEDULER)
pub fn apply_env_overrides<F>(cfg: &mut KernelConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup("VIGIE_DATA_DIR").filter(|v| !v.trim().is_empty()) {
        cfg.data_dir = PathBuf::from(dir);
    }
    if let Some(name) = lookup("APP_NAME").filter(|v| !v.trim().is_empty()) {
        cfg.app_name = name;
    }
    if let Some(url) = lookup("SLACK_WEBHOOK_URL") {
        let url = url.trim().to_string();
        cfg.notifier.webhook_url = if url.is_empty() { None } else { Some(url) };
    }
    if lookup("DISABLE_SCHEDULER").as_deref() == Some("1") {
        cfg.scheduler.enabled = false;
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("VIGIE_CONFIG").unwrap_or_else(|_| "vigie.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("[config] invalid {path}: {e}, using defaults");
            KernelConfig::default()
        })
    } else {
        info!("[config] no {path}, using defaults");
        KernelConfig::default()
    };
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.probe.timeout_ms, 2000);
        assert_eq!(cfg.notifier.timeout_secs, 6);
        assert!(cfg.scheduler.enabled);
        assert!(cfg.notifier.webhook_url.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let cfg = parse_config(
            "app_name: Lab\nprobe:\n  timeout_ms: 500\nscheduler:\n  initial_sweep: false\n",
        )
        .unwrap();
        assert_eq!(cfg.app_name, "Lab");
        assert_eq!(cfg.probe.timeout_ms, 500);
        assert_eq!(cfg.probe.grace_ms, 2000);
        assert!(cfg.scheduler.enabled);
        assert!(!cfg.scheduler.initial_sweep);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(parse_config("probe: [not, a, map]").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("VIGIE_DATA_DIR", "/srv/vigie"),
            ("APP_NAME", "Floor Watch"),
            ("SLACK_WEBHOOK_URL", "https://hooks.example.test/x"),
            ("DISABLE_SCHEDULER", "1"),
        ]
        .into_iter()
        .collect();

        let mut cfg = KernelConfig::default();
        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.data_dir, PathBuf::from("/srv/vigie"));
        assert_eq!(cfg.app_name, "Floor Watch");
        assert_eq!(cfg.notifier.webhook_url.as_deref(), Some("https://hooks.example.test/x"));
        assert!(!cfg.scheduler.enabled);
    }

    #[test]
    fn test_scheduler_stays_enabled_unless_flag_is_one() {
        let mut cfg = KernelConfig::default();
        apply_env_overrides(&mut cfg, |k| (k == "DISABLE_SCHEDULER").then(|| "0".to_string()));
        assert!(cfg.scheduler.enabled);
    }
}
