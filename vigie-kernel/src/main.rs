/**
 * VIGIE KERNEL - Point d'entrée du démon de surveillance
 *
 * RÔLE : Bootstrap : .env, logs, config, registre, sondes, notifications, planificateur.
 * Tourne jusqu'à Ctrl-C puis journalise un dernier état de santé.
 */

use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vigie_kernel::config::load_config;
use vigie_kernel::notifier;
use vigie_kernel::probes::NetworkProber;
use vigie_kernel::{Monitor, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigie_kernel=info")),
        )
        .init();

    let cfg = load_config().await;
    info!("[kernel] starting {} (data dir {})", cfg.app_name, cfg.data_dir.display());

    let registry = Registry::open(&cfg.data_dir)
        .with_context(|| format!("failed to open registry in {}", cfg.data_dir.display()))?;
    let registry = Arc::new(registry);

    let prober = Arc::new(NetworkProber::from_config(&cfg.probe));
    let notifier = notifier::from_config(&cfg);

    let monitor = Monitor::new(registry, prober, notifier).with_scheduler_conf(cfg.scheduler);
    let scheduler = monitor.spawn_scheduler();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    let health = monitor.health();
    info!(
        uptime_seconds = health.uptime_seconds,
        machines = health.machines_tracked,
        sweeps = health.sweeps_completed,
        "[kernel] shutting down"
    );
    if let Some(handle) = scheduler {
        handle.abort();
    }
    Ok(())
}
