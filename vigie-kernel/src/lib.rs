/**
 * VIGIE KERNEL - Moteur de surveillance de disponibilité d'un parc de machines
 *
 * MODULES :
 * - models    : machine, étage, résultat de sonde, entrée d'historique
 * - state     : snapshot persisté (state.json) + export/import
 * - registry  : registre verrouillé, routine de mise à jour après sonde, éditions validées
 * - history   : journal CSV append-only partitionné par jour UTC
 * - probes    : sondes icmp (ping système) et tcp
 * - notifier  : annonce des transitions (webhook)
 * - health    : compteurs de santé du moteur
 * - scheduler : façade `Monitor` + balayages au quart d'heure
 * - clock     : source de temps du planificateur (système ou pilotée)
 * - config    : vigie.yaml + surcharges d'environnement
 */

pub mod clock;
pub mod config;
pub mod health;
pub mod history;
pub mod models;
pub mod notifier;
pub mod probes;
pub mod registry;
pub mod scheduler;
pub mod state;

pub use clock::{Clock, SystemClock};
pub use config::KernelConfig;
pub use models::{Category, CheckKind, Machine, MachinePatch, MachineSpec, ProbeOutcome, Status};
pub use registry::{Registry, RegistryError};
pub use scheduler::{Monitor, MonitorError};
