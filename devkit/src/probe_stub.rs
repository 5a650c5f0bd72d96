/*!
Sondes scriptées pour tests déterministes

Chaque machine a une file de résultats consommée à chaque sonde ; une fois la
file vide, le résultat par défaut s'applique.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use vigie_kernel::probes::Prober;
use vigie_kernel::{Machine, ProbeOutcome};

#[derive(Clone)]
pub struct ScriptedProber {
    scripts: Arc<Mutex<HashMap<String, VecDeque<ProbeOutcome>>>>,
    default: Arc<Mutex<ProbeOutcome>>,
    probed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProber {
    /// Par défaut toute machine est injoignable
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(HashMap::new())),
            default: Arc::new(Mutex::new(ProbeOutcome::down("unreachable"))),
            probed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, machine_id: &str, outcome: ProbeOutcome) -> &Self {
        self.scripts
            .lock()
            .entry(machine_id.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn push_many<I>(&self, machine_id: &str, outcomes: I) -> &Self
    where
        I: IntoIterator<Item = ProbeOutcome>,
    {
        self.scripts
            .lock()
            .entry(machine_id.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    pub fn set_default(&self, outcome: ProbeOutcome) {
        *self.default.lock() = outcome;
    }

    /// Ids sondés, dans l'ordre
    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().clone()
    }

    pub fn remaining(&self, machine_id: &str) -> usize {
        self.scripts.lock().get(machine_id).map_or(0, VecDeque::len)
    }
}

impl Default for ScriptedProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, machine: &Machine) -> ProbeOutcome {
        self.probed.lock().push(machine.id.clone());
        let scripted = self
            .scripts
            .lock()
            .get_mut(&machine.id)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| self.default.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_default() {
        let prober = ScriptedProber::new();
        prober.push("a", ProbeOutcome::up(4)).push("a", ProbeOutcome::down("timeout"));
        let machine = Machine::new("a", "10.0.0.1", time::OffsetDateTime::now_utc());

        assert!(prober.probe(&machine).await.ok);
        assert_eq!(prober.probe(&machine).await.error, "timeout");
        assert_eq!(prober.probe(&machine).await.error, "unreachable");

        prober.set_default(ProbeOutcome::up(1));
        assert!(prober.probe(&machine).await.ok);
        assert_eq!(prober.probed().len(), 4);
        assert_eq!(prober.remaining("a"), 0);
    }
}
