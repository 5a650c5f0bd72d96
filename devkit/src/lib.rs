/*!
# Vigie DevKit - Doublures et harness pour tester le moteur

Bibliothèque facilitant les tests du moteur de surveillance avec:
- Notifier enregistreur (aucun appel réseau, assertions sur les transitions)
- Sondes scriptées (résultats déterministes par machine)
- Horloge manuelle (balayages planifiés pilotés par le test)
- Harness complet : registre dans un répertoire temporaire + `Monitor` câblé
*/

pub mod clock_stub;
pub mod notifier_stub;
pub mod probe_stub;
pub mod test_utils;

pub use clock_stub::ManualClock;
pub use notifier_stub::{NotifyCall, RecordingNotifier};
pub use probe_stub::ScriptedProber;
pub use test_utils::TestHarness;
