/**
 * HORLOGE - Source de temps du planificateur
 *
 * RÔLE : Le planificateur lit l'heure et attend les frontières de quart d'heure
 * à travers `Clock`, ce qui permet de le piloter en test avec une horloge manuelle.
 *
 * `SystemClock` : heure murale UTC pour l'alignement, attente par tranches sur le
 * minuteur monotone de tokio (l'horloge murale est relue à chaque réveil).
 */

use async_trait::async_trait;
use time::OffsetDateTime;

// Réveil au moins une fois par minute pour suivre l'horloge murale
const MAX_NAP: std::time::Duration = std::time::Duration::from_secs(60);

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    /// Rend la main dès que `now() >= target` (immédiatement si déjà passé)
    async fn sleep_until(&self, target: OffsetDateTime);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    async fn sleep_until(&self, target: OffsetDateTime) {
        loop {
            let remaining = target - self.now();
            if !remaining.is_positive() {
                return;
            }
            tokio::time::sleep(remaining.unsigned_abs().min(MAX_NAP)).await;
        }
    }
}
