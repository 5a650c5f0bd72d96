/*!
Horloge manuelle pour piloter le planificateur en test

Le temps n'avance que par `advance`/`set` ; chaque avance réveille les tâches
endormies dans `sleep_until`.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::Notify;
use vigie_kernel::Clock;

#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<OffsetDateTime>>,
    tick: Arc<Notify>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            tick: Arc::new(Notify::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
        self.tick.notify_waiters();
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock() = at;
        self.tick.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }

    async fn sleep_until(&self, target: OffsetDateTime) {
        loop {
            // enregistré avant le test : une avance concurrente ne peut pas être perdue
            let woken = self.tick.notified();
            if self.now() >= target {
                return;
            }
            woken.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn test_sleeper_wakes_on_advance() {
        let clock = ManualClock::new(datetime!(2025-03-07 10:00 UTC));
        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep_until(datetime!(2025-03-07 10:15 UTC)).await })
        };

        clock.advance(Duration::minutes(10));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::minutes(5));
        tokio::time::timeout(std::time::Duration::from_secs(1), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(clock.now(), datetime!(2025-03-07 10:15 UTC));
    }
}
