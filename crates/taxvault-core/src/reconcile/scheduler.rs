//! Periodic reconciliation.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::{ReconcileError, ReconcileOutcome, Reconciler};

/// Runs [`Reconciler::run`] for a fixed set of organisations on an
/// interval.
///
/// The first pass starts immediately. Runs execute on the blocking pool
/// because the store is synchronous.
#[derive(Debug, Clone)]
pub struct ReconcileScheduler {
    reconciler: Reconciler,
    org_ids: Vec<String>,
    interval: Duration,
}

impl ReconcileScheduler {
    /// Creates a scheduler.
    #[must_use]
    pub const fn new(reconciler: Reconciler, org_ids: Vec<String>, interval: Duration) -> Self {
        Self {
            reconciler,
            org_ids,
            interval,
        }
    }

    /// Reconciles every organisation once. A failure for one organisation
    /// does not stop the others.
    pub async fn run_once(&self) -> Vec<(String, Result<ReconcileOutcome, ReconcileError>)> {
        let mut results = Vec::with_capacity(self.org_ids.len());
        for org_id in &self.org_ids {
            let reconciler = self.reconciler.clone();
            let org = org_id.clone();
            let result = tokio::task::spawn_blocking(move || reconciler.run(&org))
                .await
                .map_err(ReconcileError::from)
                .and_then(|r| r);

            if let Err(e) = &result {
                error!(org_id = %org_id, error = %e, "reconciliation failed");
            }
            results.push((org_id.clone(), result));
        }
        results
    }

    /// Runs passes until `shutdown` becomes `true` or its sender is
    /// dropped. Returns the number of completed passes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut passes = 0u64;

        info!(
            orgs = self.org_ids.len(),
            interval_secs = self.interval.as_secs(),
            "reconciliation scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                    passes += 1;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(passes, "reconciliation scheduler stopped");
        passes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::designated::{AccountKind, DesignatedAccounts};
    use crate::ledger::LedgerStore;

    fn scheduler(interval: Duration) -> (ReconcileScheduler, Reconciler) {
        let store = LedgerStore::in_memory().unwrap();
        let accounts = DesignatedAccounts::with_sqlite_audit(store.clone());
        accounts
            .open_account("org-1", AccountKind::PaygwBuffer, "system")
            .unwrap();
        let reconciler = Reconciler::new(store);
        (
            ReconcileScheduler::new(
                reconciler.clone(),
                vec!["org-1".to_string(), "org-2".to_string()],
                interval,
            ),
            reconciler,
        )
    }

    #[tokio::test]
    async fn test_run_once_covers_every_org() {
        let (scheduler, reconciler) = scheduler(Duration::from_secs(3600));

        let results = scheduler.run_once().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(reconciler.snapshots("org-1", 10).unwrap().len(), 1);
        assert_eq!(reconciler.snapshots("org-2", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stops_on_shutdown_signal() {
        let (scheduler, reconciler) = scheduler(Duration::from_millis(20));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        tokio::time::sleep(Duration::from_millis(90)).await;
        tx.send(true).unwrap();

        let passes = handle.await.unwrap();
        assert!(passes >= 1);
        assert_eq!(
            reconciler.snapshots("org-1", 1000).unwrap().len() as u64,
            passes
        );
    }

    #[tokio::test]
    async fn test_stops_when_sender_dropped() {
        let (scheduler, _) = scheduler(Duration::from_secs(3600));
        let (tx, rx) = watch::channel(false);
        drop(tx);

        // First tick fires immediately, then the closed channel ends the loop.
        let passes = scheduler.run(rx).await;
        assert!(passes <= 1);
    }
}
