//! Background reconciler: resolves payments parked in `monitoring` and
//! reclaims idle dispatcher state.

use std::sync::Arc;
use std::time::Duration;

use crate::chain::ChainClient;
use crate::dispatcher::SettlementDispatcher;

/// Spawn the periodic reconciliation sweep. Each tick resolves stale
/// monitored payments against the chain and purges idle locks and memo
/// entries. Runs for the life of the process.
pub fn start_reconciler<C>(dispatcher: Arc<SettlementDispatcher<C>>, interval_secs: u64)
where
    C: ChainClient + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        // First tick fires immediately; skip it so startup is quiet.
        interval.tick().await;
        loop {
            interval.tick().await;
            match dispatcher.reconcile_once().await {
                Ok(0) => {}
                Ok(resolved) => {
                    tracing::info!(resolved, "reconciliation sweep resolved parked payments");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reconciliation sweep failed");
                }
            }
            dispatcher.purge_idle_state();
        }
    });
}
