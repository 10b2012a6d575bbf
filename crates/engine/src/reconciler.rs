// In crates/engine/src/reconciler.rs

use chrono::Duration;
use core_types::OrderStatus;
use ledger::TradeLedger;
use protections::ProtectionsManager;
use router::ExecutionRouter;
use serde_json::json;

/// Startup reconciliation, run once before the first cycle.
///
/// A crash can leave reservations without a matching broker
/// acknowledgment. Each stale open record is re-verified against the
/// venue's order history: a found terminal order is recorded as such, a
/// missing order means the submit never landed and the reservation is
/// released as `rejected` (the retry policy then allows a fresh attempt).
/// Records the venue still reports as live are left alone.
pub async fn resolve_stale_reservations(
    router: &ExecutionRouter,
    ledger: &TradeLedger,
    older_than: Duration,
) -> anyhow::Result<usize> {
    let stale = ledger.stale_open(older_than)?;
    if stale.is_empty() {
        return Ok(0);
    }

    tracing::warn!(count = stale.len(), "Resolving stale ledger reservations against brokers.");
    let mut resolved = 0usize;

    for record in stale {
        let lookup = router
            .order_status(&record.symbol, record.order_id.as_deref(), Some(&record.key))
            .await;

        match lookup {
            Ok(Some(order)) if order.status.is_terminal() => {
                ledger.record_outcome(
                    &record.key,
                    order.status,
                    json!({
                        "price": order.price.to_string(),
                        "resolved_by": "startup_reconcile",
                    }),
                )?;
                tracing::info!(
                    key = %record.key,
                    symbol = %record.symbol,
                    status = order.status.as_str(),
                    "Stale reservation resolved from broker history."
                );
                resolved += 1;
            }
            Ok(Some(order)) => {
                // Still live on the venue; the normal confirmation path
                // will pick it up.
                tracing::info!(
                    key = %record.key,
                    symbol = %record.symbol,
                    status = order.status.as_str(),
                    "Stale reservation still live on the venue; leaving it."
                );
            }
            Ok(None) => {
                // The venue never saw it: the crash happened between the
                // reservation and the submit.
                ledger.record_outcome(
                    &record.key,
                    OrderStatus::Rejected,
                    json!({"reason": "stale_reservation_no_order"}),
                )?;
                tracing::warn!(
                    key = %record.key,
                    symbol = %record.symbol,
                    "Stale reservation had no matching broker order; released as rejected."
                );
                resolved += 1;
            }
            Err(e) => {
                tracing::warn!(
                    key = %record.key,
                    symbol = %record.symbol,
                    error = %e,
                    "Could not verify stale reservation; will retry next startup or cycle."
                );
            }
        }
    }
    Ok(resolved)
}

/// Warns about open positions that carry no protection entry (opened
/// manually, or state lost). Stop placement is left to the operator;
/// inventing stop prices here would trade on data we do not have.
pub async fn warn_unprotected_positions(
    router: &ExecutionRouter,
    protections: &ProtectionsManager,
) -> usize {
    let mut unprotected = 0usize;
    for position in router.positions(None).await {
        if protections.get(&position.symbol).is_none() {
            tracing::error!(
                symbol = %position.symbol,
                broker = %position.broker,
                quantity = %position.quantity,
                "Open position has NO protections."
            );
            unprotected += 1;
        }
    }
    unprotected
}
