// In crates/engine/src/risk.rs

use std::collections::HashMap;

use app_config::RiskLimits;
use chrono::NaiveDate;
use num_traits::FromPrimitive;
use router::GlobalAccountState;
use rust_decimal::Decimal;

/// Start-of-day equity anchors, per broker, for the daily-drawdown guard.
/// Rolled at the first cycle of each UTC day.
#[derive(Debug, Default)]
pub struct DrawdownAnchors {
    date: Option<NaiveDate>,
    by_broker: HashMap<String, Decimal>,
    global: Decimal,
}

impl DrawdownAnchors {
    /// Captures fresh anchors when the UTC day has rolled over.
    pub fn roll(&mut self, today: NaiveDate, state: &GlobalAccountState) {
        if self.date == Some(today) {
            return;
        }
        self.date = Some(today);
        self.global = state.equity;
        self.by_broker = state
            .details
            .iter()
            .map(|(name, account)| (name.clone(), account.equity))
            .collect();
        tracing::info!(date = %today, equity = %state.equity, "Daily drawdown anchors rolled.");
    }

    /// Returns the reason string when the intraday drawdown limit is
    /// breached on any broker (or globally, as a fallback when a broker
    /// reports no detail). `max_dd` is a fraction of the morning equity.
    pub fn breached(&self, state: &GlobalAccountState, max_dd: f64) -> Option<String> {
        if max_dd <= 0.0 {
            return None;
        }
        let Some(limit) = Decimal::from_f64(max_dd) else {
            return None;
        };

        for (broker, account) in &state.details {
            let Some(anchor) = self.by_broker.get(broker).copied() else {
                continue;
            };
            if anchor <= Decimal::ZERO || account.equity <= Decimal::ZERO {
                continue;
            }
            let dd = (anchor - account.equity) / anchor;
            if dd >= limit {
                return Some(format!(
                    "daily drawdown {:.4} >= {:.4} on {}",
                    dd, limit, broker
                ));
            }
        }

        if self.global > Decimal::ZERO && state.equity > Decimal::ZERO {
            let dd = (self.global - state.equity) / self.global;
            if dd >= limit {
                return Some(format!("daily drawdown {:.4} >= {:.4} (global)", dd, limit));
            }
        }
        None
    }
}

/// A single cycle's view of the risk limits, applied to every candidate
/// entry before it can reach the router. The exit path is never gated:
/// closing risk is always allowed.
pub struct RiskGate<'a> {
    pub limits: &'a RiskLimits,
    pub open_positions: usize,
    pub drawdown_breach: Option<String>,
}

impl RiskGate<'_> {
    /// Checks an entry with the given notional. `Err` carries the reason
    /// recorded in the ledger under `RiskLimitExceeded`.
    pub fn check_entry(&self, notional: Decimal) -> Result<(), String> {
        if let Some(reason) = &self.drawdown_breach {
            return Err(reason.clone());
        }
        if self.limits.max_open_positions > 0
            && self.open_positions >= self.limits.max_open_positions as usize
        {
            return Err(format!(
                "max open positions reached ({}/{})",
                self.open_positions, self.limits.max_open_positions
            ));
        }
        if self.limits.max_position_notional > 0.0 {
            let cap = Decimal::from_f64(self.limits.max_position_notional).unwrap_or_default();
            if notional > cap {
                return Err(format!("notional {} exceeds cap {}", notional, cap));
            }
        }
        Ok(())
    }
}

/// Scales the per-trade risk fraction with signal confidence, clamped to
/// `[base, max]`.
pub fn scaled_risk(confidence: f64, base: f64, max: f64, threshold: f64) -> f64 {
    let scale = ((confidence - threshold) / (1.0 - threshold + 1e-6)).clamp(0.0, 1.0);
    (base + (max - base) * scale).clamp(base, max)
}

/// Fixed-fractional position sizing: risk `risk_fraction` of equity over
/// a stop distance of `atr * sl_mult`, optionally capped by notional.
/// Returns zero when the inputs cannot support a sane size.
pub fn position_size(
    equity: Decimal,
    atr: f64,
    risk_fraction: f64,
    sl_mult: f64,
    price: Decimal,
    max_notional: f64,
) -> Decimal {
    let atr = Decimal::from_f64(atr).unwrap_or_default();
    let sl_mult = Decimal::from_f64(sl_mult).unwrap_or_default();
    let risk = Decimal::from_f64(risk_fraction).unwrap_or_default();

    let stop_distance = atr * sl_mult;
    if stop_distance <= Decimal::ZERO || price <= Decimal::ZERO || equity <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let mut size = (equity * risk) / stop_distance;

    if max_notional > 0.0 {
        let cap = Decimal::from_f64(max_notional).unwrap_or_default();
        let notional = size * price;
        if notional > cap {
            size = cap / price;
        }
    }
    size
}
