// In crates/core-types/src/intent.rs

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{IntentRole, Symbol};

/// Deterministic idempotency key for a logical trade decision.
///
/// The same `(broker, symbol, role, signal_id)` tuple always produces the
/// same key, no matter how many times the run-loop re-evaluates the
/// decision or how often the process restarts. The ledger uses it as the
/// exactly-once gate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntentKey(String);

impl IntentKey {
    /// Derives the key as a pure function of the decision coordinates.
    ///
    /// Layout: sanitized broker/symbol/role fragments (kept for log
    /// greppability) followed by a truncated SHA-256 of the full tuple.
    pub fn derive(broker: &str, symbol: &Symbol, role: IntentRole, signal_id: &str) -> Self {
        let raw = format!("{}|{}|{}|{}", broker, symbol.0, role.as_str(), signal_id);
        let digest = hex::encode(Sha256::digest(raw.as_bytes()));

        let b = sanitize(broker, 6);
        let s = sanitize(&symbol.0, 10);
        let r = sanitize(role.as_str(), 6);
        IntentKey(format!("{}{}{}{}", b, s, r, &digest[..20]))
    }

    /// Wraps an externally supplied key (ledger reads, tests).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        IntentKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IntentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derives the signal identifier from the decision inputs: the symbol,
/// the bar timestamp, the strategy artifact version and the raw
/// probabilities. Two re-reads of the same artifact row yield the same
/// id; a new training run (new version) yields a fresh one.
pub fn derive_signal_id(
    symbol: &Symbol,
    bar_ts: &str,
    strategy_version: &str,
    p_long: &str,
    p_short: &str,
) -> String {
    let raw = format!(
        "{}|{}|{}|{}|{}",
        symbol.0, bar_ts, strategy_version, p_long, p_short
    );
    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    format!("{}-{}", symbol.0, &digest[..16])
}

fn sanitize(input: &str, max: usize) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(max)
        .collect()
}
