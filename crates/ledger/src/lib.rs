// In crates/ledger/src/lib.rs

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use core_types::{IntentKey, IntentRole, OrderStatus, Side, Symbol};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

pub mod error;

pub use error::{Error, Result};

/// A persisted intent outcome. Never deleted: the ledger is the audit
/// trail and the single source of truth for "has this already been done".
#[derive(Debug, Clone)]
pub struct LedgerRecord {
    pub key: IntentKey,
    pub broker: String,
    pub symbol: Symbol,
    pub role: String,
    pub side: Side,
    pub status: OrderStatus,
    pub order_id: Option<String>,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Metadata recorded alongside a reservation.
#[derive(Debug, Clone)]
pub struct ReserveMeta<'a> {
    pub broker: &'a str,
    pub symbol: &'a Symbol,
    pub role: IntentRole,
    pub side: Side,
    pub detail: Value,
}

/// The durable exactly-once gate for order submission.
///
/// Backed by SQLite in WAL mode with `synchronous=FULL`, so a committed
/// reservation survives a crash between the reserve and the broker
/// acknowledgment — restart reconciliation finds it via
/// [`TradeLedger::stale_open`].
pub struct TradeLedger {
    conn: Mutex<Connection>,
}

/// Fixed-width UTC timestamps so lexicographic comparison in SQL matches
/// chronological order.
fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl TradeLedger {
    /// Opens (or creates) the ledger at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(path)?;
        // WAL keeps readers cheap; FULL fsyncs every commit so a
        // reservation is on disk before any order leaves the process.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// An in-memory ledger for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS intents (
                key        TEXT PRIMARY KEY,
                broker     TEXT NOT NULL,
                symbol     TEXT NOT NULL,
                role       TEXT NOT NULL,
                side       TEXT NOT NULL,
                status     TEXT NOT NULL,
                order_id   TEXT,
                detail     TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_intents_status ON intents(status, created_at);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned ledger lock means a panic mid-write; continuing would
        // risk double submission, so propagate the panic.
        self.conn.lock().expect("ledger mutex poisoned")
    }

    /// Atomically records a `pending` reservation iff the key is free.
    ///
    /// Returns `false` when a live record (pending / submitted / filled)
    /// already exists — the caller must skip the intent. A prior
    /// `rejected` or `cancelled` record does not block: the reservation is
    /// re-armed in place with a bumped retry counter and a cleared order
    /// id, matching the retry policy for terminally-failed intents.
    pub fn reserve(&self, key: &IntentKey, meta: ReserveMeta<'_>) -> Result<bool> {
        let now = now_str();
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT status, detail FROM intents WHERE key = ?1",
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let reserved = match existing {
            Some((status, _)) if status.parse::<OrderStatus>().map(OrderStatus::blocks_reservation).unwrap_or(true) => false,
            Some((prev_status, prev_detail)) => {
                let mut detail: Value =
                    serde_json::from_str(&prev_detail).unwrap_or_else(|_| json!({}));
                merge_detail(&mut detail, &meta.detail);
                let retries = detail.get("_retries").and_then(Value::as_u64).unwrap_or(0) + 1;
                detail["_retries"] = json!(retries);
                detail["_prev_status"] = json!(prev_status);

                tx.execute(
                    "UPDATE intents SET status = ?1, order_id = NULL, detail = ?2, updated_at = ?3 WHERE key = ?4",
                    params![
                        OrderStatus::Pending.as_str(),
                        detail.to_string(),
                        now,
                        key.as_str()
                    ],
                )?;
                true
            }
            None => {
                tx.execute(
                    "INSERT INTO intents (key, broker, symbol, role, side, status, order_id, detail, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?8)",
                    params![
                        key.as_str(),
                        meta.broker,
                        meta.symbol.0,
                        meta.role.as_str(),
                        meta.side.as_str(),
                        OrderStatus::Pending.as_str(),
                        meta.detail.to_string(),
                        now
                    ],
                )?;
                true
            }
        };

        tx.commit()?;
        Ok(reserved)
    }

    /// Records the venue's acknowledgment: the order id, status
    /// `submitted`. Fails with [`Error::UnknownIntent`] when the key was
    /// never reserved.
    pub fn mark_submitted(&self, key: &IntentKey, order_id: &str, detail: Value) -> Result<()> {
        self.transition(key, OrderStatus::Submitted, Some(order_id), detail)
    }

    /// Transitions a reservation to a terminal (or `submitted`) status.
    pub fn record_outcome(&self, key: &IntentKey, status: OrderStatus, detail: Value) -> Result<()> {
        self.transition(key, status, None, detail)
    }

    fn transition(
        &self,
        key: &IntentKey,
        status: OrderStatus,
        order_id: Option<&str>,
        new_detail: Value,
    ) -> Result<()> {
        let now = now_str();
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let prev_detail: Option<String> = tx
            .query_row(
                "SELECT detail FROM intents WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(prev_detail) = prev_detail else {
            return Err(Error::UnknownIntent(key.as_str().to_string()));
        };

        // Merge the payloads so history survives; new keys win.
        let mut detail: Value = serde_json::from_str(&prev_detail).unwrap_or_else(|_| json!({}));
        merge_detail(&mut detail, &new_detail);
        detail["_event"] = json!(status.as_str());

        match order_id {
            Some(order_id) => {
                tx.execute(
                    "UPDATE intents SET status = ?1, order_id = ?2, detail = ?3, updated_at = ?4 WHERE key = ?5",
                    params![status.as_str(), order_id, detail.to_string(), now, key.as_str()],
                )?;
            }
            None => {
                tx.execute(
                    "UPDATE intents SET status = ?1, detail = ?2, updated_at = ?3 WHERE key = ?4",
                    params![status.as_str(), detail.to_string(), now, key.as_str()],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Point lookup by idempotency key.
    pub fn get(&self, key: &IntentKey) -> Result<Option<LedgerRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT key, broker, symbol, role, side, status, order_id, detail, created_at, updated_at
                 FROM intents WHERE key = ?1",
                params![key.as_str()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Non-terminal records (pending or submitted) older than
    /// `older_than`. Restart reconciliation re-verifies each against the
    /// broker's order history before retrying or rejecting it.
    pub fn stale_open(&self, older_than: Duration) -> Result<Vec<LedgerRecord>> {
        let cutoff = (Utc::now() - older_than).to_rfc3339_opts(SecondsFormat::Micros, true);
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT key, broker, symbol, role, side, status, order_id, detail, created_at, updated_at
             FROM intents
             WHERE status IN ('pending', 'submitted') AND updated_at <= ?1
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![cutoff], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Record counts grouped by status, for the operator status command.
    pub fn status_summary(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM intents GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Test helper: ages a record so staleness scans can see it.
    #[cfg(test)]
    fn backdate(&self, key: &IntentKey, by: Duration) {
        let past = (Utc::now() - by).to_rfc3339_opts(SecondsFormat::Micros, true);
        let conn = self.lock();
        conn.execute(
            "UPDATE intents SET created_at = ?1, updated_at = ?1 WHERE key = ?2",
            params![past, key.as_str()],
        )
        .unwrap();
    }
}

fn merge_detail(base: &mut Value, new: &Value) {
    match (base.as_object_mut(), new.as_object()) {
        (Some(base_map), Some(new_map)) => {
            for (k, v) in new_map {
                base_map.insert(k.clone(), v.clone());
            }
        }
        _ => {
            if !new.is_null() {
                *base = new.clone();
            }
        }
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<LedgerRecord> {
    let key: String = row.get(0)?;
    let symbol: String = row.get(2)?;
    let side: String = row.get(4)?;
    let status: String = row.get(5)?;
    let detail: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(LedgerRecord {
        key: IntentKey::from_raw(key),
        broker: row.get(1)?,
        symbol: Symbol(symbol),
        role: row.get(3)?,
        side: side.parse().unwrap_or(Side::Buy),
        status: status.parse().unwrap_or(OrderStatus::Pending),
        order_id: row.get(6)?,
        detail: serde_json::from_str(&detail).unwrap_or(Value::Null),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tag: &str) -> IntentKey {
        IntentKey::derive("sim", &Symbol("BTCUSDT".to_string()), IntentRole::Entry, tag)
    }

    fn meta<'a>(symbol: &'a Symbol) -> ReserveMeta<'a> {
        ReserveMeta {
            broker: "sim",
            symbol,
            role: IntentRole::Entry,
            side: Side::Buy,
            detail: json!({"qty": "0.01"}),
        }
    }

    #[test]
    fn second_reservation_is_refused() {
        let ledger = TradeLedger::in_memory().unwrap();
        let symbol = Symbol("BTCUSDT".to_string());
        let k = key("k1");

        assert!(ledger.reserve(&k, meta(&symbol)).unwrap());
        // The retry in the same cycle hits the gate.
        assert!(!ledger.reserve(&k, meta(&symbol)).unwrap());

        let record = ledger.get(&k).unwrap().unwrap();
        assert_eq!(record.status, OrderStatus::Pending);
    }

    #[test]
    fn rejected_intents_may_be_retried() {
        let ledger = TradeLedger::in_memory().unwrap();
        let symbol = Symbol("BTCUSDT".to_string());
        let k = key("k1");

        assert!(ledger.reserve(&k, meta(&symbol)).unwrap());
        ledger
            .record_outcome(&k, OrderStatus::Rejected, json!({"reason": "insufficient margin"}))
            .unwrap();

        // Terminal-negative outcome frees the key for another attempt.
        assert!(ledger.reserve(&k, meta(&symbol)).unwrap());
        let record = ledger.get(&k).unwrap().unwrap();
        assert_eq!(record.status, OrderStatus::Pending);
        assert_eq!(record.detail["_retries"], json!(1));
        assert!(record.order_id.is_none());
    }

    #[test]
    fn filled_intents_stay_blocked_forever() {
        let ledger = TradeLedger::in_memory().unwrap();
        let symbol = Symbol("BTCUSDT".to_string());
        let k = key("k1");

        assert!(ledger.reserve(&k, meta(&symbol)).unwrap());
        ledger.mark_submitted(&k, "ord-1", json!({})).unwrap();
        ledger
            .record_outcome(&k, OrderStatus::Filled, json!({"price": "65000"}))
            .unwrap();

        assert!(!ledger.reserve(&k, meta(&symbol)).unwrap());
        let record = ledger.get(&k).unwrap().unwrap();
        assert_eq!(record.order_id.as_deref(), Some("ord-1"));
        // The fill detail merged over the reservation detail.
        assert_eq!(record.detail["qty"], json!("0.01"));
        assert_eq!(record.detail["price"], json!("65000"));
    }

    #[test]
    fn outcome_without_reservation_is_an_error() {
        let ledger = TradeLedger::in_memory().unwrap();
        let err = ledger
            .record_outcome(&key("ghost"), OrderStatus::Filled, json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownIntent(_)));
    }

    #[test]
    fn stale_scan_sees_only_old_open_records() {
        let ledger = TradeLedger::in_memory().unwrap();
        let symbol = Symbol("BTCUSDT".to_string());

        let old_pending = key("old-pending");
        let fresh_pending = key("fresh-pending");
        let old_filled = key("old-filled");

        ledger.reserve(&old_pending, meta(&symbol)).unwrap();
        ledger.reserve(&fresh_pending, meta(&symbol)).unwrap();
        ledger.reserve(&old_filled, meta(&symbol)).unwrap();
        ledger
            .record_outcome(&old_filled, OrderStatus::Filled, json!({}))
            .unwrap();

        ledger.backdate(&old_pending, Duration::minutes(30));
        ledger.backdate(&old_filled, Duration::minutes(30));

        let stale = ledger.stale_open(Duration::minutes(5)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].key, old_pending);
    }

    #[test]
    fn ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.sqlite");
        let symbol = Symbol("BTCUSDT".to_string());
        let k = key("k1");

        {
            let ledger = TradeLedger::open(&path).unwrap();
            assert!(ledger.reserve(&k, meta(&symbol)).unwrap());
        }

        // The reservation is durable: after a "restart" the same decision
        // is refused.
        let ledger = TradeLedger::open(&path).unwrap();
        assert!(!ledger.reserve(&k, meta(&symbol)).unwrap());
    }
}
