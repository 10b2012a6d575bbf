// In crates/engine/src/heartbeat.rs

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// The record the external watchdog polls: if `ts` goes stale it assumes
/// the runner is dead or hung and restarts the process. Overwritten in
/// place every cycle, never appended.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub updated_at: String,
    /// Unix seconds; what the watchdog actually compares against.
    pub ts: f64,
    pub pid: u32,
    pub status: String,
    pub note: String,
    pub cycle_count: u64,
    pub mode: String,
}

/// Liveness emitter. Writes are throttled to `min_interval` except for
/// terminal statuses, which always land.
pub struct Heartbeat {
    path: PathBuf,
    min_interval: Duration,
    last_write: Option<Instant>,
    cycle_count: u64,
    mode: String,
}

impl Heartbeat {
    pub fn new(path: PathBuf, min_interval: Duration, mode: &str) -> Self {
        Self {
            path,
            min_interval,
            last_write: None,
            cycle_count: 0,
            mode: mode.to_string(),
        }
    }

    /// Monotonically increasing cycle counter; called once per cycle.
    pub fn begin_cycle(&mut self) -> u64 {
        self.cycle_count += 1;
        self.cycle_count
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// Throttled liveness write.
    pub fn touch(&mut self, status: &str, note: &str) {
        if let Some(last) = self.last_write {
            if last.elapsed() < self.min_interval {
                return;
            }
        }
        self.write(status, note);
    }

    /// Unthrottled write, for state transitions the watchdog must see
    /// (errors, stop).
    pub fn touch_now(&mut self, status: &str, note: &str) {
        self.write(status, note);
    }

    fn write(&mut self, status: &str, note: &str) {
        let now = Utc::now();
        let record = HeartbeatRecord {
            updated_at: now.to_rfc3339(),
            ts: now.timestamp_millis() as f64 / 1000.0,
            pid: std::process::id(),
            status: status.to_string(),
            note: note.to_string(),
            cycle_count: self.cycle_count,
            mode: self.mode.clone(),
        };
        if let Err(e) = protections::store::atomic_write_json(&self.path, &record) {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to write heartbeat.");
            return;
        }
        self.last_write = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_counter_is_monotonic_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner_heartbeat.json");
        let mut hb = Heartbeat::new(path.clone(), Duration::ZERO, "paper");

        hb.begin_cycle();
        hb.touch("alive", "loop_top");
        hb.begin_cycle();
        hb.touch("ok", "cycle_ok");

        let record: HeartbeatRecord = protections::store::read_json_or_default(&path);
        assert_eq!(record.cycle_count, 2);
        assert_eq!(record.status, "ok");
        assert_eq!(record.mode, "paper");
        assert!(record.ts > 0.0);
    }

    #[test]
    fn throttle_suppresses_rapid_writes_but_not_touch_now() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner_heartbeat.json");
        let mut hb = Heartbeat::new(path.clone(), Duration::from_secs(60), "paper");

        hb.touch("alive", "first");
        hb.touch("alive", "suppressed");
        let record: HeartbeatRecord = protections::store::read_json_or_default(&path);
        assert_eq!(record.note, "first");

        hb.touch_now("stopped", "kill_switch");
        let record: HeartbeatRecord = protections::store::read_json_or_default(&path);
        assert_eq!(record.status, "stopped");
    }
}
