// In crates/engine/src/kill_switch.rs

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// The externally controlled emergency stop. Operators (or the watchdog
/// tooling) flip `enabled`; the core only reads it — with one exception,
/// the consecutive-error auto-trip, which writes `enabled: true` through
/// [`FileKillSwitch::trip`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillSwitchState {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_at: Option<String>,
}

/// Injected read-only state source, polled once per cycle. File-backed in
/// production; tests substitute an in-memory flag.
pub trait KillSwitchSource: Send + Sync {
    fn read(&self) -> KillSwitchState;
}

pub struct FileKillSwitch {
    path: PathBuf,
}

impl FileKillSwitch {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The auto-trip: persists an enabled switch so the halt survives the
    /// process. Used only for the consecutive-error guard.
    pub fn trip(&self, reason: &str) -> std::io::Result<()> {
        protections::store::atomic_write_json(
            &self.path,
            &KillSwitchState {
                enabled: true,
                reason: reason.to_string(),
                enabled_at: Some(Utc::now().to_rfc3339()),
            },
        )
    }
}

impl KillSwitchSource for FileKillSwitch {
    fn read(&self) -> KillSwitchState {
        protections::store::read_json_or_default(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_reads_as_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let switch = FileKillSwitch::new(dir.path().join("kill_switch.json"));
        assert!(!switch.read().enabled);
    }

    #[test]
    fn trip_round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kill_switch.json");
        let switch = FileKillSwitch::new(path.clone());

        switch.trip("auto_max_consecutive_errors:5").unwrap();

        let state = switch.read();
        assert!(state.enabled);
        assert!(state.reason.contains("consecutive"));
        assert!(state.enabled_at.is_some());
    }

    #[test]
    fn external_write_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kill_switch.json");
        std::fs::write(&path, r#"{"enabled": true, "reason": "operator"}"#).unwrap();

        let switch = FileKillSwitch::new(path);
        let state = switch.read();
        assert!(state.enabled);
        assert_eq!(state.reason, "operator");
    }
}
