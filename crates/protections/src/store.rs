// In crates/protections/src/store.rs

//! Atomic JSON persistence for small state files (protections snapshot,
//! heartbeat, runner state, kill-switch). Write to a temp file, fsync,
//! then rename over the target so readers never observe a torn write.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
    if let Some(dir) = dir {
        fs::create_dir_all(dir)?;
    }

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Reads a JSON file, falling back to `T::default()` when the file is
/// missing or unreadable. State files are advisory on read; they only
/// have to be exact on write.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut value = HashMap::new();
        value.insert("cycle".to_string(), 42u64);
        atomic_write_json(&path, &value).unwrap();

        let loaded: HashMap<String, u64> = read_json_or_default(&path);
        assert_eq!(loaded.get("cycle"), Some(&42));
        // No stray temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: HashMap<String, u64> = read_json_or_default(&dir.path().join("absent.json"));
        assert!(loaded.is_empty());
    }
}
