//! Persisted bridge state.
//!
//! One small TOML file under the platform config directory holds the last
//! terminal local-network probe result, so the app can answer permission
//! queries before the first probe of a session finishes.

use std::path::PathBuf;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::protocol::PermissionStatus;

const STATE_FILE_NAME: &str = "bridge_state.toml";

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    local_network_status: Option<String>,
}

pub struct ProbeStore {
    path: PathBuf,
}

impl ProbeStore {
    pub fn at_default_location() -> Self {
        let dir = dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("tonebridge");
        ProbeStore {
            path: dir.join(STATE_FILE_NAME),
        }
    }

    pub fn at_path(path: PathBuf) -> Self {
        ProbeStore { path }
    }

    /// Loads the persisted status, treating a missing or unreadable file
    /// as never-probed.
    pub fn load_status(&self) -> PermissionStatus {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return PermissionStatus::Unknown;
        };
        let state: PersistedState = match toml::from_str(&contents) {
            Ok(state) => state,
            Err(err) => {
                warn!("ProbeStore: failed to parse {}: {err}", self.path.display());
                return PermissionStatus::Unknown;
            }
        };
        state
            .local_network_status
            .as_deref()
            .map(PermissionStatus::parse)
            .unwrap_or_default()
    }

    /// Persists a terminal status. `Unknown` is never written; a probe
    /// that learned nothing must not overwrite an earlier real answer.
    pub fn save_status(&self, status: PermissionStatus) {
        if status == PermissionStatus::Unknown {
            return;
        }
        let state = PersistedState {
            local_network_status: Some(status.as_str().to_string()),
        };
        let contents = match toml::to_string(&state) {
            Ok(contents) => contents,
            Err(err) => {
                warn!("ProbeStore: failed to serialize state: {err}");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!("ProbeStore: failed to create {}: {err}", parent.display());
                return;
            }
        }
        if let Err(err) = std::fs::write(&self.path, contents) {
            warn!("ProbeStore: failed to write {}: {err}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> ProbeStore {
        let path = std::env::temp_dir()
            .join(format!("tonebridge-test-{tag}-{}", std::process::id()))
            .join(STATE_FILE_NAME);
        let _ = std::fs::remove_file(&path);
        ProbeStore::at_path(path)
    }

    #[test]
    fn test_missing_file_loads_as_unknown() {
        let store = temp_store("missing");
        assert_eq!(store.load_status(), PermissionStatus::Unknown);
    }

    #[test]
    fn test_terminal_status_round_trips() {
        let store = temp_store("roundtrip");
        store.save_status(PermissionStatus::Granted);
        assert_eq!(store.load_status(), PermissionStatus::Granted);
        store.save_status(PermissionStatus::Denied);
        assert_eq!(store.load_status(), PermissionStatus::Denied);
    }

    #[test]
    fn test_unknown_is_never_persisted() {
        let store = temp_store("unknown");
        store.save_status(PermissionStatus::Granted);
        store.save_status(PermissionStatus::Unknown);
        assert_eq!(store.load_status(), PermissionStatus::Granted);
    }

    #[test]
    fn test_garbage_file_loads_as_unknown() {
        let store = temp_store("garbage");
        if let Some(parent) = store.path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&store.path, "not valid toml [[[").unwrap();
        assert_eq!(store.load_status(), PermissionStatus::Unknown);
    }
}
