//! Inbound method channel.
//!
//! Dispatches calls arriving from the application layer to the owning
//! component. Argument validation happens synchronously on the caller's
//! thread; anything touching the snapshot or the template tree is
//! resequenced onto the UI-affinity executor.

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use serde_json::Value;

use crate::executor::MainExecutor;
use crate::now_playing::SharedProjector;
use crate::permission_probe::LocalCapabilityProbe;
use crate::protocol::SnapshotDelta;
use crate::scene_registry::SceneRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    BadArgs(String),
    NotImplemented,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::BadArgs(detail) => write!(f, "bad arguments: {detail}"),
            CallError::NotImplemented => write!(f, "method not implemented"),
        }
    }
}

impl CallError {
    pub fn code(&self) -> &'static str {
        match self {
            CallError::BadArgs(_) => "bad_args",
            CallError::NotImplemented => "not_implemented",
        }
    }
}

/// Opens the OS settings surface for this app.
pub trait SettingsPort: Send + Sync {
    fn open_settings(&self) -> bool;
}

pub struct SystemSettingsPort {
    settings_url: String,
}

impl SystemSettingsPort {
    pub fn new(settings_url: String) -> Self {
        SystemSettingsPort { settings_url }
    }
}

impl SettingsPort for SystemSettingsPort {
    fn open_settings(&self) -> bool {
        match webbrowser::open(&self.settings_url) {
            Ok(()) => true,
            Err(err) => {
                warn!("SystemSettingsPort: failed to open settings: {err}");
                false
            }
        }
    }
}

pub struct BridgeChannel {
    projector: SharedProjector,
    scenes: Arc<SceneRegistry>,
    probe: Arc<LocalCapabilityProbe>,
    settings: Arc<dyn SettingsPort>,
    executor: Arc<dyn MainExecutor>,
}

impl BridgeChannel {
    pub fn new(
        projector: SharedProjector,
        scenes: Arc<SceneRegistry>,
        probe: Arc<LocalCapabilityProbe>,
        settings: Arc<dyn SettingsPort>,
        executor: Arc<dyn MainExecutor>,
    ) -> Self {
        BridgeChannel {
            projector,
            scenes,
            probe,
            settings,
            executor,
        }
    }

    /// Handles one inbound call. The acknowledgement is synchronous even
    /// when the work itself runs later on the UI executor; a rejected call
    /// mutates nothing.
    pub fn handle_call(&self, method: &str, args: &Value) -> Result<Value, CallError> {
        match method {
            "setNowPlaying" => {
                let delta: SnapshotDelta = serde_json::from_value(args.clone())
                    .map_err(|err| CallError::BadArgs(err.to_string()))?;
                let projector = self.projector.clone();
                self.executor.dispatch(Box::new(move || {
                    lock_projector(&projector).ingest(&delta);
                }));
                Ok(Value::Bool(true))
            }
            "clearNowPlaying" => {
                let projector = self.projector.clone();
                self.executor.dispatch(Box::new(move || {
                    lock_projector(&projector).clear();
                }));
                Ok(Value::Bool(true))
            }
            "authState" => {
                let authorized = match args.get("authorized") {
                    None | Some(Value::Null) => false,
                    Some(Value::Bool(value)) => *value,
                    Some(other) => {
                        return Err(CallError::BadArgs(format!(
                            "authorized must be a bool, got {other}"
                        )))
                    }
                };
                let scenes = self.scenes.clone();
                self.executor.dispatch(Box::new(move || {
                    if let Some(nav) = scenes.head_unit() {
                        let mut nav = match nav.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        nav.set_auth_state(authorized);
                    } else {
                        debug!("BridgeChannel: auth state with no head unit connected");
                    }
                }));
                Ok(Value::Bool(true))
            }
            "getLocalNetworkPermission" => {
                Ok(Value::String(self.probe.status().as_str().to_string()))
            }
            "refreshLocalNetworkPermission" => {
                self.probe.refresh();
                Ok(Value::Bool(true))
            }
            "openAppSettings" => Ok(Value::Bool(self.settings.open_settings())),
            other => {
                debug!("BridgeChannel: unknown method {other}");
                Err(CallError::NotImplemented)
            }
        }
    }
}

fn lock_projector(
    projector: &SharedProjector,
) -> std::sync::MutexGuard<'_, crate::now_playing::NowPlayingProjector> {
    match projector.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
