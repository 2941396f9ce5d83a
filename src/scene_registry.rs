//! Registry of connected head-unit scenes.
//!
//! Scenes register their navigation state machine under a scene id when
//! they connect and deregister on disconnect. Handles are held weakly so a
//! torn-down scene never keeps its state machine alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::navigation::NavigationStateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SceneId(pub u64);

#[derive(Default)]
pub struct SceneRegistry {
    head_units: Mutex<HashMap<SceneId, Weak<Mutex<NavigationStateMachine>>>>,
}

impl SceneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_head_unit(&self, id: SceneId, nav: &Arc<Mutex<NavigationStateMachine>>) {
        let mut head_units = match self.head_units.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        head_units.insert(id, Arc::downgrade(nav));
    }

    pub fn deregister_head_unit(&self, id: SceneId) {
        let mut head_units = match self.head_units.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        head_units.remove(&id);
    }

    /// Returns a live head-unit handle if any scene is connected, pruning
    /// entries whose scene has already gone away.
    pub fn head_unit(&self) -> Option<Arc<Mutex<NavigationStateMachine>>> {
        let mut head_units = match self.head_units.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        head_units.retain(|_, weak| weak.strong_count() > 0);
        head_units.values().find_map(Weak::upgrade)
    }
}
