//! Active console tracking.

use crate::error::{CoreError, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Set of instance ids with an attached console.
#[derive(Debug, Clone, Default)]
pub struct ConsoleRegistry {
    active: Arc<Mutex<HashSet<i64>>>,
}

impl ConsoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the console of an instance. Fails with `ResourceBusy` while
    /// another lease for the same instance is alive.
    pub fn acquire(&self, instance_id: i64) -> Result<ConsoleLease> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(instance_id) {
            return Err(CoreError::ResourceBusy(
                "this instance already has an active console session".into(),
            ));
        }
        Ok(ConsoleLease {
            registry: self.clone(),
            instance_id,
        })
    }

    pub fn is_active(&self, instance_id: i64) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&instance_id)
    }
}

/// Releases the console claim when dropped.
#[derive(Debug)]
pub struct ConsoleLease {
    registry: ConsoleRegistry,
    instance_id: i64,
}

impl Drop for ConsoleLease {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.instance_id);
        tracing::debug!(instance_id = self.instance_id, "Released console");
    }
}
