//! At most one in-flight sync run per user.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when a run for `user_id` is already in flight.
    pub fn try_acquire(&self, user_id: Uuid) -> Option<RunGuard> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(user_id) {
            return None;
        }
        Some(RunGuard {
            registry: self.clone(),
            user_id,
        })
    }

    pub fn is_running(&self, user_id: Uuid) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&user_id)
    }
}

/// Releases the user's slot when dropped.
#[derive(Debug)]
pub struct RunGuard {
    registry: RunRegistry,
    user_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.user_id);
    }
}
