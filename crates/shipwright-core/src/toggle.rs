//! Process-wide single-flight gate for image pulls.

use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct PullToggle {
    on: Mutex<bool>,
}

impl PullToggle {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.on.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_on(&self) -> bool {
        *self.flag()
    }

    pub fn turn_on(&self) {
        *self.flag() = true;
    }

    pub fn turn_off(&self) {
        *self.flag() = false;
    }

    /// Check-and-set in one critical section. `None` if already on; the
    /// returned guard turns the toggle off when dropped.
    pub fn try_enter(self: &Arc<Self>) -> Option<ToggleGuard> {
        let mut on = self.flag();
        if *on {
            return None;
        }
        *on = true;
        Some(ToggleGuard {
            toggle: Arc::clone(self),
        })
    }
}

#[must_use = "the toggle turns off as soon as the guard is dropped"]
pub struct ToggleGuard {
    toggle: Arc<PullToggle>,
}

impl Drop for ToggleGuard {
    fn drop(&mut self) {
        self.toggle.turn_off();
    }
}
