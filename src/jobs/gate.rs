//! Creation rate limiter for extraction jobs
//!
//! Rapid duplicate UI triggers must not start the same kind of job twice.
//! A [`CreationGate`] remembers when each [`JobKind`] last started and drops
//! requests that land inside the cooldown window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::JobKind;

/// Per-kind creation lock with a cooldown window
#[derive(Debug)]
pub struct CreationGate {
    cooldown: Duration,
    last_created: Mutex<HashMap<JobKind, Instant>>,
}

impl CreationGate {
    /// Create a gate with the given cooldown
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_created: Mutex::new(HashMap::new()),
        }
    }

    /// The configured cooldown
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Try to create a job of `kind` now
    pub fn try_acquire(&self, kind: JobKind) -> bool {
        self.try_acquire_at(kind, Instant::now())
    }

    /// Try to create a job of `kind` at `now`
    ///
    /// Returns `false` when a job of the same kind was created less than one
    /// cooldown ago. A refused attempt does not extend the window.
    pub fn try_acquire_at(&self, kind: JobKind, now: Instant) -> bool {
        let mut last_created = match self.last_created.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(previous) = last_created.get(&kind)
            && now.saturating_duration_since(*previous) < self.cooldown
        {
            tracing::debug!(kind = %kind, "Dropping job request inside creation cooldown");
            return false;
        }

        last_created.insert(kind, now);
        true
    }
}

impl Default for CreationGate {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
