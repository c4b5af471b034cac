//! The set of track ids that the janitor must never evict.
//!
//! The set is owned by an external collaborator (playlist membership) and
//! replaced wholesale on every update. Sweeps take a [`snapshot`] and use it
//! for their whole duration, so a concurrent replacement never produces a
//! half-updated view.
//!
//! [`snapshot`]: ProtectedSet::snapshot

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::identifier::TrackId;

/// Process-wide protected id set.
#[derive(Debug, Default)]
pub struct ProtectedSet {
    inner: RwLock<Arc<HashSet<TrackId>>>,
}

impl ProtectedSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set. Malformed ids are dropped.
    ///
    /// Returns the number of ids retained.
    pub fn replace<I, S>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut next = HashSet::new();
        let mut rejected = 0usize;
        for raw in ids {
            match TrackId::parse(raw.as_ref()) {
                Ok(id) => {
                    next.insert(id);
                }
                Err(_) => rejected += 1,
            }
        }
        if rejected > 0 {
            debug!("Dropped {} malformed protected ids", rejected);
        }

        let count = next.len();
        match self.inner.write() {
            Ok(mut guard) => *guard = Arc::new(next),
            Err(poisoned) => {
                warn!("Protected set lock was poisoned, recovering");
                *poisoned.into_inner() = Arc::new(next);
            }
        }
        count
    }

    /// The current set, frozen.
    #[must_use]
    pub fn snapshot(&self) -> Arc<HashSet<TrackId>> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Whether `id` is currently protected.
    #[must_use]
    pub fn contains(&self, id: &TrackId) -> bool {
        self.snapshot().contains(id)
    }

    /// Number of protected ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}
