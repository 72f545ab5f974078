//! Per-identity mutual exclusion
//!
//! Classification and the state transition that follows it must not interleave
//! with another writer for the same identity. Identities hash onto a fixed set of
//! stripes so unrelated identities rarely contend.

use crate::types::DocumentId;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use parking_lot::{Mutex, MutexGuard};

const STRIPES: usize = 256;

pub struct IdentityLocks {
    stripes: Vec<Mutex<()>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::with_stripes(STRIPES)
    }

    pub fn with_stripes(count: usize) -> Self {
        Self {
            stripes: (0..count.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Block until the identity's stripe is free
    pub fn lock(&self, identity: &DocumentId) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe(identity)].lock()
    }

    fn stripe(&self, identity: &DocumentId) -> usize {
        let mut hasher = DefaultHasher::new();
        identity.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }
}

impl Default for IdentityLocks {
    fn default() -> Self {
        Self::new()
    }
}
