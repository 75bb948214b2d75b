/// Per-digest ownership.
///
/// At most one task drives a given digest at a time. Distinct digests never
/// contend. Map entries live only while someone owns or waits for them.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use crate::digest::Digest;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
pub struct DigestOwnership {
    slots: Arc<Mutex<HashMap<Digest, Slot>>>,
}

impl DigestOwnership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `digest` is free, then own it until the guard drops.
    pub async fn acquire(&self, digest: Digest) -> OwnershipGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(digest).or_default().clone()
        };
        let guard = slot.lock_owned().await;

        OwnershipGuard {
            digest,
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    /// Digests currently owned or awaited.
    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive ownership of one digest.
pub struct OwnershipGuard {
    digest: Digest,
    slots: Arc<Mutex<HashMap<Digest, Slot>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl OwnershipGuard {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

impl Drop for OwnershipGuard {
    fn drop(&mut self) {
        // Release first so the strong count reflects only the map and waiters.
        self.guard.take();
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(&self.digest) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.digest);
            }
        }
    }
}
