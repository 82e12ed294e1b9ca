//! Device-wide scanout engine allocation.
//!
//! Every output on a device claims its engine here, so two outputs can never drive the same
//! engine. Selection and claiming happen under one lock ([`EngineAllocator::lock`]) and callers
//! keep it held across the mode-set that commits the claim.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use crate::{lock, EngineId};

#[derive(Debug, Default)]
pub struct EngineAllocator {
    in_use: Mutex<BTreeSet<EngineId>>,
}

/// Exclusive view of the in-use set.
pub struct EngineClaims<'a> {
    in_use: MutexGuard<'a, BTreeSet<EngineId>>,
}

impl EngineAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> EngineClaims<'_> {
        EngineClaims {
            in_use: lock(&self.in_use),
        }
    }

    pub fn is_claimed(&self, engine: EngineId) -> bool {
        lock(&self.in_use).contains(&engine)
    }

    pub fn claimed(&self) -> Vec<EngineId> {
        lock(&self.in_use).iter().copied().collect()
    }

    pub fn release(&self, engine: EngineId) -> bool {
        self.lock().release(engine)
    }
}

impl EngineClaims<'_> {
    /// Pick an engine for a connector: the one already driving it if unclaimed, otherwise the
    /// first unclaimed engine in `compatible` order.
    pub fn select(&self, current: Option<EngineId>, compatible: &[EngineId]) -> Option<EngineId> {
        current
            .filter(|engine| !self.in_use.contains(engine))
            .or_else(|| {
                compatible
                    .iter()
                    .copied()
                    .find(|engine| !self.in_use.contains(engine))
            })
    }

    /// Returns `false` if `engine` was already claimed.
    pub fn claim(&mut self, engine: EngineId) -> bool {
        self.in_use.insert(engine)
    }

    pub fn release(&mut self, engine: EngineId) -> bool {
        self.in_use.remove(&engine)
    }
}
