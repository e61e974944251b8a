#![forbid(unsafe_code)]

//! Reclamation epochs shared by every thread that touches a table.
//!
//! A thread pins the current global epoch for the duration of each
//! operation. Nodes unlinked during epoch `e` may still be visible to
//! anyone pinned at `e` or earlier, so they are only recycled once the
//! active epoch (the oldest pinned epoch) has moved past `e`.

use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

/// Monotonic reclamation generation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Epoch(pub u64);

/// Per-thread announcement of the epoch the thread is pinned at.
#[derive(Debug, Default)]
pub struct EpochSlot {
    announced: AtomicU64,
    depth: AtomicU32,
}

impl EpochSlot {
    /// Epoch the owning thread is pinned at, if any.
    pub fn announced(&self) -> Option<Epoch> {
        match self.announced.load(Ordering::SeqCst) {
            0 => None,
            value => Some(Epoch(value)),
        }
    }
}

/// Process-wide epoch counter plus the recovering flag.
#[derive(Debug)]
pub struct EpochCoordinator {
    global: AtomicU64,
    active: AtomicU64,
    recovering: AtomicBool,
    slots: RwLock<Vec<Arc<EpochSlot>>>,
}

impl Default for EpochCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochCoordinator {
    /// Creates a coordinator with both counters at 1.
    pub fn new() -> Self {
        Self {
            global: AtomicU64::new(1),
            active: AtomicU64::new(1),
            recovering: AtomicBool::new(false),
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Returns the current global epoch.
    pub fn current(&self) -> Epoch {
        Epoch(self.global.load(Ordering::SeqCst))
    }

    /// Returns the oldest epoch that may still be pinned.
    pub fn active(&self) -> Epoch {
        Epoch(self.active.load(Ordering::SeqCst))
    }

    /// Whether reclamation is currently suspended.
    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// Suspends or resumes reclamation. While set, [`Self::advance`] does not
    /// move the active epoch.
    pub fn set_recovering(&self, recovering: bool) {
        self.recovering.store(recovering, Ordering::SeqCst);
    }

    /// Adds an announcement slot for a new participant.
    pub fn register(&self) -> Arc<EpochSlot> {
        let slot = Arc::new(EpochSlot::default());
        self.slots.write().push(Arc::clone(&slot));
        slot
    }

    /// Number of registered participants.
    pub fn participants(&self) -> usize {
        self.slots.read().len()
    }

    /// Pins `slot` at the current epoch until the guard drops. Pins nest.
    pub fn pin<'a>(&'a self, slot: &'a EpochSlot) -> EpochGuard<'a> {
        if slot.depth.fetch_add(1, Ordering::Relaxed) > 0 {
            let epoch = Epoch(slot.announced.load(Ordering::Relaxed));
            return EpochGuard { slot, epoch };
        }
        loop {
            let seen = self.global.load(Ordering::SeqCst);
            slot.announced.store(seen, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if self.global.load(Ordering::SeqCst) == seen {
                return EpochGuard {
                    slot,
                    epoch: Epoch(seen),
                };
            }
        }
    }

    /// Epoch to stamp on something that was just unlinked.
    pub fn retire_epoch(&self) -> Epoch {
        fence(Ordering::SeqCst);
        self.current()
    }

    /// Bumps the global epoch and raises the active epoch to the oldest pin.
    ///
    /// Returns the active epoch after the call.
    pub fn advance(&self) -> Epoch {
        let next = self.global.fetch_add(1, Ordering::SeqCst) + 1;
        fence(Ordering::SeqCst);
        let floor = self
            .slots
            .read()
            .iter()
            .filter_map(|slot| slot.announced())
            .map(|epoch| epoch.0)
            .min()
            .map_or(next, |oldest| oldest.min(next));
        if self.is_recovering() {
            return self.active();
        }
        let previous = self.active.fetch_max(floor, Ordering::SeqCst);
        let active = previous.max(floor);
        if active > previous {
            debug!(global = next, active, "epoch advanced");
        }
        Epoch(active)
    }

    /// Whether something retired at `retired` can no longer be observed.
    pub fn is_reclaimable(&self, retired: Epoch) -> bool {
        retired < self.active()
    }
}

/// Keeps a slot pinned; unpins when the outermost guard drops.
#[derive(Debug)]
pub struct EpochGuard<'a> {
    slot: &'a EpochSlot,
    epoch: Epoch,
}

impl EpochGuard<'_> {
    /// Epoch this guard is pinned at.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        if self.slot.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.slot.announced.store(0, Ordering::SeqCst);
        }
    }
}
