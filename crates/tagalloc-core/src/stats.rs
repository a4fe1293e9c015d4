//! Occupancy snapshots for a thread heap.

/// Per-class slab occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// Slot size of the class.
    pub bound: usize,
    /// Slabs currently linked in the class chain.
    pub slabs: usize,
    /// Slots handed out and not yet released.
    pub slots_in_use: usize,
    /// Total slots across the chain.
    pub capacity: usize,
}

impl ClassStats {
    /// Slots that can be served without mapping another page.
    #[must_use]
    pub const fn free_slots(&self) -> usize {
        self.capacity - self.slots_in_use
    }
}

/// Snapshot of one thread heap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Id of the heap the snapshot was taken from.
    pub heap_id: u64,
    /// One entry per size class, ascending.
    pub classes: Vec<ClassStats>,
    /// Slab pages obtained from the page provider.
    pub slab_maps: u64,
    /// Slab pages returned to the page provider.
    pub slab_unmaps: u64,
    /// Large regions mapped by any heap sharing this heap's ledger.
    pub large_maps: u64,
    /// Large regions unmapped by any heap sharing this heap's ledger.
    pub large_unmaps: u64,
    /// Bytes mapped for large regions minus bytes unmapped, per the ledger.
    pub large_live_bytes: usize,
}

impl HeapStats {
    /// Slabs currently linked across all chains.
    #[must_use]
    pub fn live_slabs(&self) -> usize {
        self.classes.iter().map(|class| class.slabs).sum()
    }

    /// Slots in use across all classes.
    #[must_use]
    pub fn slots_in_use(&self) -> usize {
        self.classes.iter().map(|class| class.slots_in_use).sum()
    }

    /// Large regions mapped and not yet released, per the ledger.
    #[must_use]
    pub const fn live_large(&self) -> u64 {
        self.large_maps.saturating_sub(self.large_unmaps)
    }

    /// The parts of the snapshot that an allocate/release pair must leave
    /// unchanged. Lifetime counters are excluded.
    #[must_use]
    pub fn occupancy(&self) -> Occupancy {
        Occupancy {
            slabs: self
                .classes
                .iter()
                .map(|class| (class.slabs, class.slots_in_use))
                .collect(),
            live_large: self.live_large(),
            large_live_bytes: self.large_live_bytes,
        }
    }
}

/// Comparable occupancy state: `(slabs, slots_in_use)` per class plus live
/// large regions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Occupancy {
    pub slabs: Vec<(usize, usize)>,
    pub live_large: u64,
    pub large_live_bytes: usize,
}
