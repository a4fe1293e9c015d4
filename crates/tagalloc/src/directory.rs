//! Per-thread slab directory.
//!
//! One chain of slabs per size class, newest first. The chains are owned by
//! a single thread heap; slabs carry that heap's id and any release coming
//! from a different heap is refused before it touches the slab.

use std::ptr::NonNull;

use tagalloc_core::{AllocError, ClassStats, ReleaseError};

use crate::page::PageProvider;
use crate::slab::Slab;

/// Outcome of a slab release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlabRelease {
    /// The slab still has live slots.
    Retained,
    /// That was the last live slot; the page went back to the provider.
    Unmapped,
}

pub(crate) struct SlabDirectory {
    owner: u64,
    heads: Box<[Option<Slab>]>,
    slab_maps: u64,
    slab_unmaps: u64,
}

impl SlabDirectory {
    pub(crate) fn new(owner: u64, classes: usize) -> Self {
        Self {
            owner,
            heads: vec![None; classes].into_boxed_slice(),
            slab_maps: 0,
            slab_unmaps: 0,
        }
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    pub(crate) fn slab_maps(&self) -> u64 {
        self.slab_maps
    }

    pub(crate) fn slab_unmaps(&self) -> u64 {
        self.slab_unmaps
    }

    fn chain(&self, class_index: usize) -> std::iter::Successors<Slab, fn(&Slab) -> Option<Slab>> {
        std::iter::successors(self.heads[class_index], Slab::next as fn(&Slab) -> Option<Slab>)
    }

    /// Serves one slot of class `class_index`.
    ///
    /// Uses the first slab in the chain with a free slot, otherwise maps a
    /// new slab and puts it at the head of the chain.
    pub(crate) fn allocate<P: PageProvider>(
        &mut self,
        provider: &P,
        page_size: usize,
        class_index: usize,
        object_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let found = self.chain(class_index).find(Slab::has_free);
        let mut slab = match found {
            Some(slab) => slab,
            None => {
                let mut slab =
                    Slab::create(provider, page_size, class_index, object_size, self.owner)
                        .map_err(|err| {
                            tracing::warn!(
                                class = class_index,
                                object_size,
                                error = %err,
                                "slab page unavailable"
                            );
                            AllocError::from_page(object_size, err)
                        })?;
                slab.set_next(self.heads[class_index]);
                self.heads[class_index] = Some(slab);
                self.slab_maps += 1;
                tracing::debug!(
                    addr = slab.base(),
                    class = class_index,
                    object_size,
                    capacity = slab.capacity(),
                    owner = self.owner,
                    "slab mapped"
                );
                slab
            }
        };
        // A slab found or created above always has a free slot.
        slab.pop()
            .ok_or(AllocError::Exhausted {
                requested: object_size,
                errno: None,
            })
    }

    /// Returns the slot at `addr` to `slab`, unmapping the slab when it
    /// empties.
    pub(crate) fn release<P: PageProvider>(
        &mut self,
        provider: &P,
        page_size: usize,
        mut slab: Slab,
        addr: usize,
    ) -> Result<SlabRelease, ReleaseError> {
        if slab.owner() != self.owner {
            return Err(ReleaseError::ForeignThread {
                addr,
                owner: slab.owner(),
                caller: self.owner,
            });
        }
        let index = slab.slot_index(addr)?;
        if slab.is_free(index) {
            return Err(ReleaseError::DoubleRelease { addr });
        }
        if slab.push(index) > 0 {
            return Ok(SlabRelease::Retained);
        }

        let class_index = slab.class_index();
        if !self.unlink(class_index, slab) {
            // Left behind by an earlier heap with this owner id, which is
            // gone along with its chains.
            tracing::debug!(addr = slab.base(), class = class_index, "orphaned slab emptied");
        }
        self.slab_unmaps += 1;
        let base = slab.base();
        // SAFETY: the slab is unlinked and its last slot was just released.
        if let Err(err) = unsafe { slab.destroy(provider, page_size) } {
            tracing::warn!(addr = base, error = %err, "slab page unmap failed");
        } else {
            tracing::debug!(addr = base, class = class_index, "slab retired");
        }
        Ok(SlabRelease::Unmapped)
    }

    /// Removes `slab` from its chain. There is no back-link, so the chain is
    /// scanned for the predecessor.
    fn unlink(&mut self, class_index: usize, slab: Slab) -> bool {
        if self.heads[class_index] == Some(slab) {
            self.heads[class_index] = slab.next();
            return true;
        }
        let mut cursor = self.heads[class_index];
        while let Some(mut prev) = cursor {
            let next = prev.next();
            if next == Some(slab) {
                prev.set_next(slab.next());
                return true;
            }
            cursor = next;
        }
        false
    }

    /// Occupancy of class `class_index`.
    pub(crate) fn class_stats(&self, class_index: usize, bound: usize) -> ClassStats {
        self.chain(class_index).fold(
            ClassStats {
                bound,
                ..ClassStats::default()
            },
            |mut stats, slab| {
                stats.slabs += 1;
                stats.slots_in_use += slab.in_use();
                stats.capacity += slab.capacity();
                stats
            },
        )
    }

    /// Slab bases of class `class_index`, head first.
    #[cfg(test)]
    pub(crate) fn chain_bases(&self, class_index: usize) -> Vec<usize> {
        self.chain(class_index).map(|slab| slab.base()).collect()
    }
}
