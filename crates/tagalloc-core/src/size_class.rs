//! Size classes for small allocations.
//!
//! A small request is served from a slab whose slots all have the same
//! size. The table maps a requested byte count to the smallest slot size
//! that can hold it. Requests above the top class take the large-object
//! path instead.

use crate::error::ConfigError;

/// Slot sizes used when no override is configured.
pub const DEFAULT_SIZE_CLASSES: [usize; 5] = [16, 32, 64, 128, 256];

/// Smallest admissible slot: a free slot stores an 8-byte link word.
pub const MIN_CLASS_BOUND: usize = 8;

/// Ordered, immutable list of slot sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeClassTable {
    bounds: Box<[usize]>,
}

impl SizeClassTable {
    /// Builds a table from ascending slot sizes.
    ///
    /// Rejects an empty list, a list that is not strictly ascending, and any
    /// bound too small to hold the free-list link.
    pub fn new(bounds: &[usize]) -> Result<Self, ConfigError> {
        let Some(&smallest) = bounds.first() else {
            return Err(ConfigError::EmptyClasses);
        };
        if smallest < MIN_CLASS_BOUND {
            return Err(ConfigError::ClassTooSmall {
                bound: smallest,
                min: MIN_CLASS_BOUND,
            });
        }
        if let Some(pair) = bounds.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::UnsortedClasses {
                previous: pair[0],
                next: pair[1],
            });
        }
        if bounds.len() > u32::MAX as usize {
            return Err(ConfigError::TooManyClasses { count: bounds.len() });
        }
        Ok(Self {
            bounds: bounds.into(),
        })
    }

    /// Returns the index of the smallest class whose bound is at least `size`.
    ///
    /// `None` means no class applies and the request belongs on the large
    /// path. A zero-byte request lands in class 0.
    #[must_use]
    pub fn class_of(&self, size: usize) -> Option<usize> {
        // Linear scan: the table is a handful of entries.
        self.bounds.iter().position(|&bound| size <= bound)
    }

    /// Slot size of class `index`, or `None` when out of range.
    #[must_use]
    pub fn bound(&self, index: usize) -> Option<usize> {
        self.bounds.get(index).copied()
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    /// Always false for a constructed table; present for API symmetry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// The largest slot size. Anything above it is a large object.
    #[must_use]
    pub fn max_bound(&self) -> usize {
        self.bounds[self.bounds.len() - 1]
    }

    /// Iterates `(index, bound)` pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.bounds.iter().copied().enumerate()
    }
}

impl Default for SizeClassTable {
    fn default() -> Self {
        Self {
            bounds: DEFAULT_SIZE_CLASSES.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_of_every_small_size() {
        let table = SizeClassTable::default();
        for size in 1..=table.max_bound() {
            let index = table.class_of(size).expect("small size must route to a class");
            let bound = table.bound(index).expect("index in range");
            assert!(bound >= size, "class {index} ({bound}) too small for {size}");
            if index > 0 {
                let below = table.bound(index - 1).expect("previous class");
                assert!(below < size, "class {} would already fit {size}", index - 1);
            }
        }
    }

    #[test]
    fn test_class_of_exact_bounds() {
        let table = SizeClassTable::default();
        assert_eq!(table.class_of(16), Some(0));
        assert_eq!(table.class_of(32), Some(1));
        assert_eq!(table.class_of(64), Some(2));
        assert_eq!(table.class_of(128), Some(3));
        assert_eq!(table.class_of(256), Some(4));
    }

    #[test]
    fn test_class_of_round_up() {
        let table = SizeClassTable::default();
        assert_eq!(table.class_of(17), Some(1));
        assert_eq!(table.class_of(65), Some(3));
        assert_eq!(table.class_of(129), Some(4));
    }

    #[test]
    fn test_class_of_above_top_is_large() {
        let table = SizeClassTable::default();
        assert_eq!(table.class_of(257), None);
        assert_eq!(table.class_of(usize::MAX), None);
    }

    #[test]
    fn test_zero_maps_to_smallest_class() {
        assert_eq!(SizeClassTable::default().class_of(0), Some(0));
    }

    #[test]
    fn test_custom_table() {
        let table = SizeClassTable::new(&[8, 24, 1000]).expect("valid table");
        assert_eq!(table.len(), 3);
        assert_eq!(table.class_of(9), Some(1));
        assert_eq!(table.class_of(25), Some(2));
        assert_eq!(table.class_of(1001), None);
        assert_eq!(table.max_bound(), 1000);
        assert_eq!(table.bound(3), None);
    }

    #[test]
    fn test_rejects_invalid_tables() {
        assert_eq!(SizeClassTable::new(&[]), Err(ConfigError::EmptyClasses));
        assert_eq!(
            SizeClassTable::new(&[4, 16]),
            Err(ConfigError::ClassTooSmall { bound: 4, min: 8 })
        );
        assert_eq!(
            SizeClassTable::new(&[16, 64, 32]),
            Err(ConfigError::UnsortedClasses {
                previous: 64,
                next: 32
            })
        );
        assert_eq!(
            SizeClassTable::new(&[16, 16]),
            Err(ConfigError::UnsortedClasses {
                previous: 16,
                next: 16
            })
        );
    }

    #[test]
    fn test_iter_is_ascending() {
        let pairs: Vec<_> = SizeClassTable::default().iter().collect();
        assert_eq!(pairs, vec![(0, 16), (1, 32), (2, 64), (3, 128), (4, 256)]);
    }
}
