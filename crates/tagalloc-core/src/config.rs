//! Allocator configuration.
//!
//! Two knobs are recognized, both optionally read from the environment:
//! - `TAGALLOC_PAGE_SIZE`: slab and large-object granularity in bytes
//!   (decimal or `0x` hex). Defaults to the OS page size.
//! - `TAGALLOC_SIZE_CLASSES`: comma-separated ascending slot sizes.
//!   Defaults to `16,32,64,128,256`.
//!
//! The large-object threshold is not a separate knob: any request above the
//! top size class is large.

use crate::error::ConfigError;
use crate::size_class::SizeClassTable;

/// Bytes reserved at the start of every slab page for its header.
/// Slot 0 begins at this offset.
pub const SLAB_HEADER_BYTES: usize = 64;

/// Bytes of header in front of every large-object payload.
pub const LARGE_HEADER_BYTES: usize = 16;

/// Page size assumed when the OS cannot be asked.
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// Largest accepted page size (1 GiB).
pub const MAX_PAGE_SIZE: usize = 1 << 30;

/// Environment variable overriding the page size.
pub const PAGE_SIZE_ENV: &str = "TAGALLOC_PAGE_SIZE";

/// Environment variable overriding the size-class table.
pub const SIZE_CLASSES_ENV: &str = "TAGALLOC_SIZE_CLASSES";

/// Validated allocator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    page_size: usize,
    classes: SizeClassTable,
}

impl AllocatorConfig {
    /// Validates a page size against the OS page size and the class table.
    pub fn new(
        os_page_size: usize,
        page_size: usize,
        classes: SizeClassTable,
    ) -> Result<Self, ConfigError> {
        if !page_size.is_power_of_two() {
            return Err(ConfigError::PageSizeNotPowerOfTwo { page_size });
        }
        if page_size < os_page_size {
            return Err(ConfigError::PageSizeBelowOs {
                page_size,
                os: os_page_size,
            });
        }
        if page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::PageSizeTooLarge {
                page_size,
                max: MAX_PAGE_SIZE,
            });
        }
        let top = classes.max_bound();
        if page_size < SLAB_HEADER_BYTES.saturating_add(top) {
            return Err(ConfigError::PageTooSmallForClass {
                page_size,
                bound: top,
            });
        }
        Ok(Self { page_size, classes })
    }

    /// OS page size with the default class table.
    pub fn default_for(os_page_size: usize) -> Result<Self, ConfigError> {
        Self::new(os_page_size, os_page_size, SizeClassTable::default())
    }

    /// Fallback page size with the default class table. Always valid.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            page_size: FALLBACK_PAGE_SIZE,
            classes: SizeClassTable::default(),
        }
    }

    /// Reads overrides from the process environment.
    ///
    /// Invalid overrides are logged and ignored; only an unusable OS page
    /// size is an error.
    pub fn from_env(os_page_size: usize) -> Result<Self, ConfigError> {
        Self::from_lookup(os_page_size, |var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(os_page_size: usize, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match Self::try_from_lookup(os_page_size, &lookup) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!(error = %err, "ignoring allocator environment overrides");
                Self::default_for(os_page_size)
            }
        }
    }

    fn try_from_lookup<F>(os_page_size: usize, lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let page_size = match lookup(PAGE_SIZE_ENV) {
            Some(raw) => parse_page_size(&raw)?,
            None => os_page_size,
        };
        let classes = match lookup(SIZE_CLASSES_ENV) {
            Some(raw) => SizeClassTable::new(&parse_size_classes(&raw)?)?,
            None => SizeClassTable::default(),
        };
        Self::new(os_page_size, page_size, classes)
    }

    /// Slab and large-object granularity in bytes.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Mask that rounds an address down to its page base.
    #[must_use]
    pub const fn page_mask(&self) -> usize {
        !(self.page_size - 1)
    }

    /// The size-class table.
    #[must_use]
    pub fn classes(&self) -> &SizeClassTable {
        &self.classes
    }

    /// Requests above this many bytes take the large-object path.
    #[must_use]
    pub fn large_threshold(&self) -> usize {
        self.classes.max_bound()
    }

    /// Number of slots a slab of class `index` holds.
    #[must_use]
    pub fn slab_capacity(&self, index: usize) -> Option<usize> {
        let bound = self.classes.bound(index)?;
        Some((self.page_size - SLAB_HEADER_BYTES) / bound)
    }

    /// Bytes mapped for a large request of `size` bytes, or `None` on
    /// overflow.
    #[must_use]
    pub fn large_mapping_len(&self, size: usize) -> Option<usize> {
        let total = size.checked_add(LARGE_HEADER_BYTES)?;
        let rounded = total.checked_add(self.page_size - 1)?;
        Some(rounded & self.page_mask())
    }
}

/// Parses a page size written in decimal or `0x` hex.
pub fn parse_page_size(raw: &str) -> Result<usize, ConfigError> {
    let trimmed = raw.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => trimmed.parse::<usize>(),
    };
    parsed.map_err(|_| ConfigError::Parse {
        var: PAGE_SIZE_ENV,
        value: raw.to_string(),
    })
}

/// Parses a comma-separated list of slot sizes.
pub fn parse_size_classes(raw: &str) -> Result<Vec<usize>, ConfigError> {
    raw.split(',')
        .map(|part| {
            part.trim().parse::<usize>().map_err(|_| ConfigError::Parse {
                var: SIZE_CLASSES_ENV,
                value: raw.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var: &str| map.get(var).cloned()
    }

    #[test]
    fn defaults_follow_os_page() {
        let config = AllocatorConfig::default_for(4096).expect("valid defaults");
        assert_eq!(config.page_size(), 4096);
        assert_eq!(config.large_threshold(), 256);
        assert_eq!(config.page_mask(), !0xFFF);
        assert_eq!(config.classes(), &SizeClassTable::default());
    }

    #[test]
    fn slab_capacity_matches_header_reserve() {
        let config = AllocatorConfig::default_for(4096).expect("valid defaults");
        assert_eq!(config.slab_capacity(0), Some((4096 - 64) / 16));
        assert_eq!(config.slab_capacity(4), Some((4096 - 64) / 256));
        assert_eq!(config.slab_capacity(5), None);
    }

    #[test]
    fn large_mapping_rounds_to_pages() {
        let config = AllocatorConfig::default_for(4096).expect("valid defaults");
        assert_eq!(config.large_mapping_len(257), Some(4096));
        assert_eq!(config.large_mapping_len(4096 - 16), Some(4096));
        assert_eq!(config.large_mapping_len(4096 - 15), Some(8192));
        assert_eq!(config.large_mapping_len(usize::MAX), None);
        assert_eq!(config.large_mapping_len(usize::MAX - 16), None);
    }

    #[test]
    fn rejects_bad_page_sizes() {
        let classes = SizeClassTable::default();
        assert_eq!(
            AllocatorConfig::new(4096, 5000, classes.clone()),
            Err(ConfigError::PageSizeNotPowerOfTwo { page_size: 5000 })
        );
        assert_eq!(
            AllocatorConfig::new(4096, 2048, classes.clone()),
            Err(ConfigError::PageSizeBelowOs {
                page_size: 2048,
                os: 4096
            })
        );
        assert_eq!(
            AllocatorConfig::new(4096, MAX_PAGE_SIZE * 2, classes),
            Err(ConfigError::PageSizeTooLarge {
                page_size: MAX_PAGE_SIZE * 2,
                max: MAX_PAGE_SIZE
            })
        );
        let wide = SizeClassTable::new(&[16, 4096]).expect("valid table");
        assert_eq!(
            AllocatorConfig::new(4096, 4096, wide),
            Err(ConfigError::PageTooSmallForClass {
                page_size: 4096,
                bound: 4096
            })
        );
    }

    #[test]
    fn larger_page_is_accepted() {
        let config = AllocatorConfig::new(4096, 16384, SizeClassTable::default())
            .expect("16K pages on a 4K system");
        assert_eq!(config.page_size(), 16384);
        assert_eq!(config.slab_capacity(0), Some((16384 - 64) / 16));
    }

    #[test]
    fn parse_page_size_forms() {
        assert_eq!(parse_page_size("4096"), Ok(4096));
        assert_eq!(parse_page_size(" 0x4000 "), Ok(0x4000));
        assert_eq!(parse_page_size("0X1000"), Ok(0x1000));
        assert!(matches!(
            parse_page_size("lots"),
            Err(ConfigError::Parse { var: PAGE_SIZE_ENV, .. })
        ));
    }

    #[test]
    fn parse_size_class_list() {
        assert_eq!(parse_size_classes("16, 48,96"), Ok(vec![16, 48, 96]));
        assert!(matches!(
            parse_size_classes("16,,32"),
            Err(ConfigError::Parse { var: SIZE_CLASSES_ENV, .. })
        ));
    }

    #[test]
    fn lookup_applies_overrides() {
        let config = AllocatorConfig::from_lookup(
            4096,
            lookup_from(&[(PAGE_SIZE_ENV, "8192"), (SIZE_CLASSES_ENV, "8,40,512")]),
        )
        .expect("valid overrides");
        assert_eq!(config.page_size(), 8192);
        assert_eq!(config.large_threshold(), 512);
        assert_eq!(config.classes().class_of(9), Some(1));
    }

    #[test]
    fn invalid_overrides_fall_back_to_defaults() {
        let config =
            AllocatorConfig::from_lookup(4096, lookup_from(&[(SIZE_CLASSES_ENV, "64,32")]))
                .expect("fallback defaults");
        assert_eq!(config, AllocatorConfig::default_for(4096).expect("defaults"));

        let config = AllocatorConfig::from_lookup(4096, lookup_from(&[(PAGE_SIZE_ENV, "1000")]))
            .expect("fallback defaults");
        assert_eq!(config.page_size(), 4096);
    }

    #[test]
    fn fallback_is_a_valid_configuration() {
        let fallback = AllocatorConfig::fallback();
        assert_eq!(
            AllocatorConfig::new(
                FALLBACK_PAGE_SIZE,
                fallback.page_size(),
                fallback.classes().clone()
            ),
            Ok(fallback)
        );
    }

    #[test]
    fn absent_overrides_use_defaults() {
        let config = AllocatorConfig::from_lookup(4096, |_| None).expect("defaults");
        assert_eq!(config, AllocatorConfig::default_for(4096).expect("defaults"));
    }
}
