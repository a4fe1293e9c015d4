//! Large-region counts on the process ledger. Kept alone in its own binary
//! so no other test maps large regions while the counts are compared.

use std::sync::Arc;

use tagalloc::{AllocatorConfig, CountingProvider, LargeLedger, ThreadHeap, os_page_size};

#[test]
fn released_elsewhere_then_allocated_again_counts_one_live_region() {
    let config = Arc::new(AllocatorConfig::default_for(os_page_size()).expect("default config"));
    let mapped = config.large_mapping_len(5000).expect("mapping length");
    let provider = Arc::new(CountingProvider::default());
    let mut a = ThreadHeap::with_provider(Arc::clone(&config), Arc::clone(&provider));
    let mut b = ThreadHeap::with_provider(config, Arc::clone(&provider));
    assert!(Arc::ptr_eq(a.ledger(), &LargeLedger::process()));
    assert!(Arc::ptr_eq(a.ledger(), b.ledger()));
    let baseline = b.stats().occupancy();
    assert_eq!(baseline.live_large, 0);

    let first = a.allocate(5000).expect("large on a");
    // SAFETY: first is a live large block; large blocks release through any heap.
    unsafe { b.release(first.as_ptr()) }.expect("release on b");
    assert_eq!(b.stats().occupancy(), baseline);

    let second = b.allocate(5000).expect("large on b");
    let stats = b.stats();
    assert_eq!(stats.live_large(), baseline.live_large + 1);
    assert_eq!(stats.large_live_bytes, baseline.large_live_bytes + mapped);
    assert_eq!(a.stats().live_large(), stats.live_large());
    assert_eq!(provider.live_regions(), 1);

    // SAFETY: second is a live large block.
    unsafe { a.release(second.as_ptr()) }.expect("release on a");
    assert_eq!(a.stats().occupancy(), baseline);
    assert_eq!(b.stats().occupancy(), baseline);
    assert_eq!(provider.live_regions(), 0);
}
