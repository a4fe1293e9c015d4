//! A release whose page tag is not live must kill the process. Each case
//! re-runs this test binary filtered to a single child test with
//! `TAGALLOC_FATAL_CHILD` set; the child performs the bad release and the
//! parent checks that it died from `SIGABRT`.

use std::os::unix::process::ExitStatusExt;
use std::process::Command;

use tagalloc::{MmapProvider, PageProvider};

const CHILD_ENV: &str = "TAGALLOC_FATAL_CHILD";

fn in_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

fn expect_abort(test_name: &str) {
    let exe = std::env::current_exe().expect("test binary path");
    let output = Command::new(exe)
        .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .expect("spawn child");
    assert!(!output.status.success(), "child survived: {output:?}");
    assert_eq!(
        output.status.signal(),
        Some(libc::SIGABRT),
        "child should abort: {output:?}"
    );
}

#[test]
fn unknown_tag_child() {
    if !in_child() {
        return;
    }
    // A mapped page that tagalloc never stamped: its first word is zero.
    let page = tagalloc::config().page_size();
    let base = MmapProvider::new().map(page, page).expect("foreign page");
    // SAFETY: the page is mapped, so reading its tag is sound.
    let _ = unsafe { tagalloc::release(base.as_ptr().wrapping_add(64)) };
    unreachable!("release of an untagged page returned");
}

#[test]
fn corrupted_tag_child() {
    if !in_child() {
        return;
    }
    // Keep a sibling slot alive so the slab survives, then corrupt the
    // page's tag word by hand to something that is not a live kind.
    let _keep = tagalloc::allocate(32).expect("keep");
    let victim = tagalloc::allocate(32).expect("victim");
    let base = tagalloc::page_base(victim.as_ptr() as usize, tagalloc::config().page_size());
    // SAFETY: the slab page is mapped; overwriting its tag is the point.
    unsafe {
        (base as *mut u64).write(0x4141_4141_4141_4141);
        let _ = tagalloc::release(victim.as_ptr());
    }
    unreachable!("release through a corrupted tag returned");
}

#[test]
fn usable_size_of_untagged_page_child() {
    if !in_child() {
        return;
    }
    let page = tagalloc::config().page_size();
    let base = MmapProvider::new().map(page, page).expect("foreign page");
    // SAFETY: the page is mapped.
    let _ = unsafe { tagalloc::usable_size(base.as_ptr()) };
    unreachable!("usable_size of an untagged page returned");
}

#[test]
fn release_of_untagged_page_aborts() {
    if in_child() {
        return;
    }
    expect_abort("unknown_tag_child");
}

#[test]
fn release_through_corrupted_tag_aborts() {
    if in_child() {
        return;
    }
    expect_abort("corrupted_tag_child");
}

#[test]
fn usable_size_of_untagged_page_aborts() {
    if in_child() {
        return;
    }
    expect_abort("usable_size_of_untagged_page_child");
}
