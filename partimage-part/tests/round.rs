#![allow(missing_docs)]

use log as _;
use num_traits as _;
use tempfile as _;
use test_log::test;
use thiserror as _;

#[test]
fn round_down() {
    assert_eq!(partimage_part::round_down(1000_u64, 512), 512);
}

#[test]
fn round_down_already_aligned() {
    assert_eq!(partimage_part::round_down(1024_u64, 512), 1024);
}

#[test]
#[should_panic]
fn round_down_null_multiple() {
    let _ = partimage_part::round_down(42_u64, 0);
}
