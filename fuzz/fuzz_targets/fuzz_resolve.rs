//! Fuzz target for last-write-wins resolution.
//!
//! Every region must pick the same winner for any pair of versions,
//! including empty and non-ASCII region ids.

#![no_main]

use libfuzzer_sys::fuzz_target;
use region_sync::record::Version;
use region_sync::resolver::{resolve, winner, Resolution};

fuzz_target!(|data: (i64, &str, bool, i64, &str, bool)| {
    let (ts_a, region_a, del_a, ts_b, region_b, del_b) = data;
    let a = Version::new(ts_a, region_a, del_a);
    let b = Version::new(ts_b, region_b, del_b);

    assert_eq!(winner(&a, &b), winner(&b, &a));
    assert_eq!(resolve(&a, &a), Resolution::KeepLocal);
    if a != b {
        assert_ne!(resolve(&a, &b), resolve(&b, &a));
    }
});
