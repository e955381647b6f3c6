//! Fuzz target for version parsing and ordering.
//!
//! Run with: cargo +nightly fuzz run fuzz_version_parse
//!
//! Input is `left|right`; both halves are parsed and their ordering must be
//! antisymmetric.

#![no_main]

use burn_core::Version;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let _ = Version::parse(text).to_string();
    let _ = Version::parse_strict(text);
    if let Some((left, right)) = text.split_once('|') {
        let (a, b) = (Version::parse(left), Version::parse(right));
        assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
    }
});
