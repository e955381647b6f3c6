//! Fuzz target for bundle manifest parsing and validation.
//!
//! Run with: cargo +nightly fuzz run fuzz_manifest_parse

#![no_main]

use burn_core::BundleModel;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = BundleModel::from_toml(s);
        let _ = BundleModel::from_json(s);
    }
});
