//! Fuzz target for the condition evaluator.
//!
//! Run with: cargo +nightly fuzz run fuzz_condition_eval

#![no_main]

use burn_core::Variables;
use burn_core::condition::evaluate;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(condition) = std::str::from_utf8(data) else {
        return;
    };
    let mut variables = Variables::new();
    let _ = variables.set_numeric("One", 1);
    let _ = variables.set_string("Name", "burn");
    let _ = evaluate(condition, &mut variables);
});
