#![deny(unsafe_code)]

//! Shared test utilities for the Burn workspace.
//!
//! Provides bundle builders, scripted stand-ins for the engine's
//! capabilities, authenticated in-memory pipes, config builders and tracing
//! helpers so that individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! burn-test-utils = { workspace = true }
//! ```
//!
//! Within `burn-core` itself, use it from `tests/` only: unit tests see a
//! different copy of the core types.

pub mod ba;
pub mod bundle;
pub mod config;
pub mod pipe;
pub mod services;
pub mod tracing_setup;

pub use ba::ScriptedBa;
pub use bundle::{TestBundleBuilder, TestPackage};
pub use config::TestConfigBuilder;
pub use pipe::{ba_pipe_pair, pipe_pair};
pub use services::{MemoryCache, RecordingRegistrar, ScriptedExecutor};
pub use tracing_setup::init_test_tracing;
