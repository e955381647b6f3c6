#![deny(unsafe_code)]

//! Burn bootstrapper engine.
//!
//! Detects the state of a bundle's packages, plans the cache, execute and
//! rollback actions needed to reach the requested state, and applies that
//! plan, optionally through an elevated companion process. A separate
//! bootstrapper application drives the engine over an authenticated pipe.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future for async trait methods used
/// through `dyn Trait`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Apply engine: cache, execute and rollback.
pub mod apply;
/// Bootstrapper application host and protocol.
pub mod ba;
pub mod build_info;
/// Install and detect condition evaluator.
pub mod condition;
/// Detect pass and registration probes.
pub mod detect;
/// Elevated companion process.
pub mod elevation;
/// Engine context and action loop.
pub mod engine;
/// Result codes carried across process boundaries.
pub mod hresult;
/// Log forwarding from the companion.
pub mod logging;
/// Bundle data model.
pub mod model;
/// Pipe transport and RPC.
pub mod pipe;
/// Plan engine.
pub mod plan;
/// In-memory encrypted strings.
pub mod protected;
/// Secret generation and key handling.
pub mod security;
pub mod variables;
pub mod variant;
pub mod version;

pub use engine::EngineContext;
pub use hresult::HResult;
pub use model::BundleModel;
pub use plan::Plan;
pub use variables::Variables;
pub use variant::Variant;
pub use version::Version;
