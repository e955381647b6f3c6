//! Bootstrapper application hosting.
//!
//! The engine talks to its application through [`BootstrapperApplication`].
//! An out-of-process application is started by [`BaHost`] and reached
//! through [`RemoteBa`]; its requests arrive at an [`EngineApi`], which
//! answers reads at once and feeds engine work into the [`ActionQueue`].

pub mod api;
pub mod client;
pub mod events;
pub mod host;
pub mod passive;
pub mod protocol;
pub mod queue;
pub mod remote;

pub use api::{EngineApi, PendingSources, SourceChange, apply_source_changes};
pub use client::{BaConnection, BaLaunchArgs, connect_to_engine, serve_callbacks};
pub use events::{
    AllowedResults, BaCommand, BaEvent, BaReply, BootstrapperApplication, ErrorType, NullBa,
    UiResult,
};
pub use host::{BaHost, HostError, HostOptions, StopOutcome};
pub use passive::PassiveBa;
pub use protocol::{EngineRequest, EngineResponse, LogLevel};
pub use queue::{ActionQueue, EngineAction, EngineActivity};
pub use remote::RemoteBa;
