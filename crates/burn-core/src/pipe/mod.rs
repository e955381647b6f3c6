//! Pipe transport between the engine, its elevated companion and the
//! bootstrapper application.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   <name>          ┌──────────────────┐
//! │    Engine    │◀─────────────────▶│ Elevated         │
//! │  (unelevated)│   <name>.Cache    │ companion        │
//! │              │◀─────────────────▶│                  │
//! │              │   <name>.Log      │                  │
//! │              │◀──────────────────│                  │
//! └──────┬───────┘                   └──────────────────┘
//!        │ <name>.BA (engine → UI callbacks, RPC)
//!        │ <name>.BAEngine (UI → engine requests, RPC)
//! ┌──────▼───────┐
//! │ Bootstrapper │
//! │ application  │
//! └──────────────┘
//! ```
//!
//! Every connection is authenticated by a secret handshake before any
//! application message is read; the [`PipeChannel`] type state enforces it.

pub mod channel;
pub mod endpoint;
pub mod frame;
pub mod handshake;
pub mod process;
pub mod rpc;

pub use channel::{
    Authenticated, BoxedStream, MessageHandler, NoopHandler, PipeChannel, PipeStream,
    PumpOutcome, Unauthenticated,
};
pub use endpoint::{PipeListener, connect, wait_for_client};
pub use frame::{
    MESSAGE_TYPE_COMPLETE, MESSAGE_TYPE_DISCONNECT, MESSAGE_TYPE_LOG, MESSAGE_TYPE_TERMINATE,
    PayloadReader, PayloadWriter, PipeMessage,
};
pub use process::{ExitWait, ParentProcess, ProcessWatch, Unwatched};
pub use rpc::{RpcHandle, RpcReply, RpcService, serve_rpc};

use crate::hresult::HResult;

/// Suffix of the companion's cache pipe.
pub const CACHE_PIPE_SUFFIX: &str = ".Cache";
/// Suffix of the companion's log pipe.
pub const LOG_PIPE_SUFFIX: &str = ".Log";
/// Suffix of the engine-to-application callback pipe.
pub const BA_CALLBACK_PIPE_SUFFIX: &str = ".BA";
/// Suffix of the application-to-engine request pipe.
pub const BA_ENGINE_PIPE_SUFFIX: &str = ".BAEngine";

/// Errors from the pipe transport.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("pipe I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message truncated")]
    Truncated,

    #[error("payload of {0} bytes exceeds the message limit")]
    PayloadTooLarge(usize),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("secret of {0} UTF-16 units exceeds the handshake limit")]
    SecretTooLong(usize),

    #[error("secret mismatch")]
    SecretMismatch,

    #[error("handshake rejected by peer: {0}")]
    HandshakeRejected(HResult),

    #[error("timed out waiting for client connection")]
    ConnectTimeout,

    #[error("client process exited before connecting")]
    ClientExited,

    #[error("peer disconnected")]
    Disconnected,

    #[error("peer terminated the session with exit code {exit_code}")]
    Terminated { exit_code: u32 },

    #[error("remote call failed: {0}")]
    Remote(HResult),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipeError {
    /// Result code reported across process boundaries for this error.
    pub fn hresult(&self) -> HResult {
        match self {
            PipeError::Io(e) => match e.kind() {
                std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset => HResult::BROKEN_PIPE,
                std::io::ErrorKind::PermissionDenied => HResult::E_ACCESSDENIED,
                _ => HResult::E_FAIL,
            },
            PipeError::Truncated | PipeError::Malformed(_) | PipeError::Json(_) => {
                HResult::INVALID_DATA
            }
            PipeError::PayloadTooLarge(_) | PipeError::SecretTooLong(_) => HResult::INVALID_DATA,
            PipeError::SecretMismatch => HResult::INVALID_DATA,
            PipeError::HandshakeRejected(hr) | PipeError::Remote(hr) => *hr,
            PipeError::ConnectTimeout => HResult::TIMEOUT,
            PipeError::ClientExited | PipeError::Disconnected => HResult::BROKEN_PIPE,
            PipeError::Terminated { .. } => HResult::E_ABORT,
        }
    }
}
