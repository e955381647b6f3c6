//! Wire protocol between the engine and an out-of-process application.
//!
//! Callbacks travel on the `.BA` pipe as [`BaEvent`](super::BaEvent) JSON
//! under [`MESSAGE_TYPE_BA_EVENT`]; the RPC reply carries a
//! [`BaReply`](super::BaReply). Requests from the application travel on the
//! `.BAEngine` pipe as [`EngineRequest`] JSON under
//! [`MESSAGE_TYPE_ENGINE_REQUEST`] and are answered with an
//! [`EngineResponse`].

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::{BundleAction, DownloadSource};

/// Protocol revision passed to the application on its command line.
pub const BOOTSTRAPPER_APPLICATION_API_VERSION: u32 = 1;

pub const MESSAGE_TYPE_BA_EVENT: u32 = 1;
pub const MESSAGE_TYPE_ENGINE_REQUEST: u32 = 2;

/// Command-line switches the application is launched with.
pub mod switches {
    pub const PIPE: &str = "--burn-pipe";
    pub const PIPE_DIRECTORY: &str = "--burn-pipe-dir";
    pub const SECRET: &str = "--burn-secret";
    pub const API_VERSION: &str = "--burn-api";
}

/// Log severity chosen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warning,
    #[default]
    Standard,
    Verbose,
    Debug,
}

/// A function call from the application.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum EngineRequest {
    Detect,
    Plan {
        action: BundleAction,
    },
    Elevate,
    Apply,
    Quit {
        exit_code: u32,
    },
    LaunchApprovedExe {
        id: String,
        #[serde(default)]
        arguments: Option<String>,
        #[serde(default)]
        wait_ms: Option<u64>,
    },

    GetVariableNumeric {
        name: String,
    },
    GetVariableString {
        name: String,
    },
    GetVariableVersion {
        name: String,
    },
    SetVariableNumeric {
        name: String,
        value: i64,
    },
    /// `None` removes the variable.
    SetVariableString {
        name: String,
        value: Option<String>,
        #[serde(default)]
        formatted: bool,
    },
    SetVariableVersion {
        name: String,
        value: Option<String>,
    },
    FormatString {
        input: String,
    },
    EscapeString {
        input: String,
    },
    EvaluateCondition {
        condition: String,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    SetUpdateSource {
        url: String,
    },
    SetLocalSource {
        /// Package or container id.
        id: String,
        #[serde(default)]
        payload_key: Option<String>,
        path: PathBuf,
    },
    SetDownloadSource {
        id: String,
        #[serde(default)]
        payload_key: Option<String>,
        source: DownloadSource,
    },
}

impl EngineRequest {
    /// Short name used in logs. Requests may carry secrets, so this is all
    /// that is ever logged about one.
    pub fn name(&self) -> &'static str {
        match self {
            EngineRequest::Detect => "detect",
            EngineRequest::Plan { .. } => "plan",
            EngineRequest::Elevate => "elevate",
            EngineRequest::Apply => "apply",
            EngineRequest::Quit { .. } => "quit",
            EngineRequest::LaunchApprovedExe { .. } => "launch_approved_exe",
            EngineRequest::GetVariableNumeric { .. } => "get_variable_numeric",
            EngineRequest::GetVariableString { .. } => "get_variable_string",
            EngineRequest::GetVariableVersion { .. } => "get_variable_version",
            EngineRequest::SetVariableNumeric { .. } => "set_variable_numeric",
            EngineRequest::SetVariableString { .. } => "set_variable_string",
            EngineRequest::SetVariableVersion { .. } => "set_variable_version",
            EngineRequest::FormatString { .. } => "format_string",
            EngineRequest::EscapeString { .. } => "escape_string",
            EngineRequest::EvaluateCondition { .. } => "evaluate_condition",
            EngineRequest::Log { .. } => "log",
            EngineRequest::SetUpdateSource { .. } => "set_update_source",
            EngineRequest::SetLocalSource { .. } => "set_local_source",
            EngineRequest::SetDownloadSource { .. } => "set_download_source",
        }
    }
}

impl fmt::Debug for EngineRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRequest")
            .field("function", &self.name())
            .finish_non_exhaustive()
    }
}

/// The engine's answer to an [`EngineRequest`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineResponse {
    Done,
    Numeric { value: i64 },
    String { value: String },
    Version { value: String },
    Condition { value: bool },
}

impl fmt::Debug for EngineResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineResponse::Done => f.write_str("Done"),
            EngineResponse::Numeric { value } => write!(f, "Numeric({value})"),
            EngineResponse::String { .. } => f.write_str("String([REDACTED])"),
            EngineResponse::Version { value } => write!(f, "Version({value})"),
            EngineResponse::Condition { value } => write!(f, "Condition({value})"),
        }
    }
}
