//! Messages exchanged with the elevated companion.
//!
//! Each message is JSON under its own numeric type. Requests are answered
//! with a `COMPLETE` whose `u32` is a packed result: a failure `HResult`
//! has its high bit set, so anything below `0x8000_0000` is a success value
//! (a [`Restart`], a process id, or zero).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::apply::{LaunchCommand, PackageOperation, RegistrationOp};
use crate::ba::events::{AllowedResults, UiResult};
use crate::hresult::HResult;
use crate::model::{Container, Payload, Restart};
use crate::pipe::{PipeError, PipeMessage};

/// Message types. Main pipe: 1-19. Cache pipe: 20-39. Companion to
/// engine: 100 and up.
pub mod message_type {
    pub const EXECUTE_PACKAGE: u32 = 1;
    pub const BEGIN_TRANSACTION: u32 = 2;
    pub const COMMIT_TRANSACTION: u32 = 3;
    pub const ROLLBACK_TRANSACTION: u32 = 4;
    pub const REGISTRATION: u32 = 5;
    pub const LAUNCH_APPROVED_EXE: u32 = 6;

    pub const ACQUIRE_CONTAINER: u32 = 20;
    pub const EXTRACT_CONTAINER: u32 = 21;
    pub const ACQUIRE_PAYLOAD: u32 = 22;
    pub const CACHE_PAYLOAD: u32 = 23;
    pub const LAYOUT_PAYLOAD: u32 = 24;
    pub const LAYOUT_BUNDLE: u32 = 25;
    pub const REMOVE_PACKAGE: u32 = 26;

    pub const PROGRESS: u32 = 100;
    pub const ERROR: u32 = 101;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElevationMessage {
    ExecutePackage {
        operation: PackageOperation,
    },
    BeginTransaction {
        boundary_id: String,
    },
    CommitTransaction {
        boundary_id: String,
    },
    RollbackTransaction {
        boundary_id: String,
    },
    Registration {
        op: RegistrationOp,
    },
    LaunchApprovedExe {
        command: LaunchCommand,
    },

    AcquireContainer {
        container: Container,
        source_directory: PathBuf,
    },
    ExtractContainer {
        container: Container,
        source_directory: PathBuf,
        payloads: Vec<Payload>,
    },
    AcquirePayload {
        payload: Payload,
        source_directory: PathBuf,
    },
    CachePayload {
        package_id: String,
        payload: Payload,
    },
    LayoutPayload {
        payload: Payload,
        directory: PathBuf,
    },
    LayoutBundle {
        directory: PathBuf,
    },
    RemovePackage {
        package_id: String,
    },

    Progress {
        percentage: u32,
    },
    Error {
        code: HResult,
        message: String,
        allowed: AllowedResults,
    },
}

impl ElevationMessage {
    pub fn message_type(&self) -> u32 {
        use message_type::*;
        match self {
            ElevationMessage::ExecutePackage { .. } => EXECUTE_PACKAGE,
            ElevationMessage::BeginTransaction { .. } => BEGIN_TRANSACTION,
            ElevationMessage::CommitTransaction { .. } => COMMIT_TRANSACTION,
            ElevationMessage::RollbackTransaction { .. } => ROLLBACK_TRANSACTION,
            ElevationMessage::Registration { .. } => REGISTRATION,
            ElevationMessage::LaunchApprovedExe { .. } => LAUNCH_APPROVED_EXE,
            ElevationMessage::AcquireContainer { .. } => ACQUIRE_CONTAINER,
            ElevationMessage::ExtractContainer { .. } => EXTRACT_CONTAINER,
            ElevationMessage::AcquirePayload { .. } => ACQUIRE_PAYLOAD,
            ElevationMessage::CachePayload { .. } => CACHE_PAYLOAD,
            ElevationMessage::LayoutPayload { .. } => LAYOUT_PAYLOAD,
            ElevationMessage::LayoutBundle { .. } => LAYOUT_BUNDLE,
            ElevationMessage::RemovePackage { .. } => REMOVE_PACKAGE,
            ElevationMessage::Progress { .. } => PROGRESS,
            ElevationMessage::Error { .. } => ERROR,
        }
    }

    pub fn encode(&self) -> Result<(u32, Vec<u8>), PipeError> {
        Ok((self.message_type(), serde_json::to_vec(self)?))
    }

    /// Parse a message, rejecting one whose body does not match its type.
    pub fn decode(message: &PipeMessage) -> Result<Self, PipeError> {
        let parsed: Self = serde_json::from_slice(&message.payload)?;
        if parsed.message_type() != message.message_type {
            return Err(PipeError::Malformed("message body does not match its type"));
        }
        Ok(parsed)
    }
}

pub fn encode_status(result: Result<(), HResult>) -> u32 {
    match result {
        Ok(()) => HResult::S_OK.as_u32(),
        Err(hr) => hr.as_u32(),
    }
}

pub fn decode_status(raw: u32) -> Result<(), HResult> {
    HResult::from_u32(raw).ok()
}

pub fn encode_restart(result: Result<Restart, HResult>) -> u32 {
    match result {
        Ok(Restart::None) => 0,
        Ok(Restart::Required) => 1,
        Ok(Restart::Initiated) => 2,
        Err(hr) => hr.as_u32(),
    }
}

pub fn decode_restart(raw: u32) -> Result<Restart, HResult> {
    HResult::from_u32(raw).ok()?;
    Ok(match raw {
        0 => Restart::None,
        1 => Restart::Required,
        _ => Restart::Initiated,
    })
}

pub fn encode_value(result: Result<u32, HResult>) -> u32 {
    match result {
        Ok(value) => value & 0x7FFF_FFFF,
        Err(hr) => hr.as_u32(),
    }
}

pub fn decode_value(raw: u32) -> Result<u32, HResult> {
    HResult::from_u32(raw).ok()?;
    Ok(raw)
}

/// A user's answer as carried in a `COMPLETE`.
pub fn ui_result_to_wire(result: UiResult) -> u32 {
    UiResult::ALL
        .iter()
        .position(|r| *r == result)
        .and_then(|i| u32::try_from(i).ok())
        .unwrap_or(0)
}

pub fn ui_result_from_wire(raw: u32) -> UiResult {
    usize::try_from(raw)
        .ok()
        .and_then(|i| UiResult::ALL.get(i).copied())
        .unwrap_or_default()
}
