//! Wire result codes.
//!
//! Every result that crosses a process boundary (pipe `COMPLETE` payloads,
//! RPC response headers, package exit codes) is carried as an [`HResult`]:
//! a signed 32-bit status where a set high bit means failure.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A 32-bit status code. Negative values are failures.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HResult(pub i32);

const fn code(value: u32) -> HResult {
    HResult(value as i32)
}

impl HResult {
    pub const S_OK: Self = code(0);
    pub const S_FALSE: Self = code(1);
    pub const E_NOTIMPL: Self = code(0x8000_4001);
    pub const E_ABORT: Self = code(0x8000_4004);
    pub const E_FAIL: Self = code(0x8000_4005);
    pub const E_ACCESSDENIED: Self = code(0x8007_0005);
    pub const E_OUTOFMEMORY: Self = code(0x8007_000E);
    pub const E_INVALIDARG: Self = code(0x8007_0057);

    pub const INVALID_DATA: Self = Self::from_win32(13);
    pub const BROKEN_PIPE: Self = Self::from_win32(109);
    pub const BUSY: Self = Self::from_win32(170);
    pub const NOT_FOUND: Self = Self::from_win32(1168);
    pub const ALREADY_INITIALIZED: Self = Self::from_win32(1247);
    pub const TIMEOUT: Self = Self::from_win32(1460);
    pub const INSTALL_USEREXIT: Self = Self::from_win32(1602);
    pub const INSTALL_FAILURE: Self = Self::from_win32(1603);
    pub const INVALID_STATE: Self = Self::from_win32(5023);

    /// Wrap a Win32 error code the way `HRESULT_FROM_WIN32` does.
    pub const fn from_win32(error: u32) -> Self {
        if error == 0 {
            Self::S_OK
        } else {
            code((error & 0xFFFF) | 0x8007_0000)
        }
    }

    pub const fn is_success(self) -> bool {
        self.0 >= 0
    }

    pub const fn is_failure(self) -> bool {
        self.0 < 0
    }

    /// The Win32 code inside a `FACILITY_WIN32` failure, if that is what this is.
    pub const fn win32_code(self) -> Option<u32> {
        let raw = self.0 as u32;
        if raw & 0xFFFF_0000 == 0x8007_0000 {
            Some(raw & 0xFFFF)
        } else {
            None
        }
    }

    pub const fn as_u32(self) -> u32 {
        self.0 as u32
    }

    pub const fn from_u32(raw: u32) -> Self {
        Self(raw as i32)
    }

    /// `Ok(())` for success codes, `Err(self)` for failures.
    pub fn ok(self) -> Result<(), HResult> {
        if self.is_success() { Ok(()) } else { Err(self) }
    }
}

impl Default for HResult {
    fn default() -> Self {
        Self::S_OK
    }
}

impl fmt::Display for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.as_u32())
    }
}

impl fmt::Debug for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HResult(0x{:08x})", self.as_u32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_win32() {
        assert_eq!(HResult::INSTALL_USEREXIT.as_u32(), 0x8007_0642);
        assert_eq!(HResult::INVALID_DATA.as_u32(), 0x8007_000D);
        assert_eq!(HResult::from_win32(0), HResult::S_OK);
    }

    #[test]
    fn test_success_and_failure() {
        assert!(HResult::S_OK.is_success());
        assert!(HResult::S_FALSE.is_success());
        assert!(HResult::E_FAIL.is_failure());
        assert!(HResult::E_FAIL.ok().is_err());
    }

    #[test]
    fn test_win32_code_roundtrip() {
        assert_eq!(HResult::INSTALL_FAILURE.win32_code(), Some(1603));
        assert_eq!(HResult::E_FAIL.win32_code(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(HResult::E_ABORT.to_string(), "0x80004004");
    }
}
