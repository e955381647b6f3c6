//! Tagged variable values.
//!
//! A [`Variant`] is empty, numeric, a literal string, a formatted string
//! (expanded through the variable store when read), or a version. String
//! payloads live in a [`ProtectedString`] so a variant flagged for
//! encryption never holds plaintext at rest.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroizing;

use crate::protected::{ProtectError, ProtectedString};
use crate::version::Version;

/// Errors from reading or converting a variant.
#[derive(Debug, thiserror::Error)]
pub enum VariantError {
    #[error("variant is empty")]
    Empty,

    #[error("cannot convert {from:?} value to {to:?}")]
    TypeMismatch { from: VariantType, to: VariantType },

    #[error(transparent)]
    Protect(#[from] ProtectError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantType {
    None,
    Numeric,
    String,
    Formatted,
    Version,
}

#[derive(Clone, Default)]
enum Value {
    #[default]
    None,
    Numeric(i64),
    String(ProtectedString),
    Formatted(ProtectedString),
    Version(Version),
}

/// A variable value plus its encryption flag.
#[derive(Clone, Default)]
pub struct Variant {
    value: Value,
    encrypt: bool,
}

static INVALID_VERSION_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_invalid_version(version: &Version) {
    if version.invalid && !INVALID_VERSION_WARNED.swap(true, Ordering::Relaxed) {
        warn!("Converted a string to an invalid version; comparisons treat it as lowest");
    }
}

impl Variant {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn numeric(value: i64) -> Self {
        Self {
            value: Value::Numeric(value),
            encrypt: false,
        }
    }

    pub fn string(value: &str) -> Self {
        Self {
            value: Value::String(ProtectedString::new(value)),
            encrypt: false,
        }
    }

    pub fn formatted(value: &str) -> Self {
        Self {
            value: Value::Formatted(ProtectedString::new(value)),
            encrypt: false,
        }
    }

    pub fn version(value: Version) -> Self {
        Self {
            value: Value::Version(value),
            encrypt: false,
        }
    }

    pub fn kind(&self) -> VariantType {
        match self.value {
            Value::None => VariantType::None,
            Value::Numeric(_) => VariantType::Numeric,
            Value::String(_) => VariantType::String,
            Value::Formatted(_) => VariantType::Formatted,
            Value::Version(_) => VariantType::Version,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self.value, Value::None)
    }

    /// Whether this variant is flagged for in-memory encryption.
    pub fn is_encrypted(&self) -> bool {
        self.encrypt
    }

    /// Whether string content is currently held as ciphertext.
    pub fn holds_ciphertext(&self) -> bool {
        match &self.value {
            Value::String(s) | Value::Formatted(s) => s.is_encrypted(),
            _ => false,
        }
    }

    /// Turn in-memory encryption on or off. Non-string values only record
    /// the flag so a later string assignment is encrypted.
    pub fn set_encryption(&mut self, encrypt: bool) -> Result<(), VariantError> {
        self.encrypt = encrypt;
        if let Value::String(s) | Value::Formatted(s) = &mut self.value {
            s.set_encrypted(encrypt)?;
        }
        Ok(())
    }

    /// Assign a new value. The encryption flag of either side survives.
    pub fn assign(&mut self, value: Variant) -> Result<(), VariantError> {
        let encrypt = self.encrypt || value.encrypt;
        self.value = value.value;
        self.set_encryption(encrypt)
    }

    pub fn get_numeric(&mut self) -> Result<i64, VariantError> {
        let from = self.kind();
        let mismatch = VariantError::TypeMismatch {
            from,
            to: VariantType::Numeric,
        };
        match &mut self.value {
            Value::None => Err(VariantError::Empty),
            Value::Numeric(n) => Ok(*n),
            Value::String(s) | Value::Formatted(s) => s
                .with_plaintext(|text| text.trim().parse::<i64>().ok())?
                .ok_or(mismatch),
            Value::Version(_) => Err(mismatch),
        }
    }

    /// Read the value as text. Formatted strings come back unexpanded.
    pub fn get_string(&mut self) -> Result<Zeroizing<String>, VariantError> {
        match &mut self.value {
            Value::None => Err(VariantError::Empty),
            Value::Numeric(n) => Ok(Zeroizing::new(n.to_string())),
            Value::String(s) | Value::Formatted(s) => Ok(s.reveal()?),
            Value::Version(v) => Ok(Zeroizing::new(v.to_string())),
        }
    }

    pub fn get_version(&mut self) -> Result<Version, VariantError> {
        match &mut self.value {
            Value::None => Err(VariantError::Empty),
            Value::Numeric(n) => {
                let version = Version::parse(&n.to_string());
                warn_invalid_version(&version);
                Ok(version)
            }
            Value::String(s) | Value::Formatted(s) => {
                let version = s.with_plaintext(Version::parse)?;
                warn_invalid_version(&version);
                Ok(version)
            }
            Value::Version(v) => Ok(v.clone()),
        }
    }

    /// Convert in place to another type, keeping the encryption flag.
    /// The previous string buffer is zeroized.
    pub fn change_type(&mut self, kind: VariantType) -> Result<(), VariantError> {
        if self.kind() == kind {
            return Ok(());
        }
        let converted = match kind {
            VariantType::None => Value::None,
            VariantType::Numeric => Value::Numeric(self.get_numeric()?),
            VariantType::String => Value::String(ProtectedString::new(&self.get_string()?)),
            VariantType::Formatted => {
                Value::Formatted(ProtectedString::new(&self.get_string()?))
            }
            VariantType::Version => Value::Version(self.get_version()?),
        };
        self.value = converted;
        let encrypt = self.encrypt;
        self.set_encryption(encrypt)
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Variant");
        s.field("kind", &self.kind());
        match &self.value {
            Value::Numeric(n) if !self.encrypt => s.field("value", n),
            Value::Version(v) if !self.encrypt => s.field("value", &v.as_str()),
            Value::None => s.field("value", &"<none>"),
            _ => s.field("value", &"[REDACTED]"),
        };
        s.field("encrypted", &self.encrypt).finish()
    }
}
