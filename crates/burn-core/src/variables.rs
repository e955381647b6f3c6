//! Named variable store with `[Name]` formatting.
//!
//! Variables hold a [`Variant`] plus visibility and persistence flags.
//! Hidden variables are always encrypted in memory and render as `*****`
//! when a string is formatted for logging.
//!
//! ## Formatting rules
//!
//! - `[Name]` expands to the variable's value; unknown names expand to empty.
//! - `[\c]` expands to the literal character `c`.
//! - Anything else in brackets (including `[]`) is copied through verbatim.
//! - Formatted-type values are expanded recursively, up to a fixed depth.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;
use zeroize::Zeroizing;

use crate::hresult::HResult;
use crate::variant::{Variant, VariantError, VariantType};
use crate::version::Version;

/// Maximum nesting when expanding formatted variables.
const MAX_FORMAT_DEPTH: usize = 16;

/// Text substituted for hidden values in obfuscated output.
pub const HIDDEN_VALUE: &str = "*****";

/// Well-known engine variable names.
pub mod names {
    pub const BUNDLE_ACTION: &str = "WixBundleAction";
    pub const BUNDLE_INSTALLED: &str = "WixBundleInstalled";
    pub const BUNDLE_ELEVATED: &str = "WixBundleElevated";
    pub const BUNDLE_NAME: &str = "WixBundleName";
    pub const BUNDLE_VERSION: &str = "WixBundleVersion";
    pub const BUNDLE_PROVIDER_KEY: &str = "WixBundleProviderKey";
    pub const BUNDLE_TAG: &str = "WixBundleTag";
    pub const BUNDLE_LAYOUT_DIRECTORY: &str = "WixBundleLayoutDirectory";
    pub const BUNDLE_ORIGINAL_SOURCE: &str = "WixBundleOriginalSource";
    pub const REBOOT_PENDING: &str = "RebootPending";
    pub const TEMP_FOLDER: &str = "TempFolder";
    pub const PROCESS_ID: &str = "WixBundleProcessId";
}

/// Errors from variable store operations.
#[derive(Debug, thiserror::Error)]
pub enum VariableError {
    #[error("variable not found: {0}")]
    NotFound(String),

    #[error("invalid variable name: {0:?}")]
    InvalidName(String),

    #[error("variable '{0}' is built in and cannot be overwritten")]
    BuiltIn(String),

    #[error("variable '{name}': {source}")]
    Value {
        name: String,
        #[source]
        source: VariantError,
    },

    #[error("formatting '{0}' recursed too deeply")]
    FormatDepth(String),

    #[error("variable store lock poisoned")]
    Poisoned,
}

impl VariableError {
    pub fn hresult(&self) -> HResult {
        match self {
            VariableError::NotFound(_) => HResult::NOT_FOUND,
            VariableError::InvalidName(_) | VariableError::Value { .. } => HResult::E_INVALIDARG,
            VariableError::BuiltIn(_) => HResult::E_ACCESSDENIED,
            VariableError::FormatDepth(_) => HResult::INVALID_DATA,
            VariableError::Poisoned => HResult::E_FAIL,
        }
    }
}

/// One named variable.
#[derive(Debug, Clone)]
pub struct Variable {
    pub value: Variant,
    pub hidden: bool,
    pub persisted: bool,
    pub built_in: bool,
}

/// The engine's variable store. Iteration order is by name.
#[derive(Debug, Default)]
pub struct Variables {
    entries: BTreeMap<String, Variable>,
}

/// Whether `name` can name a variable.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed process-level built-ins.
    pub fn initialize_system(&mut self) -> Result<(), VariableError> {
        let temp = std::env::temp_dir();
        self.set_built_in(
            names::TEMP_FOLDER,
            Variant::string(&temp.to_string_lossy()),
        )?;
        self.set_built_in(
            names::PROCESS_ID,
            Variant::numeric(i64::from(std::process::id())),
        )?;
        self.set_built_in(names::REBOOT_PENDING, Variant::numeric(0))
    }

    /// Declare a variable from bundle authoring.
    pub fn declare(
        &mut self,
        name: &str,
        value: Variant,
        hidden: bool,
        persisted: bool,
    ) -> Result<(), VariableError> {
        if !is_valid_name(name) {
            return Err(VariableError::InvalidName(name.to_string()));
        }
        let mut variable = Variable {
            value: Variant::none(),
            hidden,
            persisted,
            built_in: false,
        };
        variable
            .value
            .set_encryption(hidden)
            .and_then(|_| variable.value.assign(value))
            .map_err(|source| value_error(name, source))?;
        self.entries.insert(name.to_string(), variable);
        Ok(())
    }

    /// Set a variable, creating it when absent. Built-ins are read-only here.
    pub fn set(&mut self, name: &str, value: Variant) -> Result<(), VariableError> {
        self.set_inner(name, value, false)
    }

    /// Set a variable, allowing built-in values to be overwritten.
    pub fn set_built_in(&mut self, name: &str, value: Variant) -> Result<(), VariableError> {
        self.set_inner(name, value, true)
    }

    fn set_inner(
        &mut self,
        name: &str,
        value: Variant,
        built_in: bool,
    ) -> Result<(), VariableError> {
        if !is_valid_name(name) {
            return Err(VariableError::InvalidName(name.to_string()));
        }
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| Variable {
                value: Variant::none(),
                hidden: false,
                persisted: false,
                built_in,
            });
        if entry.built_in && !built_in {
            return Err(VariableError::BuiltIn(name.to_string()));
        }
        entry
            .value
            .assign(value)
            .map_err(|source| value_error(name, source))?;
        debug!(variable = name, kind = ?entry.value.kind(), "Set variable");
        Ok(())
    }

    pub fn set_numeric(&mut self, name: &str, value: i64) -> Result<(), VariableError> {
        self.set(name, Variant::numeric(value))
    }

    pub fn set_string(&mut self, name: &str, value: &str) -> Result<(), VariableError> {
        self.set(name, Variant::string(value))
    }

    pub fn set_formatted(&mut self, name: &str, value: &str) -> Result<(), VariableError> {
        self.set(name, Variant::formatted(value))
    }

    pub fn set_version(&mut self, name: &str, value: Version) -> Result<(), VariableError> {
        self.set(name, Variant::version(value))
    }

    /// Remove a non-built-in variable.
    pub fn remove(&mut self, name: &str) -> Result<(), VariableError> {
        match self.entries.get(name) {
            None => Err(VariableError::NotFound(name.to_string())),
            Some(v) if v.built_in => Err(VariableError::BuiltIn(name.to_string())),
            Some(_) => {
                self.entries.remove(name);
                Ok(())
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_hidden(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|v| v.hidden)
    }

    pub fn kind(&self, name: &str) -> Option<VariantType> {
        self.entries.get(name).map(|v| v.value.kind())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn variable_mut(&mut self, name: &str) -> Result<&mut Variable, VariableError> {
        self.entries
            .get_mut(name)
            .ok_or_else(|| VariableError::NotFound(name.to_string()))
    }

    pub fn get_numeric(&mut self, name: &str) -> Result<i64, VariableError> {
        self.variable_mut(name)?
            .value
            .get_numeric()
            .map_err(|source| value_error(name, source))
    }

    /// Raw string value. Formatted values are not expanded.
    pub fn get_string(&mut self, name: &str) -> Result<Zeroizing<String>, VariableError> {
        self.variable_mut(name)?
            .value
            .get_string()
            .map_err(|source| value_error(name, source))
    }

    pub fn get_version(&mut self, name: &str) -> Result<Version, VariableError> {
        self.variable_mut(name)?
            .value
            .get_version()
            .map_err(|source| value_error(name, source))
    }

    /// String value with formatted content expanded.
    pub fn get_formatted(&mut self, name: &str) -> Result<Zeroizing<String>, VariableError> {
        let variable = self.variable_mut(name)?;
        let raw = variable
            .value
            .get_string()
            .map_err(|source| value_error(name, source))?;
        if variable.value.kind() == VariantType::Formatted {
            self.format(&raw)
        } else {
            Ok(raw)
        }
    }

    /// Clone of the stored variant, used by condition evaluation.
    pub fn get_variant(&self, name: &str) -> Option<Variant> {
        self.entries.get(name).map(|v| v.value.clone())
    }

    /// Expand `[Name]` references.
    pub fn format(&mut self, input: &str) -> Result<Zeroizing<String>, VariableError> {
        self.format_inner(input, false, 0)
    }

    /// Expand `[Name]` references with hidden values masked, for logs.
    pub fn format_obfuscated(&mut self, input: &str) -> Result<String, VariableError> {
        self.format_inner(input, true, 0)
            .map(|s| s.as_str().to_string())
    }

    /// Escape text so that formatting yields it unchanged.
    pub fn escape(input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        for c in input.chars() {
            match c {
                '[' | ']' | '{' | '}' => {
                    out.push_str("[\\");
                    out.push(c);
                    out.push(']');
                }
                _ => out.push(c),
            }
        }
        out
    }

    /// Non-hidden persisted variables as display strings.
    pub fn persisted_values(&mut self) -> Result<BTreeMap<String, String>, VariableError> {
        let mut values = BTreeMap::new();
        for (name, variable) in &mut self.entries {
            if !variable.persisted || variable.hidden || variable.value.is_none() {
                continue;
            }
            let value = variable
                .value
                .get_string()
                .map_err(|source| value_error(name, source))?;
            values.insert(name.clone(), value.as_str().to_string());
        }
        Ok(values)
    }

    fn format_inner(
        &mut self,
        input: &str,
        obfuscate: bool,
        depth: usize,
    ) -> Result<Zeroizing<String>, VariableError> {
        if depth > MAX_FORMAT_DEPTH {
            return Err(VariableError::FormatDepth(input.to_string()));
        }

        let mut out = Zeroizing::new(String::with_capacity(input.len()));
        let mut rest = input;
        while let Some(open) = rest.find('[') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];

            if let Some(escaped) = after.strip_prefix('\\')
                && let Some(c) = escaped.chars().next()
                && escaped[c.len_utf8()..].starts_with(']')
            {
                out.push(c);
                rest = &escaped[c.len_utf8() + 1..];
                continue;
            }

            let Some(close) = after.find(']') else {
                out.push_str(&rest[open..]);
                rest = "";
                break;
            };
            let token = &after[..close];
            if token.contains('[') {
                out.push('[');
                rest = after;
                continue;
            }

            if is_valid_name(token) {
                self.append_variable(token, obfuscate, depth, &mut out)?;
            } else {
                out.push('[');
                out.push_str(token);
                out.push(']');
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn append_variable(
        &mut self,
        name: &str,
        obfuscate: bool,
        depth: usize,
        out: &mut String,
    ) -> Result<(), VariableError> {
        let Some(variable) = self.entries.get_mut(name) else {
            return Ok(());
        };
        if obfuscate && variable.hidden {
            out.push_str(HIDDEN_VALUE);
            return Ok(());
        }
        let kind = variable.value.kind();
        if kind == VariantType::None {
            return Ok(());
        }
        let raw = variable
            .value
            .get_string()
            .map_err(|source| value_error(name, source))?;
        if kind == VariantType::Formatted {
            let expanded = self.format_inner(&raw, obfuscate, depth + 1)?;
            out.push_str(&expanded);
        } else {
            out.push_str(&raw);
        }
        Ok(())
    }
}

fn value_error(name: &str, source: VariantError) -> VariableError {
    VariableError::Value {
        name: name.to_string(),
        source,
    }
}

/// The store shared between the engine loop and API callers. Never hold
/// the guard across an `.await`.
pub type SharedVariables = Arc<Mutex<Variables>>;

pub fn shared(variables: Variables) -> SharedVariables {
    Arc::new(Mutex::new(variables))
}

/// Lock the shared store.
pub fn lock(shared: &SharedVariables) -> Result<MutexGuard<'_, Variables>, VariableError> {
    shared.lock().map_err(|_| VariableError::Poisoned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> Variables {
        let mut vars = Variables::new();
        vars.set_string("Name", "World").unwrap();
        vars.set_numeric("Count", 3).unwrap();
        vars.declare("Password", Variant::string("s3cret"), true, false)
            .unwrap();
        vars
    }

    #[test]
    fn test_format_expands_known_and_unknown() {
        let mut vars = store();
        let out = vars.format("Hello [Name], [Count] times, [Missing]!").unwrap();
        assert_eq!(out.as_str(), "Hello World, 3 times, !");
    }

    #[test]
    fn test_format_escapes_and_literals() {
        let mut vars = store();
        assert_eq!(vars.format("[\\[]Name[\\]]").unwrap().as_str(), "[Name]");
        assert_eq!(vars.format("a [] b").unwrap().as_str(), "a [] b");
        assert_eq!(vars.format("[not valid]").unwrap().as_str(), "[not valid]");
        assert_eq!(vars.format("open [Name").unwrap().as_str(), "open [Name");
        assert_eq!(vars.format("[[Name]]").unwrap().as_str(), "[World]");
    }

    #[test]
    fn test_escape_roundtrips_through_format() {
        let mut vars = store();
        let text = "[Name] {braces}";
        let escaped = Variables::escape(text);
        assert_eq!(vars.format(&escaped).unwrap().as_str(), text);
    }

    #[test]
    fn test_obfuscated_hides_hidden_values() {
        let mut vars = store();
        assert_eq!(
            vars.format_obfuscated("-p [Password]").unwrap(),
            "-p *****"
        );
        assert_eq!(vars.format("-p [Password]").unwrap().as_str(), "-p s3cret");
    }

    #[test]
    fn test_hidden_variables_stay_encrypted() {
        let mut vars = store();
        vars.set_string("Password", "rotated").unwrap();
        assert!(vars.get_variant("Password").unwrap().holds_ciphertext());
        assert_eq!(vars.get_string("Password").unwrap().as_str(), "rotated");
    }

    #[test]
    fn test_formatted_values_expand_recursively() {
        let mut vars = store();
        vars.set_formatted("Greeting", "Hi [Name]").unwrap();
        assert_eq!(vars.get_formatted("Greeting").unwrap().as_str(), "Hi World");
        assert_eq!(vars.get_string("Greeting").unwrap().as_str(), "Hi [Name]");
    }

    #[test]
    fn test_self_reference_is_bounded() {
        let mut vars = Variables::new();
        vars.set_formatted("Loop", "[Loop]").unwrap();
        assert!(matches!(
            vars.format("[Loop]"),
            Err(VariableError::FormatDepth(_))
        ));
    }

    #[test]
    fn test_built_ins_are_read_only() {
        let mut vars = Variables::new();
        vars.initialize_system().unwrap();
        assert!(matches!(
            vars.set_numeric(names::REBOOT_PENDING, 1),
            Err(VariableError::BuiltIn(_))
        ));
        vars.set_built_in(names::REBOOT_PENDING, Variant::numeric(1))
            .unwrap();
        assert_eq!(vars.get_numeric(names::REBOOT_PENDING).unwrap(), 1);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let mut vars = Variables::new();
        assert!(vars.set_numeric("1abc", 1).is_err());
        assert!(vars.set_numeric("has space", 1).is_err());
        assert!(vars.set_numeric("Ok.Name_2", 1).is_ok());
    }

    #[test]
    fn test_persisted_values_skip_hidden() {
        let mut vars = Variables::new();
        vars.declare("InstallDir", Variant::string("/opt/app"), false, true)
            .unwrap();
        vars.declare("Token", Variant::string("t"), true, true).unwrap();
        let values = vars.persisted_values().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["InstallDir"], "/opt/app");
    }
}
