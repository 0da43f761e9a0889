//! Captured view of the process environment.
//!
//! Every harness setting is read through an [`EnvSnapshot`] rather than
//! `std::env::var` directly, so the truthiness rules live in one place and
//! tests can hand the harness a fabricated environment.

use std::collections::BTreeMap;
use std::time::Duration;

/// Names of the variables the harness understands.
pub mod vars {
    pub const STAGE_NAME: &str = "STAGE_NAME";
    pub const STAGE_ENABLE_DIFF: &str = "STAGE_ENABLE_DIFF";
    pub const TRY_RUN_ENABLED: &str = "TRY_RUN_ENABLED";
    pub const TRY_RUN_TIMEOUT_SECS: &str = "TRY_RUN_TIMEOUT_SECS";
    pub const FLOAT16_TOLERANCE: &str = "FLOAT16_TOLERANCE";
    pub const FLOAT32_TOLERANCE: &str = "FLOAT32_TOLERANCE";
    pub const WHILE_LOOP_LIMIT: &str = "WHILE_LOOP_LIMIT";
    pub const ACCELERATION_ENABLED: &str = "ACCELERATION_ENABLED";
}

/// Parse a boolean-like setting.
///
/// Returns `None` for anything that is neither recognisably true nor false;
/// callers then fall back to the setting's own default.
#[must_use]
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "true" | "True" | "TRUE" | "on" | "ON" | "yes" => Some(true),
        "0" | "false" | "False" | "FALSE" | "off" | "OFF" | "no" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the current process environment. Non-UTF-8 entries are converted lossily.
    #[must_use]
    pub fn from_process() -> Self {
        let vars = std::env::vars_os()
            .map(|(key, value)| {
                (
                    key.to_string_lossy().into_owned(),
                    value.to_string_lossy().into_owned(),
                )
            })
            .collect();
        Self { vars }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Boolean setting; absent or unparseable values yield `default`.
    #[must_use]
    pub fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(parse_flag).unwrap_or(default)
    }

    /// Float setting; `None` when absent or malformed.
    #[must_use]
    pub fn float(&self, key: &str) -> Option<f64> {
        self.get(key)
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|value| !value.is_nan())
    }

    /// Unsigned integer setting; `None` when absent or malformed.
    #[must_use]
    pub fn unsigned(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|raw| raw.trim().parse::<u64>().ok())
    }

    /// Whole-second duration. `Some(None)` means the setting explicitly disables
    /// the duration (value `0`); `None` means absent or malformed.
    #[must_use]
    pub fn duration_secs(&self, key: &str) -> Option<Option<Duration>> {
        self.unsigned(key).map(|secs| {
            if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(secs))
            }
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    #[must_use]
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.vars
    }
}
