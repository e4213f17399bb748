//! Environment variable parsing with type safety.
//!
//! Provides a type-safe parser for `APPCHECK_` tuning variables with
//! validation, error collection, and source tracking. Values are read
//! through a lookup function so callers can parse a snapshot instead of
//! the live process environment.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Where a configuration value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    Environment(String),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Environment(var) => write!(f, "env:{var}"),
        }
    }
}

/// A value tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> Sourced<T> {
    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment(var.into()),
        }
    }

    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser<'a> {
    prefix: &'static str,
    lookup: &'a dyn Fn(&str) -> Option<String>,
    errors: Vec<EnvError>,
}

impl<'a> EnvParser<'a> {
    /// Create a parser with the `APPCHECK_` prefix over the given lookup.
    pub fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self {
            prefix: "APPCHECK_",
            lookup,
            errors: Vec::new(),
        }
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    /// Check if any errors occurred.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn read(&self, var_name: &str) -> Option<String> {
        (self.lookup)(var_name).filter(|value| !value.trim().is_empty())
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match self.read(&var_name) {
            Some(value) => Sourced::from_env(value, var_name),
            None => Sourced::default_value(default.to_string()),
        }
    }

    /// Get a whitespace-separated command line with default.
    pub fn get_command(&mut self, name: &str, default: &str) -> Sourced<Vec<String>> {
        let split = |value: &str| -> Vec<String> {
            value.split_whitespace().map(str::to_string).collect()
        };
        let raw = self.get_string(name, default);
        let words = split(&raw.value);
        if words.is_empty() {
            self.errors.push(EnvError::InvalidValue {
                var: self.var_name(name),
                expected: "non-empty command".to_string(),
                value: raw.value,
            });
            return Sourced::default_value(split(default));
        }
        Sourced {
            value: words,
            source: raw.source,
        }
    }

    /// Get a u16 value with default and range validation.
    pub fn get_u16_range(&mut self, name: &str, default: u16, min: u16, max: u16) -> Sourced<u16> {
        let var_name = self.var_name(name);
        match self.read(&var_name) {
            Some(value) => match value.trim().parse::<u16>() {
                Ok(n) if n >= min && n <= max => Sourced::from_env(n, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name.clone(),
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::from_env(default, var_name)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: "unsigned 16-bit integer".to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            None => Sourced::default_value(default),
        }
    }

    /// Get a duration in humantime syntax (`250ms`, `2s`, `1m 30s`).
    ///
    /// Zero durations are rejected.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let var_name = self.var_name(name);
        match self.read(&var_name) {
            Some(value) => match humantime::parse_duration(value.trim()) {
                Ok(parsed) if !parsed.is_zero() => Sourced::from_env(parsed, var_name),
                _ => {
                    self.errors.push(EnvError::InvalidDuration {
                        var: var_name.clone(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            None => Sourced::default_value(default),
        }
    }

    /// Get any value implementing `FromStr`, recording `expected` on failure.
    pub fn get_parsed<T: FromStr>(&mut self, name: &str, default: T, expected: &str) -> Sourced<T> {
        let var_name = self.var_name(name);
        match self.read(&var_name) {
            Some(value) => match value.trim().parse::<T>() {
                Ok(parsed) => Sourced::from_env(parsed, var_name),
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: expected.to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            None => Sourced::default_value(default),
        }
    }
}
