//! Credential handling for the generation collaborator.
//!
//! Model API keys are only ever read from the environment and travel as
//! [`SecretValue`], whose `Debug` output never contains the key. The raw
//! string is reachable through [`SecretValue::expose`] and should only be
//! read where it is written to the outgoing request.

use std::env;
use std::fmt;

use crate::TutorError;

const REDACTED: &str = "***redacted***";

#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Read `var` from the environment. Unset and blank values both count as absent.
    pub fn from_env(var: &str) -> Option<Self> {
        env::var(var)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(Self)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Resolve the model key named by `model.api_key_env`.
pub fn require_env(var: &str) -> Result<SecretValue, TutorError> {
    SecretValue::from_env(var).ok_or_else(|| TutorError::MissingSecret(var.to_string()))
}
