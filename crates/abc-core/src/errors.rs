//! Structured error types shared across the calibration crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`AbcError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (step, particle indices, paths, etc.).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional hint that may help the caller resolve the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry to the payload.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Canonical error type for the calibration engine.
///
/// Variants map one-to-one onto the error families of the engine:
/// configuration problems are fatal before any dispatch, simulation
/// failures are recovered locally with a penalty distance, backend
/// failures retry then abort, and checkpoint corruption always requires
/// operator intervention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum AbcError {
    /// Malformed run configuration, prior, or perturbation spec.
    #[error("config error: {0}")]
    Config(ErrorInfo),
    /// Per-particle simulation failure (missing or unreadable output).
    #[error("simulation error: {0}")]
    Simulation(ErrorInfo),
    /// Distance strategy violated its contract while scoring.
    #[error("distance error: {0}")]
    Distance(ErrorInfo),
    /// Job submission or polling failure on a compute backend.
    #[error("backend error: {0}")]
    Backend(ErrorInfo),
    /// Unreadable or inconsistent checkpoint on resume.
    #[error("checkpoint error: {0}")]
    Checkpoint(ErrorInfo),
    /// Serialization and schema errors.
    #[error("serde error: {0}")]
    Serde(ErrorInfo),
    /// Randomness and seeding errors.
    #[error("rng error: {0}")]
    Rng(ErrorInfo),
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)?;
        if !self.context.is_empty() {
            write!(f, " | context: [")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, "]")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " | hint: {hint}")?;
        }
        Ok(())
    }
}

impl AbcError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            AbcError::Config(info)
            | AbcError::Simulation(info)
            | AbcError::Distance(info)
            | AbcError::Backend(info)
            | AbcError::Checkpoint(info)
            | AbcError::Serde(info)
            | AbcError::Rng(info) => info,
        }
    }

    /// Adds a context entry to the payload, keeping the error's family
    /// and code intact.
    pub fn with_context(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match self {
            AbcError::Config(info) => AbcError::Config(info.with_context(key, value)),
            AbcError::Simulation(info) => AbcError::Simulation(info.with_context(key, value)),
            AbcError::Distance(info) => AbcError::Distance(info.with_context(key, value)),
            AbcError::Backend(info) => AbcError::Backend(info.with_context(key, value)),
            AbcError::Checkpoint(info) => AbcError::Checkpoint(info.with_context(key, value)),
            AbcError::Serde(info) => AbcError::Serde(info.with_context(key, value)),
            AbcError::Rng(info) => AbcError::Rng(info.with_context(key, value)),
        }
    }
}
