//! Structured error types shared across the comb audit crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`AuditError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (stage, dataset, offending values, etc.).
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

/// Canonical error type for the audit pipeline.
///
/// The family tells the operator which class of problem stopped the run;
/// insufficient-data conditions are never errors and never appear here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum AuditError {
    /// Input bytes do not match the recorded manifest hash.
    #[error("provenance error: {0}")]
    Provenance(ErrorInfo),
    /// Malformed input files, misaligned multipole grids or dimension mismatches.
    #[error("format error: {0}")]
    Format(ErrorInfo),
    /// Covariance regularisation or factorisation failures.
    #[error("numerical error: {0}")]
    Numerical(ErrorInfo),
    /// Invalid or tampered run configuration.
    #[error("config error: {0}")]
    Config(ErrorInfo),
    /// Serialization, schema and report persistence errors.
    #[error("serde error: {0}")]
    Serde(ErrorInfo),
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

impl AuditError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            AuditError::Provenance(info)
            | AuditError::Format(info)
            | AuditError::Numerical(info)
            | AuditError::Config(info)
            | AuditError::Serde(info) => info,
        }
    }

    fn info_mut(&mut self) -> &mut ErrorInfo {
        match self {
            AuditError::Provenance(info)
            | AuditError::Format(info)
            | AuditError::Numerical(info)
            | AuditError::Config(info)
            | AuditError::Serde(info) => info,
        }
    }

    /// Short lowercase family label used in diagnostics.
    pub fn family(&self) -> &'static str {
        match self {
            AuditError::Provenance(_) => "provenance",
            AuditError::Format(_) => "format",
            AuditError::Numerical(_) => "numerical",
            AuditError::Config(_) => "config",
            AuditError::Serde(_) => "serde",
        }
    }

    /// Adds a context entry while preserving the error family.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info_mut().context.insert(key.into(), value.into());
        self
    }

    /// Tags the error with the pipeline stage that raised it.
    pub fn stage(self, stage: impl Into<String>) -> Self {
        self.with_context("stage", stage)
    }

    /// Convenience constructor for format errors.
    pub fn format(code: impl Into<String>, message: impl Into<String>) -> Self {
        AuditError::Format(ErrorInfo::new(code, message))
    }

    /// Convenience constructor for numerical errors.
    pub fn numerical(code: impl Into<String>, message: impl Into<String>) -> Self {
        AuditError::Numerical(ErrorInfo::new(code, message))
    }

    /// Convenience constructor for configuration errors.
    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        AuditError::Config(ErrorInfo::new(code, message))
    }

    /// Convenience constructor for serialization errors.
    pub fn serde(code: impl Into<String>, err: impl ToString) -> Self {
        AuditError::Serde(ErrorInfo::new(code, err.to_string()))
    }
}
