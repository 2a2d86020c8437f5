//! Error type definitions for the channel resolver
//!
//! This module defines the error taxonomy used by the resolution, probing and
//! ranking layers.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Top-level resolver error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolverError {
    /// A raw provider entry that cannot be turned into a stream candidate
    #[error("Malformed entry from provider '{provider_id}': {message}")]
    MalformedEntry {
        provider_id: String,
        message: String,
    },

    /// Several candidates qualified for the same merge
    #[error("Merge ambiguity for '{name}': {candidates} candidates at or above threshold")]
    MergeAmbiguity { name: String, candidates: usize },

    /// Attempted merge across differing region or variant
    #[error("Registry conflict: {message}")]
    RegistryConflict { message: String },

    /// Liveness or quality probe failure
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Invalid engine configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Unknown channel or stream
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: Uuid },

    /// Manual correction that cannot be applied
    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    /// The cycle was cancelled between batches
    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },
}

/// Errors produced by a single liveness or quality probe
///
/// All of these are recoverable: the health state machine counts them as a
/// failed check and moves on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The probe did not complete within its timeout
    #[error("Probe timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Connection could not be established or broke mid-request
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Upstream answered with a status that does not indicate a live stream
    #[error("HTTP status {status}")]
    HttpStatus { status: u16 },

    /// Active (ffprobe) analysis failed
    #[error("Analysis failed: {message}")]
    Analysis { message: String },
}

/// Convenience methods for creating common error types
impl ResolverError {
    /// Create a malformed entry error
    pub fn malformed<P: Into<String>, M: Into<String>>(provider_id: P, message: M) -> Self {
        Self::MalformedEntry {
            provider_id: provider_id.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a registry conflict error
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::RegistryConflict {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(resource: S, id: Uuid) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id,
        }
    }

    /// Create an invalid operation error
    pub fn invalid_operation<S: Into<String>>(message: S) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Whether this error must abort the whole cycle
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

impl ProbeError {
    /// Create a connection error from anything displayable
    pub fn connection<S: std::fmt::Display>(message: S) -> Self {
        Self::Connection {
            message: message.to_string(),
        }
    }

    /// Short label used in logs and stream diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Connection { .. } => "connection",
            Self::HttpStatus { .. } => "http_status",
            Self::Analysis { .. } => "analysis",
        }
    }
}
