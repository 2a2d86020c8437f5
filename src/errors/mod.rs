//! Centralized error handling for the channel resolver
//!
//! Every failure the engine can observe is described by one of the enums in
//! [`types`]. Per-item failures (a malformed entry, an unreachable stream) are
//! isolated by the caller and never abort a batch; only configuration errors
//! are fatal, and those are raised before the registry is touched.
//!
//! # Error Categories
//!
//! - **Entry Errors**: provider entries that cannot be turned into a stream
//! - **Merge Errors**: ambiguous matches and region/variant conflicts
//! - **Probe Errors**: timeouts, connection failures and bad HTTP statuses
//! - **Configuration Errors**: invalid engine settings at cycle start
//!
//! # Usage
//!
//! ```rust
//! use channel_resolver::errors::{ResolverError, ResolverResult};
//!
//! fn check_threshold(threshold: u8) -> ResolverResult<()> {
//!     if threshold > 100 {
//!         return Err(ResolverError::configuration("threshold must be 0-100"));
//!     }
//!     Ok(())
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using ResolverError
pub type ResolverResult<T> = Result<T, ResolverError>;

/// Convenience type alias for probe Results
pub type ProbeResult<T> = Result<T, ProbeError>;
