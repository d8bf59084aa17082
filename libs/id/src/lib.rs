//! # stagehand-id
//!
//! Typed identifiers for the stagehand dispatch and staging scheduler.
//!
//! ## Design Principles
//!
//! - IDs are system-generated and opaque to everything but the code that
//!   mints them
//! - All IDs have a canonical string representation with strict parsing
//! - IDs support roundtrip serialization (parse → format → parse)
//! - IDs are typed to prevent mixing different kinds of identifiers
//!
//! ## ID Format
//!
//! Generated IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `stg_01HV4Z2WQXKJNM8GPQY6VBKC3D` (a staging task token)
//! - `inbox_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (a reply inbox)
//!
//! This format provides:
//! - Type safety (prefix indicates what the ID is for)
//! - Sortability (ULID is time-ordered)
//! - Uniqueness (ULID has 80 bits of randomness)
//! - Human readability in logs (clear prefixes)
//!
//! `WorkerId` is the exception: workers self-identify in advertisements, so
//! it is an opaque string newtype rather than a generated ULID.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
