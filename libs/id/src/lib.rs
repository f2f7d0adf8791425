//! # hostprov-id
//!
//! Identifiers allocated by the hostprov engine.
//!
//! ## ID Format
//!
//! Engine-allocated IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! - `req_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a provisioning (create) request
//! - `ret_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for a decommissioning (return) request
//!
//! The prefix is the only thing that tells the two flows apart: the store
//! never records the flow separately, so [`FlowKind::of`] must stay in sync
//! with the prefixes below.
//!
//! Request IDs read back from the store or supplied by the caller are kept as
//! plain strings by the engine. Older stores may contain provider-assigned
//! request IDs (reservation or fleet IDs) that do not parse as a [`RequestId`];
//! those are still create-flow requests.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
