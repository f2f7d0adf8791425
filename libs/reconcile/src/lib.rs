//! Reconciliation primitives for the host provider.
//!
//! Everything in here is pure: no I/O, no clocks (callers pass `now`), no
//! provider calls. The engine builds its operations on top of:
//!
//! - **Matcher**: deciding whether two records name the same machine.
//! - **Status model**: mapping provider phases to per-machine results and
//!   folding those into a request status.
//! - **Policy**: creation timeout, orphan grace and reclaim notice arithmetic.
//! - **Retry**: capped backoff for transient provider failures.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - A machine result never depends on its position in a list
//! - Grace periods never exceed the configured notice window

pub mod matcher;
pub mod policy;
pub mod retry;
pub mod status;

use thiserror::Error;

pub use matcher::{find_match, has_machine_id, matches, partition_matched, MachineIdentity, MachineRef};
pub use policy::{grace_period, Policy};
pub use retry::RetryPolicy;
pub use status::{
    aggregate_status, map_result, missing_result, AggregateState, InstancePhase, MachineResult,
    RequestStatus,
};

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Policy values that would make convergence impossible.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// Retry settings that would never call the provider.
    #[error("invalid retry policy: {0}")]
    InvalidRetry(String),
}
