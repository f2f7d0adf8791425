//! Provider capability interface.
//!
//! The engine only talks to a compute provider through [`ProviderClient`].
//! Adapters translate vendor vocabulary at this boundary: native state
//! strings are classified into an [`InstancePhase`], and vendor error codes
//! into a [`ProviderErrorKind`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostprov_reconcile::{AggregateState, InstancePhase, MachineIdentity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::templates::TemplateSpec;

pub mod retry;
pub mod simulated;

pub use retry::call_with_retry;
pub use simulated::{SimOp, SimulatedConfig, SimulatedProvider};

/// How a provider failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Throttling, timeouts, connectivity. Worth retrying.
    Transient,
    /// Auth, quota or validation failures. Retrying will not help.
    Fatal,
    /// One or more referenced instances or requests do not exist.
    NotFound,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::NotFound => "not found",
        })
    }
}

/// The only error the engine sees from a provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} provider error: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Fatal, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ProviderErrorKind::Fatal
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }
}

/// Optional provider features the engine adapts to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// One call can launch `count` instances.
    pub bulk_create: bool,
    /// Fleet / bid allocations are tracked as one provider request.
    pub aggregate_requests: bool,
}

/// An instance as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInstance {
    pub machine_id: Option<String>,
    pub name: Option<String>,
    /// Native state string, stored verbatim.
    pub status: String,
    pub phase: InstancePhase,
    pub launch_time: Option<DateTime<Utc>>,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub public_dns: Option<String>,
    /// When the provider scheduled this instance for reclaim.
    pub reclaim_marked_at: Option<DateTime<Utc>>,
}

impl MachineIdentity for ProviderInstance {
    fn machine_id(&self) -> Option<&str> {
        self.machine_id.as_deref()
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Result of a create call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOutcome {
    /// Provider reference for fleet / bid allocations.
    pub aggregate_ref: Option<String>,
    /// Instances known immediately. May be empty for aggregate allocations.
    pub instances: Vec<ProviderInstance>,
}

impl CreateOutcome {
    pub fn is_empty(&self) -> bool {
        self.aggregate_ref.is_none() && self.instances.is_empty()
    }
}

/// State transition reported by a terminate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub machine_id: String,
    pub name: Option<String>,
    pub previous: Option<String>,
    pub status: String,
    pub phase: InstancePhase,
}

impl StateChange {
    /// The instance was already gone when we asked.
    pub fn already_gone(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            name: None,
            previous: None,
            status: "terminated".to_string(),
            phase: InstancePhase::Terminated,
        }
    }
}

/// Current view of a fleet / bid allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateDescription {
    pub aggregate_ref: String,
    pub state: AggregateState,
    pub members: Vec<ProviderInstance>,
    pub message: Option<String>,
}

/// Compute provider interface.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Launch `count` instances for `spec`, tagged with `tag`.
    async fn create_instances(
        &self,
        spec: &TemplateSpec,
        count: u32,
        tag: &str,
    ) -> Result<CreateOutcome, ProviderError>;

    /// Describe instances by ID, or everything carrying this system's tag
    /// when `ids` is `None`. Unknown IDs are simply absent from the map.
    async fn list_instances(
        &self,
        ids: Option<&[String]>,
    ) -> Result<BTreeMap<String, ProviderInstance>, ProviderError>;

    /// Terminate instances by ID. Fails with `NotFound` if any ID is unknown.
    async fn terminate_instances(&self, ids: &[String]) -> Result<Vec<StateChange>, ProviderError>;

    /// Terminate instances that never reported an ID.
    ///
    /// Providers that cannot address instances by name return nothing.
    async fn terminate_by_name(&self, names: &[String]) -> Result<Vec<StateChange>, ProviderError> {
        let _ = names;
        Ok(Vec::new())
    }

    async fn describe_aggregate_request(
        &self,
        aggregate_ref: &str,
    ) -> Result<AggregateDescription, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(ProviderError::transient("RequestLimitExceeded").is_transient());
        assert!(ProviderError::fatal("AuthFailure").is_fatal());
        let nf = ProviderError::not_found("InvalidInstanceID.NotFound");
        assert!(nf.is_not_found());
        assert_eq!(
            nf.to_string(),
            "not found provider error: InvalidInstanceID.NotFound"
        );
    }

    #[test]
    fn test_empty_outcome() {
        assert!(CreateOutcome::default().is_empty());
        let fleet = CreateOutcome {
            aggregate_ref: Some("sfr-1".into()),
            instances: Vec::new(),
        };
        assert!(!fleet.is_empty());
    }
}
