//! Machine results, request statuses and the provider-state classification
//! they are derived from.

use hostprov_id::FlowKind;
use serde::{Deserialize, Serialize};

/// Normalized per-machine outcome. This is the only field the caller should
/// use to decide readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineResult {
    /// Still converging.
    #[default]
    Executing,
    /// Reached the state the flow was waiting for.
    Succeed,
    /// Reached a terminal state the flow was not waiting for.
    Fail,
}

impl MachineResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Executing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executing => "executing",
            Self::Succeed => "succeed",
            Self::Fail => "fail",
        }
    }
}

impl std::fmt::Display for MachineResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-level status.
///
/// `Warning` and `Error` are only ever produced for responses rejected before
/// anything is persisted; a stored request is always one of the first three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RequestStatus {
    #[default]
    #[serde(rename = "RUNNING", alias = "running")]
    Running,
    #[serde(rename = "COMPLETE", alias = "complete")]
    Complete,
    #[serde(rename = "COMPLETE_WITH_ERROR", alias = "complete_with_error")]
    CompleteWithError,
    #[serde(rename = "WARNING", alias = "warning")]
    Warning,
    #[serde(rename = "ERROR", alias = "error")]
    Error,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::CompleteWithError => "COMPLETE_WITH_ERROR",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vendor-neutral lifecycle classification of a provider instance.
///
/// Provider adapters attach one of these to every native state string they
/// report, so the engine never has to interpret vendor vocabulary. The native
/// string itself is still stored verbatim for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    /// Requested or booting.
    Pending,
    /// Up and usable.
    Running,
    /// Still running but scheduled for provider-initiated termination.
    Reclaiming,
    /// Shutting down.
    Stopping,
    /// Stopped or deallocated; not consuming compute.
    Stopped,
    /// Gone for good.
    Terminated,
    /// Terminal error state reported by the provider.
    Failed,
    /// State string the adapter could not classify.
    #[default]
    Unknown,
}

impl InstancePhase {
    /// Shutdown has started or finished.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped | Self::Terminated)
    }

    /// The instance no longer exists as a running machine.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Stopped | Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Reclaiming => "reclaiming",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

/// Map a provider phase to a machine result for the given flow.
pub fn map_result(flow: FlowKind, phase: InstancePhase) -> MachineResult {
    use InstancePhase::*;

    match flow {
        FlowKind::Create => match phase {
            Pending | Unknown => MachineResult::Executing,
            Running => MachineResult::Succeed,
            // Anything else means the instance will never come up, including
            // one interrupted by a reclaim before the caller could use it.
            Reclaiming | Stopping | Stopped | Terminated | Failed => MachineResult::Fail,
        },
        FlowKind::Return => match phase {
            Pending | Stopping | Reclaiming | Unknown => MachineResult::Executing,
            Stopped | Terminated => MachineResult::Succeed,
            // Still up after a terminate call: the shutdown failed.
            Running | Failed => MachineResult::Fail,
        },
    }
}

/// Result for a machine the provider no longer knows about.
///
/// Already gone is a successful return but a failed creation.
pub fn missing_result(flow: FlowKind) -> MachineResult {
    match flow {
        FlowKind::Create => MachineResult::Fail,
        FlowKind::Return => MachineResult::Succeed,
    }
}

/// State of a provider-side aggregate allocation (fleet or bid request).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateState {
    /// Accepted and still materializing members.
    Active,
    /// All requested capacity has been delivered.
    Fulfilled,
    /// The provider gave up on the allocation.
    Failed,
    /// Cancelled or expired before completion.
    Cancelled,
}

impl AggregateState {
    /// Provisional request status implied by the aggregate alone.
    pub fn provisional_status(&self) -> RequestStatus {
        match self {
            Self::Active => RequestStatus::Running,
            Self::Fulfilled => RequestStatus::Complete,
            Self::Failed | Self::Cancelled => RequestStatus::CompleteWithError,
        }
    }
}

/// Fold machine results (and an optional provisional status from the
/// aggregate request) into the request status.
///
/// - any machine executing, or the aggregate still running → `Running`
/// - everything terminal and successful → `Complete`
/// - everything terminal with at least one failure → `CompleteWithError`
pub fn aggregate_status<I>(results: I, provisional: Option<RequestStatus>) -> RequestStatus
where
    I: IntoIterator<Item = MachineResult>,
{
    let mut any_failed = false;
    for result in results {
        match result {
            MachineResult::Executing => return RequestStatus::Running,
            MachineResult::Fail => any_failed = true,
            MachineResult::Succeed => {}
        }
    }

    match provisional {
        Some(RequestStatus::Running) => RequestStatus::Running,
        Some(RequestStatus::CompleteWithError | RequestStatus::Error) => {
            RequestStatus::CompleteWithError
        }
        _ if any_failed => RequestStatus::CompleteWithError,
        _ => RequestStatus::Complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(InstancePhase::Pending, MachineResult::Executing)]
    #[case(InstancePhase::Unknown, MachineResult::Executing)]
    #[case(InstancePhase::Running, MachineResult::Succeed)]
    #[case(InstancePhase::Reclaiming, MachineResult::Fail)]
    #[case(InstancePhase::Stopping, MachineResult::Fail)]
    #[case(InstancePhase::Stopped, MachineResult::Fail)]
    #[case(InstancePhase::Terminated, MachineResult::Fail)]
    #[case(InstancePhase::Failed, MachineResult::Fail)]
    fn test_create_flow_mapping(#[case] phase: InstancePhase, #[case] expected: MachineResult) {
        assert_eq!(map_result(FlowKind::Create, phase), expected);
    }

    #[rstest]
    #[case(InstancePhase::Pending, MachineResult::Executing)]
    #[case(InstancePhase::Stopping, MachineResult::Executing)]
    #[case(InstancePhase::Reclaiming, MachineResult::Executing)]
    #[case(InstancePhase::Stopped, MachineResult::Succeed)]
    #[case(InstancePhase::Terminated, MachineResult::Succeed)]
    #[case(InstancePhase::Running, MachineResult::Fail)]
    #[case(InstancePhase::Failed, MachineResult::Fail)]
    fn test_return_flow_mapping(#[case] phase: InstancePhase, #[case] expected: MachineResult) {
        assert_eq!(map_result(FlowKind::Return, phase), expected);
    }

    #[test]
    fn test_missing_result_depends_on_flow() {
        assert_eq!(missing_result(FlowKind::Create), MachineResult::Fail);
        assert_eq!(missing_result(FlowKind::Return), MachineResult::Succeed);
    }

    #[test]
    fn test_aggregate_status() {
        use MachineResult::*;

        assert_eq!(
            aggregate_status([Succeed, Executing, Fail], None),
            RequestStatus::Running
        );
        assert_eq!(aggregate_status([Succeed, Succeed], None), RequestStatus::Complete);
        assert_eq!(
            aggregate_status([Succeed, Fail], None),
            RequestStatus::CompleteWithError
        );
        assert_eq!(aggregate_status(Vec::new(), None), RequestStatus::Complete);
    }

    #[test]
    fn test_aggregate_status_with_provisional() {
        use MachineResult::*;

        // fleet still materializing members
        assert_eq!(
            aggregate_status([Succeed], Some(RequestStatus::Running)),
            RequestStatus::Running
        );
        assert_eq!(
            aggregate_status([Succeed], Some(RequestStatus::CompleteWithError)),
            RequestStatus::CompleteWithError
        );
        assert_eq!(
            aggregate_status([Succeed], Some(RequestStatus::Complete)),
            RequestStatus::Complete
        );
        // an executing machine wins over a fulfilled aggregate
        assert_eq!(
            aggregate_status([Executing], Some(RequestStatus::Complete)),
            RequestStatus::Running
        );
    }

    #[test]
    fn test_status_wire_strings() {
        assert_eq!(
            serde_json::to_string(&RequestStatus::CompleteWithError).unwrap(),
            "\"COMPLETE_WITH_ERROR\""
        );
        assert_eq!(serde_json::to_string(&MachineResult::Succeed).unwrap(), "\"succeed\"");

        // older stores wrote lowercase request statuses
        let legacy: RequestStatus = serde_json::from_str("\"complete_with_error\"").unwrap();
        assert_eq!(legacy, RequestStatus::CompleteWithError);
    }

    #[test]
    fn test_aggregate_state_provisional() {
        assert_eq!(AggregateState::Active.provisional_status(), RequestStatus::Running);
        assert_eq!(
            AggregateState::Cancelled.provisional_status(),
            RequestStatus::CompleteWithError
        );
    }
}
