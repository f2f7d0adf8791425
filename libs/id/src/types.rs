//! Typed request identifiers and flow classification.

use crate::define_id;

define_id!(
    /// ID of a provisioning request created by `RequestMachines`.
    RequestId,
    "req"
);

define_id!(
    /// ID of a decommissioning request created by `RequestReturnMachines`.
    ReturnId,
    "ret"
);

/// Direction of a tracked request.
///
/// Create-flow requests wait for machines to come up; return-flow requests
/// wait for them to go away. The same provider state means opposite things
/// in the two flows, so everything downstream branches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Create,
    Return,
}

impl FlowKind {
    /// Classify a raw request ID by its prefix.
    ///
    /// Anything that is not a return ID is a create request, including IDs
    /// that do not parse at all.
    #[must_use]
    pub fn of(request_id: &str) -> Self {
        if ReturnId::has_prefix(request_id) {
            Self::Return
        } else {
            Self::Create
        }
    }

    #[must_use]
    pub fn is_return(&self) -> bool {
        matches!(self, Self::Return)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Return => "return",
        }
    }
}

impl std::fmt::Display for FlowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
