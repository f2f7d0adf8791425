//! Deltas produced by engine operations.
//!
//! An operation never writes the document it read. It records what it
//! decided as a [`Changeset`], and the store replays that onto the freshest
//! document just before saving, so records written by a concurrent
//! invocation in the meantime are kept.

use hostprov_reconcile::{MachineIdentity, MachineRef};
use tracing::debug;

use super::model::{Machine, Request, StoreDocument};

/// One recorded decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Insert the request, or merge its header and machines into the stored one.
    UpsertRequest(Request),
    /// Merge a machine into its owning request by identity.
    UpsertMachine { request_id: String, machine: Machine },
    /// Drop a machine from its owning request.
    RemoveMachine {
        request_id: String,
        identity: MachineRef,
    },
    RemoveRequest(String),
}

/// Ordered list of changes applied as one store write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    changes: Vec<Change>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_request(&mut self, request: Request) {
        self.changes.push(Change::UpsertRequest(request));
    }

    pub fn upsert_machine(&mut self, request_id: impl Into<String>, machine: Machine) {
        self.changes.push(Change::UpsertMachine {
            request_id: request_id.into(),
            machine,
        });
    }

    pub fn remove_machine(&mut self, request_id: impl Into<String>, identity: &impl MachineIdentity) {
        self.changes.push(Change::RemoveMachine {
            request_id: request_id.into(),
            identity: MachineRef::from_identity(identity),
        });
    }

    pub fn remove_request(&mut self, request_id: impl Into<String>) {
        self.changes.push(Change::RemoveRequest(request_id.into()));
    }

    pub fn extend(&mut self, other: Changeset) {
        self.changes.extend(other.changes);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// Replay every change onto `doc`, in order.
    ///
    /// Changes addressing a request that no longer exists are skipped.
    pub fn apply(&self, doc: &mut StoreDocument) {
        for change in &self.changes {
            match change {
                Change::UpsertRequest(request) => doc.upsert_request(request.clone()),
                Change::UpsertMachine {
                    request_id,
                    machine,
                } => match doc.find_request_mut(request_id) {
                    Some(request) => request.upsert_machine(machine.clone()),
                    None => debug!(
                        request_id = %request_id,
                        machine = %machine.label(),
                        "Owning request gone, dropping machine update"
                    ),
                },
                Change::RemoveMachine {
                    request_id,
                    identity,
                } => {
                    if let Some(request) = doc.find_request_mut(request_id) {
                        request.remove_machine(identity);
                    }
                }
                Change::RemoveRequest(request_id) => {
                    doc.requests.retain(|r| &r.request_id != request_id);
                }
            }
        }
    }

    /// `doc` with this changeset applied.
    pub fn applied_to(&self, mut doc: StoreDocument) -> StoreDocument {
        self.apply(&mut doc);
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostprov_reconcile::{MachineResult, RequestStatus};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn machine(id: &str) -> Machine {
        Machine {
            machine_id: Some(id.to_string()),
            ..Machine::default()
        }
    }

    fn request(id: &str, machines: Vec<Machine>) -> Request {
        Request {
            request_id: id.to_string(),
            template_id: None,
            time: 1,
            ttl: None,
            tag_value: None,
            status: RequestStatus::Running,
            aggregate_ref: None,
            allocation: None,
            message: None,
            machines,
        }
    }

    #[test]
    fn test_apply_keeps_concurrently_appended_machines() {
        // snapshot the operation worked from
        let snapshot = StoreDocument {
            requests: vec![request("req_1", vec![machine("i-1")])],
        };

        let mut polled = machine("i-1");
        polled.result = MachineResult::Succeed;
        let mut changes = Changeset::new();
        changes.upsert_request(request("req_1", vec![polled]));

        // another invocation appended i-2 before this one saved
        let mut latest = snapshot.clone();
        latest.requests[0].machines.push(machine("i-2"));

        let merged = changes.applied_to(latest);
        let machines = &merged.requests[0].machines;
        assert_eq!(machines.len(), 2);
        assert_eq!(machines[0].result, MachineResult::Succeed);
        assert_eq!(machines[1].machine_id.as_deref(), Some("i-2"));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut changes = Changeset::new();
        changes.upsert_request(request("req_1", vec![machine("i-1")]));
        changes.upsert_machine("req_1", machine("i-2"));
        changes.remove_machine("req_1", &machine("i-1"));

        let once = changes.applied_to(StoreDocument::default());
        let twice = changes.applied_to(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.requests[0].machines, vec![machine("i-2")]);
    }

    #[test]
    fn test_changes_for_missing_request_are_skipped() {
        let mut changes = Changeset::new();
        changes.upsert_machine("req_gone", machine("i-1"));
        changes.remove_request("req_also_gone");

        let doc = changes.applied_to(StoreDocument::default());
        assert!(doc.requests.is_empty());
    }

    proptest! {
        #[test]
        fn test_upsert_request_unions_machines(
            stored in proptest::collection::btree_set(0u8..16, 0..8),
            incoming in proptest::collection::btree_set(0u8..16, 0..8),
        ) {
            let ids = |set: &BTreeSet<u8>| -> Vec<Machine> {
                set.iter().map(|n| machine(&format!("i-{n}"))).collect()
            };
            let latest = StoreDocument {
                requests: vec![request("req_1", ids(&stored))],
            };
            let mut changes = Changeset::new();
            changes.upsert_request(request("req_1", ids(&incoming)));

            let merged = changes.applied_to(latest);
            let got: BTreeSet<String> = merged.requests[0]
                .machines
                .iter()
                .filter_map(|m| m.machine_id.clone())
                .collect();
            let want: BTreeSet<String> =
                stored.union(&incoming).map(|n| format!("i-{n}")).collect();
            prop_assert_eq!(merged.requests[0].machines.len(), want.len());
            prop_assert_eq!(got, want);
        }
    }
}
