//! `requestReturnMachines`: decommission machines the caller hands back.

use hostprov_id::ReturnId;
use hostprov_reconcile::{matcher, InstancePhase, MachineRef, MachineResult, RequestStatus};
use tracing::{debug, error, info, warn};

use super::{Engine, Terminated};
use crate::error::EngineError;
use crate::input::MachinesInput;
use crate::provider::StateChange;
use crate::response::Response;
use crate::state::{Changeset, Machine, StoreDocument};

/// How a matched machine is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Already shutting down; only the return ID is recorded.
    AlreadyDown,
    /// Being reclaimed; the provider finishes the job.
    Deferred,
    Terminate,
}

/// A stored machine claimed by one of the caller's references.
struct Claimed {
    owner: String,
    machine: Machine,
    disposition: Disposition,
}

impl Engine {
    /// `requestReturnMachines`
    pub async fn request_return_machines(&self, input: &MachinesInput) -> Result<Response, EngineError> {
        let refs = input.refs();
        if refs.is_empty() {
            return Err(EngineError::InvalidInput("no machines given".to_string()));
        }

        let return_id = ReturnId::new().to_string();
        let doc = self.store.load_or_default()?;
        let (claimed, unmatched) = self.claim(&doc, refs);

        let (to_terminate, by_name) = terminate_targets(&claimed);
        info!(
            return_id = %return_id,
            tracked = claimed.len(),
            terminating = to_terminate.len() + by_name.len(),
            untracked = unmatched.len(),
            "Returning machines"
        );

        let mut terminated = self
            .terminate_tolerant(&to_terminate)
            .await
            .and_then(Terminated::into_partial)
            .map_err(|err| {
                error!(return_id = %return_id, error = %err, "Terminate failed, store left unchanged");
                EngineError::from(err)
            })?;
        let named_changes = self.terminate_by_name(&by_name).await.map_err(|err| {
            error!(return_id = %return_id, error = %err, "Terminate by name failed, store left unchanged");
            EngineError::from(err)
        })?;
        if !terminated.failed.is_empty() {
            warn!(
                return_id = %return_id,
                failed = terminated.failed.len(),
                "Some machines could not be terminated and are not part of this return"
            );
        }
        let mut state_changes = std::mem::take(&mut terminated.changes);
        state_changes.extend(named_changes);

        self.terminate_untracked(&unmatched).await;

        let mut changes = Changeset::new();
        let mut active = false;
        for Claimed {
            owner,
            mut machine,
            disposition,
        } in claimed
        {
            match disposition {
                Disposition::Terminate => {
                    if machine
                        .machine_id
                        .as_deref()
                        .is_some_and(|id| terminated.has_failed(id))
                    {
                        continue;
                    }
                    if let Some(change) = change_for(&state_changes, &machine) {
                        machine.status = Some(change.status.clone());
                        machine.phase = change.phase;
                    }
                    machine.return_id = Some(return_id.clone());
                    machine.result = MachineResult::Executing;
                    active = true;
                }
                Disposition::AlreadyDown | Disposition::Deferred => {
                    if machine.return_id.is_some() {
                        debug!(machine = machine.label(), "Machine is already being returned");
                        continue;
                    }
                    machine.return_id = Some(return_id.clone());
                    machine.result = MachineResult::Executing;
                    active |= disposition == Disposition::Deferred;
                }
            }
            changes.upsert_machine(owner, machine);
        }
        self.store.commit(&changes)?;

        if active {
            Ok(Response::with_status(RequestStatus::Running, "Delete VM success.")
                .with_request_id(return_id))
        } else {
            Ok(Response::with_status(RequestStatus::Complete, "No active instances."))
        }
    }

    /// Pair stored machines with the caller's references. Each reference is
    /// consumed by the first stored machine it matches.
    fn claim(&self, doc: &StoreDocument, mut refs: Vec<MachineRef>) -> (Vec<Claimed>, Vec<MachineRef>) {
        let mut claimed = Vec::new();
        for request in &doc.requests {
            for machine in &request.machines {
                let Some(idx) = refs.iter().position(|r| matcher::matches(machine, r)) else {
                    continue;
                };
                refs.remove(idx);

                let disposition = match machine.phase {
                    phase if phase.is_shutting_down() => Disposition::AlreadyDown,
                    InstancePhase::Reclaiming if !self.policy.terminate_on_reclaim => {
                        Disposition::Deferred
                    }
                    _ => Disposition::Terminate,
                };
                debug!(
                    request_id = %request.request_id,
                    machine = machine.label(),
                    phase = %machine.phase.as_str(),
                    ?disposition,
                    "Claimed machine for return"
                );
                claimed.push(Claimed {
                    owner: request.request_id.clone(),
                    machine: machine.clone(),
                    disposition,
                });
            }
        }
        (claimed, refs)
    }

    /// Terminate machines the store never tracked. Nothing is recorded.
    async fn terminate_untracked(&self, refs: &[MachineRef]) {
        let ids: Vec<String> = refs
            .iter()
            .filter_map(|r| matcher::present(r.machine_id.as_deref()))
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return;
        }
        match self.terminate_tolerant(&ids).await {
            Ok(outcome) if outcome.failed.is_empty() => {
                debug!(count = ids.len(), "Terminated untracked machines");
            }
            Ok(outcome) => {
                warn!(failed = outcome.failed.len(), "Some untracked machines could not be terminated");
            }
            Err(err) if err.is_fatal() => {
                error!(count = ids.len(), error = %err, "Provider rejected untracked terminate");
            }
            Err(err) => warn!(count = ids.len(), error = %err, "Untracked terminate failed"),
        }
    }
}

/// IDs to terminate, and names of machines that never reported an ID.
fn terminate_targets(claimed: &[Claimed]) -> (Vec<String>, Vec<String>) {
    let mut ids = Vec::new();
    let mut names = Vec::new();
    for c in claimed.iter().filter(|c| c.disposition == Disposition::Terminate) {
        match matcher::present(c.machine.machine_id.as_deref()) {
            Some(id) => ids.push(id.to_string()),
            None => names.extend(c.machine.name.clone()),
        }
    }
    (ids, names)
}

fn change_for<'a>(changes: &'a [StateChange], machine: &Machine) -> Option<&'a StateChange> {
    match matcher::present(machine.machine_id.as_deref()) {
        Some(id) => changes.iter().find(|c| c.machine_id == id),
        None => {
            let name = machine.name.as_deref()?;
            changes.iter().find(|c| c.name.as_deref() == Some(name))
        }
    }
}
