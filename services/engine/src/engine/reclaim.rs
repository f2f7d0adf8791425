//! `getReturnRequests`: detect machines the provider is taking away, and
//! drop store records that no longer describe anything.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hostprov_reconcile::{
    find_match, matcher, InstancePhase, MachineIdentity, MachineRef, Policy, RequestStatus,
};
use tracing::{debug, info, warn};

use super::{Engine, Terminated};
use crate::error::EngineError;
use crate::input::MachinesInput;
use crate::provider::{ProviderError, ProviderInstance};
use crate::response::{Response, ReturnView};
use crate::state::{Changeset, Machine, StoreDocument};

/// A stored machine scheduled for removal once the provider confirms it is
/// terminating.
struct Orphan {
    owner: String,
    machine: Machine,
}

/// Accumulated outcome of walking the store.
#[derive(Default)]
struct Scan {
    notices: Vec<ReturnView>,
    changes: Changeset,
    by_id: Vec<Orphan>,
    by_name: Vec<Orphan>,
}

fn label_of(identity: &impl MachineIdentity) -> String {
    matcher::present(identity.name())
        .or(matcher::present(identity.machine_id()))
        .unwrap_or_default()
        .to_string()
}

impl Engine {
    /// `getReturnRequests`
    pub async fn get_return_requests(&self, input: &MachinesInput) -> Result<Response, EngineError> {
        let known = input.refs();
        let doc = self.store.load_or_default()?;
        let now = self.clock.now();
        let inventory = self.list_instances(None).await?;

        let mut scan = Scan::default();
        for request in &doc.requests {
            for stored in &request.machines {
                self.inspect(&mut scan, &known, &inventory, &request.request_id, stored, request.created_at(), now);
            }
        }

        let Scan {
            mut notices,
            mut changes,
            by_id,
            by_name,
        } = scan;

        let ids: Vec<String> = by_id
            .iter()
            .filter_map(|o| o.machine.machine_id.clone())
            .collect();
        let outcome = self
            .terminate_tolerant(&ids)
            .await
            .and_then(Terminated::into_partial);
        if let Some(terminated) = self.terminate_orphans(outcome, ids.len())? {
            for orphan in &by_id {
                let refused = orphan
                    .machine
                    .machine_id
                    .as_deref()
                    .is_some_and(|id| terminated.has_failed(id));
                if !refused {
                    changes.remove_machine(orphan.owner.clone(), &orphan.machine);
                }
            }
        }

        let names: Vec<String> = by_name
            .iter()
            .filter_map(|o| o.machine.name.clone())
            .collect();
        let terminated = self.terminate_orphans(self.terminate_by_name(&names).await, names.len())?;
        if terminated.is_some() {
            for orphan in &by_name {
                changes.remove_machine(orphan.owner.clone(), &orphan.machine);
            }
        }

        notices.extend(unknown_to_store(&doc, &known, &inventory, &self.policy, now));

        let projected = changes.applied_to(doc);
        changes.extend(housekeeping(&projected, &self.policy, now));
        self.store.commit(&changes)?;

        info!(
            notices = notices.len(),
            orphans = ids.len() + names.len(),
            "Reclaim scan finished"
        );
        Ok(Response::with_status(
            RequestStatus::Complete,
            "Instances marked for termination retrieved successfully.",
        )
        .with_returns(notices))
    }

    /// Decide what to do with one stored machine.
    #[allow(clippy::too_many_arguments)]
    fn inspect(
        &self,
        scan: &mut Scan,
        known: &[MachineRef],
        inventory: &BTreeMap<String, ProviderInstance>,
        owner: &str,
        stored: &Machine,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        if stored.return_id.is_some() && !stored.result.is_terminal() {
            return;
        }

        let mut machine = stored.clone();
        let launched = machine.launch_time.unwrap_or(created_at);

        if !matcher::has_machine_id(&machine) {
            match inventory.values().find(|i| matcher::matches(&machine, *i)) {
                Some(found) => {
                    debug!(name = machine.label(), "Resolved machine by name during scan");
                    machine.machine_id = found.machine_id.clone();
                    scan.changes.upsert_machine(owner, machine.clone());
                }
                None => {
                    let is_known = find_match(&machine, known).is_some();
                    if !is_known && self.policy.orphan_expired(launched, now) {
                        warn!(
                            request_id = %owner,
                            name = machine.label(),
                            "Machine never surfaced, terminating orphan"
                        );
                        scan.by_name.push(Orphan {
                            owner: owner.to_string(),
                            machine,
                        });
                    }
                    return;
                }
            }
        }

        let is_known = find_match(&machine, known).is_some();
        let id = machine.machine_id.clone().unwrap_or_default();

        match inventory.get(&id) {
            None => {
                if is_known {
                    debug!(machine_id = %id, "Known machine gone from provider");
                    scan.notices.push(ReturnView::gone(label_of(&machine), machine.machine_id.clone()));
                } else {
                    warn!(request_id = %owner, machine_id = %id, "Removing orphan unknown to provider");
                }
                scan.changes.remove_machine(owner, &machine);
            }
            Some(instance) if instance.phase == InstancePhase::Reclaiming => {
                let marked_at = instance.reclaim_marked_at.unwrap_or(now);
                let grace = self.policy.grace_period(marked_at, now);
                info!(
                    machine_id = %id,
                    grace_period_secs = grace.as_secs(),
                    "Machine is being reclaimed"
                );
                scan.notices.push(ReturnView::new(&machine, grace));
            }
            Some(instance) if instance.phase == InstancePhase::Terminated => {
                if is_known {
                    debug!(machine_id = %id, "Known machine terminated");
                    machine.observe(instance);
                    scan.notices.push(ReturnView::gone(label_of(&machine), machine.machine_id.clone()));
                    scan.changes.upsert_machine(owner, machine);
                } else {
                    debug!(machine_id = %id, "Dropping terminated machine");
                    scan.changes.remove_machine(owner, &machine);
                }
            }
            Some(instance) => {
                let launched = instance.launch_time.unwrap_or(launched);
                if !is_known
                    && machine.return_id.is_none()
                    && self.policy.orphan_expired(launched, now)
                {
                    warn!(
                        request_id = %owner,
                        machine_id = %id,
                        "Machine never reached the caller, terminating orphan"
                    );
                    scan.by_id.push(Orphan {
                        owner: owner.to_string(),
                        machine,
                    });
                }
            }
        }
    }

    /// Whether orphans may be dropped. Non-fatal failures keep them for the
    /// next scan.
    fn terminate_orphans<T>(
        &self,
        result: Result<T, ProviderError>,
        count: usize,
    ) -> Result<Option<T>, EngineError> {
        match result {
            Ok(done) => Ok(Some(done)),
            Err(err) if err.is_fatal() => {
                tracing::error!(error = %err, "Provider rejected orphan terminate");
                Err(err.into())
            }
            Err(err) => {
                warn!(count, error = %err, "Orphan terminate failed, retrying next scan");
                Ok(None)
            }
        }
    }
}

/// Caller references the store does not track: report them if the provider
/// has no live instance behind them.
fn unknown_to_store(
    doc: &StoreDocument,
    known: &[MachineRef],
    inventory: &BTreeMap<String, ProviderInstance>,
    policy: &Policy,
    now: DateTime<Utc>,
) -> Vec<ReturnView> {
    let stored: Vec<&Machine> = doc.requests.iter().flat_map(|r| r.machines.iter()).collect();

    known
        .iter()
        .filter(|k| find_match(*k, stored.iter().copied()).is_none())
        .filter_map(|k| {
            let instance = inventory.values().find(|i| matcher::matches(k, *i));
            match instance {
                None => {
                    debug!(machine = %label_of(k), "Caller machine unknown to store and provider");
                    Some(ReturnView::gone(label_of(k), k.machine_id.clone()))
                }
                Some(i) if i.phase == InstancePhase::Terminated => {
                    Some(ReturnView::gone(label_of(k), i.machine_id.clone()))
                }
                Some(i) if i.phase == InstancePhase::Reclaiming => Some(ReturnView {
                    machine: label_of(k),
                    machine_id: i.machine_id.clone(),
                    grace_period: policy
                        .grace_period(i.reclaim_marked_at.unwrap_or(now), now)
                        .as_secs(),
                }),
                Some(_) => None,
            }
        })
        .collect()
}

/// Drop requests that no longer track anything.
///
/// Empty requests go unless an aggregate allocation may still add members.
/// Settled requests go once they are older than the collection window.
pub fn housekeeping(doc: &StoreDocument, policy: &Policy, now: DateTime<Utc>) -> Changeset {
    let mut changes = Changeset::new();
    for request in &doc.requests {
        if request.machines.is_empty() {
            if !request.awaits_members() {
                debug!(request_id = %request.request_id, "Removing empty request");
                changes.remove_request(request.request_id.clone());
            }
        } else if request.is_settled() && policy.request_collectable(request.created_at(), now) {
            info!(
                request_id = %request.request_id,
                status = %request.status,
                "Collecting settled request"
            );
            changes.remove_request(request.request_id.clone());
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Change, Request};
    use chrono::TimeZone;
    use hostprov_reconcile::MachineResult;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn request(id: &str, status: RequestStatus, machines: Vec<Machine>) -> Request {
        Request {
            request_id: id.to_string(),
            template_id: None,
            time: t0().timestamp_millis(),
            ttl: None,
            tag_value: None,
            status,
            aggregate_ref: None,
            allocation: None,
            message: None,
            machines,
        }
    }

    fn machine(id: &str, result: MachineResult) -> Machine {
        Machine {
            machine_id: Some(id.to_string()),
            result,
            ..Machine::default()
        }
    }

    fn removed(changes: &Changeset) -> Vec<String> {
        changes
            .changes()
            .iter()
            .filter_map(|c| match c {
                Change::RemoveRequest(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_housekeeping_keeps_filling_aggregates() {
        let mut filling = request("req_fleet", RequestStatus::Running, vec![]);
        filling.aggregate_ref = Some("sfr-1".into());
        let doc = StoreDocument {
            requests: vec![
                filling,
                request("req_done", RequestStatus::Complete, vec![]),
                request(
                    "req_live",
                    RequestStatus::Running,
                    vec![machine("i-1", MachineResult::Executing)],
                ),
            ],
        };

        let changes = housekeeping(&doc, &Policy::default(), t0());
        assert_eq!(removed(&changes), vec!["req_done".to_string()]);
    }

    #[test]
    fn test_housekeeping_collects_only_old_settled_requests() {
        let policy = Policy::default();
        let doc = StoreDocument {
            requests: vec![
                request(
                    "req_failed",
                    RequestStatus::CompleteWithError,
                    vec![machine("i-1", MachineResult::Fail)],
                ),
                request(
                    "req_serving",
                    RequestStatus::Complete,
                    vec![machine("i-2", MachineResult::Succeed)],
                ),
            ],
        };

        let early = t0() + chrono::Duration::hours(1);
        assert!(housekeeping(&doc, &policy, early).is_empty());

        let late = t0() + chrono::Duration::hours(25);
        assert_eq!(
            removed(&housekeeping(&doc, &policy, late)),
            vec!["req_failed".to_string()]
        );
    }

    #[test]
    fn test_label_prefers_name() {
        let both = MachineRef::new(Some("i-1".into()), Some("host-1".into()));
        assert_eq!(label_of(&both), "host-1");
        let id_only = MachineRef::new(Some("i-1".into()), Some("  ".into()));
        assert_eq!(label_of(&id_only), "i-1");
    }
}
