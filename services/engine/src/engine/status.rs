//! `getRequestStatus`: reconcile tracked requests against the provider.
//!
//! After polling only the housekeeping half of the reclaim scan runs.
//! Reclaim notices and orphan termination come from `getReturnRequests`.

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use hostprov_id::FlowKind;
use hostprov_reconcile::{
    aggregate_status, find_match, map_result, matcher, missing_result, AggregateState,
    InstancePhase, MachineResult, RequestStatus,
};
use tracing::{debug, info, warn};

use super::{reclaim, Engine, Terminated};
use crate::error::EngineError;
use crate::input::StatusInput;
use crate::provider::{call_with_retry, AggregateDescription, ProviderError};
use crate::response::{MachineView, RequestView, Response};
use crate::state::{Changeset, Machine, Request, StoreDocument};

/// What a requested ID resolved to in the store.
enum Target {
    Create(Request),
    /// Machines carrying a return ID, each with the ID of its owning request.
    Return {
        return_id: String,
        machines: Vec<(String, Machine)>,
    },
    Unknown(String),
}

impl Target {
    fn resolve(doc: &StoreDocument, request_id: &str) -> Self {
        match FlowKind::of(request_id) {
            FlowKind::Return => {
                let machines: Vec<(String, Machine)> = doc
                    .machines_with_return_id(request_id)
                    .into_iter()
                    .map(|(owner, m)| (owner.to_string(), m.clone()))
                    .collect();
                if machines.is_empty() {
                    Self::Unknown(request_id.to_string())
                } else {
                    Self::Return {
                        return_id: request_id.to_string(),
                        machines,
                    }
                }
            }
            FlowKind::Create => match doc.find_request(request_id) {
                Some(request) => Self::Create(request.clone()),
                None => Self::Unknown(request_id.to_string()),
            },
        }
    }
}

/// Outcome of polling one request.
struct Polled {
    view: RequestView,
    changes: Changeset,
}

impl Polled {
    /// The request is reported as it was and nothing is written.
    fn unchanged(mut view: RequestView, err: &ProviderError) -> Self {
        view.message = Some(err.to_string());
        Self {
            view,
            changes: Changeset::new(),
        }
    }
}

/// Machines a create-flow poll leaves alone: failures are final, and
/// returned machines are tracked by their return request.
fn frozen(flow: FlowKind, machine: &Machine) -> bool {
    flow == FlowKind::Create
        && (machine.result == MachineResult::Fail || machine.return_id.is_some())
}

fn timeout_message(machine: &Machine, limit: std::time::Duration) -> String {
    EngineError::Timeout(format!(
        "{} did not start within {}s",
        machine.label(),
        limit.as_secs()
    ))
    .to_string()
}

impl Engine {
    /// `getRequestStatus`
    pub async fn get_request_status(&self, input: &StatusInput) -> Result<Response, EngineError> {
        let ids = input.request_ids();
        if ids.is_empty() {
            return Err(EngineError::InvalidInput("no requestId given".to_string()));
        }

        let doc = self.store.load_or_default()?;
        let now = self.clock.now();
        let targets: Vec<Target> = ids.iter().map(|id| Target::resolve(&doc, id)).collect();

        let outcomes: Vec<Result<Polled, ProviderError>> = stream::iter(targets)
            .map(|target| self.poll_target(target, now))
            .buffered(self.max_parallel)
            .collect()
            .await;

        let mut views = Vec::with_capacity(outcomes.len());
        let mut changes = Changeset::new();
        for outcome in outcomes {
            let polled = outcome.map_err(|err| {
                tracing::error!(error = %err, "Provider rejected status poll");
                EngineError::from(err)
            })?;
            views.push(polled.view);
            changes.extend(polled.changes);
        }

        let projected = changes.applied_to(doc);
        changes.extend(reclaim::housekeeping(&projected, &self.policy, now));
        self.store.commit(&changes)?;

        Ok(Response::ok("Get request status success.").with_requests(views))
    }

    /// Poll one target. Only fatal provider errors escape.
    async fn poll_target(&self, target: Target, now: DateTime<Utc>) -> Result<Polled, ProviderError> {
        match target {
            Target::Unknown(request_id) => {
                debug!(request_id = %request_id, "Unknown request");
                Ok(Polled {
                    view: RequestView {
                        request_id,
                        status: RequestStatus::CompleteWithError,
                        message: Some("Request not found.".to_string()),
                        machines: Vec::new(),
                    },
                    changes: Changeset::new(),
                })
            }
            Target::Create(request) => self.poll_create(request, now).await,
            Target::Return {
                return_id,
                machines,
            } => self.poll_return(return_id, machines, now).await,
        }
    }

    async fn poll_create(&self, mut request: Request, now: DateTime<Utc>) -> Result<Polled, ProviderError> {
        let prior = RequestView::from(&request);
        let previous_status = request.status;

        let provisional = match self.refresh_create(&mut request, now).await {
            Ok(provisional) => provisional,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(request_id = %request.request_id, error = %err, "Poll failed, keeping prior state");
                return Ok(Polled::unchanged(prior, &err));
            }
        };

        let status = aggregate_status(
            request
                .machines
                .iter()
                .filter(|m| m.return_id.is_none())
                .map(|m| m.result),
            provisional,
        );
        // A settled request never goes back to RUNNING.
        if !(previous_status.is_terminal() && !status.is_terminal()) {
            request.status = status;
        }
        if request.status != previous_status {
            info!(
                request_id = %request.request_id,
                from = %previous_status,
                to = %request.status,
                "Request status changed"
            );
        }

        let view = RequestView::from(&request);
        let mut update = request;
        update.machines.retain(|m| m.return_id.is_none());
        let mut changes = Changeset::new();
        changes.upsert_request(update);
        Ok(Polled { view, changes })
    }

    /// Steps 1-3 for a create request. Returns the aggregate's provisional
    /// status, if it has one.
    async fn refresh_create(
        &self,
        request: &mut Request,
        now: DateTime<Utc>,
    ) -> Result<Option<RequestStatus>, ProviderError> {
        let mut provisional = None;

        if let Some(aggregate_ref) = request.aggregate_ref.clone() {
            let provider = self.provider.as_ref();
            let described = call_with_retry(&self.retry, "describe_aggregate_request", || {
                provider.describe_aggregate_request(&aggregate_ref)
            })
            .await;
            let description = match described {
                Ok(description) => description,
                // Expired or deleted allocations are gone for good; members
                // still converge on their own.
                Err(err) if err.is_not_found() => {
                    warn!(
                        request_id = %request.request_id,
                        aggregate_ref = %aggregate_ref,
                        error = %err.message,
                        "Aggregate request no longer exists, treating it as cancelled"
                    );
                    AggregateDescription {
                        aggregate_ref: aggregate_ref.clone(),
                        state: AggregateState::Cancelled,
                        members: Vec::new(),
                        message: Some(format!("Aggregate request {aggregate_ref} no longer exists.")),
                    }
                }
                Err(err) => return Err(err),
            };
            provisional = Some(description.state.provisional_status());

            for member in description.members {
                if find_match(&member, &request.machines).is_none() {
                    debug!(
                        request_id = %request.request_id,
                        machine_id = member.machine_id.as_deref().unwrap_or(""),
                        "New aggregate member"
                    );
                    let machine = Machine::launched(member, &request.request_id, now);
                    request.machines.push(machine);
                }
            }
            if description.message.is_some() {
                request.message = description.message;
            }
        }

        let created_at = request.created_at();
        self.refresh_machines(FlowKind::Create, &mut request.machines, created_at, now)
            .await?;
        Ok(provisional)
    }

    async fn poll_return(
        &self,
        return_id: String,
        owned: Vec<(String, Machine)>,
        now: DateTime<Utc>,
    ) -> Result<Polled, ProviderError> {
        let (owners, mut machines): (Vec<String>, Vec<Machine>) = owned.into_iter().unzip();
        let prior = RequestView {
            request_id: return_id.clone(),
            status: aggregate_status(machines.iter().map(|m| m.result), None),
            message: None,
            machines: machines.iter().map(MachineView::from).collect(),
        };

        match self.refresh_machines(FlowKind::Return, &mut machines, now, now).await {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(return_id = %return_id, error = %err, "Poll failed, keeping prior state");
                return Ok(Polled::unchanged(prior, &err));
            }
        }

        let status = aggregate_status(machines.iter().map(|m| m.result), None);
        debug!(return_id = %return_id, status = %status, "Polled return request");

        let view = RequestView {
            request_id: return_id,
            status,
            message: None,
            machines: machines.iter().map(MachineView::from).collect(),
        };
        let mut changes = Changeset::new();
        for (owner, machine) in owners.into_iter().zip(machines) {
            changes.upsert_machine(owner, machine);
        }
        Ok(Polled { view, changes })
    }

    /// Steps 2-3: resolve names, then map provider state onto results.
    async fn refresh_machines(
        &self,
        flow: FlowKind,
        machines: &mut [Machine],
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), ProviderError> {
        let unresolved: Vec<usize> = machines
            .iter()
            .enumerate()
            .filter(|(_, m)| !frozen(flow, m) && !matcher::has_machine_id(*m))
            .map(|(idx, _)| idx)
            .collect();

        if !unresolved.is_empty() {
            let inventory = self.list_instances(None).await?;
            let mut expired_names = Vec::new();

            for idx in unresolved {
                let machine = &mut machines[idx];
                if let Some(found) = inventory.values().find(|i| matcher::matches(&*machine, *i)) {
                    debug!(
                        name = machine.label(),
                        machine_id = found.machine_id.as_deref().unwrap_or(""),
                        "Resolved machine by name"
                    );
                    machine.machine_id = found.machine_id.clone();
                    continue;
                }

                if flow == FlowKind::Return {
                    debug!(name = machine.label(), "Returned machine no longer listed");
                    machine.result = missing_result(flow);
                    machine.phase = InstancePhase::Terminated;
                    continue;
                }

                let launched = machine.launch_time.unwrap_or(created_at);
                if self.policy.creation_expired(launched, now) {
                    warn!(name = machine.label(), "Machine never reported an ID, giving up");
                    machine.message = Some(timeout_message(machine, self.policy.creation_timeout));
                    machine.result = MachineResult::Fail;
                    if let Some(name) = machine.name.clone() {
                        expired_names.push(name);
                    }
                }
            }

            if let Err(err) = self.terminate_by_name(&expired_names).await {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(error = %err, "Best-effort terminate by name failed");
            }
        }

        let ids: Vec<String> = machines
            .iter()
            .filter(|m| !frozen(flow, m))
            .filter_map(|m| matcher::present(m.machine_id.as_deref()))
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        let listing = self.list_instances(Some(&ids)).await?;
        let mut expired = Vec::new();

        for machine in machines.iter_mut().filter(|m| !frozen(flow, m)) {
            let Some(id) = matcher::present(machine.machine_id.as_deref()).map(str::to_string)
            else {
                continue;
            };

            match listing.get(&id) {
                Some(instance) => {
                    machine.observe(instance);
                    let mut result = map_result(flow, instance.phase);
                    let launched = machine.launch_time.unwrap_or(created_at);
                    if flow == FlowKind::Create
                        && instance.phase == InstancePhase::Pending
                        && self.policy.creation_expired(launched, now)
                    {
                        warn!(machine_id = %id, "Machine stuck pending, terminating");
                        machine.message =
                            Some(timeout_message(machine, self.policy.creation_timeout));
                        result = MachineResult::Fail;
                        expired.push(id.clone());
                    }
                    if machine.result.is_terminal() && !result.is_terminal() {
                        result = machine.result;
                    }
                    if result != machine.result {
                        debug!(
                            machine_id = %id,
                            flow = %flow,
                            from = %machine.result,
                            to = %result,
                            "Machine result changed"
                        );
                    }
                    machine.result = result;
                }
                None => {
                    debug!(machine_id = %id, flow = %flow, "Machine unknown to provider");
                    machine.result = missing_result(flow);
                    if flow == FlowKind::Return {
                        machine.phase = InstancePhase::Terminated;
                    } else {
                        machine.message = Some("Instance no longer exists.".to_string());
                    }
                }
            }
        }

        if let Err(err) = self
            .terminate_tolerant(&expired)
            .await
            .and_then(Terminated::into_partial)
        {
            if err.is_fatal() {
                return Err(err);
            }
            warn!(error = %err, "Failed to terminate timed-out machines");
        }
        Ok(())
    }
}
