//! In-process simulated provider.
//!
//! Keeps instances in memory, optionally snapshotted to a JSON file so
//! successive CLI invocations see the same fleet. Tests drive it directly:
//! scripted state changes, reclaim marks, instances launched outside the
//! engine, and injected failures.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostprov_reconcile::{AggregateState, InstancePhase};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    AggregateDescription, Capabilities, CreateOutcome, ProviderClient, ProviderError,
    ProviderInstance, StateChange,
};
use crate::clock::Clock;
use crate::templates::{Allocation, TemplateSpec};

/// Provider calls, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SimOp {
    Create,
    List,
    Terminate,
    TerminateByName,
    DescribeAggregate,
}

/// Simulated provider settings.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub bulk_create: bool,
    pub aggregate_requests: bool,
    /// Move instances one lifecycle step forward after every listing.
    pub auto_advance: bool,
    /// Report only names from create calls; IDs show up in listings.
    pub names_only_on_create: bool,
    /// Members an aggregate request launches per describe call.
    pub aggregate_fill_per_describe: Option<u32>,
    /// Snapshot file; state is in memory only when unset.
    pub state_file: Option<PathBuf>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            bulk_create: true,
            aggregate_requests: true,
            auto_advance: false,
            names_only_on_create: false,
            aggregate_fill_per_describe: None,
            state_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimState {
    next_seq: u64,
    instances: BTreeMap<String, SimInstance>,
    aggregates: BTreeMap<String, SimAggregate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimInstance {
    machine_id: String,
    name: String,
    status: String,
    tag: String,
    template_id: String,
    launch_time: DateTime<Utc>,
    private_ip: String,
    #[serde(default)]
    reclaim_marked_at: Option<DateTime<Utc>>,
}

impl SimInstance {
    fn to_provider(&self, with_id: bool) -> ProviderInstance {
        ProviderInstance {
            machine_id: with_id.then(|| self.machine_id.clone()),
            name: Some(self.name.clone()),
            status: self.status.clone(),
            phase: classify(&self.status, self.reclaim_marked_at.is_some()),
            launch_time: Some(self.launch_time),
            private_ip: Some(self.private_ip.clone()),
            public_ip: None,
            public_dns: None,
            reclaim_marked_at: self.reclaim_marked_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimAggregate {
    template_id: String,
    tag: String,
    target: u32,
    members: Vec<String>,
    state: AggregateState,
}

#[derive(Debug, Default)]
struct Inner {
    state: SimState,
    faults: VecDeque<(SimOp, ProviderError)>,
    calls: BTreeMap<SimOp, usize>,
}

impl Inner {
    fn record(&mut self, op: SimOp) -> Result<(), ProviderError> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.iter().position(|(o, _)| *o == op) {
            Some(idx) => match self.faults.remove(idx) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn launch(&mut self, template_id: &str, tag: &str, now: DateTime<Utc>) -> &SimInstance {
        self.state.next_seq += 1;
        let seq = self.state.next_seq;
        let (hi, lo) = ((seq / 256) % 256, seq % 256);
        let machine_id = format!("i-{seq:017x}");
        let instance = SimInstance {
            machine_id: machine_id.clone(),
            name: format!("ip-10-0-{hi}-{lo}.sim.internal"),
            status: "pending".to_string(),
            tag: tag.to_string(),
            template_id: template_id.to_string(),
            launch_time: now,
            private_ip: format!("10.0.{hi}.{lo}"),
            reclaim_marked_at: None,
        };
        self.state
            .instances
            .entry(machine_id)
            .or_insert(instance)
    }

    fn shut_down(&mut self, machine_id: &str) -> Option<StateChange> {
        let instance = self.state.instances.get_mut(machine_id)?;
        let previous = instance.status.clone();
        if !matches!(previous.as_str(), "terminated" | "shutting-down") {
            instance.status = "shutting-down".to_string();
        }
        Some(StateChange {
            machine_id: instance.machine_id.clone(),
            name: Some(instance.name.clone()),
            previous: Some(previous),
            status: instance.status.clone(),
            phase: classify(&instance.status, false),
        })
    }

    fn advance(&mut self) {
        for instance in self.state.instances.values_mut() {
            let next = match instance.status.as_str() {
                "pending" => "running",
                "shutting-down" => "terminated",
                "stopping" => "stopped",
                _ => continue,
            };
            instance.status = next.to_string();
        }
    }
}

/// Classify a native state string into the engine's lifecycle phase.
pub fn classify(status: &str, reclaim_marked: bool) -> InstancePhase {
    match status {
        "pending" => InstancePhase::Pending,
        "running" if reclaim_marked => InstancePhase::Reclaiming,
        "running" => InstancePhase::Running,
        "marked-for-termination" | "marked-for-stop" => InstancePhase::Reclaiming,
        "shutting-down" | "stopping" => InstancePhase::Stopping,
        "stopped" => InstancePhase::Stopped,
        "terminated" => InstancePhase::Terminated,
        "failed" | "error" => InstancePhase::Failed,
        _ => InstancePhase::Unknown,
    }
}

/// Simulated compute provider.
pub struct SimulatedProvider {
    config: SimulatedConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl SimulatedProvider {
    /// Create an empty in-memory provider.
    pub fn new(config: SimulatedConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create a provider, restoring the snapshot file if one exists.
    pub fn open(config: SimulatedConfig, clock: Arc<dyn Clock>) -> Result<Self, ProviderError> {
        let mut inner = Inner::default();
        if let Some(path) = config.state_file.as_ref().filter(|p| p.exists()) {
            let content = fs::read_to_string(path).map_err(|e| {
                ProviderError::fatal(format!("failed to read {}: {e}", path.display()))
            })?;
            if !content.trim().is_empty() {
                inner.state = serde_json::from_str(&content).map_err(|e| {
                    ProviderError::fatal(format!("failed to parse {}: {e}", path.display()))
                })?;
            }
            debug!(
                path = %path.display(),
                instance_count = inner.state.instances.len(),
                "Restored simulated provider state"
            );
        }

        Ok(Self {
            config,
            clock,
            inner: Mutex::new(inner),
        })
    }

    fn persist(&self, state: &SimState) -> Result<(), ProviderError> {
        let Some(path) = self.config.state_file.as_ref() else {
            return Ok(());
        };

        let io_err = |e: std::io::Error| {
            ProviderError::fatal(format!("failed to save {}: {e}", path.display()))
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| ProviderError::fatal(format!("failed to serialize state: {e}")))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, content).map_err(io_err)?;
        fs::rename(&tmp_path, path).map_err(io_err)
    }

    /// Fail the next call of `op` with `error`.
    pub async fn fail_next(&self, op: SimOp, error: ProviderError) {
        self.inner.lock().await.faults.push_back((op, error));
    }

    /// Number of calls made for `op`, including failed ones.
    pub async fn calls(&self, op: SimOp) -> usize {
        self.inner.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Overwrite an instance's native state. Returns false if unknown.
    pub async fn set_status(&self, machine_id: &str, status: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state.instances.get_mut(machine_id) {
            Some(instance) => {
                instance.status = status.to_string();
                true
            }
            None => false,
        }
    }

    /// Schedule an instance for provider-initiated reclaim at `at`.
    pub async fn mark_for_reclaim(&self, machine_id: &str, at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state.instances.get_mut(machine_id) {
            Some(instance) => {
                instance.reclaim_marked_at = Some(at);
                true
            }
            None => false,
        }
    }

    pub async fn set_launch_time(&self, machine_id: &str, at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state.instances.get_mut(machine_id) {
            Some(instance) => {
                instance.launch_time = at;
                true
            }
            None => false,
        }
    }

    /// Drop every trace of an instance, as providers eventually do.
    pub async fn forget(&self, machine_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .state
            .instances
            .remove(machine_id)
            .is_some()
    }

    /// Launch instances the engine never asked for.
    pub async fn launch_untracked(&self, count: u32, tag: &str) -> Vec<ProviderInstance> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        (0..count)
            .map(|_| inner.launch("untracked", tag, now).to_provider(true))
            .collect()
    }

    pub async fn instance(&self, machine_id: &str) -> Option<ProviderInstance> {
        self.inner
            .lock()
            .await
            .state
            .instances
            .get(machine_id)
            .map(|i| i.to_provider(true))
    }
}

#[async_trait]
impl ProviderClient for SimulatedProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            bulk_create: self.config.bulk_create,
            aggregate_requests: self.config.aggregate_requests,
        }
    }

    async fn create_instances(
        &self,
        spec: &TemplateSpec,
        count: u32,
        tag: &str,
    ) -> Result<CreateOutcome, ProviderError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        inner.record(SimOp::Create)?;

        if count == 0 {
            return Err(ProviderError::fatal("InvalidParameterValue: count must be positive"));
        }

        let outcome = if spec.allocation != Allocation::OnDemand && self.config.aggregate_requests
        {
            inner.state.next_seq += 1;
            let prefix = match spec.allocation {
                Allocation::Fleet => "sfr",
                _ => "sir",
            };
            let aggregate_ref = format!("{prefix}-{:08x}", inner.state.next_seq);
            inner.state.aggregates.insert(
                aggregate_ref.clone(),
                SimAggregate {
                    template_id: spec.template_id.clone(),
                    tag: tag.to_string(),
                    target: count,
                    members: Vec::new(),
                    state: AggregateState::Active,
                },
            );
            info!(
                aggregate_ref = %aggregate_ref,
                template_id = %spec.template_id,
                count,
                "[SIM] Aggregate request accepted"
            );
            CreateOutcome {
                aggregate_ref: Some(aggregate_ref),
                instances: Vec::new(),
            }
        } else {
            let with_id = !self.config.names_only_on_create;
            let instances = (0..count)
                .map(|_| inner.launch(&spec.template_id, tag, now).to_provider(with_id))
                .collect::<Vec<_>>();
            info!(
                template_id = %spec.template_id,
                count,
                "[SIM] Instances launched"
            );
            CreateOutcome {
                aggregate_ref: None,
                instances,
            }
        };

        self.persist(&inner.state)?;
        Ok(outcome)
    }

    async fn list_instances(
        &self,
        ids: Option<&[String]>,
    ) -> Result<BTreeMap<String, ProviderInstance>, ProviderError> {
        let mut inner = self.inner.lock().await;
        inner.record(SimOp::List)?;

        let listed = inner
            .state
            .instances
            .values()
            .filter(|i| ids.is_none_or(|ids| ids.contains(&i.machine_id)))
            .map(|i| (i.machine_id.clone(), i.to_provider(true)))
            .collect();

        if self.config.auto_advance {
            inner.advance();
            self.persist(&inner.state)?;
        }
        Ok(listed)
    }

    async fn terminate_instances(&self, ids: &[String]) -> Result<Vec<StateChange>, ProviderError> {
        let mut inner = self.inner.lock().await;
        inner.record(SimOp::Terminate)?;

        let unknown: Vec<&str> = ids
            .iter()
            .filter(|id| !inner.state.instances.contains_key(id.as_str()))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(ProviderError::not_found(format!(
                "InvalidInstanceID.NotFound: {}",
                unknown.join(", ")
            )));
        }

        let changes = ids.iter().filter_map(|id| inner.shut_down(id)).collect();
        self.persist(&inner.state)?;
        Ok(changes)
    }

    async fn terminate_by_name(&self, names: &[String]) -> Result<Vec<StateChange>, ProviderError> {
        let mut inner = self.inner.lock().await;
        inner.record(SimOp::TerminateByName)?;

        let ids: Vec<String> = inner
            .state
            .instances
            .values()
            .filter(|i| names.contains(&i.name))
            .map(|i| i.machine_id.clone())
            .collect();
        let changes = ids.iter().filter_map(|id| inner.shut_down(id)).collect();
        self.persist(&inner.state)?;
        Ok(changes)
    }

    async fn describe_aggregate_request(
        &self,
        aggregate_ref: &str,
    ) -> Result<AggregateDescription, ProviderError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        inner.record(SimOp::DescribeAggregate)?;

        let Some(mut aggregate) = inner.state.aggregates.get(aggregate_ref).cloned() else {
            return Err(ProviderError::not_found(format!(
                "InvalidSpotFleetRequestId.NotFound: {aggregate_ref}"
            )));
        };

        if aggregate.state == AggregateState::Active {
            let missing = aggregate.target.saturating_sub(aggregate.members.len() as u32);
            let batch = self
                .config
                .aggregate_fill_per_describe
                .map_or(missing, |n| n.min(missing));
            for _ in 0..batch {
                let id = inner
                    .launch(&aggregate.template_id, &aggregate.tag, now)
                    .machine_id
                    .clone();
                aggregate.members.push(id);
            }
            if aggregate.members.len() as u32 >= aggregate.target {
                aggregate.state = AggregateState::Fulfilled;
            }
        }

        let members = aggregate
            .members
            .iter()
            .filter_map(|id| inner.state.instances.get(id))
            .map(|i| i.to_provider(true))
            .collect();
        let description = AggregateDescription {
            aggregate_ref: aggregate_ref.to_string(),
            state: aggregate.state,
            members,
            message: None,
        };

        inner
            .state
            .aggregates
            .insert(aggregate_ref.to_string(), aggregate);
        self.persist(&inner.state)?;
        Ok(description)
    }
}
