//! Persisted request and machine records.

use chrono::{DateTime, Utc};
use hostprov_id::FlowKind;
use hostprov_reconcile::{
    find_match, InstancePhase, MachineIdentity, MachineResult, RequestStatus,
};
use serde::{Deserialize, Serialize};

use crate::provider::ProviderInstance;
use crate::templates::Allocation;

/// The whole store: `{ "requests": [...] }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDocument {
    #[serde(default)]
    pub requests: Vec<Request>,
}

/// A tracked create request.
///
/// Return requests are never stored as their own record: a machine being
/// returned stays under the request that created it and carries the
/// `returnId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Creation time, Unix milliseconds.
    #[serde(default)]
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_value: Option<String>,
    #[serde(default)]
    pub status: RequestStatus,
    /// Provider handle of a fleet / bid allocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<Allocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub machines: Vec<Machine>,
}

impl Request {
    pub fn flow(&self) -> FlowKind {
        FlowKind::of(&self.request_id)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.time).unwrap_or_default()
    }

    /// Whether the provider may still add machines to this request.
    pub fn awaits_members(&self) -> bool {
        self.flow() == FlowKind::Create
            && self.aggregate_ref.is_some()
            && self.status == RequestStatus::Running
    }

    /// Terminal, with no machine left in service.
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && self.machines.iter().all(Machine::is_retired)
    }

    /// Merge `machine` into this request by identity; append if unmatched.
    ///
    /// A stored `returnId` is never cleared by a merge.
    pub fn upsert_machine(&mut self, mut machine: Machine) {
        match find_match(&machine, &self.machines) {
            Some(idx) => {
                if machine.return_id.is_none() {
                    machine.return_id = self.machines[idx].return_id.take();
                }
                self.machines[idx] = machine;
            }
            None => self.machines.push(machine),
        }
    }

    /// Remove the first machine matching `identity`.
    pub fn remove_machine(&mut self, identity: &impl MachineIdentity) -> Option<Machine> {
        let idx = find_match(identity, &self.machines)?;
        Some(self.machines.remove(idx))
    }
}

/// A machine tracked under a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Native provider state string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub phase: InstancePhase,
    #[serde(default)]
    pub result: MachineResult,
    /// The create request this machine belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// The return request currently decommissioning this machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_id: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub launch_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_dns: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub reclaim_marked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Machine {
    /// A freshly launched machine for `request_id`.
    pub fn launched(instance: ProviderInstance, request_id: &str, now: DateTime<Utc>) -> Self {
        let launch_time = instance.launch_time.unwrap_or(now);
        let mut machine = Self {
            request_id: Some(request_id.to_string()),
            result: MachineResult::Executing,
            ..Self::default()
        };
        machine.observe(&instance);
        machine.launch_time = Some(launch_time);
        machine
    }

    /// Copy what the provider reports, verbatim.
    pub fn observe(&mut self, instance: &ProviderInstance) {
        if instance.machine_id.is_some() {
            self.machine_id = instance.machine_id.clone();
        }
        if instance.name.is_some() {
            self.name = instance.name.clone();
        }
        self.status = Some(instance.status.clone());
        self.phase = instance.phase;
        if instance.launch_time.is_some() {
            self.launch_time = instance.launch_time;
        }
        self.private_ip = instance.private_ip.clone().or(self.private_ip.take());
        self.public_ip = instance.public_ip.clone().or(self.public_ip.take());
        self.public_dns = instance.public_dns.clone().or(self.public_dns.take());
        self.reclaim_marked_at = instance.reclaim_marked_at;
    }

    /// Flow this machine is currently tracked in.
    pub fn flow(&self) -> FlowKind {
        if self.return_id.is_some() {
            FlowKind::Return
        } else {
            FlowKind::Create
        }
    }

    /// Failed to launch, or returned and confirmed gone.
    pub fn is_retired(&self) -> bool {
        match self.flow() {
            FlowKind::Create => self.result == MachineResult::Fail,
            FlowKind::Return => self.result == MachineResult::Succeed,
        }
    }

    /// Launch time, falling back to the owning request's creation time.
    pub fn launched_at(&self, request: &Request) -> DateTime<Utc> {
        self.launch_time.unwrap_or_else(|| request.created_at())
    }

    /// Display name for logs and reclaim notices.
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .or(self.machine_id.as_deref())
            .unwrap_or("<unnamed>")
    }
}

impl MachineIdentity for Machine {
    fn machine_id(&self) -> Option<&str> {
        self.machine_id.as_deref()
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl StoreDocument {
    pub fn find_request(&self, request_id: &str) -> Option<&Request> {
        self.requests.iter().find(|r| r.request_id == request_id)
    }

    pub fn find_request_mut(&mut self, request_id: &str) -> Option<&mut Request> {
        self.requests.iter_mut().find(|r| r.request_id == request_id)
    }

    /// Insert `request`, or merge it into the record with the same ID.
    ///
    /// Merging replaces the request header and merges the incoming machines
    /// by identity; stored machines absent from `request` are kept.
    pub fn upsert_request(&mut self, request: Request) {
        let Some(existing) = self.find_request_mut(&request.request_id) else {
            self.requests.push(request);
            return;
        };

        let Request {
            template_id,
            time,
            ttl,
            tag_value,
            status,
            aggregate_ref,
            allocation,
            message,
            machines,
            ..
        } = request;
        existing.template_id = template_id.or(existing.template_id.take());
        existing.time = if existing.time == 0 { time } else { existing.time };
        existing.ttl = ttl.or(existing.ttl);
        existing.tag_value = tag_value.or(existing.tag_value.take());
        existing.status = status;
        existing.aggregate_ref = aggregate_ref.or(existing.aggregate_ref.take());
        existing.allocation = allocation.or(existing.allocation);
        existing.message = message;
        for machine in machines {
            existing.upsert_machine(machine);
        }
    }

    /// Every stored machine decommissioned under `return_id`, with the ID of
    /// the request that owns it.
    pub fn machines_with_return_id(&self, return_id: &str) -> Vec<(&str, &Machine)> {
        self.requests
            .iter()
            .flat_map(|r| r.machines.iter().map(move |m| (r.request_id.as_str(), m)))
            .filter(|(_, m)| m.return_id.as_deref() == Some(return_id))
            .collect()
    }

    pub fn machine_count(&self) -> usize {
        self.requests.iter().map(|r| r.machines.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostprov_reconcile::MachineRef;

    fn machine(id: Option<&str>, name: Option<&str>) -> Machine {
        Machine {
            machine_id: id.map(str::to_string),
            name: name.map(str::to_string),
            ..Machine::default()
        }
    }

    fn request(id: &str, machines: Vec<Machine>) -> Request {
        Request {
            request_id: id.to_string(),
            template_id: Some("small".into()),
            time: 1_700_000_000_000,
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
    fn test_document_json_shape() {
        let doc = StoreDocument {
            requests: vec![request("req_1", vec![machine(Some("i-1"), Some("host-1"))])],
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["requests"][0]["requestId"], "req_1");
        assert_eq!(json["requests"][0]["status"], "RUNNING");
        assert_eq!(json["requests"][0]["machines"][0]["machineId"], "i-1");
        assert_eq!(json["requests"][0]["machines"][0]["result"], "executing");
        assert!(json["requests"][0]["machines"][0].get("returnId").is_none());
    }

    #[test]
    fn test_reads_legacy_lowercase_status() {
        let doc: StoreDocument = serde_json::from_str(
            r#"{"requests":[{"requestId":"r-1","time":5,"status":"complete","machines":[]}]}"#,
        )
        .unwrap();
        assert_eq!(doc.requests[0].status, RequestStatus::Complete);
    }

    #[test]
    fn test_upsert_request_merges_machines_by_identity() {
        let mut doc = StoreDocument {
            requests: vec![request(
                "req_1",
                vec![machine(Some("i-1"), None), machine(None, Some("host-2"))],
            )],
        };

        let mut update = request("req_1", vec![machine(Some("i-2"), Some("host-2"))]);
        update.status = RequestStatus::Complete;
        doc.upsert_request(update);

        let merged = doc.find_request("req_1").unwrap();
        assert_eq!(merged.status, RequestStatus::Complete);
        assert_eq!(merged.machines.len(), 2);
        assert_eq!(merged.machines[1].machine_id.as_deref(), Some("i-2"));
    }

    #[test]
    fn test_merge_keeps_return_id() {
        let mut returned = machine(Some("i-1"), None);
        returned.return_id = Some("ret_1".into());
        let mut req = request("req_1", vec![returned]);

        req.upsert_machine(machine(Some("i-1"), Some("host-1")));
        assert_eq!(req.machines[0].return_id.as_deref(), Some("ret_1"));
        assert_eq!(req.machines[0].name.as_deref(), Some("host-1"));
    }

    #[test]
    fn test_at_most_one_request_per_id() {
        let mut doc = StoreDocument::default();
        doc.upsert_request(request("req_1", vec![]));
        doc.upsert_request(request("req_1", vec![]));
        assert_eq!(doc.requests.len(), 1);
    }

    #[test]
    fn test_remove_machine_by_name() {
        let mut req = request("req_1", vec![machine(Some("i-1"), Some("a"))]);
        let gone = req.remove_machine(&MachineRef::new(None, Some("a".into())));
        assert!(gone.is_some());
        assert!(req.machines.is_empty());
    }

    #[test]
    fn test_machines_with_return_id() {
        let mut returned = machine(Some("i-1"), None);
        returned.return_id = Some("ret_x".into());
        let doc = StoreDocument {
            requests: vec![
                request("req_1", vec![returned, machine(Some("i-2"), None)]),
                request("req_2", vec![machine(Some("i-3"), None)]),
            ],
        };
        let hits = doc.machines_with_return_id("ret_x");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "req_1");
    }

    #[test]
    fn test_settled_requires_every_machine_retired() {
        let mut serving = machine(Some("i-1"), None);
        serving.result = MachineResult::Succeed;
        let mut failed = machine(Some("i-2"), None);
        failed.result = MachineResult::Fail;
        let mut returned = machine(Some("i-3"), None);
        returned.return_id = Some("ret_1".into());
        returned.result = MachineResult::Succeed;

        let mut live = request("req_live", vec![serving, failed.clone()]);
        live.status = RequestStatus::Complete;
        assert!(!live.is_settled());

        let mut gone = request("req_gone", vec![failed, returned]);
        gone.status = RequestStatus::CompleteWithError;
        assert!(gone.is_settled());
    }
}
