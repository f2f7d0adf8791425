//! Caller-facing response documents.
//!
//! Views deliberately leave out the engine's correlation fields (owning
//! request, return request, lifecycle phase, aggregate handle, reclaim mark).

use std::time::Duration;

use hostprov_reconcile::{MachineResult, RequestStatus};
use serde::Serialize;

use crate::error::EngineError;
use crate::state::{Machine, Request};
use crate::templates::Template;

/// Top-level response printed for every command.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// 0 on success, 1 otherwise. Also the process exit code.
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<RequestEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<Template>,
}

/// An element of `requests`: a polled request, or a reclaim notice.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RequestEntry {
    Request(RequestView),
    Return(ReturnView),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestView {
    pub request_id: String,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub machines: Vec<MachineView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub result: MachineResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_dns_name: Option<String>,
    /// Unix seconds.
    #[serde(rename = "launchtime", skip_serializing_if = "Option::is_none")]
    pub launch_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A machine the caller should treat as going away.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnView {
    pub machine: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Seconds left before the provider takes the machine.
    pub grace_period: u64,
}

impl From<&Machine> for MachineView {
    fn from(m: &Machine) -> Self {
        Self {
            machine_id: m.machine_id.clone(),
            name: m.name.clone(),
            result: m.result,
            status: m.status.clone(),
            private_ip_address: m.private_ip.clone(),
            public_ip_address: m.public_ip.clone(),
            public_dns_name: m.public_dns.clone(),
            launch_time: m.launch_time.map(|t| t.timestamp()),
            message: m.message.clone(),
        }
    }
}

impl From<&Request> for RequestView {
    fn from(r: &Request) -> Self {
        Self {
            request_id: r.request_id.clone(),
            status: r.status,
            message: r.message.clone(),
            machines: r.machines.iter().map(MachineView::from).collect(),
        }
    }
}

impl ReturnView {
    pub fn new(machine: &Machine, grace_period: Duration) -> Self {
        Self {
            machine: machine.label().to_string(),
            machine_id: machine.machine_id.clone(),
            grace_period: grace_period.as_secs(),
        }
    }

    /// A machine that is already gone.
    pub fn gone(machine: String, machine_id: Option<String>) -> Self {
        Self {
            machine,
            machine_id,
            grace_period: 0,
        }
    }
}

fn code_for(status: RequestStatus) -> i32 {
    match status {
        RequestStatus::Warning | RequestStatus::Error => 1,
        _ => 0,
    }
}

impl Response {
    /// A response with `status` and a matching `code`.
    pub fn with_status(status: RequestStatus, message: impl Into<String>) -> Self {
        Self {
            code: code_for(status),
            message: Some(message.into()),
            status: Some(status),
            ..Self::default()
        }
    }

    /// A successful response without a request-level status.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn from_error(err: &EngineError) -> Self {
        Self::with_status(err.response_status(), err.to_string())
    }

    pub fn templates(templates: Vec<Template>) -> Self {
        Self {
            templates,
            ..Self::with_status(RequestStatus::Complete, "Get available templates success.")
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_requests(mut self, requests: Vec<RequestView>) -> Self {
        self.requests = requests.into_iter().map(RequestEntry::Request).collect();
        self
    }

    pub fn with_returns(mut self, returns: Vec<ReturnView>) -> Self {
        self.requests = returns.into_iter().map(RequestEntry::Return).collect();
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Polled requests contained in this response.
    pub fn request_views(&self) -> impl Iterator<Item = &RequestView> {
        self.requests.iter().filter_map(|e| match e {
            RequestEntry::Request(view) => Some(view),
            RequestEntry::Return(_) => None,
        })
    }

    /// Reclaim notices contained in this response.
    pub fn return_views(&self) -> impl Iterator<Item = &ReturnView> {
        self.requests.iter().filter_map(|e| match e {
            RequestEntry::Return(view) => Some(view),
            RequestEntry::Request(_) => None,
        })
    }
}
