//! Caller input documents.
//!
//! ```json
//! { "template": { "templateId": "small", "machineCount": 2 }, "rc_account": "acct" }
//! { "requests": [ { "requestId": "req_01H..." } ] }
//! { "machines": [ { "name": "ip-10-0-0-1", "machineId": "i-0abc" } ] }
//! ```

use hostprov_reconcile::{MachineIdentity, MachineRef};
use serde::Deserialize;

use crate::error::EngineError;

/// Input of `requestMachines`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProvisionInput {
    #[serde(default)]
    pub template: TemplateRequest,
    /// Account tag applied to launched instances.
    #[serde(default)]
    pub rc_account: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRequest {
    #[serde(default)]
    pub template_id: String,
    /// Signed so that a negative count is reported as bad input rather than
    /// a parse failure.
    #[serde(default)]
    pub machine_count: i64,
}

impl ProvisionInput {
    pub fn new(template_id: impl Into<String>, machine_count: i64) -> Self {
        Self {
            template: TemplateRequest {
                template_id: template_id.into(),
                machine_count,
            },
            rc_account: None,
        }
    }
}

/// Input of `getRequestStatus`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatusInput {
    #[serde(default)]
    pub requests: Vec<RequestRef>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRef {
    pub request_id: String,
}

impl StatusInput {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            requests: ids
                .into_iter()
                .map(|id| RequestRef {
                    request_id: id.into(),
                })
                .collect(),
        }
    }

    pub fn request_ids(&self) -> Vec<String> {
        self.requests.iter().map(|r| r.request_id.clone()).collect()
    }
}

/// Input of `requestReturnMachines` and `getReturnRequests`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MachinesInput {
    #[serde(default)]
    pub machines: Vec<MachineInput>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub machine_id: Option<String>,
}

impl MachineIdentity for MachineInput {
    fn machine_id(&self) -> Option<&str> {
        self.machine_id.as_deref()
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl MachinesInput {
    pub fn refs(&self) -> Vec<MachineRef> {
        self.machines.iter().map(MachineRef::from_identity).collect()
    }
}

/// Parse an input document.
pub fn parse<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, EngineError> {
    serde_json::from_str(raw).map_err(|e| EngineError::InvalidInput(format!("malformed input: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provision_input() {
        let input: ProvisionInput = parse(
            r#"{"template":{"templateId":"small","machineCount":3},"rc_account":"acct-1"}"#,
        )
        .unwrap();
        assert_eq!(input.template.template_id, "small");
        assert_eq!(input.template.machine_count, 3);
        assert_eq!(input.rc_account.as_deref(), Some("acct-1"));
    }

    #[test]
    fn test_parse_machines_input_drops_blank_identity() {
        let input: MachinesInput =
            parse(r#"{"machines":[{"name":"host-1","machineId":" "},{"machineId":"i-2"}]}"#)
                .unwrap();
        let refs = input.refs();
        assert_eq!(refs[0], MachineRef::new(None, Some("host-1".into())));
        assert_eq!(refs[1], MachineRef::new(Some("i-2".into()), None));
    }

    #[test]
    fn test_malformed_input_is_invalid() {
        let err = parse::<StatusInput>("{not json").unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
