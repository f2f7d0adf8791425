//! Machine templates offered to the broker.
//!
//! Templates are read from `<conf>/conf/<provider>prov_templates.json`:
//!
//! ```json
//! { "templates": [ { "templateId": "small", "maxNumber": 10, "vmType": "m5.large" } ] }
//! ```
//!
//! Keys the engine does not interpret are kept in [`Template::extra`] and
//! handed to the provider untouched.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Tag keys with this prefix are reserved for the engine's own bookkeeping.
pub const RESERVED_TAG_PREFIX: &str = "hostprov:";

/// Errors loading the template catalog.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read template file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse template file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("template file {} defines no templates", .0.display())]
    Empty(PathBuf),

    #[error("invalid template {template_id}: {reason}")]
    Invalid { template_id: String, reason: String },
}

/// How instances for a template are allocated at the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Allocation {
    /// Plain instances, one provider record per machine.
    OnDemand,
    /// A bid for spare capacity; the provider may reclaim it.
    SpotBid,
    /// A fleet request the provider fills asynchronously.
    Fleet,
}

impl Allocation {
    /// Whether the provider tracks the allocation as one aggregate request.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::SpotBid | Self::Fleet)
    }
}

/// A machine template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub template_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_number: Option<u32>,

    /// Broker-facing attributes, e.g. `"ncpus": ["Numeric", "2"]`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_type: Option<String>,

    /// Request time-to-live in seconds, copied onto each request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_price: Option<f64>,

    /// Provider fleet definition; its presence selects fleet allocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet_config: Option<serde_json::Value>,

    /// `key=value;key2=value2`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_tags: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Template {
    /// Allocation mode: a fleet definition wins over a spot price.
    pub fn allocation(&self) -> Allocation {
        if self.fleet_config.is_some() {
            Allocation::Fleet
        } else if self.spot_price.is_some_and(|p| p > 0.0) {
            Allocation::SpotBid
        } else {
            Allocation::OnDemand
        }
    }

    /// User tags parsed from `instanceTags`.
    ///
    /// Malformed pairs and reserved keys are skipped.
    pub fn tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        let Some(raw) = self.instance_tags.as_deref() else {
            return tags;
        };

        for pair in raw.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                continue;
            }
            if key.to_ascii_lowercase().starts_with(RESERVED_TAG_PREFIX) {
                warn!(
                    template_id = %self.template_id,
                    tag = %key,
                    "Ignoring user tag with reserved prefix"
                );
                continue;
            }
            tags.insert(key.to_string(), value.to_string());
        }
        tags
    }

    /// The provider-facing view of this template.
    pub fn spec(&self) -> TemplateSpec {
        TemplateSpec {
            template_id: self.template_id.clone(),
            allocation: self.allocation(),
            image_id: self.image_id.clone(),
            vm_type: self.vm_type.clone(),
            spot_price: self.spot_price,
            fleet_config: self.fleet_config.clone(),
            tags: self.tags(),
            extra: self.extra.clone(),
        }
    }

    fn validate(&self) -> Result<(), TemplateError> {
        let invalid = |reason: &str| TemplateError::Invalid {
            template_id: self.template_id.clone(),
            reason: reason.to_string(),
        };

        if self.template_id.trim().is_empty() {
            return Err(invalid("templateId must not be empty"));
        }
        if self.max_number == Some(0) {
            return Err(invalid("maxNumber must be at least 1"));
        }
        if self.spot_price.is_some_and(|p| !p.is_finite() || p < 0.0) {
            return Err(invalid("spotPrice must be a non-negative number"));
        }
        Ok(())
    }
}

/// What the provider needs to launch instances for a template.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateSpec {
    pub template_id: String,
    pub allocation: Allocation,
    pub image_id: Option<String>,
    pub vm_type: Option<String>,
    pub spot_price: Option<f64>,
    pub fleet_config: Option<serde_json::Value>,
    pub tags: BTreeMap<String, String>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    templates: Vec<Template>,
}

/// The set of templates available for provisioning.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: Vec<Template>,
}

impl TemplateCatalog {
    pub fn new(templates: Vec<Template>) -> Self {
        Self { templates }
    }

    /// Load and validate the catalog at `path`.
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        if !path.exists() {
            return Err(TemplateError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|source| TemplateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: TemplateFile =
            serde_json::from_str(&content).map_err(|source| TemplateError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if file.templates.is_empty() {
            return Err(TemplateError::Empty(path.to_path_buf()));
        }

        let mut seen = std::collections::BTreeSet::new();
        for template in &file.templates {
            template.validate()?;
            if !seen.insert(template.template_id.as_str()) {
                return Err(TemplateError::Invalid {
                    template_id: template.template_id.clone(),
                    reason: "duplicate templateId".to_string(),
                });
            }
        }

        debug!(
            path = %path.display(),
            template_count = file.templates.len(),
            "Loaded template catalog"
        );

        Ok(Self::new(file.templates))
    }

    pub fn get(&self, template_id: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.template_id == template_id)
    }

    pub fn all(&self) -> &[Template] {
        &self.templates
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn template(json: serde_json::Value) -> Template {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_allocation_precedence() {
        let on_demand = template(serde_json::json!({ "templateId": "a" }));
        assert_eq!(on_demand.allocation(), Allocation::OnDemand);

        let zero_bid = template(serde_json::json!({ "templateId": "a", "spotPrice": 0.0 }));
        assert_eq!(zero_bid.allocation(), Allocation::OnDemand);

        let bid = template(serde_json::json!({ "templateId": "a", "spotPrice": 0.12 }));
        assert_eq!(bid.allocation(), Allocation::SpotBid);

        let fleet = template(serde_json::json!({
            "templateId": "a",
            "spotPrice": 0.12,
            "fleetConfig": { "targetCapacity": 4 }
        }));
        assert_eq!(fleet.allocation(), Allocation::Fleet);
        assert!(fleet.allocation().is_aggregate());
    }

    #[test]
    fn test_tags_skip_malformed_and_reserved() {
        let t = template(serde_json::json!({
            "templateId": "a",
            "instanceTags": "team=infra;bad;=x;HostProv:owner=me;cost center = 42"
        }));
        let tags = t.tags();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["team"], "infra");
        assert_eq!(tags["cost center"], "42");
    }

    #[test]
    fn test_unknown_keys_survive() {
        let t = template(serde_json::json!({
            "templateId": "a",
            "subnetId": "subnet-1",
            "securityGroupIds": ["sg-1"]
        }));
        assert_eq!(t.extra["subnetId"], "subnet-1");
        let back = serde_json::to_value(&t).unwrap();
        assert_eq!(back["securityGroupIds"][0], "sg-1");
    }

    #[test]
    fn test_load_catalog() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"templates":[{{"templateId":"small","maxNumber":4}},{{"templateId":"large"}}]}}"#
        )
        .unwrap();

        let catalog = TemplateCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.all().len(), 2);
        assert_eq!(catalog.get("small").unwrap().max_number, Some(4));
        assert!(catalog.get("medium").is_none());
    }

    #[test]
    fn test_load_rejects_missing_empty_and_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.json");
        assert!(matches!(
            TemplateCatalog::load(&missing),
            Err(TemplateError::NotFound(_))
        ));

        let empty = dir.path().join("empty.json");
        fs::write(&empty, r#"{"templates":[]}"#).unwrap();
        assert!(matches!(TemplateCatalog::load(&empty), Err(TemplateError::Empty(_))));

        let dup = dir.path().join("dup.json");
        fs::write(&dup, r#"{"templates":[{"templateId":"a"},{"templateId":"a"}]}"#).unwrap();
        assert!(matches!(
            TemplateCatalog::load(&dup),
            Err(TemplateError::Invalid { .. })
        ));
    }
}
