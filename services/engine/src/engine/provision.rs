//! `requestMachines`: launch instances and start tracking them.

use std::sync::Arc;

use hostprov_id::RequestId;
use hostprov_reconcile::RequestStatus;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::Engine;
use crate::error::EngineError;
use crate::input::ProvisionInput;
use crate::provider::{call_with_retry, CreateOutcome, ProviderError};
use crate::response::Response;
use crate::state::{Changeset, Machine, Request};
use crate::templates::{Template, TemplateSpec};

/// Tag used when the caller does not name an account.
const DEFAULT_TAG: &str = "default";

impl Engine {
    /// `requestMachines`
    pub async fn request_machines(&self, input: &ProvisionInput) -> Result<Response, EngineError> {
        let (template, count) = self.validate_provision(input)?;
        let request_id = RequestId::new();
        let tag = input
            .rc_account
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TAG.to_string());
        let spec = template.spec();

        info!(
            request_id = %request_id,
            template_id = %template.template_id,
            count,
            allocation = ?spec.allocation,
            "Provisioning machines"
        );

        let outcome = if self.provider.capabilities().bulk_create || spec.allocation.is_aggregate() {
            let provider = self.provider.as_ref();
            call_with_retry(&self.retry, "create_instances", || {
                provider.create_instances(&spec, count, &tag)
            })
            .await?
        } else {
            self.create_one_by_one(&spec, count, &tag).await?
        };

        if outcome.is_empty() {
            error!(request_id = %request_id, "Provider returned neither instances nor a request");
            return Err(EngineError::ProviderFatal(
                "provider accepted the request but returned no instances".to_string(),
            ));
        }

        let now = self.clock.now();
        let request_key = request_id.to_string();
        let machines: Vec<Machine> = outcome
            .instances
            .into_iter()
            .map(|instance| Machine::launched(instance, &request_key, now))
            .collect();
        let machine_count = machines.len();

        let request = Request {
            request_id: request_key.clone(),
            template_id: Some(template.template_id.clone()),
            time: now.timestamp_millis(),
            ttl: template.ttl,
            tag_value: Some(tag),
            status: RequestStatus::Running,
            aggregate_ref: outcome.aggregate_ref.clone(),
            allocation: Some(spec.allocation),
            message: None,
            machines,
        };

        let mut changes = Changeset::new();
        changes.upsert_request(request);
        self.store.commit(&changes)?;

        info!(
            request_id = %request_key,
            machine_count,
            aggregate_ref = outcome.aggregate_ref.as_deref().unwrap_or(""),
            "Request accepted"
        );

        Ok(Response::with_status(RequestStatus::Running, "Request VM success.")
            .with_request_id(request_key))
    }

    fn validate_provision(&self, input: &ProvisionInput) -> Result<(&Template, u32), EngineError> {
        let template_id = input.template.template_id.trim();
        if template_id.is_empty() {
            return Err(EngineError::InvalidInput("templateId is required".to_string()));
        }

        let template = self.templates.get(template_id).ok_or_else(|| {
            EngineError::InvalidInput(format!("template {template_id} does not exist"))
        })?;

        let requested = input.template.machine_count;
        if requested < 1 {
            return Err(EngineError::InvalidInput(format!(
                "machineCount must be at least 1, got {requested}"
            )));
        }
        let count = u32::try_from(requested).map_err(|_| {
            EngineError::InvalidInput(format!("machineCount {requested} is too large"))
        })?;

        Ok((template, count))
    }

    /// Issue `count` single-instance creates through a bounded worker pool.
    ///
    /// Individual failures are logged and dropped; if every call fails the
    /// first error is returned.
    async fn create_one_by_one(
        &self,
        spec: &TemplateSpec,
        count: u32,
        tag: &str,
    ) -> Result<CreateOutcome, ProviderError> {
        let permits = Arc::new(Semaphore::new(self.max_parallel));
        let mut join_set = JoinSet::new();

        for slot in 0..count {
            let permits = Arc::clone(&permits);
            let provider = Arc::clone(&self.provider);
            let retry = self.retry.clone();
            let spec = spec.clone();
            let tag = tag.to_string();
            join_set.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        call_with_retry(&retry, "create_instances", || {
                            provider.create_instances(&spec, 1, &tag)
                        })
                        .await
                    }
                    Err(e) => Err(ProviderError::transient(format!("worker pool closed: {e}"))),
                };
                (slot, result)
            });
        }

        let mut results = Vec::with_capacity(count as usize);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => {
                    error!(error = %e, "Create task panicked");
                    results.push((u32::MAX, Err(ProviderError::transient(e.to_string()))));
                }
            }
        }
        results.sort_by_key(|(slot, _)| *slot);

        let mut outcome = CreateOutcome::default();
        let mut first_error = None;
        for (slot, result) in results {
            match result {
                Ok(mut created) => outcome.instances.append(&mut created.instances),
                Err(err) => {
                    warn!(slot, error = %err, "Single-instance create failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) if outcome.instances.is_empty() => Err(err),
            _ => Ok(outcome),
        }
    }
}
