//! Engine operations.
//!
//! [`Engine`] is the per-invocation context every operation runs against:
//! provider, store, templates, policy and clock are passed in explicitly.
//!
//! - `provision`: `requestMachines`
//! - `status`: `getRequestStatus`
//! - `reclaim`: `getReturnRequests` and the housekeeping pass after polls
//! - `return_machines`: `requestReturnMachines`

use std::collections::BTreeMap;
use std::sync::Arc;

use hostprov_reconcile::{Policy, RetryPolicy};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::provider::{call_with_retry, ProviderClient, ProviderError, ProviderInstance, StateChange};
use crate::response::Response;
use crate::state::Store;
use crate::templates::TemplateCatalog;

mod provision;
mod reclaim;
mod return_machines;
mod status;

pub use reclaim::housekeeping;

/// Default number of concurrent provider calls per invocation.
pub const DEFAULT_MAX_PARALLEL: usize = 8;

/// Engine context.
#[derive(Clone)]
pub struct Engine {
    provider: Arc<dyn ProviderClient>,
    store: Store,
    templates: TemplateCatalog,
    policy: Policy,
    retry: RetryPolicy,
    max_parallel: usize,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(provider: Arc<dyn ProviderClient>, store: Store, templates: TemplateCatalog) -> Self {
        Self {
            provider,
            store,
            templates,
            policy: Policy::default(),
            retry: RetryPolicy::default(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// `getAvailableTemplates`
    pub fn get_available_templates(&self) -> Response {
        debug!(template_count = self.templates.all().len(), "Listing templates");
        Response::templates(self.templates.all().to_vec())
    }

    async fn list_instances(
        &self,
        ids: Option<&[String]>,
    ) -> Result<BTreeMap<String, ProviderInstance>, ProviderError> {
        list_with_retry(self.provider.as_ref(), &self.retry, ids).await
    }

    /// Terminate `ids`, tolerating IDs the provider no longer knows.
    ///
    /// A batch rejected as not-found is retried one ID at a time; an ID that
    /// is individually not found is reported as already terminated, and any
    /// other per-ID error is collected in [`Terminated::failed`] while the
    /// remaining IDs are still terminated.
    async fn terminate_tolerant(&self, ids: &[String]) -> Result<Terminated, ProviderError> {
        if ids.is_empty() {
            return Ok(Terminated::default());
        }

        let provider = self.provider.as_ref();
        match call_with_retry(&self.retry, "terminate_instances", || {
            provider.terminate_instances(ids)
        })
        .await
        {
            Ok(changes) => Ok(Terminated {
                changes,
                failed: Vec::new(),
            }),
            Err(err) if err.is_not_found() => {
                warn!(
                    count = ids.len(),
                    error = %err.message,
                    "Batch terminate rejected, retrying one instance at a time"
                );
                let mut outcome = Terminated::default();
                for id in ids {
                    let one = std::slice::from_ref(id);
                    match call_with_retry(&self.retry, "terminate_instances", || {
                        provider.terminate_instances(one)
                    })
                    .await
                    {
                        Ok(mut c) => outcome.changes.append(&mut c),
                        Err(err) if err.is_not_found() => {
                            debug!(machine_id = %id, "Instance already gone");
                            outcome.changes.push(StateChange::already_gone(id.clone()));
                        }
                        Err(err) => {
                            warn!(machine_id = %id, error = %err, "Terminate failed for instance");
                            outcome.failed.push((id.clone(), err));
                        }
                    }
                }
                Ok(outcome)
            }
            Err(err) => Err(err),
        }
    }

    async fn terminate_by_name(&self, names: &[String]) -> Result<Vec<StateChange>, ProviderError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let provider = self.provider.as_ref();
        call_with_retry(&self.retry, "terminate_by_name", || {
            provider.terminate_by_name(names)
        })
        .await
    }
}

/// Outcome of [`Engine::terminate_tolerant`].
#[derive(Debug, Default)]
struct Terminated {
    changes: Vec<StateChange>,
    /// IDs the provider refused one at a time.
    failed: Vec<(String, ProviderError)>,
}

impl Terminated {
    fn has_failed(&self, machine_id: &str) -> bool {
        self.failed.iter().any(|(id, _)| id == machine_id)
    }

    /// Keep partial progress, but fail when every ID was refused.
    fn into_partial(mut self) -> Result<Self, ProviderError> {
        if self.changes.is_empty() && !self.failed.is_empty() {
            let (_, err) = self.failed.swap_remove(0);
            return Err(err);
        }
        Ok(self)
    }
}

async fn list_with_retry(
    provider: &dyn ProviderClient,
    retry: &RetryPolicy,
    ids: Option<&[String]>,
) -> Result<BTreeMap<String, ProviderInstance>, ProviderError> {
    call_with_retry(retry, "list_instances", || provider.list_instances(ids)).await
}
