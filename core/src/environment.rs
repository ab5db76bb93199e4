//! Execution environment: collects an ordered batch of resources inside a
//! scope and converges them in declaration order.
//!
//! ```text
//! let mut env = Environment::new(services, params, Some("task-7".into()));
//! let mut scope = env.scope();
//! scope.resource("directory", "/etc/app", None, Map::new(), None)?;
//! scope.resource("file", "/etc/app/app.cfg", None, args, None)?;
//! let outcomes = scope.run()?;
//! ```
//!
//! Order is significant: later resources may rely on what earlier ones did,
//! so `run` is strictly sequential and stops at the first failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::command::ResourceSpec;
use crate::config::ConfigDictionary;
use crate::convergence::retry::RetryPolicy;
use crate::error::{AgentError, Result};
use crate::format::{Formatted, Formatter};
use crate::infrastructure::{CommandRunner, ProcessSupervisor};
use crate::logging::SecretRegistry;
use crate::platform::OsFamily;
use crate::provider::registry::ProviderRegistry;
use crate::provider::ProviderContext;
use crate::resource::Resource;

/// Values templates and providers may read.
#[derive(Debug, Clone)]
pub struct Params {
    pub config: ConfigDictionary,
    pub values: BTreeMap<String, String>,
}

impl Params {
    pub fn new(config: ConfigDictionary) -> Self {
        Params {
            config,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

/// Shared collaborators handed to every environment.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<ProviderRegistry>,
    pub runner: Arc<dyn CommandRunner>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub secrets: Arc<SecretRegistry>,
    pub family: OsFamily,
}

/// What happened to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOutcome {
    pub kind: String,
    pub name: String,
    pub action: String,
    pub updated: bool,
}

pub struct Environment {
    services: Services,
    params: Arc<Params>,
    task_id: Option<String>,
    depth: usize,
}

impl Environment {
    pub fn new(services: Services, params: Params, task_id: Option<String>) -> Self {
        Environment {
            services,
            params: Arc::new(params),
            task_id,
            depth: 0,
        }
    }

    pub(crate) fn with_shared_params(
        services: Services,
        params: Arc<Params>,
        task_id: Option<String>,
    ) -> Self {
        Environment {
            services,
            params,
            task_id,
            depth: 0,
        }
    }

    /// A nested environment sharing this one's params, with its own
    /// resource list.
    pub fn child(&self) -> Environment {
        Environment::with_shared_params(
            self.services.clone(),
            Arc::clone(&self.params),
            self.task_id.clone(),
        )
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn format(&self, template: &str, overrides: &[(&str, &str)]) -> Result<Formatted> {
        Formatter::new(&self.params, &self.services.secrets).format(template, overrides)
    }

    /// Open a collection scope. Resources added through the guard are kept
    /// in construction order; the scope closes when the guard is dropped,
    /// whether or not it was run.
    pub fn scope(&mut self) -> Scope<'_> {
        self.depth += 1;
        debug!(task_id = ?self.task_id, depth = self.depth, "resource scope opened");
        Scope {
            env: self,
            resources: Vec::new(),
            ran: false,
        }
    }
}

pub struct Scope<'e> {
    env: &'e mut Environment,
    resources: Vec<Resource>,
    ran: bool,
}

impl<'e> Scope<'e> {
    /// Bind and append a resource of a built-in kind.
    pub fn resource(
        &mut self,
        kind: &str,
        name: &str,
        action: Option<&str>,
        args: Map<String, Value>,
        provider: Option<&str>,
    ) -> Result<&Resource> {
        let resource = Resource::of_kind(kind, name, action, args, provider.map(str::to_string))?;
        self.resources.push(resource);
        Ok(&self.resources[self.resources.len() - 1])
    }

    /// Bind and append a resource from its wire form.
    pub fn add(&mut self, spec: &ResourceSpec) -> Result<&Resource> {
        self.resource(
            &spec.kind,
            &spec.name,
            spec.action.as_deref(),
            spec.attributes.clone(),
            spec.provider.as_deref(),
        )
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Converge every collected resource, in order. The first failure
    /// stops the run and is returned wrapped with the resource identity.
    pub fn run(mut self) -> Result<Vec<ResourceOutcome>> {
        self.ran = true;
        let env: &Environment = &*self.env;
        let mut outcomes = Vec::with_capacity(self.resources.len());
        for resource in &mut self.resources {
            let identity = resource.identity();
            apply(env, resource).map_err(|e| AgentError::Resource {
                resource: identity.clone(),
                source: Box::new(e),
            })?;
            outcomes.push(ResourceOutcome {
                kind: resource.kind_name().to_string(),
                name: resource.name().to_string(),
                action: resource.action().to_string(),
                updated: resource.is_updated(),
            });
        }
        Ok(outcomes)
    }
}

fn apply(env: &Environment, resource: &mut Resource) -> Result<()> {
    let services = &env.services;
    if let Some(task) = env.task_id.as_deref() {
        if let Some(reason) = services.supervisor.cancel_reason(task) {
            return Err(AgentError::Cancelled(reason));
        }
    }

    let mut provider =
        services
            .registry
            .find_provider(resource.kind_name(), services.family, resource.provider_key())?;
    let ctx = ProviderContext::new(services, &env.params, env.task_id.as_deref());
    let action = resource.action().to_string();
    let identity = resource.identity();
    let policy = RetryPolicy::fixed(resource.tries(), resource.try_sleep());

    // A mutation made by a failed attempt still counts once a later
    // attempt succeeds.
    resource.begin_invocation();
    policy.retry(&identity, |_| provider.run_action(&action, &mut *resource, &ctx))?;

    info!(
        resource = %identity,
        provider = provider.name(),
        action = %action,
        updated = resource.is_updated(),
        "resource converged"
    );
    Ok(())
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        if !self.ran && !self.resources.is_empty() {
            debug!(discarded = self.resources.len(), "scope closed without running");
        }
        debug!(task_id = ?self.env.task_id, depth = self.env.depth, "resource scope closed");
        self.env.depth -= 1;
    }
}
