//! Providers: the strategies that converge one resource kind.
//!
//! Every action follows the same contract: inspect the current state, make
//! the smallest change that reaches the declared state, change nothing when
//! already converged, and mark the resource updated exactly when something
//! changed. `nothing` is a no-op for every kind.

pub mod directory;
pub mod execute;
pub mod file;
pub mod package;
pub mod registry;
pub mod service;
pub mod user;

use std::sync::Arc;

use tracing::debug;

use crate::environment::{Environment, Params, Services};
use crate::error::{AgentError, Result};
use crate::format::{Formatted, Formatter};
use crate::infrastructure::{CommandResult, CommandSpec, ProcessSupervisor};
use crate::platform::OsFamily;
use crate::resource::Resource;

pub use registry::{ProviderFactory, ProviderRegistry, ProviderTable};

pub trait Provider: Send {
    /// Class name used in explicit override keys (`builtin.<Name>`).
    fn name(&self) -> &'static str;

    fn run_action(&mut self, action: &str, resource: &mut Resource, ctx: &ProviderContext<'_>)
        -> Result<()>;
}

/// Error for an action a provider does not implement.
pub fn unsupported(provider: &dyn Provider, action: &str, resource: &Resource) -> AgentError {
    AgentError::config(format!(
        "provider {} cannot perform action '{}' on {}",
        provider.name(),
        action,
        resource.identity()
    ))
}

/// What a provider may use while running an action.
pub struct ProviderContext<'a> {
    services: &'a Services,
    params: &'a Arc<Params>,
    task_id: Option<&'a str>,
}

impl<'a> ProviderContext<'a> {
    pub fn new(services: &'a Services, params: &'a Arc<Params>, task_id: Option<&'a str>) -> Self {
        ProviderContext {
            services,
            params,
            task_id,
        }
    }

    pub fn family(&self) -> OsFamily {
        self.services.family
    }

    pub fn params(&self) -> &Params {
        self.params
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.services.supervisor
    }

    pub fn format(&self, template: &str, overrides: &[(&str, &str)]) -> Result<Formatted> {
        Formatter::new(self.params, &self.services.secrets).format(template, overrides)
    }

    pub fn redact(&self, text: &str) -> String {
        self.services.secrets.redact(text).into_owned()
    }

    /// Run a command on behalf of the current task.
    pub fn run(&self, spec: CommandSpec) -> Result<CommandResult> {
        let spec = match self.task_id {
            Some(task) => spec.task(task),
            None => spec,
        };
        self.services.runner.run(&spec)
    }

    /// Run a command and turn a nonzero exit into an execution error.
    pub fn run_checked(&self, spec: CommandSpec) -> Result<CommandResult> {
        let line = spec.display();
        let result = self.run(spec)?;
        if result.success() {
            return Ok(result);
        }
        debug!(exit_code = result.exit_code, "command failed");
        Err(AgentError::execution(format!(
            "'{}' exited with {}: {}",
            self.redact(&line),
            result.exit_code,
            self.redact(result.stderr().trim())
        )))
    }

    /// A nested environment for actions that converge further resources
    /// synchronously.
    pub fn child_environment(&self) -> Environment {
        Environment::with_shared_params(
            self.services.clone(),
            Arc::clone(self.params),
            self.task_id.map(str::to_string),
        )
    }
}
