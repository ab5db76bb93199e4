//! Process-wide agent state, owned in one place and shared through `Arc`s.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::command::CommandBatch;
use crate::config::{ConfigDictionary, Decryptor};
use crate::environment::{Environment, Params, Services};
use crate::error::Result;
use crate::infrastructure::{CommandRunner, ProcessRunner, ProcessSupervisor};
use crate::logging::SecretRegistry;
use crate::monitor::{AgentCounters, HeartbeatCoordinator};
use crate::platform::OsFamily;
use crate::provider::ProviderRegistry;
use crate::types::config::AgentSettings;

pub struct AgentContext {
    pub settings: AgentSettings,
    pub secrets: Arc<SecretRegistry>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub heartbeat: Arc<HeartbeatCoordinator>,
    pub registry: Arc<ProviderRegistry>,
    pub runner: Arc<dyn CommandRunner>,
    pub family: OsFamily,
    pub counters: Arc<AgentCounters>,
    started: Instant,
}

impl AgentContext {
    /// Build the context: create the run directory, resolve the OS family
    /// and wire the production runner to the supervisor.
    pub fn new(settings: AgentSettings, secrets: Arc<SecretRegistry>) -> Result<Self> {
        let supervisor = Arc::new(ProcessSupervisor::new(&settings.run_dir, settings.kill_grace())?);
        let family = resolve_family(settings.os_family.as_deref());
        let runner = ProcessRunner::new(Arc::clone(&secrets)).with_supervisor(Arc::clone(&supervisor));
        info!(family = %family, run_dir = %settings.run_dir.display(), "agent context ready");
        Ok(AgentContext {
            settings,
            secrets,
            supervisor,
            heartbeat: Arc::new(HeartbeatCoordinator::new()),
            registry: Arc::new(ProviderRegistry::with_builtins()),
            runner: Arc::new(runner),
            family,
            counters: Arc::new(AgentCounters::default()),
            started: Instant::now(),
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_family(mut self, family: OsFamily) -> Self {
        self.family = family;
        self
    }

    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn services(&self) -> Services {
        Services {
            registry: Arc::clone(&self.registry),
            runner: Arc::clone(&self.runner),
            supervisor: Arc::clone(&self.supervisor),
            secrets: Arc::clone(&self.secrets),
            family: self.family,
        }
    }

    pub fn decryptor(&self) -> Decryptor {
        Decryptor::new(self.settings.encryption_key_env.as_str()).with_secrets(Arc::clone(&self.secrets))
    }

    /// A fresh environment carrying the batch's configurations and params.
    pub fn environment_for(&self, batch: &CommandBatch) -> Environment {
        let config = ConfigDictionary::new(batch.configurations.clone(), self.decryptor());
        let mut params = Params::new(config);
        params.values = batch.params.clone();
        let task_id = Some(batch.task_id.clone()).filter(|t| !t.is_empty());
        Environment::new(self.services(), params, task_id)
    }
}

fn resolve_family(forced: Option<&str>) -> OsFamily {
    match forced.map(str::parse::<OsFamily>) {
        Some(Ok(family)) => family,
        Some(Err(e)) => {
            warn!(error = %e, "ignoring os_family override");
            OsFamily::detect()
        }
        None => OsFamily::detect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::MockRunner;
    use serde_json::json;

    fn settings(dir: &std::path::Path) -> AgentSettings {
        AgentSettings {
            run_dir: dir.join("run"),
            os_family: Some("suse".into()),
            ..AgentSettings::default()
        }
    }

    #[test]
    fn forced_family_and_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AgentContext::new(settings(dir.path()), Arc::new(SecretRegistry::new())).unwrap();
        assert_eq!(ctx.family, OsFamily::Suse);
        assert!(dir.path().join("run").is_dir());
    }

    #[test]
    fn bad_family_override_falls_back_to_detection() {
        assert_eq!(resolve_family(Some("beos")), OsFamily::detect());
    }

    #[test]
    fn environment_carries_batch_values() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AgentContext::new(settings(dir.path()), Arc::new(SecretRegistry::new()))
            .unwrap()
            .with_runner(Arc::new(MockRunner::new()));
        let batch: CommandBatch = serde_json::from_value(json!({
            "taskId": "t-5",
            "configurations": {"core-site": {"fs.defaultFS": "hdfs://nn:8020"}},
            "params": {"user": "hdfs"}
        }))
        .unwrap();
        let env = ctx.environment_for(&batch);
        assert_eq!(env.task_id(), Some("t-5"));
        let out = env
            .format("{user}@{configurations.core-site.fs.defaultFS}", &[])
            .unwrap();
        assert_eq!(out.value, "hdfs@hdfs://nn:8020");
    }
}
