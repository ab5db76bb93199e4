//! `service` providers: systemd units, and background processes tracked by
//! the agent's own supervisor.

use tracing::{debug, info};

use super::{unsupported, Provider, ProviderContext};
use crate::error::{AgentError, Result};
use crate::infrastructure::CommandSpec;
use crate::resource::Resource;

// ---------------------------------------------------------------------------
// Systemd
// ---------------------------------------------------------------------------

pub struct SystemdProvider;

impl SystemdProvider {
    fn is_active(resource: &Resource, ctx: &ProviderContext<'_>) -> Result<bool> {
        let spec = match resource.str_attr("status_command") {
            Some(cmd) => CommandSpec::shell(cmd),
            None => {
                let unit = resource.required_str("service_name")?;
                CommandSpec::argv(["systemctl", "is-active", "--quiet", unit])
            }
        };
        Ok(ctx.run(spec)?.success())
    }

    fn systemctl(verb: &str, resource: &mut Resource, ctx: &ProviderContext<'_>) -> Result<()> {
        let unit = resource.required_str("service_name")?.to_string();
        ctx.run_checked(CommandSpec::argv(["systemctl", verb, unit.as_str()]))?;
        info!(unit = %unit, verb, "systemd unit changed");
        resource.mark_updated();
        Ok(())
    }
}

impl Provider for SystemdProvider {
    fn name(&self) -> &'static str {
        "Systemd"
    }

    fn run_action(&mut self, action: &str, resource: &mut Resource, ctx: &ProviderContext<'_>) -> Result<()> {
        match action {
            "start" => {
                if Self::is_active(resource, ctx)? {
                    debug!(resource = %resource.identity(), "already active");
                    return Ok(());
                }
                Self::systemctl("start", resource, ctx)
            }
            "stop" => {
                if !Self::is_active(resource, ctx)? {
                    return Ok(());
                }
                Self::systemctl("stop", resource, ctx)
            }
            "restart" => Self::systemctl("restart", resource, ctx),
            "reload" => {
                if Self::is_active(resource, ctx)? {
                    Self::systemctl("reload", resource, ctx)
                } else {
                    Self::systemctl("start", resource, ctx)
                }
            }
            "nothing" => Ok(()),
            other => Err(unsupported(self, other, resource)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tracked
// ---------------------------------------------------------------------------

/// Runs `command` as a background process owned by the agent, with a pid
/// file named after `service_name`. Reload restarts the process.
pub struct TrackedProvider;

impl TrackedProvider {
    fn start(resource: &mut Resource, ctx: &ProviderContext<'_>) -> Result<()> {
        let name = resource.required_str("service_name")?.to_string();
        if ctx.supervisor().is_running(&name) {
            debug!(service = %name, "already running");
            return Ok(());
        }
        let command = resource.str_attr("command").ok_or_else(|| {
            AgentError::config(format!(
                "{}: the tracked provider needs a 'command' attribute",
                resource.identity()
            ))
        })?;
        let mut spec = CommandSpec::shell(command);
        if let Some(user) = resource.str_attr("user") {
            spec = spec.user(user);
        }
        let pid = ctx.supervisor().start_tracked(&name, &spec)?;
        info!(service = %name, pid, "tracked service started");
        resource.mark_updated();
        Ok(())
    }

    fn stop(resource: &mut Resource, ctx: &ProviderContext<'_>) -> Result<()> {
        let name = resource.required_str("service_name")?.to_string();
        let was_running = ctx.supervisor().is_running(&name);
        if !was_running {
            // Still clears a stale pid file.
            ctx.supervisor().terminate(&name)?;
            return Ok(());
        }
        let dead = ctx.supervisor().terminate(&name)?;
        if !dead {
            return Err(AgentError::execution(format!("{} survived SIGKILL", name)));
        }
        info!(service = %name, "tracked service stopped");
        resource.mark_updated();
        Ok(())
    }
}

impl Provider for TrackedProvider {
    fn name(&self) -> &'static str {
        "Tracked"
    }

    fn run_action(&mut self, action: &str, resource: &mut Resource, ctx: &ProviderContext<'_>) -> Result<()> {
        match action {
            "start" => Self::start(resource, ctx),
            "stop" => Self::stop(resource, ctx),
            "restart" | "reload" => {
                Self::stop(resource, ctx)?;
                Self::start(resource, ctx)
            }
            "nothing" => Ok(()),
            other => Err(unsupported(self, other, resource)),
        }
    }
}
