//! `execute` provider: runs a shell command unless a guard says the work is
//! already done.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use super::{unsupported, Provider, ProviderContext};
use crate::error::{AgentError, Result};
use crate::infrastructure::CommandSpec;
use crate::resource::Resource;

pub struct ExecuteProvider;

impl Provider for ExecuteProvider {
    fn name(&self) -> &'static str {
        "Execute"
    }

    fn run_action(&mut self, action: &str, resource: &mut Resource, ctx: &ProviderContext<'_>) -> Result<()> {
        match action {
            "run" => run(resource, ctx),
            "nothing" => Ok(()),
            other => Err(unsupported(self, other, resource)),
        }
    }
}

/// A shell command carrying the resource's user, cwd and environment.
fn spec_for(resource: &Resource, line: &str) -> CommandSpec {
    let mut spec = CommandSpec::shell(line);
    if let Some(user) = resource.str_attr("user") {
        spec = spec.user(user);
    }
    if let Some(cwd) = resource.str_attr("cwd") {
        spec = spec.cwd(cwd);
    }
    if let Some(Value::Object(vars)) = resource.attr("environment") {
        for (key, value) in vars {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            spec = spec.env(key.clone(), value);
        }
    }
    spec
}

/// Why the command should be skipped, if it should.
fn skip_reason(resource: &Resource, ctx: &ProviderContext<'_>) -> Result<Option<String>> {
    if let Some(creates) = resource.str_attr("creates") {
        if Path::new(creates).exists() {
            return Ok(Some(format!("{} exists", creates)));
        }
    }
    if let Some(guard) = resource.str_attr("not_if") {
        if ctx.run(spec_for(resource, guard))?.success() {
            return Ok(Some("not_if guard succeeded".to_string()));
        }
    }
    if let Some(guard) = resource.str_attr("only_if") {
        if !ctx.run(spec_for(resource, guard))?.success() {
            return Ok(Some("only_if guard failed".to_string()));
        }
    }
    Ok(None)
}

fn accepted_codes(resource: &Resource) -> Vec<i64> {
    match resource.attr("returns") {
        Some(Value::Array(codes)) => codes.iter().filter_map(Value::as_i64).collect(),
        Some(Value::Number(n)) => n.as_i64().into_iter().collect(),
        _ => vec![0],
    }
}

fn run(resource: &mut Resource, ctx: &ProviderContext<'_>) -> Result<()> {
    let identity = resource.identity();
    if let Some(reason) = skip_reason(resource, ctx)? {
        debug!(resource = %identity, reason, "skipped");
        return Ok(());
    }

    let command = resource.required_str("command")?.to_string();
    let mut spec = spec_for(resource, &command);
    let timeout = resource
        .int_attr("timeout")
        .filter(|t| *t > 0)
        .map(|t| Duration::from_secs(t as u64));
    if let Some(t) = timeout {
        spec = spec.timeout(t);
    }

    let result = ctx.run(spec)?;
    let shown = ctx.redact(&command);
    if result.timed_out {
        return Err(AgentError::Timeout {
            command: shown,
            after: timeout.unwrap_or_default(),
        });
    }
    if !accepted_codes(resource).contains(&i64::from(result.exit_code)) {
        return Err(AgentError::execution(format!(
            "'{}' returned {}: {}",
            shown,
            result.exit_code,
            ctx.redact(result.stderr().trim())
        )));
    }

    info!(resource = %identity, exit_code = result.exit_code, "command ran");
    resource.mark_updated();
    Ok(())
}
