//! `directory` provider.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::info;

use super::file::ensure_metadata;
use super::{unsupported, Provider, ProviderContext};
use crate::error::{AgentError, Result};
use crate::resource::Resource;

pub struct DirectoryProvider;

impl Provider for DirectoryProvider {
    fn name(&self) -> &'static str {
        "Directory"
    }

    fn run_action(&mut self, action: &str, resource: &mut Resource, _ctx: &ProviderContext<'_>) -> Result<()> {
        match action {
            "create" => create(resource),
            "delete" => delete(resource),
            "nothing" => Ok(()),
            other => Err(unsupported(self, other, resource)),
        }
    }
}

fn create(resource: &mut Resource) -> Result<()> {
    let path = resource.required_str("path")?.to_string();
    let path = Path::new(&path);
    let mut changed = false;

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) if path.is_dir() => {}
        Ok(_) => {
            return Err(AgentError::execution(format!(
                "{} exists and is not a directory",
                path.display()
            )))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if resource.bool_attr("create_parents") {
                fs::create_dir_all(path)
            } else {
                fs::create_dir(path)
            }
            .map_err(|e| AgentError::path(path, e))?;
            info!(path = %path.display(), "directory created");
            changed = true;
        }
        Err(e) => return Err(AgentError::path(path, e)),
    }

    changed |= ensure_metadata(path, resource)?;
    if changed {
        resource.mark_updated();
    }
    Ok(())
}

fn delete(resource: &mut Resource) -> Result<()> {
    let path = resource.required_str("path")?.to_string();
    let path = Path::new(&path);
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(AgentError::path(path, e)),
        Ok(meta) if !meta.is_dir() => {
            return Err(AgentError::execution(format!(
                "{} exists and is not a directory",
                path.display()
            )))
        }
        Ok(_) => {}
    }
    if resource.bool_attr("recursive_delete") {
        fs::remove_dir_all(path)
    } else {
        fs::remove_dir(path)
    }
    .map_err(|e| AgentError::path(path, e))?;
    info!(path = %path.display(), "directory deleted");
    resource.mark_updated();
    Ok(())
}
