//! `file` provider, plus the ownership and permission helpers shared with
//! the directory provider.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use tracing::{debug, info};

use super::{unsupported, Provider, ProviderContext};
use crate::error::{AgentError, Result};
use crate::infrastructure::accounts;
use crate::resource::Resource;

pub struct FileProvider;

impl Provider for FileProvider {
    fn name(&self) -> &'static str {
        "File"
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

    if path.is_dir() {
        return Err(AgentError::execution(format!(
            "{} is a directory, not a file",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.is_dir() {
            return Err(AgentError::execution(format!(
                "parent directory {} does not exist",
                parent.display()
            )));
        }
    }

    let mut changed = false;
    match resource.str_attr("content") {
        Some(content) => {
            let current = match fs::read(path) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(AgentError::path(path, e)),
            };
            if current.as_deref() != Some(content.as_bytes()) {
                fs::write(path, content).map_err(|e| AgentError::path(path, e))?;
                info!(path = %path.display(), bytes = content.len(), "file content written");
                changed = true;
            }
        }
        None if !path.exists() => {
            fs::write(path, b"").map_err(|e| AgentError::path(path, e))?;
            info!(path = %path.display(), "empty file created");
            changed = true;
        }
        None => {}
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
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AgentError::path(path, e)),
        Ok(meta) if meta.is_dir() => Err(AgentError::execution(format!(
            "{} is a directory, not a file",
            path.display()
        ))),
        Ok(_) => {
            fs::remove_file(path).map_err(|e| AgentError::path(path, e))?;
            info!(path = %path.display(), "file deleted");
            resource.mark_updated();
            Ok(())
        }
    }
}

/// Parse an octal mode such as `"0644"` or `"755"`.
pub(crate) fn parse_mode(mode: &str) -> Result<u32> {
    let digits = mode.trim().trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| AgentError::config(format!("invalid file mode '{}'", mode)))
}

/// Bring `mode`, `owner` and `group` of `path` in line with the resource.
/// Returns whether anything changed.
pub(crate) fn ensure_metadata(path: &Path, resource: &Resource) -> Result<bool> {
    let meta = fs::metadata(path).map_err(|e| AgentError::path(path, e))?;
    let mut changed = false;

    if let Some(mode) = resource.str_attr("mode") {
        let wanted = parse_mode(mode)?;
        let current = meta.permissions().mode() & 0o7777;
        if current != wanted {
            fs::set_permissions(path, fs::Permissions::from_mode(wanted))
                .map_err(|e| AgentError::path(path, e))?;
            debug!(path = %path.display(), from = format!("{:o}", current), to = format!("{:o}", wanted), "mode changed");
            changed = true;
        }
    }

    let uid = match resource.str_attr("owner") {
        Some(owner) => Some(
            accounts::lookup_user(owner)?
                .ok_or_else(|| AgentError::execution(format!("user '{}' does not exist", owner)))?
                .uid,
        ),
        None => None,
    };
    let gid = match resource.str_attr("group") {
        Some(group) => Some(
            accounts::lookup_group(group)?
                .ok_or_else(|| AgentError::execution(format!("group '{}' does not exist", group)))?
                .gid,
        ),
        None => None,
    };
    let uid = uid.filter(|u| *u != meta.uid());
    let gid = gid.filter(|g| *g != meta.gid());
    if uid.is_some() || gid.is_some() {
        std::os::unix::fs::chown(path, uid, gid).map_err(|e| AgentError::path(path, e))?;
        debug!(path = %path.display(), ?uid, ?gid, "ownership changed");
        changed = true;
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::MockRunner;
    use crate::platform::OsFamily;
    use crate::provider::testing::{resource, Harness};
    use serde_json::json;

    fn apply(h: &Harness, r: &mut Resource) -> Result<()> {
        r.begin_invocation();
        let action = r.action().to_string();
        FileProvider.run_action(&action, r, &h.ctx())
    }

    // --- create ---

    #[test]
    fn create_is_idempotent() {
        let h = Harness::new(MockRunner::new(), OsFamily::Redhat);
        let path = h.dir.path().join("app.cfg");
        let name = path.to_str().unwrap();

        let mut r = resource("file", name, None, json!({"content": "hi"}));
        apply(&h, &mut r).unwrap();
        assert!(r.is_updated());
        assert_eq!(fs::read_to_string(&path).unwrap(), "hi");

        apply(&h, &mut r).unwrap();
        assert!(!r.is_updated());

        let mut r = resource("file", name, None, json!({"content": "bye"}));
        apply(&h, &mut r).unwrap();
        assert!(r.is_updated());
        assert_eq!(fs::read_to_string(&path).unwrap(), "bye");
    }

    #[test]
    fn create_without_content_touches_once() {
        let h = Harness::new(MockRunner::new(), OsFamily::Redhat);
        let path = h.dir.path().join("marker");
        let mut r = resource("file", path.to_str().unwrap(), None, json!({}));
        apply(&h, &mut r).unwrap();
        assert!(r.is_updated());
        assert!(path.exists());
        apply(&h, &mut r).unwrap();
        assert!(!r.is_updated());
    }

    #[test]
    fn missing_parent_is_an_error() {
        let h = Harness::new(MockRunner::new(), OsFamily::Redhat);
        let path = h.dir.path().join("nope/app.cfg");
        let mut r = resource("file", path.to_str().unwrap(), None, json!({"content": "x"}));
        let err = apply(&h, &mut r).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert!(!r.is_updated());
    }

    #[test]
    fn mode_converges() {
        let h = Harness::new(MockRunner::new(), OsFamily::Redhat);
        let path = h.dir.path().join("secret");
        let mut r = resource(
            "file",
            path.to_str().unwrap(),
            None,
            json!({"content": "s", "mode": "0600"}),
        );
        apply(&h, &mut r).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o600);

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        apply(&h, &mut r).unwrap();
        assert!(r.is_updated());
        apply(&h, &mut r).unwrap();
        assert!(!r.is_updated());
    }

    // --- delete ---

    #[test]
    fn delete_only_updates_when_present() {
        let h = Harness::new(MockRunner::new(), OsFamily::Redhat);
        let path = h.dir.path().join("gone");
        fs::write(&path, "x").unwrap();
        let mut r = resource("file", path.to_str().unwrap(), Some("delete"), json!({}));
        apply(&h, &mut r).unwrap();
        assert!(r.is_updated());
        assert!(!path.exists());
        apply(&h, &mut r).unwrap();
        assert!(!r.is_updated());
    }

    #[test]
    fn nothing_does_nothing() {
        let h = Harness::new(MockRunner::new(), OsFamily::Redhat);
        let path = h.dir.path().join("untouched");
        let mut r = resource("file", path.to_str().unwrap(), Some("nothing"), json!({"content": "x"}));
        apply(&h, &mut r).unwrap();
        assert!(!r.is_updated());
        assert!(!path.exists());
    }

    #[test]
    fn parse_modes() {
        assert_eq!(parse_mode("0644").unwrap(), 0o644);
        assert_eq!(parse_mode("755").unwrap(), 0o755);
        assert!(parse_mode("0999").is_err());
        assert!(parse_mode("rwx").is_err());
    }
}
