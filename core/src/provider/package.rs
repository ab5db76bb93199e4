//! `package` providers for the yum, zypper and apt package managers.

use tracing::{debug, info};

use super::{unsupported, Provider, ProviderContext};
use crate::error::Result;
use crate::infrastructure::CommandSpec;
use crate::resource::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Yum,
    Zypper,
    Apt,
}

pub struct PackageProvider {
    manager: PackageManager,
}

impl PackageProvider {
    pub fn new(manager: PackageManager) -> Self {
        PackageProvider { manager }
    }

    /// Whether the package (at `version`, when given) is installed.
    fn installed(&self, name: &str, version: Option<&str>, ctx: &ProviderContext<'_>) -> Result<bool> {
        match self.manager {
            PackageManager::Yum | PackageManager::Zypper => {
                let query = match version {
                    Some(v) => format!("{}-{}", name, v),
                    None => name.to_string(),
                };
                Ok(ctx.run(CommandSpec::argv(["rpm", "-q", query.as_str()]))?.success())
            }
            PackageManager::Apt => {
                let result = ctx.run(CommandSpec::argv([
                    "dpkg-query",
                    "-W",
                    "-f=${Status} ${Version}",
                    name,
                ]))?;
                if !result.success() {
                    return Ok(false);
                }
                let out = result.stdout();
                let Some(installed_version) = out.trim().strip_prefix("install ok installed") else {
                    return Ok(false);
                };
                Ok(version.map_or(true, |v| installed_version.trim().starts_with(v)))
            }
        }
    }

    fn install_spec(&self, name: &str, version: Option<&str>) -> CommandSpec {
        match self.manager {
            PackageManager::Yum => {
                let target = version.map_or(name.to_string(), |v| format!("{}-{}", name, v));
                CommandSpec::argv(["yum", "-y", "install", target.as_str()])
            }
            PackageManager::Zypper => {
                let target = version.map_or(name.to_string(), |v| format!("{}={}", name, v));
                CommandSpec::argv(["zypper", "--non-interactive", "install", target.as_str()])
            }
            PackageManager::Apt => {
                let target = version.map_or(name.to_string(), |v| format!("{}={}", name, v));
                CommandSpec::argv(["apt-get", "-y", "-q", "install", target.as_str()])
                    .env("DEBIAN_FRONTEND", "noninteractive")
            }
        }
    }

    fn remove_spec(&self, name: &str) -> CommandSpec {
        match self.manager {
            PackageManager::Yum => CommandSpec::argv(["yum", "-y", "erase", name]),
            PackageManager::Zypper => CommandSpec::argv(["zypper", "--non-interactive", "remove", name]),
            PackageManager::Apt => CommandSpec::argv(["apt-get", "-y", "-q", "remove", name])
                .env("DEBIAN_FRONTEND", "noninteractive"),
        }
    }

    fn install(&self, resource: &mut Resource, ctx: &ProviderContext<'_>) -> Result<()> {
        let name = resource.required_str("package_name")?.to_string();
        let version = resource.str_attr("version").map(str::to_string);
        if self.installed(&name, version.as_deref(), ctx)? {
            debug!(package = %name, "already installed");
            return Ok(());
        }
        ctx.run_checked(self.install_spec(&name, version.as_deref()))?;
        info!(package = %name, version = ?version, manager = self.name(), "package installed");
        resource.mark_updated();
        Ok(())
    }

    fn remove(&self, resource: &mut Resource, ctx: &ProviderContext<'_>) -> Result<()> {
        let name = resource.required_str("package_name")?.to_string();
        if !self.installed(&name, None, ctx)? {
            return Ok(());
        }
        ctx.run_checked(self.remove_spec(&name))?;
        info!(package = %name, manager = self.name(), "package removed");
        resource.mark_updated();
        Ok(())
    }
}

impl Provider for PackageProvider {
    fn name(&self) -> &'static str {
        match self.manager {
            PackageManager::Yum => "Yum",
            PackageManager::Zypper => "Zypper",
            PackageManager::Apt => "Apt",
        }
    }

    fn run_action(&mut self, action: &str, resource: &mut Resource, ctx: &ProviderContext<'_>) -> Result<()> {
        match action {
            "install" => self.install(resource, ctx),
            "remove" => self.remove(resource, ctx),
            "nothing" => Ok(()),
            other => Err(unsupported(self, other, resource)),
        }
    }
}
