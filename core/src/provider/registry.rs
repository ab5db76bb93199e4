//! Provider lookup tables.
//!
//! A table maps `(kind, os family)` to a provider class name, with an
//! optional family-independent default per kind, and maps class names to
//! factories. The registry consults its tables in order; tables added later
//! take precedence over the built-in one.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::directory::DirectoryProvider;
use super::execute::ExecuteProvider;
use super::file::FileProvider;
use super::package::{PackageManager, PackageProvider};
use super::service::{SystemdProvider, TrackedProvider};
use super::user::UserProvider;
use super::Provider;
use crate::error::{AgentError, Result};
use crate::platform::OsFamily;

pub type ProviderFactory = Arc<dyn Fn() -> Box<dyn Provider> + Send + Sync>;

pub const BUILTIN_TABLE: &str = "builtin";

pub struct ProviderTable {
    name: String,
    entries: BTreeMap<(String, Option<OsFamily>), String>,
    named: BTreeMap<String, ProviderFactory>,
}

impl ProviderTable {
    pub fn new(name: impl Into<String>) -> Self {
        ProviderTable {
            name: name.into(),
            entries: BTreeMap::new(),
            named: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `class` under `kind`. `family: None` makes it the default
    /// for families without their own entry. Passing an empty `kind` only
    /// makes the class reachable through an explicit override key.
    pub fn register<F>(&mut self, kind: &str, family: Option<OsFamily>, class: &str, factory: F)
    where
        F: Fn() -> Box<dyn Provider> + Send + Sync + 'static,
    {
        if !kind.is_empty() {
            self.entries
                .insert((kind.to_string(), family), class.to_string());
        }
        self.named.insert(class.to_string(), Arc::new(factory));
    }

    fn resolve(&self, kind: &str, family: OsFamily) -> Option<&str> {
        self.entries
            .get(&(kind.to_string(), Some(family)))
            .or_else(|| self.entries.get(&(kind.to_string(), None)))
            .map(String::as_str)
    }

    fn build(&self, class: &str) -> Option<Box<dyn Provider>> {
        self.named.get(class).map(|f| f())
    }

    /// Class names known to this table.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.named.keys().map(String::as_str)
    }
}

impl fmt::Debug for ProviderTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderTable")
            .field("name", &self.name)
            .field("entries", &self.entries)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ProviderRegistry {
    tables: Vec<ProviderTable>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = ProviderRegistry::new();
        registry.add_table(builtin_table());
        registry
    }

    /// Add a table ahead of the existing ones.
    pub fn add_table(&mut self, table: ProviderTable) {
        debug!(table = table.name(), "provider table registered");
        self.tables.insert(0, table);
    }

    pub fn tables(&self) -> &[ProviderTable] {
        &self.tables
    }

    /// Pick the provider for a resource. An explicit `table.Class` key wins
    /// over family resolution.
    pub fn find_provider(
        &self,
        kind: &str,
        family: OsFamily,
        explicit: Option<&str>,
    ) -> Result<Box<dyn Provider>> {
        if let Some(key) = explicit {
            return self.find_explicit(kind, key);
        }
        for table in &self.tables {
            if let Some(class) = table.resolve(kind, family) {
                if let Some(provider) = table.build(class) {
                    return Ok(provider);
                }
            }
        }
        Err(AgentError::config(format!(
            "no provider for resource kind '{}' on os family '{}'",
            kind, family
        )))
    }

    fn find_explicit(&self, kind: &str, key: &str) -> Result<Box<dyn Provider>> {
        let unknown = || {
            AgentError::config(format!(
                "unknown provider '{}' for resource kind '{}'",
                key, kind
            ))
        };
        let (table_name, class) = key.split_once('.').ok_or_else(unknown)?;
        self.tables
            .iter()
            .filter(|t| t.name() == table_name)
            .find_map(|t| t.build(class))
            .ok_or_else(unknown)
    }
}

fn builtin_table() -> ProviderTable {
    let mut table = ProviderTable::new(BUILTIN_TABLE);
    table.register("file", None, "File", || Box::new(FileProvider));
    table.register("directory", None, "Directory", || Box::new(DirectoryProvider));
    table.register("execute", None, "Execute", || Box::new(ExecuteProvider));
    table.register("user", None, "User", || Box::new(UserProvider));
    table.register("service", None, "Systemd", || Box::new(SystemdProvider));
    table.register("", None, "Tracked", || Box::new(TrackedProvider));
    table.register("package", Some(OsFamily::Redhat), "Yum", || {
        Box::new(PackageProvider::new(PackageManager::Yum))
    });
    table.register("package", Some(OsFamily::Suse), "Zypper", || {
        Box::new(PackageProvider::new(PackageManager::Zypper))
    });
    table.register("package", Some(OsFamily::Debian), "Apt", || {
        Box::new(PackageProvider::new(PackageManager::Apt))
    });
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderContext;
    use crate::resource::{kinds, Resource};

    struct Fake;

    impl Provider for Fake {
        fn name(&self) -> &'static str {
            "Fake"
        }

        fn run_action(&mut self, _: &str, _: &mut Resource, _: &ProviderContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    const FAMILIES: [OsFamily; 3] = [OsFamily::Redhat, OsFamily::Suse, OsFamily::Debian];

    #[test]
    fn every_builtin_kind_resolves_on_every_known_family() {
        let registry = ProviderRegistry::with_builtins();
        for kind in kinds::ALL {
            for family in FAMILIES {
                assert!(
                    registry.find_provider(kind.name, family, None).is_ok(),
                    "{} on {}",
                    kind.name,
                    family
                );
            }
        }
    }

    #[test]
    fn package_provider_follows_family() {
        let registry = ProviderRegistry::with_builtins();
        let name = |f| registry.find_provider("package", f, None).unwrap().name();
        assert_eq!(name(OsFamily::Redhat), "Yum");
        assert_eq!(name(OsFamily::Suse), "Zypper");
        assert_eq!(name(OsFamily::Debian), "Apt");
    }

    #[test]
    fn package_has_no_default() {
        let registry = ProviderRegistry::with_builtins();
        let err = registry
            .find_provider("package", OsFamily::Unknown, None)
            .err()
            .unwrap();
        let msg = err.to_string();
        assert!(msg.contains("package"));
        assert!(msg.contains("unknown"));
        assert!(err.is_fatal());
    }

    #[test]
    fn family_independent_kinds_fall_back_to_default() {
        let registry = ProviderRegistry::with_builtins();
        let p = registry.find_provider("file", OsFamily::Unknown, None).unwrap();
        assert_eq!(p.name(), "File");
    }

    #[test]
    fn explicit_override() {
        let registry = ProviderRegistry::with_builtins();
        let p = registry
            .find_provider("service", OsFamily::Redhat, Some("builtin.Tracked"))
            .unwrap();
        assert_eq!(p.name(), "Tracked");
    }

    #[test]
    fn bad_explicit_keys() {
        let registry = ProviderRegistry::with_builtins();
        for key in ["Tracked", "builtin.Nope", "other.File"] {
            let err = registry
                .find_provider("service", OsFamily::Redhat, Some(key))
                .err()
                .unwrap();
            assert!(err.to_string().contains(key), "{}", key);
            assert!(err.to_string().contains("service"));
        }
    }

    #[test]
    fn added_tables_take_precedence() {
        let mut registry = ProviderRegistry::with_builtins();
        let mut site = ProviderTable::new("site");
        site.register("file", Some(OsFamily::Debian), "Fake", || Box::new(Fake));
        registry.add_table(site);

        let on_debian = registry.find_provider("file", OsFamily::Debian, None).unwrap();
        assert_eq!(on_debian.name(), "Fake");
        let on_redhat = registry.find_provider("file", OsFamily::Redhat, None).unwrap();
        assert_eq!(on_redhat.name(), "File");
        let explicit = registry
            .find_provider("file", OsFamily::Redhat, Some("site.Fake"))
            .unwrap();
        assert_eq!(explicit.name(), "Fake");
    }

    #[test]
    fn unknown_kind() {
        let registry = ProviderRegistry::with_builtins();
        assert!(registry.find_provider("cron", OsFamily::Redhat, None).is_err());
    }
}
