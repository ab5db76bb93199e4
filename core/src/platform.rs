//! OS-family detection.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Groups of distributions sharing package and service tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Redhat,
    Suse,
    Debian,
    Unknown,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Redhat => "redhat",
            OsFamily::Suse => "suse",
            OsFamily::Debian => "debian",
            OsFamily::Unknown => "unknown",
        }
    }

    fn from_distribution_id(id: &str) -> Option<OsFamily> {
        let id = id.trim().trim_matches('"').to_ascii_lowercase();
        match id.as_str() {
            "redhat" | "rhel" | "centos" | "fedora" | "amzn" | "amazon" | "rocky" | "almalinux"
            | "ol" | "oraclelinux" => Some(OsFamily::Redhat),
            "suse" | "sles" | "sled" | "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" => {
                Some(OsFamily::Suse)
            }
            "debian" | "ubuntu" | "linuxmint" => Some(OsFamily::Debian),
            _ => None,
        }
    }

    /// Family from the contents of an `os-release` file: `ID` first, then
    /// each word of `ID_LIKE`.
    pub fn from_os_release(content: &str) -> OsFamily {
        let field = |key: &str| {
            content.lines().find_map(|line| {
                line.trim()
                    .strip_prefix(key)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(|v| v.trim().trim_matches('"').to_string())
            })
        };
        if let Some(family) = field("ID").as_deref().and_then(OsFamily::from_distribution_id) {
            return family;
        }
        field("ID_LIKE")
            .unwrap_or_default()
            .split_whitespace()
            .find_map(OsFamily::from_distribution_id)
            .unwrap_or(OsFamily::Unknown)
    }

    /// Detect the running system's family from `/etc/os-release`.
    pub fn detect() -> OsFamily {
        Self::detect_from(Path::new("/etc/os-release"))
    }

    pub fn detect_from(path: &Path) -> OsFamily {
        match std::fs::read_to_string(path) {
            Ok(content) => OsFamily::from_os_release(&content),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read os-release");
                OsFamily::Unknown
            }
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsFamily {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("unknown") {
            return Ok(OsFamily::Unknown);
        }
        OsFamily::from_distribution_id(s)
            .ok_or_else(|| AgentError::config(format!("unknown OS family '{}'", s)))
    }
}
