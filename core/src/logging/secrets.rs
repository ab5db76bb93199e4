//! Secret redaction table.
//!
//! Once a secret has been rendered through a redacting template flag (or
//! decrypted from configuration) its verbatim text is registered here, and
//! every log line written afterwards is rewritten through `redact()`. The
//! table only grows for the lifetime of the process.

use std::borrow::Cow;

use parking_lot::RwLock;

/// Marker substituted for secrets in log-facing output.
pub const REDACTED: &str = "[PROTECTED]";

/// Process-wide find/replace table for secrets.
#[derive(Debug, Default)]
pub struct SecretRegistry {
    // Kept sorted longest-first so a secret containing another one is
    // replaced as a whole.
    entries: RwLock<Vec<String>>,
}

impl SecretRegistry {
    pub fn new() -> Self {
        SecretRegistry::default()
    }

    /// Register a verbatim secret. Empty strings are ignored, duplicates are
    /// stored once.
    ///
    /// The JSON-escaped spelling is registered alongside, since the JSON log
    /// format writes `"` and `\` escaped.
    pub fn register(&self, secret: &str) {
        if secret.is_empty() || secret == REDACTED {
            return;
        }
        let escaped = json_escaped(secret);
        let mut entries = self.entries.write();
        for form in std::iter::once(secret).chain(escaped.as_deref()) {
            if !entries.iter().any(|s| s == form) {
                entries.push(form.to_string());
            }
        }
        entries.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    /// Replace every registered secret in `line` with [`REDACTED`].
    pub fn redact<'a>(&self, line: &'a str) -> Cow<'a, str> {
        let entries = self.entries.read();
        if !entries.iter().any(|s| line.contains(s.as_str())) {
            return Cow::Borrowed(line);
        }
        let mut out = line.to_string();
        for secret in entries.iter() {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        Cow::Owned(out)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// The secret as it appears inside a JSON string literal, when that differs
/// from the verbatim text.
fn json_escaped(secret: &str) -> Option<String> {
    let quoted = serde_json::to_string(secret).ok()?;
    let inner = quoted.strip_prefix('"')?.strip_suffix('"')?;
    (inner != secret).then(|| inner.to_string())
}
