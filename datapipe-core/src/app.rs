use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// What a task executes.
///
/// A native app is a registered Rust callable that returns an
/// `ArgValue`. A shell app is an argv template — plain data, so a
/// manager working only from the store can still dispatch it — whose
/// `{field}` placeholders are filled from the resolved arguments right
/// before the process is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppKind {
    Native,
    Shell,
}

impl AppKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "NATIVE",
            Self::Shell => "SHELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "NATIVE" => Self::Native,
            "SHELL" => Self::Shell,
            _ => return None,
        })
    }
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What identifies the app inside the fingerprint.
///
/// `Code` fingerprints the full source blob: editing the callable (even
/// a comment) re-runs it. `Name`/`Alias` fingerprint the logical name
/// only, rebinding the call to any previously computed result that
/// bears the same name and arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppAlias {
    Code,
    Name,
    Alias(String),
}

impl Default for AppAlias {
    fn default() -> Self {
        AppAlias::Code
    }
}

/// Per-app declaration options, orthogonal to dependency semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppOptions {
    /// Do not enqueue; calls return a null future outside any graph.
    pub skip: bool,
    pub alias: AppAlias,
}

/// Declaration of one app: the unit of enqueued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    pub name: String,
    pub kind: AppKind,
    /// Source text for native apps; JSON-encoded argv template for
    /// shell apps. Participates in the fingerprint unless aliased.
    pub code_blob: String,
    /// Environment version inventory (crate name -> version). Captured
    /// for bookkeeping only; never fingerprinted.
    pub versions: BTreeMap<String, String>,
    pub options: AppOptions,
}

impl AppSpec {
    pub fn native(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AppKind::Native,
            code_blob: source.into(),
            versions: BTreeMap::new(),
            options: AppOptions::default(),
        }
    }

    pub fn shell<S: Into<String>>(name: impl Into<String>, template: Vec<S>) -> Self {
        let template: Vec<String> = template.into_iter().map(Into::into).collect();
        let code_blob =
            serde_json::to_string(&template).expect("argv template serializes to JSON");
        Self {
            name: name.into(),
            kind: AppKind::Shell,
            code_blob,
            versions: BTreeMap::new(),
            options: AppOptions::default(),
        }
    }

    /// Argv template for shell apps.
    pub fn argv_template(&self) -> Result<Vec<String>, serde_json::Error> {
        serde_json::from_str(&self.code_blob)
    }

    pub fn with_version(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.versions.insert(name.into(), version.into());
        self
    }

    pub fn skipped(mut self) -> Self {
        self.options.skip = true;
        self
    }

    /// Fingerprint by app name instead of source.
    pub fn named(mut self) -> Self {
        self.options.alias = AppAlias::Name;
        self
    }

    /// Fingerprint under an explicit alias.
    pub fn named_as(mut self, alias: impl Into<String>) -> Self {
        self.options.alias = AppAlias::Alias(alias.into());
        self
    }

    /// The identity string hashed in step 1 of the fingerprint.
    pub fn fingerprint_identity(&self) -> crate::fingerprint::AppIdentity<'_> {
        match &self.options.alias {
            AppAlias::Code => crate::fingerprint::AppIdentity::Source(&self.code_blob),
            AppAlias::Name => crate::fingerprint::AppIdentity::Name(&self.name),
            AppAlias::Alias(alias) => crate::fingerprint::AppIdentity::Name(alias),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_template_roundtrip() {
        let spec = AppSpec::shell("echo_pi", vec!["echo", "-n", "pi ~ {pi:.4f}"]);
        assert_eq!(spec.kind, AppKind::Shell);
        assert_eq!(
            spec.argv_template().unwrap(),
            vec!["echo", "-n", "pi ~ {pi:.4f}"]
        );
    }

    #[test]
    fn aliasing_switches_identity() {
        use crate::fingerprint::AppIdentity;
        let spec = AppSpec::native("fraction", "fn fraction() {}");
        assert!(matches!(
            spec.fingerprint_identity(),
            AppIdentity::Source(_)
        ));
        let named = spec.clone().named();
        assert!(matches!(
            named.fingerprint_identity(),
            AppIdentity::Name("fraction")
        ));
        let aliased = spec.named_as("frac_v1");
        assert!(matches!(
            aliased.fingerprint_identity(),
            AppIdentity::Name("frac_v1")
        ));
    }
}
