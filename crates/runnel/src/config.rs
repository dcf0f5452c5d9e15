//! Orchestrator configuration

use std::time::Duration;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Output lines that are never recorded in stdout.
pub const DEFAULT_SUPPRESSED_MESSAGES: &[&str] = &["Python initialization complete"];

/// Packages installed into every new execution context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageSpec {
    /// Prebuilt packages loaded natively by the interpreter
    #[serde(alias = "official")]
    pub native: Vec<String>,
    /// Packages fetched and installed at runtime by the interpreter's installer
    #[serde(alias = "micropip")]
    pub dynamic: Vec<String>,
}

impl PackageSpec {
    /// Create an empty package specification.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add natively-prebuilt packages.
    pub fn with_native<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.native.extend(packages.into_iter().map(Into::into));
        self
    }

    /// Add dynamically-installed packages.
    pub fn with_dynamic<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dynamic.extend(packages.into_iter().map(Into::into));
        self
    }

    /// Whether neither list names a package.
    pub fn is_empty(&self) -> bool {
        self.native.is_empty() && self.dynamic.is_empty()
    }

    /// Union of two specs, keeping first-seen order and dropping duplicates.
    ///
    /// Used to combine a process-wide spec with a per-session one.
    pub fn merged(&self, other: &PackageSpec) -> PackageSpec {
        fn union(a: &[String], b: &[String]) -> Vec<String> {
            a.iter()
                .chain(b)
                .cloned()
                .collect::<IndexSet<_>>()
                .into_iter()
                .collect()
        }

        PackageSpec {
            native: union(&self.native, &other.native),
            dynamic: union(&self.dynamic, &other.dynamic),
        }
    }
}

/// Configuration supplied when the orchestrator is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Packages installed during initialization
    pub packages: PackageSpec,
    /// Wall-clock limit per run; zero disables the limit
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Defer creating the execution context until the first run
    pub lazy: bool,
    /// Tear the context down once a run completes
    pub terminate_on_completion: bool,
    /// Process-style arguments the interpreter is constructed with
    pub args: Vec<String>,
    /// Output lines dropped from stdout
    pub suppressed_messages: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            packages: PackageSpec::default(),
            timeout: Duration::ZERO,
            lazy: false,
            terminate_on_completion: false,
            args: Vec::new(),
            suppressed_messages: DEFAULT_SUPPRESSED_MESSAGES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl OrchestratorConfig {
    /// The run timeout, or `None` when disabled.
    pub fn time_limit(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }

    /// Whether `line` is on the suppression list.
    pub fn is_suppressed(&self, line: &str) -> bool {
        self.suppressed_messages.iter().any(|m| m == line)
    }
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();

        assert_eq!(config.timeout, Duration::ZERO);
        assert_eq!(config.time_limit(), None);
        assert!(!config.lazy);
        assert!(!config.terminate_on_completion);
        assert!(config.packages.is_empty());
        assert!(config.is_suppressed("Python initialization complete"));
    }

    #[test]
    fn test_config_timeout_serialized_as_millis() {
        let config = OrchestratorConfig {
            timeout: Duration::from_millis(1500),
            ..Default::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"timeout\":1500"));

        let back: OrchestratorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.time_limit(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_config_partial_document_uses_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"lazy": true, "packages": {"micropip": ["snowballstemmer"]}}"#)
                .unwrap();

        assert!(config.lazy);
        assert_eq!(config.timeout, Duration::ZERO);
        assert_eq!(config.packages.dynamic, vec!["snowballstemmer"]);
        assert!(config.packages.native.is_empty());
        assert_eq!(config.suppressed_messages.len(), 1);
    }

    #[test]
    fn test_package_spec_merge_dedupes_in_order() {
        let global = PackageSpec::new()
            .with_native(["numpy", "pandas"])
            .with_dynamic(["rich"]);
        let local = PackageSpec::new()
            .with_native(["pandas", "scipy"])
            .with_dynamic(["rich", "attrs"]);

        let merged = global.merged(&local);

        assert_eq!(merged.native, vec!["numpy", "pandas", "scipy"]);
        assert_eq!(merged.dynamic, vec!["rich", "attrs"]);
    }
}
