//! Engine and policy configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use gradebook_core::engine::EngineConfig;
use gradebook_core::policy::{validate_policies, PolicyOverrides, PolicySet, PolicyWarning};

/// The `[engine]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Max keys recomputed concurrently.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Bound on each record fetch, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Bound on each summary upsert, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub commit_timeout_ms: u64,
    /// Retries on storage errors and timeouts.
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// How often failed keys are requeued and settled keys pruned, in
    /// milliseconds.
    #[serde(default = "default_maintenance_ms")]
    pub maintenance_interval_ms: u64,
    /// How long a committed key stays in the scheduler, in milliseconds.
    #[serde(default = "default_retain_ms")]
    pub retain_settled_ms: u64,
}

fn default_parallelism() -> usize {
    4
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    200
}
fn default_maintenance_ms() -> u64 {
    60_000
}
fn default_retain_ms() -> u64 {
    600_000
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            fetch_timeout_ms: default_timeout_ms(),
            commit_timeout_ms: default_timeout_ms(),
            max_retries: default_retries(),
            retry_delay_ms: default_retry_delay(),
            maintenance_interval_ms: default_maintenance_ms(),
            retain_settled_ms: default_retain_ms(),
        }
    }
}

/// Top-level gradebook configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradebookConfig {
    #[serde(default)]
    pub engine: EngineSection,
    /// `attendance_decimals` and the `[policies.<curriculum>]` tables.
    #[serde(flatten)]
    pub policy: PolicyOverrides,
}

impl GradebookConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse config")
    }

    /// Engine settings with the configured bounds.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            parallelism: self.engine.parallelism,
            fetch_timeout: Duration::from_millis(self.engine.fetch_timeout_ms),
            commit_timeout: Duration::from_millis(self.engine.commit_timeout_ms),
            max_retries: self.engine.max_retries,
            retry_delay: Duration::from_millis(self.engine.retry_delay_ms),
            maintenance_interval: Duration::from_millis(self.engine.maintenance_interval_ms),
            retain_settled: Duration::from_millis(self.engine.retain_settled_ms),
        }
    }

    /// Default policies with the configured overrides merged on top.
    pub fn policy_set(&self) -> Result<PolicySet> {
        let mut set = PolicySet::default();
        set.apply(&self.policy).context("invalid policy configuration")?;
        Ok(set)
    }

    /// Reject unusable settings and report suspicious policy.
    pub fn validate(&self) -> Result<Vec<PolicyWarning>> {
        anyhow::ensure!(self.engine.parallelism > 0, "engine.parallelism must be at least 1");
        anyhow::ensure!(
            self.engine.fetch_timeout_ms > 0 && self.engine.commit_timeout_ms > 0,
            "engine timeouts must be positive"
        );
        anyhow::ensure!(
            self.engine.maintenance_interval_ms > 0,
            "engine.maintenance_interval_ms must be positive"
        );
        let warnings = validate_policies(&self.policy_set()?);
        for w in &warnings {
            tracing::warn!(curriculum = %w.curriculum, "{}", w.message);
        }
        Ok(warnings)
    }

    /// Apply `GRADEBOOK_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {name}={value:?}: {e}"))
        }

        if let Some(v) = lookup("GRADEBOOK_PARALLELISM") {
            self.engine.parallelism = parse("GRADEBOOK_PARALLELISM", &v)?;
        }
        if let Some(v) = lookup("GRADEBOOK_MAX_RETRIES") {
            self.engine.max_retries = parse("GRADEBOOK_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("GRADEBOOK_FETCH_TIMEOUT_MS") {
            self.engine.fetch_timeout_ms = parse("GRADEBOOK_FETCH_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("GRADEBOOK_COMMIT_TIMEOUT_MS") {
            self.engine.commit_timeout_ms = parse("GRADEBOOK_COMMIT_TIMEOUT_MS", &v)?;
        }
        Ok(())
    }
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `gradebook.toml` in the current directory
/// 2. `~/.config/gradebook/config.toml`
///
/// Environment variable overrides: `GRADEBOOK_PARALLELISM`,
/// `GRADEBOOK_MAX_RETRIES`, `GRADEBOOK_FETCH_TIMEOUT_MS`,
/// `GRADEBOOK_COMMIT_TIMEOUT_MS`.
pub fn load_config() -> Result<GradebookConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<GradebookConfig> {
    let config_path = match path {
        Some(p) if p.exists() => Some(p.to_path_buf()),
        Some(p) => anyhow::bail!("config file not found: {}", p.display()),
        None => [Some(PathBuf::from("gradebook.toml")), dirs_path().map(|d| d.join("config.toml"))]
            .into_iter()
            .flatten()
            .find(|p| p.exists()),
    };

    let mut config = match config_path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            GradebookConfig::from_toml(&content)
                .with_context(|| format!("in {}", path.display()))?
        }
        None => GradebookConfig::default(),
    };

    config.apply_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("gradebook"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    use gradebook_core::model::{AssessmentKind, CurriculumType};

    const SAMPLE: &str = r#"
attendance_decimals = 1

[engine]
parallelism = 8
fetch_timeout_ms = 2500
max_retries = 5
maintenance_interval_ms = 5000

[policies.CBC]
decimals = 0

[policies."8-4-4"]
kind_weights = { MAIN_EXAM = 2.0 }
bands = [
    { min = 50.0, label = "PASS" },
    { min = 0.0, label = "FAIL" },
]
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn default_config() {
        let config = GradebookConfig::default();
        assert_eq!(config.engine.parallelism, 4);
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.engine_config().fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.policy_set().unwrap(), PolicySet::default());
    }

    #[test]
    fn load_explicit_file() {
        let file = write_config(SAMPLE);
        let config = load_config_from(Some(file.path())).unwrap();
        assert_eq!(config.engine.parallelism, 8);
        assert_eq!(config.engine.fetch_timeout_ms, 2500);
        assert_eq!(config.engine.commit_timeout_ms, 10_000);
        let engine = config.engine_config();
        assert_eq!(engine.maintenance_interval, Duration::from_secs(5));
        assert_eq!(engine.retain_settled, Duration::from_secs(600));
        assert_eq!(config.policy.attendance_decimals, Some(1));

        let set = config.policy_set().unwrap();
        assert_eq!(set.attendance.decimals, 1);
        assert_eq!(set.for_curriculum(CurriculumType::Cbc).rounding.decimals, 0);
        let kcse = set.for_curriculum(CurriculumType::EightFourFour);
        assert_eq!(kcse.grade_label(62.0).as_deref(), Some("PASS"));
        assert_eq!(kcse.kind_weights.get(&AssessmentKind::MainExam), Some(&2.0));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_from(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn bad_policy_is_rejected_with_context() {
        let file = write_config("[policies.IGCSE]\nkind_weights = { HOMEWORK = 1.0 }\n");
        let err = load_config_from(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("invalid policy configuration"));
    }

    #[test]
    fn unknown_curriculum_is_rejected() {
        let config = GradebookConfig::from_toml("[policies.MONTESSORI]\ndecimals = 1\n").unwrap();
        assert!(config.policy_set().is_err());
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("GRADEBOOK_PARALLELISM", "2"),
            ("GRADEBOOK_COMMIT_TIMEOUT_MS", " 750 "),
        ]
        .into_iter()
        .collect();
        let mut config = GradebookConfig::from_toml(SAMPLE).unwrap();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.engine.parallelism, 2);
        assert_eq!(config.engine.commit_timeout_ms, 750);
        assert_eq!(config.engine.max_retries, 5);
    }

    #[test]
    fn malformed_env_override_is_an_error() {
        let mut config = GradebookConfig::default();
        let err = config
            .apply_overrides(|name| (name == "GRADEBOOK_MAX_RETRIES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("GRADEBOOK_MAX_RETRIES"));
    }

    #[test]
    fn zero_parallelism_fails_validation() {
        let config = GradebookConfig::from_toml("[engine]\nparallelism = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn suspicious_bands_warn() {
        let config = GradebookConfig::from_toml(
            "[policies.CUSTOM]\nbands = [{ min = 40.0, label = \"P\" }]\n",
        )
        .unwrap();
        let warnings = config.validate().unwrap();
        assert!(warnings
            .iter()
            .any(|w| w.curriculum == CurriculumType::Custom && w.message.contains("lowest band")));
    }
}
