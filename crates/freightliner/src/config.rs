//! Configuration file support (`.freightliner.toml`)
//!
//! This module provides support for project-specific configuration via a
//! `.freightliner.toml` file, merged with CLI-flag overrides the way the
//! CLI always wins for anything explicitly passed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::retry::{PerErrorConfig, RetryPolicy, RetryStrategyConfig, RetryStrategyType};
use crate::types::{
    deserialize_duration, serialize_duration, AuthMode, FilterSet, Registry, TreeJobSpec,
};

/// One registry endpoint's connection settings as they appear in the config
/// file, before being turned into a [`Registry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub connect_timeout: Duration,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    // Table-valued fields (an internally-tagged enum still serializes as a
    // TOML table) must come last so they follow every scalar key in this
    // table, as TOML requires.
    #[serde(default)]
    pub auth: AuthMode,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_attempts() -> u32 {
    5
}

impl From<RegistryConfig> for Registry {
    fn from(c: RegistryConfig) -> Self {
        Registry {
            id: c.id,
            endpoint: c.endpoint,
            auth: c.auth,
            insecure_skip_verify: c.insecure_skip_verify,
            connect_timeout: c.connect_timeout,
            retry_attempts: c.retry_attempts,
        }
    }
}

/// Nested filter configuration, mirrored onto [`FilterSet`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub exclude_repositories: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
    #[serde(default)]
    pub include_tags: Vec<String>,
}

impl From<FilterConfig> for FilterSet {
    fn from(c: FilterConfig) -> Self {
        FilterSet {
            exclude_repositories: c.exclude_repositories,
            exclude_tags: c.exclude_tags,
            include_tags: c.include_tags,
        }
    }
}

/// Nested checkpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_enable_checkpointing")]
    pub enable_checkpointing: bool,
    #[serde(default = "default_checkpoint_directory")]
    pub checkpoint_directory: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enable_checkpointing: default_enable_checkpointing(),
            checkpoint_directory: default_checkpoint_directory(),
        }
    }
}

fn default_enable_checkpointing() -> bool {
    true
}

fn default_checkpoint_directory() -> PathBuf {
    PathBuf::from(".freightliner/checkpoints")
}

/// Nested retry configuration: a named policy (or `custom`, which falls
/// back to `strategy`) plus per-error-class overrides, both consumed only
/// by [`crate::registry::HttpRegistryClient`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetryConfig {
    #[serde(default)]
    pub policy: RetryPolicy,
    #[serde(default)]
    pub strategy: RetryStrategyConfig,
    #[serde(default)]
    pub per_error: PerErrorConfig,
}

impl RetryConfig {
    /// The strategy the registry client should actually retry with: a named
    /// policy's fixed values, or `strategy` verbatim for `Custom` (the
    /// default, preserving the pre-policy config-file behavior).
    pub fn effective_strategy(&self) -> RetryStrategyConfig {
        match self.policy {
            RetryPolicy::Custom => self.strategy.clone(),
            other => other.to_config(),
        }
    }
}

/// Top-level configuration loaded from `.freightliner.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreightlinerConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_max_concurrent_blobs")]
    pub max_concurrent_blobs: usize,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub source_prefix: String,
    #[serde(default)]
    pub dest_prefix: String,
    #[serde(default)]
    pub force_overwrite: bool,
    #[serde(default)]
    pub resume_from: Option<String>,
    #[serde(default)]
    pub skip_completed: bool,
    // Table-valued fields must come last within this table (TOML requires
    // every scalar key to precede every sub-table key).
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub source: Option<RegistryConfig>,
    #[serde(default)]
    pub dest: Option<RegistryConfig>,
}

fn default_worker_count() -> usize {
    4
}

fn default_max_concurrent_blobs() -> usize {
    4
}

impl Default for FreightlinerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_concurrent_blobs: default_max_concurrent_blobs(),
            filters: FilterConfig::default(),
            checkpoint: CheckpointConfig::default(),
            dry_run: false,
            retry: RetryConfig::default(),
            source: None,
            dest: None,
            source_prefix: String::new(),
            dest_prefix: String::new(),
            force_overwrite: false,
            resume_from: None,
            skip_completed: false,
        }
    }
}

/// CLI overrides for merging with config-file values.
///
/// `Option` fields mean "user did not pass this flag" when `None`. `bool`
/// fields mean "user explicitly enabled this" when `true`.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub source: Option<RegistryConfig>,
    pub dest: Option<RegistryConfig>,
    pub source_prefix: Option<String>,
    pub dest_prefix: Option<String>,
    pub force_overwrite: bool,
    pub resume_from: Option<String>,
    pub skip_completed: bool,
    pub dry_run: bool,
    pub worker_count: Option<usize>,
    pub max_concurrent_blobs: Option<usize>,
    pub exclude_repositories: Option<Vec<String>>,
    pub exclude_tags: Option<Vec<String>>,
    pub include_tags: Option<Vec<String>>,
    pub checkpoint_directory: Option<PathBuf>,
    pub enable_checkpointing: bool,
    pub disable_checkpointing: bool,
}

impl FreightlinerConfig {
    /// Load configuration by searching for `.freightliner.toml` under
    /// `workspace_root`. Returns `Ok(None)` if no config file exists.
    pub fn load_from_workspace(workspace_root: &Path) -> Result<Option<Self>> {
        let config_path = workspace_root.join(".freightliner.toml");
        if !config_path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&config_path).map(Some)
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: FreightlinerConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Rejected-at-startup failures (an invalid
    /// helper/credential configuration is the same principle) surface here
    /// rather than partway through a run.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("worker-count must be greater than 0");
        }
        if self.max_concurrent_blobs == 0 {
            bail!("max-concurrent-blobs must be greater than 0");
        }
        if self.retry.strategy.jitter < 0.0 || self.retry.strategy.jitter > 1.0 {
            bail!("retry.strategy.jitter must be between 0.0 and 1.0");
        }
        if self.retry.strategy.max_delay < self.retry.strategy.base_delay
            && !self.retry.strategy.max_delay.is_zero()
        {
            bail!("retry.strategy.max_delay must be greater than or equal to base_delay");
        }
        for (label, registry) in [("source", &self.source), ("dest", &self.dest)] {
            if let Some(registry) = registry {
                if registry.id.is_empty() {
                    bail!("{label}.id cannot be empty");
                }
                if registry.endpoint.is_empty() {
                    bail!("{label}.endpoint cannot be empty");
                }
                if let AuthMode::Provider { name } = &registry.auth {
                    if !name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                    {
                        bail!("{label}.auth provider name {name:?} contains invalid characters");
                    }
                }
            }
        }
        Ok(())
    }

    /// Build a [`TreeJobSpec`] by merging CLI overrides with config-file
    /// values. CLI values win for anything explicitly passed; `source` and
    /// `dest` registries must be supplied by one or the other.
    pub fn build_tree_job_spec(&self, cli: CliOverrides) -> Result<TreeJobSpec> {
        let source = cli
            .source
            .or_else(|| self.source.clone())
            .context("source registry must be configured (.freightliner.toml [source] or --source-* flags)")?;
        let dest = cli
            .dest
            .or_else(|| self.dest.clone())
            .context("dest registry must be configured (.freightliner.toml [dest] or --dest-* flags)")?;

        let mut filters = self.filters.clone();
        if let Some(exclude_repositories) = cli.exclude_repositories {
            filters.exclude_repositories = exclude_repositories;
        }
        if let Some(exclude_tags) = cli.exclude_tags {
            filters.exclude_tags = exclude_tags;
        }
        if let Some(include_tags) = cli.include_tags {
            filters.include_tags = include_tags;
        }

        Ok(TreeJobSpec {
            source_registry: source.into(),
            dest_registry: dest.into(),
            source_prefix: cli.source_prefix.unwrap_or_else(|| self.source_prefix.clone()),
            dest_prefix: cli.dest_prefix.unwrap_or_else(|| self.dest_prefix.clone()),
            force_overwrite: cli.force_overwrite || self.force_overwrite,
            resume_from: cli.resume_from.or_else(|| self.resume_from.clone()),
            skip_completed: cli.skip_completed || self.skip_completed,
            dry_run: cli.dry_run || self.dry_run,
            worker_count: cli.worker_count.unwrap_or(self.worker_count),
            max_concurrent_blobs: cli.max_concurrent_blobs.unwrap_or(self.max_concurrent_blobs),
            filters: filters.into(),
        })
    }

    /// Resolve the effective checkpoint directory and whether checkpointing
    /// is enabled at all, applying CLI overrides.
    pub fn checkpoint_settings(&self, cli: &CliOverrides) -> (bool, PathBuf) {
        let enabled = if cli.disable_checkpointing {
            false
        } else {
            cli.enable_checkpointing || self.checkpoint.enable_checkpointing
        };
        let dir = cli
            .checkpoint_directory
            .clone()
            .unwrap_or_else(|| self.checkpoint.checkpoint_directory.clone());
        (enabled, dir)
    }

    /// Render a commented template suitable for `freightliner init`-style
    /// scaffolding or documentation.
    pub fn default_toml_template() -> String {
        r#"# Freightliner configuration. Every field has a default; uncomment and
# edit the ones you need.

worker-count = 4
max-concurrent-blobs = 4
dry-run = false

[filters]
exclude-repositories = []
exclude-tags = []
include-tags = []

[checkpoint]
enable-checkpointing = true
checkpoint-directory = ".freightliner/checkpoints"

[retry]
policy = "custom"

[retry.strategy]
strategy = "exponential"
max-attempts = 6
base-delay = "2s"
max-delay = "120s"
jitter = 0.5

# [source]
# id = "source-registry"
# endpoint = "https://registry.example.com"
# [source.auth]
# mode = "anonymous"

# [dest]
# id = "dest-registry"
# endpoint = "https://mirror.example.com"
# [dest.auth]
# mode = "anonymous"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_config(id: &str) -> RegistryConfig {
        RegistryConfig {
            id: id.to_string(),
            endpoint: format!("https://{id}.example.com"),
            auth: AuthMode::Anonymous,
            insecure_skip_verify: false,
            connect_timeout: Duration::from_secs(10),
            retry_attempts: 5,
        }
    }

    #[test]
    fn defaults_are_sane() {
        let config = FreightlinerConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.max_concurrent_blobs, 4);
        assert!(config.checkpoint.enable_checkpointing);
        config.validate().unwrap();
    }

    #[test]
    fn roundtrips_every_field_through_toml() {
        let mut config = FreightlinerConfig {
            source: Some(registry_config("src")),
            dest: Some(registry_config("dst")),
            ..FreightlinerConfig::default()
        };
        config.filters.exclude_repositories = vec!["*-test".to_string()];
        config.source_prefix = "team-a/".to_string();
        config.dest_prefix = "mirror/".to_string();

        let toml_text = toml::to_string(&config).unwrap();
        let parsed: FreightlinerConfig = toml::from_str(&toml_text).unwrap();

        assert_eq!(parsed.source.unwrap().id, "src");
        assert_eq!(parsed.dest.unwrap().id, "dst");
        assert_eq!(parsed.filters.exclude_repositories, vec!["*-test".to_string()]);
        assert_eq!(parsed.source_prefix, "team-a/");
    }

    #[test]
    fn rejects_zero_worker_count() {
        let config = FreightlinerConfig {
            worker_count: 0,
            ..FreightlinerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_jitter() {
        let mut config = FreightlinerConfig::default();
        config.retry.strategy.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_provider_auth_name() {
        let mut source = registry_config("src");
        source.auth = AuthMode::Provider {
            name: "not valid!".to_string(),
        };
        let config = FreightlinerConfig {
            source: Some(source),
            ..FreightlinerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn cli_overrides_win_over_config_file() {
        let config = FreightlinerConfig {
            source: Some(registry_config("src")),
            dest: Some(registry_config("dst")),
            source_prefix: "from-file/".to_string(),
            ..FreightlinerConfig::default()
        };

        let cli = CliOverrides {
            source_prefix: Some("from-cli/".to_string()),
            worker_count: Some(8),
            ..CliOverrides::default()
        };

        let spec = config.build_tree_job_spec(cli).unwrap();
        assert_eq!(spec.source_prefix, "from-cli/");
        assert_eq!(spec.worker_count, 8);
    }

    #[test]
    fn missing_source_and_dest_is_an_error() {
        let config = FreightlinerConfig::default();
        let err = config.build_tree_job_spec(CliOverrides::default()).unwrap_err();
        assert!(format!("{err:#}").contains("source registry"));
    }

    #[test]
    fn checkpoint_settings_cli_disable_wins() {
        let config = FreightlinerConfig::default();
        let cli = CliOverrides {
            disable_checkpointing: true,
            ..CliOverrides::default()
        };
        let (enabled, _) = config.checkpoint_settings(&cli);
        assert!(!enabled);
    }

    #[test]
    fn load_from_workspace_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let result = FreightlinerConfig::load_from_workspace(dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_from_file_parses_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".freightliner.toml");
        std::fs::write(&path, FreightlinerConfig::default_toml_template()).unwrap();
        let config = FreightlinerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.worker_count, 4);
    }
}
