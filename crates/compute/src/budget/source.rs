use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use tickgate_core::{BudgetConfig, Config, ControlConfig, CoreError};

#[derive(Debug, Error)]
pub enum ConfigSourceError {
    #[error("control source '{source_name}' unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },

    #[error("control source returned invalid configuration: {0}")]
    Invalid(#[from] CoreError),
}

/// An external source of budget ceilings and breaker thresholds.
#[async_trait]
pub trait ControlSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch and validate one snapshot.
    async fn fetch(&self) -> Result<ControlConfig, ConfigSourceError>;
}

/// Reads a TOML document with `[budget]` and `[breakers.<dependency>]` tables.
#[derive(Debug, Clone)]
pub struct TomlFileSource {
    path: PathBuf,
    label: String,
}

impl TomlFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = format!("file:{}", path.display());
        Self { path, label }
    }
}

#[async_trait]
impl ControlSource for TomlFileSource {
    fn name(&self) -> &str {
        &self.label
    }

    async fn fetch(&self) -> Result<ControlConfig, ConfigSourceError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ConfigSourceError::Unavailable {
                source_name: self.label.clone(),
                reason: e.to_string(),
            })?;
        Ok(ControlConfig::from_toml(&content)?)
    }
}

/// Budget from profiled `BUDGET_*` environment variables. Carries no
/// per-dependency breaker overrides.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    profile: String,
}

impl EnvSource {
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into().to_uppercase(),
        }
    }
}

#[async_trait]
impl ControlSource for EnvSource {
    fn name(&self) -> &str {
        "env"
    }

    async fn fetch(&self) -> Result<ControlConfig, ConfigSourceError> {
        let config = ControlConfig {
            budget: BudgetConfig::from_env_profiled(&self.profile),
            breakers: Default::default(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// The source named by `config.control`: the TOML file when one is set,
/// otherwise the profiled environment.
pub fn source_for(config: &Config) -> Arc<dyn ControlSource> {
    match &config.control.file {
        Some(path) => Arc::new(TomlFileSource::new(path.clone())),
        None => Arc::new(EnvSource::new(config.profile.clone())),
    }
}
