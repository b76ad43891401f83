use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Root application configuration, loaded from `~/.config/citegraph/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub graph: GraphConfig,
    pub eutils: EutilsConfig,
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub database_path: String,
}

/// NCBI E-utilities access. Registered users (API key set) may issue
/// 10 requests/second, everyone else 3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EutilsConfig {
    pub base_url: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub min_interval_ms: u64,
    pub max_retries: u32,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub channel_capacity: usize,
    pub expand_citations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub initial_delay_ms: u64,
    pub interval_ms: u64,
    pub repeat_count: u32,
}

// ─── Defaults ──────────────────────────────────────────────

impl Default for GraphConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("citegraph");

        Self {
            database_path: data_dir.join("graph.db").to_string_lossy().to_string(),
        }
    }
}

impl Default for EutilsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".to_string(),
            tool: "citegraph".to_string(),
            email: None,
            api_key: None,
            min_interval_ms: 100,
            max_retries: 3,
            batch_size: 20,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            expand_citations: false,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            interval_ms: 60_000,
            repeat_count: 2,
        }
    }
}

// ─── Load / Save ───────────────────────────────────────────

impl AppConfig {
    /// Standard config file path: `~/.config/citegraph/config.toml`
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("CITEGRAPH_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("citegraph")
            .join("config.toml")
    }

    /// Load config from disk, falling back to defaults if file doesn't exist.
    /// NCBI credentials from the environment win over the file.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.graph.database_path.trim().is_empty() {
            return Err(GraphError::ConfigError("graph.database_path is empty".into()));
        }
        if self.eutils.base_url.trim().is_empty() {
            return Err(GraphError::ConfigError("eutils.base_url is empty".into()));
        }
        if self.eutils.batch_size == 0 {
            return Err(GraphError::ConfigError("eutils.batch_size must be at least 1".into()));
        }
        if self.scheduler.repeat_count == 0 {
            return Err(GraphError::ConfigError("scheduler.repeat_count must be at least 1".into()));
        }
        Ok(())
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(email) = non_blank_env("NCBI_EMAIL") {
            self.eutils.email = Some(email);
        }
        if let Some(key) = non_blank_env("NCBI_API_KEY") {
            self.eutils.api_key = Some(key);
        }
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.graph.database_path)
    }
}

fn non_blank_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.eutils.min_interval_ms, 100);
        assert_eq!(cfg.scheduler.repeat_count, 2);
        assert_eq!(cfg.scheduler.initial_delay_ms, 5_000);
        assert!(cfg.database_path().to_string_lossy().ends_with("graph.db"));
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut cfg = AppConfig::default();
        cfg.eutils.email = Some("curator@example.org".to_string());
        cfg.eutils.batch_size = 5;
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.eutils.email.as_deref(), Some("curator@example.org"));
        assert_eq!(loaded.eutils.batch_size, 5);
        assert_eq!(loaded.scheduler.interval_ms, cfg.scheduler.interval_ms);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[scheduler]\ninterval_ms = 1000\n").unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.interval_ms, 1000);
        assert_eq!(loaded.scheduler.repeat_count, 2);
        assert_eq!(loaded.eutils.max_retries, 3);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[eutils]\nbatch_size = 0\n").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, GraphError::ConfigError(msg) if msg.contains("batch_size")));
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let cfg = AppConfig::load_from(Path::new("/tmp/nonexistent_citegraph_config.toml")).unwrap();
        assert_eq!(cfg.pipeline.channel_capacity, 64);
    }
}
