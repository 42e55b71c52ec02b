use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "reportcardd.toml";

pub const DEFAULT_GRADING_CEILING: f64 = 20.0;
pub const DEFAULT_GENERATION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Workspace-level engine settings, read from `reportcardd.toml` when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Grading-scale ceiling used when a school has no `grading_scale.max` setting.
    pub default_grading_ceiling: f64,
    /// Wall-clock bound for one generation transaction.
    pub generation_timeout_ms: u64,
    /// How long a writer waits on a locked database before failing with `db_busy`.
    pub busy_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_grading_ceiling: DEFAULT_GRADING_CEILING,
            generation_timeout_ms: DEFAULT_GENERATION_TIMEOUT_MS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    pub fn load(workspace: &Path) -> anyhow::Result<Self> {
        let path = workspace.join(CONFIG_FILE_NAME);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let cfg: EngineConfig = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(self.default_grading_ceiling.is_finite() && self.default_grading_ceiling > 0.0) {
            anyhow::bail!("default_grading_ceiling must be a positive number");
        }
        if self.generation_timeout_ms == 0 {
            anyhow::bail!("generation_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}
