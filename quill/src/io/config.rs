//! Pipeline configuration stored under `.quill/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::RetryPolicy;
use crate::core::settings::StepSettings;
use crate::io::atomic::write_atomic;

/// Pipeline configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that work
/// with the stock `gemini` CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuillConfig {
    /// Global fallback for model, temperature and engine.
    pub defaults: StepSettings,

    /// Wall-clock limit for one backend call.
    pub backend_timeout_secs: u64,

    /// Bytes of backend stdout/stderr kept in memory per call.
    pub backend_output_limit_bytes: usize,

    /// Upper bound on prompt size; document contents are dropped to fit.
    pub prompt_budget_bytes: usize,

    pub retry: RetryPolicy,
    pub resolve: ResolveConfig,
    pub engines: BTreeMap<String, EngineConfig>,
    pub roles: BTreeMap<String, RoleConfig>,
}

/// Bounds for the fuzzy file search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResolveConfig {
    pub max_depth: usize,
    pub max_entries: usize,
    /// Directory names never descended into. Hidden directories are always skipped.
    pub skip_dirs: Vec<String>,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            max_depth: 6,
            max_entries: 5_000,
            skip_dirs: [
                "node_modules",
                "target",
                "vendor",
                "__pycache__",
                ".venv",
                "dist",
                "build",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

/// How to launch one backend engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Argv; `{model}` and `{temperature}` are expanded. The prompt goes on stdin.
    pub command: Vec<String>,
    /// Environment variable that receives the credential.
    pub credential_env: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoleConfig {
    pub instructions: String,
}

impl Default for QuillConfig {
    fn default() -> Self {
        let mut engines = BTreeMap::new();
        engines.insert(
            "gemini".to_string(),
            EngineConfig {
                command: vec!["gemini".to_string(), "--model".to_string(), "{model}".to_string()],
                credential_env: "GEMINI_API_KEY".to_string(),
            },
        );
        engines.insert(
            "codex".to_string(),
            EngineConfig {
                command: vec![
                    "codex".to_string(),
                    "exec".to_string(),
                    "--model".to_string(),
                    "{model}".to_string(),
                    "--skip-git-repo-check".to_string(),
                    "-".to_string(),
                ],
                credential_env: "OPENAI_API_KEY".to_string(),
            },
        );
        Self {
            defaults: StepSettings::default(),
            backend_timeout_secs: 10 * 60,
            backend_output_limit_bytes: 1_000_000,
            prompt_budget_bytes: 200_000,
            retry: RetryPolicy::default(),
            resolve: ResolveConfig::default(),
            engines,
            roles: BTreeMap::new(),
        }
    }
}

impl QuillConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend_timeout_secs == 0 {
            return Err(anyhow!("backend_timeout_secs must be > 0"));
        }
        if self.backend_output_limit_bytes == 0 {
            return Err(anyhow!("backend_output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if !(0.0..=2.0).contains(&self.defaults.temperature) {
            return Err(anyhow!("defaults.temperature must be within 0.0..=2.0"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(anyhow!("retry.multiplier must be >= 1.0"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(anyhow!("retry.initial_backoff_ms must not exceed retry.max_backoff_ms"));
        }
        for (name, engine) in &self.engines {
            if engine.command.is_empty() || engine.command[0].trim().is_empty() {
                return Err(anyhow!("engines.{name}.command must be a non-empty array"));
            }
            if engine.credential_env.trim().is_empty() {
                return Err(anyhow!("engines.{name}.credential_env must not be empty"));
            }
        }
        if !self.engines.contains_key(&self.defaults.engine) {
            return Err(anyhow!(
                "defaults.engine '{}' has no [engines.{}] entry",
                self.defaults.engine,
                self.defaults.engine
            ));
        }
        Ok(())
    }

    pub fn role_instructions(&self, role: &str) -> Option<&str> {
        self.roles
            .get(role)
            .map(|r| r.instructions.trim())
            .filter(|s| !s.is_empty())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `QuillConfig::default()`.
pub fn load_config(path: &Path) -> Result<QuillConfig> {
    if !path.exists() {
        let cfg = QuillConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: QuillConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &QuillConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
