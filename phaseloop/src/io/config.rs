//! Loop configuration stored under `.phaseloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::CycleBudget;
use crate::core::session::LoopSettings;
use crate::core::types::RunMode;
use crate::io::atomic::write_atomic;

pub const DEFAULT_PLAN_FILE: &str = "@fix_plan.md";

/// Loop configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
/// Command-line flags override values loaded from here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Plan file, relative to the project root.
    pub plan_file: PathBuf,
    pub min_cycles: u32,
    pub max_cycles: u32,
    pub mode: RunMode,
    pub max_phase_attempts: u32,
    pub max_task_attempts: u32,
    /// Pause between attempts of a failed phase, multiplied by the attempt number.
    pub retry_delay_ms: u64,
    /// How long an idle worker waits for new tasks before re-reading the plan.
    pub idle_poll_ms: u64,
    pub generation: GenerationConfig,
    pub test: TestConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GenerationBackend {
    #[default]
    Ollama,
    /// External command: prompt on stdin, generated text on stdout.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GenerationConfig {
    pub backend: GenerationBackend,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Attempts per request for retryable failures (connection, server).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub backoff_ms: u64,
    /// Double the delay on every further retry.
    pub exponential_backoff: bool,
    /// argv for the command backend, e.g. `["llm", "-m", "local"]`.
    pub command: Vec<String>,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestConfig {
    /// Shell command run from the project root. Empty means the Test phase
    /// asks the model for a review instead.
    pub command: String,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            backend: GenerationBackend::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            timeout_secs: 300,
            max_retries: 3,
            backoff_ms: 1000,
            exponential_backoff: true,
            command: Vec::new(),
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout_secs: 600,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            plan_file: PathBuf::from(DEFAULT_PLAN_FILE),
            min_cycles: 4,
            max_cycles: 40,
            mode: RunMode::NonStop,
            max_phase_attempts: 3,
            max_task_attempts: 3,
            retry_delay_ms: 2000,
            idle_poll_ms: 2000,
            generation: GenerationConfig::default(),
            test: TestConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.plan_file.as_os_str().is_empty() {
            return Err(anyhow!("plan_file must not be empty"));
        }
        self.budget()?;
        if self.max_phase_attempts == 0 {
            return Err(anyhow!("max_phase_attempts must be > 0"));
        }
        if self.max_task_attempts == 0 {
            return Err(anyhow!("max_task_attempts must be > 0"));
        }
        if self.idle_poll_ms == 0 {
            return Err(anyhow!("idle_poll_ms must be > 0"));
        }
        let generation = &self.generation;
        if generation.timeout_secs == 0 {
            return Err(anyhow!("generation.timeout_secs must be > 0"));
        }
        if generation.max_retries == 0 {
            return Err(anyhow!("generation.max_retries must be > 0"));
        }
        if generation.output_limit_bytes == 0 {
            return Err(anyhow!("generation.output_limit_bytes must be > 0"));
        }
        match generation.backend {
            GenerationBackend::Ollama if generation.base_url.trim().is_empty() => {
                return Err(anyhow!("generation.base_url is required for the ollama backend"));
            }
            GenerationBackend::Command
                if generation
                    .command
                    .first()
                    .is_none_or(|program| program.trim().is_empty()) =>
            {
                return Err(anyhow!(
                    "generation.command must be a non-empty array for the command backend"
                ));
            }
            _ => {}
        }
        if self.test.timeout_secs == 0 {
            return Err(anyhow!("test.timeout_secs must be > 0"));
        }
        if self.test.output_limit_bytes == 0 {
            return Err(anyhow!("test.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn budget(&self) -> Result<CycleBudget> {
        CycleBudget::new(self.min_cycles, self.max_cycles)
    }

    pub fn settings(&self) -> Result<LoopSettings> {
        Ok(LoopSettings {
            budget: self.budget()?,
            mode: self.mode,
            max_phase_attempts: self.max_phase_attempts,
            max_task_attempts: self.max_task_attempts,
        })
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        return Ok(LoopConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
