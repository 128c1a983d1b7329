//! Configuração do cadenza carregada a partir de `cadenza.toml`.
//!
//! A struct [`CadenzaConfig`] contém todos os parâmetros ajustáveis do motor.
//! Campos ausentes no arquivo usam defaults sensíveis; sem arquivo, vale
//! [`CadenzaConfig::default`]. Variáveis de ambiente têm precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default location, relative to the working directory.
pub const CONFIG_FILE: &str = "cadenza.toml";

/// Top-level configuration loaded from `cadenza.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CadenzaConfig {
    /// Upper bound on external tool calls in flight across all jobs.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,

    /// Optional TOML tool catalog replacing the built-in one.
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,

    /// `tracing` filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    #[serde(default)]
    pub quality: QualityConfig,
}

/// Retry backoff between attempts on the same tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    /// Base delay; attempt `k` (0-based) waits `base_delay_ms * 2^k`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Uniform jitter added on top, in `[0, max_jitter_ms)`.
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,

    /// Raise the exponential delay to the failure class's minimum retry delay.
    #[serde(default = "default_true")]
    pub class_delay_floor: bool,
}

/// Per-tool circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualityConfig {
    /// Half-width of the uniform noise added to step scores.
    #[serde(default = "default_perturbation")]
    pub perturbation: f64,

    /// Flat bonus on the final score when every step succeeded.
    #[serde(default = "default_completion_bonus")]
    pub completion_bonus: f64,
}

fn default_max_concurrent_calls() -> usize {
    16
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_jitter_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_perturbation() -> f64 {
    0.05
}

fn default_completion_bonus() -> f64 {
    0.1
}

impl Default for CadenzaConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: default_max_concurrent_calls(),
            catalog_path: None,
            log_filter: default_log_filter(),
            backoff: BackoffConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            quality: QualityConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            class_delay_floor: true,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            perturbation: default_perturbation(),
            completion_bonus: default_completion_bonus(),
        }
    }
}

impl BackoffConfig {
    /// Backoff with no waiting at all; handy for tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_jitter_ms: 0,
            class_delay_floor: false,
        }
    }

    /// Exponential part of the delay before retry `attempt` (0-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32, class_floor: Duration) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let delay = Duration::from_millis(exp);
        if self.class_delay_floor {
            delay.max(class_floor)
        } else {
            delay
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl CadenzaConfig {
    /// Loads `cadenza.toml` from the working directory, or defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Loads the given file, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<CadenzaConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup("CADENZA_MAX_CONCURRENT_CALLS").filter(|v| !v.is_empty()) {
            self.max_concurrent_calls = raw
                .parse()
                .with_context(|| format!("CADENZA_MAX_CONCURRENT_CALLS is not a number: {raw}"))?;
        }
        if let Some(path) = lookup("CADENZA_CATALOG").filter(|v| !v.is_empty()) {
            self.catalog_path = Some(PathBuf::from(path));
        }
        if self.max_concurrent_calls == 0 {
            anyhow::bail!("max_concurrent_calls must be at least 1");
        }
        Ok(())
    }
}
