//! Static registry of external tools: formats, cost model, reliability and limits.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CadenzaError;

/// How a tool bills one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostModel {
    PerRequest { rate: f64 },
    PerSecond { rate: f64 },
    PerMinute { rate: f64 },
    PerPrediction { rate: f64 },
}

impl CostModel {
    /// Cost of one call producing `duration_secs` of media.
    pub fn estimate(&self, duration_secs: f64) -> f64 {
        match *self {
            CostModel::PerSecond { rate } => rate * duration_secs,
            CostModel::PerMinute { rate } => rate * duration_secs / 60.0,
            CostModel::PerRequest { rate } | CostModel::PerPrediction { rate } => rate,
        }
    }

    pub fn rate(&self) -> f64 {
        match *self {
            CostModel::PerRequest { rate }
            | CostModel::PerSecond { rate }
            | CostModel::PerMinute { rate }
            | CostModel::PerPrediction { rate } => rate,
        }
    }
}

/// One named sliding-window limit, e.g. 60 requests per minute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimit {
    pub name: String,
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimit {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            name: "per_minute".to_string(),
            max_requests,
            window_secs: 60,
        }
    }

    pub fn per_hour(max_requests: u32) -> Self {
        Self {
            name: "per_hour".to_string(),
            max_requests,
            window_secs: 3600,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub input_formats: Vec<String>,
    pub output_formats: Vec<String>,
    /// Longest media, in seconds, the tool accepts.
    pub max_duration_secs: f64,
    pub cost: CostModel,
    /// Relative price used for ranking; lower is cheaper.
    #[serde(default = "default_factor")]
    pub cost_factor: f64,
    /// Processing seconds per second of requested media.
    #[serde(default = "default_factor")]
    pub time_factor: f64,
    /// Static prior in `[0, 1]`.
    pub reliability: f64,
    #[serde(default = "default_quality_factor")]
    pub quality_factor: f64,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Total attempts per invocation, first call included.
    #[serde(default = "default_max_attempts", alias = "retry_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub rate_limits: Vec<RateLimit>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_factor() -> f64 {
    1.0
}

fn default_quality_factor() -> f64 {
    0.75
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    2
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            capabilities: Vec::new(),
            input_formats: Vec::new(),
            output_formats: Vec::new(),
            max_duration_secs: 300.0,
            cost: CostModel::PerRequest { rate: 0.0 },
            cost_factor: default_factor(),
            time_factor: default_factor(),
            reliability: 0.8,
            quality_factor: default_quality_factor(),
            fallbacks: Vec::new(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            rate_limits: Vec::new(),
            endpoint: None,
            api_key_env: None,
        }
    }

    pub fn formats(mut self, inputs: &[&str], outputs: &[&str]) -> Self {
        self.input_formats = inputs.iter().map(|s| s.to_string()).collect();
        self.output_formats = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn capabilities(mut self, caps: &[&str]) -> Self {
        self.capabilities = caps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn max_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    pub fn cost(mut self, model: CostModel, cost_factor: f64) -> Self {
        self.cost = model;
        self.cost_factor = cost_factor;
        self
    }

    pub fn reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn quality(mut self, quality_factor: f64) -> Self {
        self.quality_factor = quality_factor;
        self
    }

    pub fn time_factor(mut self, time_factor: f64) -> Self {
        self.time_factor = time_factor;
        self
    }

    pub fn fallbacks(mut self, names: &[&str]) -> Self {
        self.fallbacks = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn per_minute(mut self, max_requests: u32) -> Self {
        self.rate_limits.push(RateLimit::per_minute(max_requests));
        self
    }

    pub fn endpoint(mut self, url: &str, api_key_env: &str) -> Self {
        self.endpoint = Some(url.to_string());
        self.api_key_env = Some(api_key_env.to_string());
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn accepts(&self, input_format: &str, output_format: &str) -> bool {
        self.input_formats.iter().any(|f| f == input_format)
            && self.output_formats.iter().any(|f| f == output_format)
    }

    pub fn estimate_cost(&self, duration_secs: f64) -> f64 {
        self.cost.estimate(duration_secs)
    }

    /// Base 10s of overhead plus media length scaled by the tool's speed.
    pub fn estimate_time_secs(&self, duration_secs: f64) -> f64 {
        10.0 + duration_secs * self.time_factor
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    tools: Vec<ToolDescriptor>,
}

/// Ordered, read-only set of tools. Declaration order breaks ranking ties.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<ToolDescriptor>) -> Result<Self, CadenzaError> {
        let catalog = Self { tools };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parses a TOML document of `[[tools]]` tables.
    pub fn from_toml_str(contents: &str) -> Result<Self, CadenzaError> {
        let file: CatalogFile = toml::from_str(contents)?;
        Self::new(file.tools)
    }

    pub fn load(path: &Path) -> Result<Self, CadenzaError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Declaration position, used as the deterministic tie-breaker.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.tools.iter().position(|t| t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Cheapest cost factor in the catalog; 1.0 when empty.
    pub fn min_cost_factor(&self) -> f64 {
        self.tools
            .iter()
            .map(|t| t.cost_factor)
            .min_by(f64::total_cmp)
            .unwrap_or(1.0)
    }

    fn validate(&self) -> Result<(), CadenzaError> {
        let mut names = HashSet::new();
        for tool in &self.tools {
            let bad = |msg: &str| CadenzaError::Config(format!("tool '{}': {msg}", tool.name));

            if tool.name.trim().is_empty() {
                return Err(CadenzaError::Config("tool with empty name".into()));
            }
            if !names.insert(tool.name.as_str()) {
                return Err(bad("declared twice"));
            }
            if !(0.0..=1.0).contains(&tool.reliability) {
                return Err(bad("reliability must be within [0, 1]"));
            }
            if tool.cost_factor.is_nan() || tool.cost_factor <= 0.0 {
                return Err(bad("cost_factor must be positive"));
            }
            if tool.cost.rate() < 0.0 || tool.time_factor < 0.0 {
                return Err(bad("rates must not be negative"));
            }
            if tool.max_attempts == 0 {
                return Err(bad("max_attempts must be at least 1"));
            }
            if tool.input_formats.is_empty() || tool.output_formats.is_empty() {
                return Err(bad("input and output formats are required"));
            }
            if let Some(limit) = tool.rate_limits.iter().find(|l| l.window_secs == 0) {
                return Err(bad(&format!("rate limit '{}' has an empty window", limit.name)));
            }
        }

        for tool in &self.tools {
            if let Some(missing) = tool.fallbacks.iter().find(|f| !names.contains(f.as_str())) {
                return Err(CadenzaError::Config(format!(
                    "tool '{}' falls back to unknown tool '{missing}'",
                    tool.name
                )));
            }
        }
        Ok(())
    }

    /// The thirteen production services the engine ships with.
    pub fn builtin() -> Self {
        const AUDIO_IN: &[&str] = &["audio/wav", "audio/mp3"];
        const WAV: &[&str] = &["audio/wav"];

        let tools = vec![
            ToolDescriptor::new("musicgen", "generation")
                .formats(&["text", "text+melody"], WAV)
                .capabilities(&["text_to_music", "melody_conditioning"])
                .max_duration(300.0)
                .cost(CostModel::PerRequest { rate: 0.001 }, 1.0)
                .reliability(0.9)
                .quality(0.85)
                .fallbacks(&["beethoven_ai", "mureka_ai"])
                .timeout(300)
                .attempts(3)
                .per_minute(60)
                .endpoint(
                    "https://api-inference.huggingface.co/models/facebook/musicgen-medium",
                    "HUGGINGFACE_API_KEY",
                ),
            ToolDescriptor::new("stable_audio", "generation")
                .formats(&["text"], WAV)
                .capabilities(&["text_to_audio", "high_fidelity"])
                .max_duration(90.0)
                .cost(CostModel::PerSecond { rate: 0.01 }, 2.0)
                .reliability(0.85)
                .quality(0.9)
                .time_factor(2.0)
                .fallbacks(&["musicgen"])
                .timeout(600)
                .attempts(2)
                .per_minute(30)
                .endpoint(
                    "https://api.stability.ai/v2beta/stable-audio/generate/music",
                    "STABILITY_API_KEY",
                ),
            ToolDescriptor::new("google_musiclm", "generation")
                .formats(&["text"], WAV)
                .capabilities(&["text_to_music", "semantic_understanding"])
                .max_duration(300.0)
                .cost(CostModel::PerRequest { rate: 0.002 }, 1.5)
                .reliability(0.8)
                .quality(0.8)
                .time_factor(1.5)
                .fallbacks(&["musicgen", "stable_audio"])
                .timeout(300)
                .attempts(3)
                .per_minute(100)
                .endpoint(
                    "https://generativelanguage.googleapis.com/v1beta/models/musiclm:generateContent",
                    "GOOGLE_AI_API_KEY",
                ),
            ToolDescriptor::new("beethoven_ai", "generation")
                .formats(&["text"], WAV)
                .capabilities(&["classical_composition", "orchestration"])
                .max_duration(480.0)
                .cost(CostModel::PerRequest { rate: 0.08 }, 3.0)
                .reliability(0.75)
                .quality(0.83)
                .time_factor(2.0)
                .fallbacks(&["musicgen"])
                .timeout(600)
                .attempts(2)
                .per_minute(15)
                .endpoint("https://api.beethoven.ai/v1/compose", "BEETHOVEN_API_KEY"),
            ToolDescriptor::new("mureka_ai", "generation")
                .formats(&["text"], WAV)
                .capabilities(&["creative_generation", "style_mixing"])
                .max_duration(240.0)
                .cost(CostModel::PerRequest { rate: 0.02 }, 2.5)
                .reliability(0.7)
                .quality(0.81)
                .time_factor(1.5)
                .fallbacks(&["musicgen", "beethoven_ai"])
                .timeout(300)
                .attempts(2)
                .per_minute(30)
                .endpoint("https://api.mureka.ai/v1/generate", "MUREKA_API_KEY"),
            ToolDescriptor::new("audiocraft", "enhancement")
                .formats(AUDIO_IN, WAV)
                .capabilities(&["audio_enhancement", "compression", "effects"])
                .max_duration(600.0)
                .cost(CostModel::PerPrediction { rate: 0.03 }, 1.5)
                .reliability(0.85)
                .quality(0.88)
                .fallbacks(&["aces_audio"])
                .timeout(900)
                .attempts(2)
                .per_minute(20)
                .endpoint("https://api.replicate.com/v1/predictions", "REPLICATE_API_TOKEN"),
            ToolDescriptor::new("jukebox", "style_transfer")
                .formats(AUDIO_IN, WAV)
                .capabilities(&["style_transfer", "genre_conversion"])
                .max_duration(240.0)
                .cost(CostModel::PerPrediction { rate: 0.15 }, 3.0)
                .reliability(0.7)
                .quality(0.82)
                .timeout(1800)
                .attempts(1)
                .per_minute(5)
                .endpoint("https://api.replicate.com/v1/predictions", "REPLICATE_API_TOKEN"),
            ToolDescriptor::new("aces_audio", "mastering")
                .formats(AUDIO_IN, WAV)
                .capabilities(&["professional_mastering", "noise_reduction"])
                .max_duration(1200.0)
                .cost(CostModel::PerMinute { rate: 0.05 }, 2.0)
                .reliability(0.9)
                .quality(0.92)
                .fallbacks(&["suni_ai"])
                .timeout(600)
                .attempts(3)
                .per_minute(40)
                .endpoint("https://api.aces-audio.com/v1/enhance", "ACES_API_KEY"),
            ToolDescriptor::new("melody_rnn", "melody")
                .formats(&["midi", "text"], &["midi", "audio/wav"])
                .capabilities(&["melody_generation", "continuation"])
                .max_duration(60.0)
                .cost(CostModel::PerRequest { rate: 0.001 }, 0.8)
                .reliability(0.85)
                .quality(0.78)
                .fallbacks(&["music_vae"])
                .timeout(120)
                .attempts(3)
                .per_minute(100)
                .endpoint(
                    "https://api.magenta.tensorflow.org/v1/models/melody_rnn:predict",
                    "MAGENTA_API_KEY",
                ),
            ToolDescriptor::new("music_vae", "melody")
                .formats(&["midi", "audio/wav"], &["midi", "audio/wav"])
                .capabilities(&["interpolation", "variation_generation"])
                .max_duration(120.0)
                .cost(CostModel::PerRequest { rate: 0.002 }, 1.0)
                .reliability(0.8)
                .quality(0.8)
                .fallbacks(&["melody_rnn"])
                .timeout(180)
                .attempts(3)
                .per_minute(80)
                .endpoint(
                    "https://api.magenta.tensorflow.org/v1/models/music_vae:predict",
                    "MAGENTA_API_KEY",
                ),
            ToolDescriptor::new("tepand_diff_rhythm", "rhythm")
                .formats(&["midi", "audio/wav"], &["midi", "audio/wav"])
                .capabilities(&["rhythm_generation", "beat_analysis"])
                .max_duration(300.0)
                .cost(CostModel::PerRequest { rate: 0.01 }, 1.2)
                .reliability(0.75)
                .quality(0.85)
                .timeout(300)
                .attempts(2)
                .per_minute(50)
                .endpoint("https://api.tepand.ai/v1/rhythm/generate", "TEPAND_API_KEY"),
            ToolDescriptor::new("suni_ai", "analysis")
                .formats(AUDIO_IN, &["application/json", "audio/wav"])
                .capabilities(&["audio_analysis", "feature_extraction"])
                .max_duration(600.0)
                .cost(CostModel::PerRequest { rate: 0.03 }, 1.5)
                .reliability(0.85)
                .quality(0.87)
                .fallbacks(&["aces_audio"])
                .timeout(400)
                .attempts(2)
                .per_minute(25)
                .endpoint("https://api.suni.ai/v1/process", "SUNI_API_KEY"),
            ToolDescriptor::new("landr_mastering", "mastering")
                .formats(AUDIO_IN, WAV)
                .capabilities(&[
                    "professional_mastering",
                    "loudness_optimization",
                    "stereo_enhancement",
                ])
                .max_duration(600.0)
                .cost(CostModel::PerRequest { rate: 0.5 }, 4.0)
                .reliability(0.85)
                .quality(0.9)
                .fallbacks(&["aces_audio"])
                .timeout(600)
                .attempts(2)
                .per_minute(10)
                .endpoint(
                    "https://landr-mastering.p.rapidapi.com/v1/master",
                    "LANDR_API_KEY",
                ),
        ];

        Self { tools }
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_is_valid() {
        let catalog = ToolCatalog::builtin();
        assert_eq!(catalog.len(), 13);
        assert!(catalog.validate().is_ok());
        assert_eq!(catalog.position("musicgen"), Some(0));
        assert_eq!(catalog.min_cost_factor(), 0.8);
    }

    #[test]
    fn cost_models() {
        assert_eq!(CostModel::PerRequest { rate: 0.5 }.estimate(120.0), 0.5);
        assert_eq!(CostModel::PerPrediction { rate: 0.03 }.estimate(10.0), 0.03);
        assert!((CostModel::PerSecond { rate: 0.01 }.estimate(30.0) - 0.3).abs() < 1e-9);
        assert!((CostModel::PerMinute { rate: 0.05 }.estimate(120.0) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn accepts_matches_both_formats() {
        let catalog = ToolCatalog::builtin();
        let aces = catalog.get("aces_audio").unwrap();
        assert!(aces.accepts("audio/mp3", "audio/wav"));
        assert!(!aces.accepts("text", "audio/wav"));
        assert!(!aces.accepts("audio/wav", "midi"));
    }

    #[test]
    fn estimated_time_uses_time_factor() {
        let catalog = ToolCatalog::builtin();
        assert_eq!(catalog.get("stable_audio").unwrap().estimate_time_secs(30.0), 70.0);
        assert_eq!(catalog.get("musicgen").unwrap().estimate_time_secs(30.0), 40.0);
    }

    #[test]
    fn parse_toml_catalog() {
        let toml_str = r#"
            [[tools]]
            name = "fast"
            input_formats = ["text"]
            output_formats = ["audio/wav"]
            max_duration_secs = 120
            reliability = 0.95
            retry_attempts = 4
            fallbacks = ["slow"]
            cost = { kind = "per_second", rate = 0.02 }
            rate_limits = [{ name = "per_minute", max_requests = 10, window_secs = 60 }]

            [[tools]]
            name = "slow"
            input_formats = ["text"]
            output_formats = ["audio/wav"]
            max_duration_secs = 600
            reliability = 0.5
            cost = { kind = "per_request", rate = 0.1 }
        "#;
        let catalog = ToolCatalog::from_toml_str(toml_str).unwrap();
        let fast = catalog.get("fast").unwrap();
        assert_eq!(fast.max_attempts, 4);
        assert_eq!(fast.cost, CostModel::PerSecond { rate: 0.02 });
        assert_eq!(fast.rate_limits, vec![RateLimit::per_minute(10)]);
        assert_eq!(catalog.get("slow").unwrap().max_attempts, 2);
    }

    #[test]
    fn toml_catalog_rejects_unknown_fields() {
        let toml_str = r#"
            [[tools]]
            name = "fast"
            input_formats = ["text"]
            output_formats = ["audio/wav"]
            max_duration_secs = 120
            reliability = 0.95
            cost = { kind = "per_request", rate = 0.1 }
            reliabilty = 0.2
        "#;
        assert!(ToolCatalog::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn validation_errors() {
        let base = || ToolDescriptor::new("a", "x").formats(&["text"], &["audio/wav"]);

        assert!(ToolCatalog::new(vec![base(), base()]).is_err());
        assert!(ToolCatalog::new(vec![base().reliability(1.5)]).is_err());
        assert!(ToolCatalog::new(vec![base().attempts(0)]).is_err());
        assert!(ToolCatalog::new(vec![base().fallbacks(&["ghost"])]).is_err());
        assert!(ToolCatalog::new(vec![base().cost(CostModel::PerRequest { rate: 0.1 }, 0.0)]).is_err());
        assert!(ToolCatalog::new(vec![base()]).is_ok());
    }

    #[test]
    fn load_catalog_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tools.toml");
        std::fs::write(
            &path,
            "[[tools]]\nname = \"only\"\ninput_formats = [\"midi\"]\noutput_formats = [\"midi\"]\n\
             max_duration_secs = 60\nreliability = 0.7\ncost = { kind = \"per_minute\", rate = 0.2 }\n",
        )
        .unwrap();
        let catalog = ToolCatalog::load(&path).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.contains("only"));
    }
}
