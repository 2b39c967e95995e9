//! TOML configuration and CLI overrides.
//!
//! Every setting has a built-in default, so the config file is optional.
//! Command-line flags are applied on top with [`Config::apply`] and the
//! result is checked with [`Config::validate`] before a run starts.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    #[serde(default = "default_input_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            root: default_input_root(),
            include_globs: default_include_globs(),
        }
    }
}

fn default_input_root() -> PathBuf {
    PathBuf::from("sources")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/items/*.jsonl".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_root")]
    pub root: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: default_output_root(),
        }
    }
}

fn default_output_root() -> PathBuf {
    PathBuf::from("llm_outputs")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default = "default_true")]
    pub enable_thinking: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            enable_thinking: true,
        }
    }
}

fn default_model() -> String {
    "qwen3-max".to_string()
}
fn default_base_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}
fn default_api_key_env() -> String {
    "DASHSCOPE_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.05
}
fn default_timeout_secs() -> f64 {
    600.0
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Delay after each completed section before its permit is released.
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: f64,
    #[serde(default)]
    pub resume: bool,
    /// Treat sections whose latest ledger row failed as pending. Implies `resume`.
    #[serde(default)]
    pub retry_failed: bool,
    #[serde(default)]
    pub max_sections: Option<usize>,
    #[serde(default)]
    pub max_volumes: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            sleep_secs: default_sleep_secs(),
            resume: false,
            retry_failed: false,
            max_sections: None,
            max_volumes: None,
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_sleep_secs() -> f64 {
    0.5
}

impl RunConfig {
    pub fn resumes(&self) -> bool {
        self.resume || self.retry_failed
    }

    /// Delays too large to represent saturate to `Duration::MAX`.
    pub fn post_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.sleep_secs).unwrap_or(Duration::MAX)
    }
}

impl LlmConfig {
    /// Timeouts too large to represent saturate to `Duration::MAX`.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::MAX)
    }

    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => bail!(
                "Missing API key. Set the {} environment variable.",
                self.api_key_env
            ),
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub input_root: Option<PathBuf>,
    pub include_globs: Vec<String>,
    pub output_root: Option<PathBuf>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub timeout_secs: Option<f64>,
    pub concurrency: Option<usize>,
    pub sleep_secs: Option<f64>,
    pub resume: bool,
    pub retry_failed: bool,
    pub max_sections: Option<usize>,
    pub max_volumes: Option<usize>,
}

impl Config {
    pub fn apply(&mut self, o: RunOverrides) {
        if let Some(v) = o.input_root {
            self.input.root = v;
        }
        if !o.include_globs.is_empty() {
            self.input.include_globs = o.include_globs;
        }
        if let Some(v) = o.output_root {
            self.output.root = v;
        }
        if let Some(v) = o.model {
            self.llm.model = v;
        }
        if let Some(v) = o.base_url {
            self.llm.base_url = v;
        }
        if let Some(v) = o.temperature {
            self.llm.temperature = v;
        }
        if let Some(v) = o.timeout_secs {
            self.llm.timeout_secs = v;
        }
        if let Some(v) = o.concurrency {
            self.run.concurrency = v;
        }
        if let Some(v) = o.sleep_secs {
            self.run.sleep_secs = v;
        }
        self.run.resume |= o.resume;
        self.run.retry_failed |= o.retry_failed;
        if o.max_sections.is_some() {
            self.run.max_sections = o.max_sections;
        }
        if o.max_volumes.is_some() {
            self.run.max_volumes = o.max_volumes;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.run.concurrency < 1 {
            bail!("run.concurrency must be >= 1");
        }
        if !(self.llm.timeout_secs.is_finite() && self.llm.timeout_secs > 0.0) {
            bail!("llm.timeout_secs must be > 0");
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            bail!("llm.temperature must be in [0.0, 2.0]");
        }
        if !(self.run.sleep_secs.is_finite() && self.run.sleep_secs >= 0.0) {
            bail!("run.sleep_secs must be >= 0");
        }
        if self.run.max_sections == Some(0) {
            bail!("run.max_sections must be >= 1 when set");
        }
        if self.run.max_volumes == Some(0) {
            bail!("run.max_volumes must be >= 1 when set");
        }
        if self.input.include_globs.is_empty() {
            bail!("input.include_globs must not be empty");
        }
        if self.llm.model.trim().is_empty() {
            bail!("llm.model must not be empty");
        }
        Ok(())
    }
}

/// Load the config file. A missing file yields the built-in defaults
/// unless `required` is set (an explicit `--config` path).
pub fn load_config(path: &Path, required: bool) -> Result<Config> {
    if !path.exists() && !required {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.run.concurrency, 4);
        assert_eq!(cfg.run.post_delay(), Duration::from_millis(500));
        assert_eq!(cfg.llm.model, "qwen3-max");
        assert!(!cfg.run.resumes());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
[llm]
model = "qwen-plus"

[run]
concurrency = 2
max_volumes = 3
"#,
        )
        .unwrap();
        assert_eq!(cfg.llm.model, "qwen-plus");
        assert_eq!(cfg.llm.timeout_secs, 600.0);
        assert_eq!(cfg.run.concurrency, 2);
        assert_eq!(cfg.run.max_volumes, Some(3));
        assert_eq!(cfg.input.include_globs, vec!["**/items/*.jsonl"]);
    }

    #[test]
    fn test_validation_ranges() {
        let mut cfg = Config::default();
        cfg.run.concurrency = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.llm.timeout_secs = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.llm.temperature = 2.5;
        assert!(cfg.validate().is_err());
        cfg.llm.temperature = 2.0;
        assert!(cfg.validate().is_ok());

        let mut cfg = Config::default();
        cfg.run.sleep_secs = -0.1;
        assert!(cfg.validate().is_err());
        cfg.run.sleep_secs = 0.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_huge_durations_saturate() {
        let mut cfg = Config::default();
        cfg.llm.timeout_secs = 1e20;
        cfg.run.sleep_secs = 1e300;
        cfg.validate().unwrap();
        assert_eq!(cfg.llm.timeout(), Duration::MAX);
        assert_eq!(cfg.run.post_delay(), Duration::MAX);

        let settings = crate::dispatch::DispatchSettings::from_config(&cfg);
        assert_eq!(settings.timeout, Duration::MAX);
    }

    #[test]
    fn test_overrides_win() {
        let mut cfg = Config::default();
        cfg.apply(RunOverrides {
            concurrency: Some(8),
            retry_failed: true,
            max_sections: Some(2),
            ..Default::default()
        });
        assert_eq!(cfg.run.concurrency, 8);
        assert!(cfg.run.resumes());
        assert_eq!(cfg.run.max_sections, Some(2));
        assert_eq!(cfg.run.max_volumes, None);
    }

    #[test]
    fn test_missing_optional_file_uses_defaults() {
        let cfg = load_config(Path::new("/nonexistent/vx.toml"), false).unwrap();
        assert_eq!(cfg.run.concurrency, 4);
        assert!(load_config(Path::new("/nonexistent/vx.toml"), true).is_err());
    }
}
