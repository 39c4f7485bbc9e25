use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::budget::CallBudget;
use crate::engine::LoopConfig;
use crate::model::GenerationParams;
use crate::retry::RetryPolicy;
use crate::security::{SecretValue, optional_env};
use crate::TrajgenError;

const DEFAULT_CONFIG_PATH: &str = "trajgen.toml";
const CONFIG_PATH_ENV: &str = "TRAJGEN_CONFIG";

/// Top-level configuration structure. Every section is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default = "Config::default_budgets")]
    pub budgets: CallBudget,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            engine: EngineConfig::default(),
            budgets: Self::default_budgets(),
            retry: RetryConfig::default(),
            batch: BatchSettings::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl Config {
    fn default_budgets() -> CallBudget {
        CallBudget::unlimited().with_limit("pubmed_search", 3).with_total(5)
    }

    /// Resolve the model API key (from environment only). Local endpoints may run without one.
    pub fn model_api_key(&self) -> Option<SecretValue> {
        optional_env(&self.model.api_key_env)
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            max_turns: self.engine.max_turns,
            max_idle_turns: self.engine.max_idle_turns,
            max_budget_violations: self.engine.max_budget_violations,
            budget: self.budgets.clone(),
            generation: GenerationParams {
                temperature: self.model.temperature,
                max_tokens: self.model.max_tokens,
            },
            model_timeout: Duration::from_secs(self.model.timeout_secs),
            model_retry: self.retry.model_policy(),
            result_preview_chars: self.engine.result_preview_chars,
        }
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `TRAJGEN_CONFIG` environment variable.
    /// 3. `trajgen.toml` in the current working directory, falling back to
    ///    built-in defaults when that file does not exist.
    pub fn load(path: Option<PathBuf>) -> Result<Config, TrajgenError> {
        let (candidate, explicit) = resolve_path(path);
        if !explicit && !candidate.exists() {
            tracing::debug!(path = %candidate.display(), "No configuration file, using defaults");
            let config = Config::default();
            Self::validate(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| TrajgenError::config_io(candidate.clone(), err))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Config, TrajgenError> {
        let config: Config = toml::from_str(raw)
            .map_err(|err| TrajgenError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), TrajgenError> {
        if config.batch.concurrency == 0 {
            return Err(TrajgenError::InvalidConfiguration(
                "batch.concurrency must be at least 1".into(),
            ));
        }
        if config.engine.max_turns == 0 {
            return Err(TrajgenError::InvalidConfiguration(
                "engine.max_turns must be at least 1".into(),
            ));
        }
        if config.model.model.trim().is_empty() {
            return Err(TrajgenError::InvalidConfiguration(
                "model.model must name a model".into(),
            ));
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = path {
        return (path, true);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return (PathBuf::from(from_env), true);
        }
    }

    (Path::new(DEFAULT_CONFIG_PATH).to_path_buf(), false)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "ModelConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "ModelConfig::default_model")]
    pub model: String,
    #[serde(default = "ModelConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "ModelConfig::default_temperature")]
    pub temperature: f32,
    #[serde(default = "ModelConfig::default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "ModelConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ModelConfig {
    fn default_base_url() -> String {
        "https://openrouter.ai/api/v1".into()
    }

    fn default_model() -> String {
        "qwen/qwen3-32b".into()
    }

    fn default_api_key_env() -> String {
        "OPENROUTER_API_KEY".into()
    }

    const fn default_temperature() -> f32 {
        0.1
    }

    const fn default_max_tokens() -> u32 {
        1024
    }

    const fn default_timeout_secs() -> u64 {
        180
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            model: Self::default_model(),
            api_key_env: Self::default_api_key_env(),
            temperature: Self::default_temperature(),
            max_tokens: Self::default_max_tokens(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "EngineConfig::default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "EngineConfig::default_max_idle_turns")]
    pub max_idle_turns: u32,
    #[serde(default = "EngineConfig::default_max_budget_violations")]
    pub max_budget_violations: u32,
    #[serde(default = "EngineConfig::default_result_preview_chars")]
    pub result_preview_chars: usize,
    /// Number of tool calls written to the diagnostic call log (0 disables it).
    #[serde(default = "EngineConfig::default_call_log_limit")]
    pub call_log_limit: usize,
}

impl EngineConfig {
    const fn default_max_turns() -> u32 {
        10
    }

    const fn default_max_idle_turns() -> u32 {
        3
    }

    const fn default_max_budget_violations() -> u32 {
        2
    }

    const fn default_result_preview_chars() -> usize {
        3000
    }

    const fn default_call_log_limit() -> usize {
        100
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: Self::default_max_turns(),
            max_idle_turns: Self::default_max_idle_turns(),
            max_budget_violations: Self::default_max_budget_violations(),
            result_preview_chars: Self::default_result_preview_chars(),
            call_log_limit: Self::default_call_log_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_attempts")]
    pub model_attempts: u32,
    #[serde(default = "RetryConfig::default_model_delay_ms")]
    pub model_base_delay_ms: u64,
    #[serde(default = "RetryConfig::default_attempts")]
    pub tool_attempts: u32,
    #[serde(default = "RetryConfig::default_tool_delay_ms")]
    pub tool_base_delay_ms: u64,
    #[serde(default = "RetryConfig::default_attempts")]
    pub item_attempts: u32,
    #[serde(default = "RetryConfig::default_item_delay_ms")]
    pub item_base_delay_ms: u64,
    #[serde(default = "RetryConfig::default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl RetryConfig {
    const fn default_attempts() -> u32 {
        3
    }

    const fn default_model_delay_ms() -> u64 {
        1_000
    }

    const fn default_tool_delay_ms() -> u64 {
        500
    }

    const fn default_item_delay_ms() -> u64 {
        2_000
    }

    const fn default_max_delay_ms() -> u64 {
        30_000
    }

    fn policy(&self, attempts: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(base_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }

    pub fn model_policy(&self) -> RetryPolicy {
        self.policy(self.model_attempts, self.model_base_delay_ms)
    }

    pub fn tool_policy(&self) -> RetryPolicy {
        self.policy(self.tool_attempts, self.tool_base_delay_ms)
    }

    pub fn item_policy(&self) -> RetryPolicy {
        self.policy(self.item_attempts, self.item_base_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            model_attempts: Self::default_attempts(),
            model_base_delay_ms: Self::default_model_delay_ms(),
            tool_attempts: Self::default_attempts(),
            tool_base_delay_ms: Self::default_tool_delay_ms(),
            item_attempts: Self::default_attempts(),
            item_base_delay_ms: Self::default_item_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "BatchSettings::default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "BatchSettings::default_checkpoint_every")]
    pub checkpoint_every: usize,
}

impl BatchSettings {
    const fn default_concurrency() -> usize {
        5
    }

    const fn default_checkpoint_every() -> usize {
        20
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: Self::default_concurrency(),
            checkpoint_every: Self::default_checkpoint_every(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub literature: LiteratureConfig,
    #[serde(default)]
    pub browse: BrowseConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiteratureConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "LiteratureConfig::default_name")]
    pub name: String,
    #[serde(default = "LiteratureConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "LiteratureConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "LiteratureConfig::default_limit")]
    pub default_limit: u32,
    /// Attempts against the unauthenticated endpoint before falling back.
    #[serde(default = "LiteratureConfig::default_public_attempts")]
    pub public_attempts: u32,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

impl LiteratureConfig {
    fn default_name() -> String {
        "pubmed_search".into()
    }

    fn default_base_url() -> String {
        "https://api.semanticscholar.org/graph/v1".into()
    }

    fn default_api_key_env() -> String {
        "S2_API_KEY".into()
    }

    const fn default_limit() -> u32 {
        5
    }

    const fn default_public_attempts() -> u32 {
        3
    }
}

impl Default for LiteratureConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            name: Self::default_name(),
            base_url: Self::default_base_url(),
            api_key_env: Self::default_api_key_env(),
            default_limit: Self::default_limit(),
            public_attempts: Self::default_public_attempts(),
            max_concurrent: None,
            timeout_secs: default_tool_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowseConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "BrowseConfig::default_name")]
    pub name: String,
    #[serde(default = "BrowseConfig::default_max_chars")]
    pub max_chars: usize,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

impl BrowseConfig {
    fn default_name() -> String {
        "browse_webpage".into()
    }

    const fn default_max_chars() -> usize {
        2000
    }
}

impl Default for BrowseConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            name: Self::default_name(),
            max_chars: Self::default_max_chars(),
            max_concurrent: None,
            timeout_secs: default_tool_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "SearchConfig::default_name")]
    pub name: String,
    #[serde(default = "SearchConfig::default_endpoint")]
    pub endpoint: String,
    #[serde(default = "SearchConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "SearchConfig::default_results")]
    pub results: usize,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

impl SearchConfig {
    fn default_name() -> String {
        "google_search".into()
    }

    fn default_endpoint() -> String {
        "https://google.serper.dev/search".into()
    }

    fn default_api_key_env() -> String {
        "SERPER_API_KEY".into()
    }

    const fn default_results() -> usize {
        5
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            name: Self::default_name(),
            endpoint: Self::default_endpoint(),
            api_key_env: Self::default_api_key_env(),
            results: Self::default_results(),
            max_concurrent: None,
            timeout_secs: default_tool_timeout_secs(),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

const fn default_tool_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ConfigLoader::parse("").unwrap();
        assert_eq!(config.engine.max_turns, 10);
        assert_eq!(config.batch.concurrency, 5);
        assert_eq!(config.budgets.limit_for("pubmed_search"), Some(3));
        assert_eq!(config.budgets.total, Some(5));
        assert_eq!(config.tools.browse.max_chars, 2000);
    }

    #[test]
    fn sections_override_defaults() {
        let config = ConfigLoader::parse(
            r#"
            [model]
            base_url = "http://localhost:8000/v1"
            model = "local-qwen"

            [engine]
            max_turns = 6

            [budgets]
            total = 4

            [budgets.per_tool]
            google_search = 2

            [retry]
            tool_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.model.model, "local-qwen");
        assert_eq!(config.engine.max_idle_turns, 3);
        assert_eq!(config.budgets.limit_for("google_search"), Some(2));
        assert_eq!(config.budgets.limit_for("pubmed_search"), None);
        assert_eq!(config.retry.tool_policy().max_attempts, 5);

        let loop_config = config.loop_config();
        assert_eq!(loop_config.max_turns, 6);
        assert_eq!(loop_config.model_timeout, Duration::from_secs(180));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = ConfigLoader::parse("[batch]\nconcurrency = 0").unwrap_err();
        assert!(matches!(err, TrajgenError::InvalidConfiguration(_)));
    }

    #[test]
    fn explicit_missing_path_is_an_io_error() {
        let temp = TempDir::new().unwrap();
        let err = ConfigLoader::load(Some(temp.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(err, TrajgenError::ConfigIo { .. }));
    }
}
