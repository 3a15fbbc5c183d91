use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::Deserialize;

use crate::context::DEFAULT_MAX_GROUNDING_CHARS;
use crate::gemini::{DEFAULT_GEMINI_MODEL, GeminiGenerator};
use crate::invoker::Generator;
use crate::memo::{CharBudget, MemoPolicy, PassThrough};
use crate::pipeline::{Coordinator, CoordinatorConfig};
use crate::{SecretValue, TutorError, require_env};

const DEFAULT_CONFIG_PATH: &str = "tutor.toml";
const CONFIG_PATH_ENV: &str = "TUTOR_CONFIG";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the configured model secret (from environment only).
    pub fn api_key(&self) -> Result<SecretValue, TutorError> {
        require_env(&self.model.api_key_env)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_grounding_chars: self.pipeline.max_grounding_chars,
            stage_timeout: self.pipeline.stage_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn memo_policy(&self) -> Arc<dyn MemoPolicy> {
        match self.pipeline.memo_char_budget {
            Some(budget) => Arc::new(CharBudget(budget)),
            None => Arc::new(PassThrough),
        }
    }

    /// Build the generation collaborator named by `model.provider`.
    pub fn build_generator(&self) -> Result<Arc<dyn Generator>, TutorError> {
        match self.model.provider.as_str() {
            "gemini" => {
                let key = self.api_key()?;
                let mut generator = GeminiGenerator::new(&self.model.model, key)
                    .with_temperature(self.model.temperature);
                if let Some(base_url) = &self.model.base_url {
                    generator = generator.with_base_url(base_url);
                }
                Ok(Arc::new(generator))
            }
            other => Err(TutorError::InvalidConfiguration(format!(
                "unsupported model provider `{other}`"
            ))),
        }
    }

    pub fn build_coordinator(&self) -> Result<Coordinator, TutorError> {
        let generator = self.build_generator()?;
        Ok(Coordinator::new(generator, self.coordinator_config()).with_memo_policy(self.memo_policy()))
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `TUTOR_CONFIG` environment variable.
    /// 3. `tutor.toml` in the current working directory.
    pub fn load(path: Option<PathBuf>) -> Result<Config, TutorError> {
        let candidate = resolve_path(path);
        let raw = fs::read_to_string(&candidate)
            .map_err(|err| TutorError::config_io(candidate.clone(), err))?;
        Self::from_toml(&raw)
    }

    /// Like [`ConfigLoader::load`], but falls back to built-in defaults when
    /// no path was given and `tutor.toml` does not exist.
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Config, TutorError> {
        let explicit = path.is_some() || env::var(CONFIG_PATH_ENV).is_ok_and(|v| !v.trim().is_empty());
        if !explicit && !Path::new(DEFAULT_CONFIG_PATH).exists() {
            let config = Config::default();
            Self::validate(&config)?;
            return Ok(config);
        }
        Self::load(path)
    }

    pub fn from_toml(raw: &str) -> Result<Config, TutorError> {
        let config: Config =
            toml::from_str(raw).map_err(|err| TutorError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), TutorError> {
        if config.model.api_key_env.trim().is_empty() {
            return Err(TutorError::InvalidConfiguration(
                "model.api_key_env must reference an environment variable".into(),
            ));
        }
        if config.model.model.trim().is_empty() {
            return Err(TutorError::InvalidConfiguration(
                "model.model must name a model".into(),
            ));
        }
        if config.pipeline.max_grounding_chars == 0 {
            return Err(TutorError::InvalidConfiguration(
                "pipeline.max_grounding_chars must be greater than zero".into(),
            ));
        }
        if config.pipeline.memo_char_budget == Some(0) {
            return Err(TutorError::InvalidConfiguration(
                "pipeline.memo_char_budget must be greater than zero when set".into(),
            ));
        }
        if config.pipeline.stage_timeout_ms == Some(0) {
            return Err(TutorError::InvalidConfiguration(
                "pipeline.stage_timeout_ms must be greater than zero when set".into(),
            ));
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return PathBuf::from(from_env);
        }
    }

    Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "ModelConfig::default_provider")]
    pub provider: String,
    #[serde(default = "ModelConfig::default_model")]
    pub model: String,
    #[serde(default = "ModelConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "ModelConfig::default_temperature")]
    pub temperature: Option<f32>,
}

impl ModelConfig {
    fn default_provider() -> String {
        "gemini".to_string()
    }

    fn default_model() -> String {
        DEFAULT_GEMINI_MODEL.to_string()
    }

    fn default_api_key_env() -> String {
        "GOOGLE_API_KEY".to_string()
    }

    const fn default_temperature() -> Option<f32> {
        Some(0.0)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Self::default_provider(),
            model: Self::default_model(),
            api_key_env: Self::default_api_key_env(),
            base_url: None,
            temperature: Self::default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "PipelineConfig::default_max_grounding_chars")]
    pub max_grounding_chars: usize,
    #[serde(default)]
    pub stage_timeout_ms: Option<u64>,
    #[serde(default)]
    pub memo_char_budget: Option<usize>,
}

impl PipelineConfig {
    const fn default_max_grounding_chars() -> usize {
        DEFAULT_MAX_GROUNDING_CHARS
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_grounding_chars: Self::default_max_grounding_chars(),
            stage_timeout_ms: None,
            memo_char_budget: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    #[serde(default)]
    pub solution_log_dir: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            solution_log_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ConfigLoader::from_toml("").unwrap();
        assert_eq!(config.model.provider, "gemini");
        assert_eq!(config.model.model, DEFAULT_GEMINI_MODEL);
        assert_eq!(config.model.api_key_env, "GOOGLE_API_KEY");
        assert_eq!(config.pipeline.max_grounding_chars, 800_000);
        assert!(config.coordinator_config().stage_timeout.is_none());
    }

    #[test]
    fn reads_sections_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[model]
model = "gemini-2.5-pro"
api_key_env = "TUTOR_TEST_KEY"
temperature = 0.2

[pipeline]
max_grounding_chars = 1000
stage_timeout_ms = 30000
memo_char_budget = 4000

[logging]
level = "debug"
"#
        )
        .unwrap();

        let config = ConfigLoader::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.model.model, "gemini-2.5-pro");
        assert_eq!(config.model.temperature, Some(0.2));
        assert_eq!(config.logging.level, "debug");
        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.max_grounding_chars, 1000);
        assert_eq!(coordinator.stage_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.memo_policy().prepare("x".repeat(5000)).len(), 4000);
    }

    #[test]
    fn rejects_zero_grounding_cap() {
        let err = ConfigLoader::from_toml("[pipeline]\nmax_grounding_chars = 0").unwrap_err();
        assert!(matches!(err, TutorError::InvalidConfiguration(_)));
    }

    #[test]
    fn rejects_zero_memo_budget() {
        let err = ConfigLoader::from_toml("[pipeline]\nmemo_char_budget = 0").unwrap_err();
        assert!(matches!(err, TutorError::InvalidConfiguration(msg) if msg.contains("memo_char_budget")));
    }

    #[test]
    fn rejects_unknown_provider() {
        let config = ConfigLoader::from_toml("[model]\nprovider = \"carrier-pigeon\"").unwrap();
        assert!(matches!(
            config.build_generator(),
            Err(TutorError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ConfigLoader::load(Some(PathBuf::from("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, TutorError::ConfigIo { .. }));
    }
}
