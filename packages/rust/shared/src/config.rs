//! Application configuration for tunebook.
//!
//! User config lives at `~/.tunebook/tunebook.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, TunebookError};
use crate::retry::RetryPolicy;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "tunebook.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".tunebook";

// ---------------------------------------------------------------------------
// Config structs (matching tunebook.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Source-site fetch policies.
    #[serde(default)]
    pub source: SourceConfig,

    /// OpenRouter settings for the external judge.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Classification-stage settings.
    #[serde(default)]
    pub classify: ClassifyConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root directory for cache, checkpoint database, and exports.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Failed items are retried on resume until they have failed this
    /// many times, after which they are reported as permanently failed.
    #[serde(default = "default_max_item_retries")]
    pub max_item_retries: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_item_retries: default_max_item_retries(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.tunebook/data".into()
}
fn default_max_item_retries() -> u32 {
    3
}

/// `[source]` section — politeness and scope for the one external host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the tune metadata site.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Only URLs whose path starts with one of these prefixes may be
    /// fetched. Anything else fails closed before any network activity.
    #[serde(default = "default_allowed_prefixes")]
    pub allowed_path_prefixes: Vec<String>,

    /// Minimum seconds between network requests (robots crawl-delay ×3).
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Total attempts per fetch, including the first.
    #[serde(default = "default_fetch_attempts")]
    pub max_attempts: u32,

    /// Exponential backoff base in seconds between attempts.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Contact string appended to the User-Agent, identifying the run.
    #[serde(default = "default_contact")]
    pub contact: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            allowed_path_prefixes: default_allowed_prefixes(),
            min_interval_secs: default_min_interval_secs(),
            request_timeout_secs: default_timeout_secs(),
            max_attempts: default_fetch_attempts(),
            backoff_base_secs: default_backoff_base(),
            contact: default_contact(),
        }
    }
}

fn default_base_url() -> String {
    "https://hymnary.org".into()
}
fn default_allowed_prefixes() -> Vec<String> {
    vec!["/search".into(), "/tune/".into()]
}
fn default_min_interval_secs() -> u64 {
    15
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_fetch_attempts() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    2
}
fn default_contact() -> String {
    "personal non-commercial church ministry use".into()
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Default model to use for classification.
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "openai/gpt-4o".into()
}

/// `[classify]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyConfig {
    /// Independent judge runs per item for majority voting.
    #[serde(default = "default_num_runs")]
    pub num_runs: usize,

    /// Total attempts per judge call, including the first.
    #[serde(default = "default_judge_attempts")]
    pub max_attempts: u32,

    /// Exponential backoff base in seconds between judge attempts.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// How an exact even split of votes is resolved.
    #[serde(default)]
    pub tie_break: TieBreak,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            num_runs: default_num_runs(),
            max_attempts: default_judge_attempts(),
            backoff_base_secs: default_backoff_base(),
            tie_break: TieBreak::default(),
        }
    }
}

fn default_num_runs() -> usize {
    3
}
fn default_judge_attempts() -> u32 {
    3
}

/// Tie-break rule for an even number of judge runs.
///
/// The default biases toward precision: a tune is included only when a
/// strict majority says so.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    NotRelevant,
    Relevant,
}

// ---------------------------------------------------------------------------
// Fetch config (runtime, merged from config file)
// ---------------------------------------------------------------------------

/// Runtime fetch configuration consumed by the rate-limited fetcher.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Base URL of the external host; the only host ever contacted.
    pub base_url: Url,
    /// Allowed path prefixes on that host.
    pub allowed_path_prefixes: Vec<String>,
    /// Minimum spacing between network requests.
    pub min_interval: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Retry schedule for transient failures.
    pub retry: RetryPolicy,
    /// Directory for the raw HTML cache.
    pub cache_dir: PathBuf,
    /// Full User-Agent string.
    pub user_agent: String,
}

impl FetchConfig {
    /// Build the runtime fetch config from the application config.
    pub fn from_app(config: &AppConfig) -> Result<Self> {
        let base_url = Url::parse(&config.source.base_url).map_err(|e| {
            TunebookError::config(format!(
                "invalid source.base_url '{}': {e}",
                config.source.base_url
            ))
        })?;
        if base_url.host_str().is_none() {
            return Err(TunebookError::config("source.base_url has no host"));
        }
        if config.source.allowed_path_prefixes.is_empty() {
            return Err(TunebookError::config(
                "source.allowed_path_prefixes must not be empty",
            ));
        }

        let data_dir = expand_tilde(&config.defaults.data_dir);
        Ok(Self {
            base_url,
            allowed_path_prefixes: config.source.allowed_path_prefixes.clone(),
            min_interval: Duration::from_secs(config.source.min_interval_secs),
            request_timeout: Duration::from_secs(config.source.request_timeout_secs),
            retry: RetryPolicy::new(
                config.source.max_attempts,
                config.source.backoff_base_secs,
            ),
            cache_dir: data_dir.join("raw"),
            user_agent: format!(
                "tunebook/{} ({})",
                env!("CARGO_PKG_VERSION"),
                config.source.contact
            ),
        })
    }
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

/// Resolved data directory for the run.
pub fn data_dir(config: &AppConfig) -> PathBuf {
    expand_tilde(&config.defaults.data_dir)
}

/// Path of the checkpoint database under the data directory.
pub fn checkpoint_path(config: &AppConfig) -> PathBuf {
    data_dir(config).join("interim").join("checkpoint.db")
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.tunebook/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| TunebookError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.tunebook/tunebook.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TunebookError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| TunebookError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TunebookError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| TunebookError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TunebookError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the OpenRouter API key env var is set and non-empty.
/// Run eagerly before any item is processed.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(TunebookError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("hymnary.org"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.source.min_interval_secs, 15);
        assert_eq!(parsed.classify.num_runs, 3);
        assert_eq!(parsed.classify.tie_break, TieBreak::NotRelevant);
    }

    #[test]
    fn fetch_config_from_defaults() {
        let app = AppConfig::default();
        let fetch = FetchConfig::from_app(&app).expect("fetch config");
        assert_eq!(fetch.min_interval, Duration::from_secs(15));
        assert_eq!(fetch.retry.max_attempts, 3);
        assert_eq!(fetch.base_url.host_str(), Some("hymnary.org"));
        assert!(fetch.user_agent.starts_with("tunebook/"));
    }

    #[test]
    fn fetch_config_rejects_empty_allow_list() {
        let mut app = AppConfig::default();
        app.source.allowed_path_prefixes.clear();
        let result = FetchConfig::from_app(&app);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("allowed_path_prefixes")
        );
    }

    #[test]
    fn fetch_config_rejects_bad_url() {
        let mut app = AppConfig::default();
        app.source.base_url = "not a url".into();
        assert!(FetchConfig::from_app(&app).is_err());
    }

    #[test]
    fn tie_break_parses_from_toml() {
        let config: AppConfig = toml::from_str(
            r#"
[classify]
tie_break = "relevant"
num_runs = 4
"#,
        )
        .expect("parse");
        assert_eq!(config.classify.tie_break, TieBreak::Relevant);
        assert_eq!(config.classify.num_runs, 4);
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "TB_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
