use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::llm::ClaudeClient;
use crate::pipeline::PipelineConfig;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

const APP_DIR: &str = "newsletter-digest";

#[derive(Debug, Clone)]
pub struct Config {
    /// Only needed by commands that call the model.
    pub anthropic_api_key: Option<String>,
    pub model: String,
    /// Messages endpoint override, e.g. a gateway in front of the API.
    pub api_endpoint: Option<String>,
    pub db_path: PathBuf,
    pub request_timeout: Duration,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // Try to load .env from multiple locations
        Self::try_load_dotenv();

        let mut pipeline = PipelineConfig::default();
        if let Some(concurrency) = parse_var::<usize>("DIGEST_CONCURRENCY")? {
            pipeline.concurrency = concurrency.max(1);
        }
        if let Some(attempts) = parse_var::<u32>("DIGEST_MAX_ATTEMPTS")? {
            pipeline.retry.max_attempts = attempts.max(1);
        }
        if let Some(secs) = parse_var::<u64>("DIGEST_RUN_TIMEOUT_SECS")? {
            // 0 disables the run deadline
            pipeline.run_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(chars) = parse_var::<usize>("DIGEST_MAX_BODY_CHARS")? {
            pipeline.max_body_chars = chars;
        }

        let request_timeout = Duration::from_secs(
            parse_var::<u64>("DIGEST_REQUEST_TIMEOUT_SECS")?.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        );

        let db_path = match env::var("DIGEST_DB_PATH") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => default_db_path()?,
        };

        Ok(Self {
            anthropic_api_key: text_var("ANTHROPIC_API_KEY"),
            model: text_var("DIGEST_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_endpoint: text_var("DIGEST_API_ENDPOINT"),
            db_path,
            request_timeout,
            pipeline,
        })
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.anthropic_api_key.as_deref().context(
            "ANTHROPIC_API_KEY not found.\n\n\
            To fix this, create ~/.config/newsletter-digest/.env with:\n  \
            ANTHROPIC_API_KEY=your_key_here\n\n\
            Get your Anthropic API key from: https://console.anthropic.com/settings/keys",
        )
    }

    /// Client for the configured model. Fails without an API key.
    pub fn model_client(&self) -> Result<ClaudeClient> {
        let client = ClaudeClient::new(
            self.require_api_key()?.to_string(),
            self.model.clone(),
            self.request_timeout,
        )?;

        Ok(match &self.api_endpoint {
            Some(endpoint) => client.with_endpoint(endpoint.clone()),
            None => client,
        })
    }

    fn try_load_dotenv() {
        // Try locations in order of preference:

        // 1. Current directory (for development)
        if dotenvy::dotenv().is_ok() {
            return;
        }

        // 2. ~/.config/newsletter-digest/.env (standard config location)
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join(APP_DIR).join(".env");
            if config_path.exists() && dotenvy::from_path(&config_path).is_ok() {
                return;
            }
        }

        // 3. ~/.env (home directory)
        if let Some(home_dir) = dirs::home_dir() {
            let home_path = home_dir.join(".env");
            if home_path.exists() {
                let _ = dotenvy::from_path(&home_path);
            }
        }
    }
}

/// Database location under the local data directory.
pub fn default_db_path() -> Result<PathBuf> {
    let data_dir =
        dirs::data_local_dir().context("Could not determine local data directory")?;
    Ok(data_dir.join(APP_DIR).join("digests.db"))
}

fn text_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} must be a number, got {:?}", name, value)),
        _ => Ok(None),
    }
}
