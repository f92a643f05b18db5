use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::attempt::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, RetryPolicy};
use crate::error::ConfigError;

pub const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "google/gemini-2.5-flash-image-preview";
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONFIG_FILE: &str = "stillgen.toml";

/// Runtime configuration. Built from defaults, then `stillgen.toml`, then the environment.
#[derive(Clone)]
pub struct Config {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub max_concurrency: usize,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub stream: bool,
    pub fetch_remote_images: bool,
    pub referer: String,
    pub app_title: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            stream: false,
            fetch_remote_images: true,
            referer: "http://localhost".to_string(),
            app_title: "stillgen".to_string(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("max_concurrency", &self.max_concurrency)
            .field("request_timeout", &self.request_timeout)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("stream", &self.stream)
            .field("fetch_remote_images", &self.fetch_remote_images)
            .field("referer", &self.referer)
            .field("app_title", &self.app_title)
            .finish()
    }
}

/// On-disk shape of `stillgen.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    api_key: Option<String>,
    api_base: Option<String>,
    model: Option<String>,
    max_concurrency: Option<usize>,
    request_timeout_secs: Option<f64>,
    max_attempts: Option<u32>,
    base_delay_secs: Option<f64>,
    stream: Option<bool>,
    fetch_remote_images: Option<bool>,
    referer: Option<String>,
    app_title: Option<String>,
}

impl Config {
    /// Defaults, then the config file (`STILLGEN_CONFIG` or `./stillgen.toml`), then env vars.
    /// An explicitly named file must exist; the implicit one is optional.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        match env::var_os("STILLGEN_CONFIG") {
            Some(path) => config.merge_file(Path::new(&path))?,
            None => {
                let implicit = PathBuf::from(DEFAULT_CONFIG_FILE);
                if implicit.exists() {
                    config.merge_file(&implicit)?;
                }
            }
        }
        config.merge_env(|key| env::var(key).ok());
        Ok(config.normalized())
    }

    pub fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.merge_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(())
    }

    fn merge_toml(&mut self, text: &str) -> Result<(), toml::de::Error> {
        let file: FileConfig = toml::from_str(text)?;
        if file.api_key.is_some() {
            self.api_key = file.api_key;
        }
        if let Some(v) = file.api_base {
            self.api_base = v;
        }
        if let Some(v) = file.model {
            self.model = v;
        }
        if let Some(v) = file.max_concurrency {
            self.max_concurrency = v;
        }
        if let Some(v) = file.request_timeout_secs.and_then(secs) {
            self.request_timeout = v;
        }
        if let Some(v) = file.max_attempts {
            self.max_attempts = v;
        }
        if let Some(v) = file.base_delay_secs.and_then(secs) {
            self.base_delay = v;
        }
        if let Some(v) = file.stream {
            self.stream = v;
        }
        if let Some(v) = file.fetch_remote_images {
            self.fetch_remote_images = v;
        }
        if let Some(v) = file.referer {
            self.referer = v;
        }
        if let Some(v) = file.app_title {
            self.app_title = v;
        }
        Ok(())
    }

    /// Overlay values from `lookup` (normally `std::env::var`). Unparseable values are
    /// logged and skipped.
    pub fn merge_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENROUTER_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.api_key = Some(key.trim().to_string());
        }
        if let Some(v) = lookup("STILLGEN_API_BASE") {
            self.api_base = v;
        }
        if let Some(v) = lookup("STILLGEN_MODEL") {
            self.model = v;
        }
        if let Some(v) = parsed(&lookup, "MAX_CONCURRENT_REQUESTS") {
            self.max_concurrency = v;
        }
        if let Some(v) = parsed::<f64, _>(&lookup, "REQUEST_TIMEOUT_SECONDS") {
            match secs(v) {
                Some(d) => self.request_timeout = d,
                None => tracing::warn!(value = v, "ignoring REQUEST_TIMEOUT_SECONDS"),
            }
        }
        if let Some(v) = parsed(&lookup, "STILLGEN_MAX_ATTEMPTS") {
            self.max_attempts = v;
        }
        if let Some(v) = parsed::<f64, _>(&lookup, "STILLGEN_BASE_DELAY_SECS") {
            match secs(v) {
                Some(d) => self.base_delay = d,
                None => tracing::warn!(value = v, "ignoring STILLGEN_BASE_DELAY_SECS"),
            }
        }
        if let Some(v) = flag(&lookup, "STILLGEN_STREAM") {
            self.stream = v;
        }
        if let Some(v) = flag(&lookup, "STILLGEN_FETCH_REMOTE") {
            self.fetch_remote_images = v;
        }
        if let Some(v) = lookup("STILLGEN_HTTP_REFERER") {
            self.referer = v;
        }
        if let Some(v) = lookup("STILLGEN_APP_TITLE") {
            self.app_title = v;
        }
    }

    /// Clamp values that would stall the pool or skip every attempt.
    pub fn normalized(mut self) -> Self {
        if self.max_concurrency == 0 {
            tracing::warn!("max_concurrency 0 clamped to 1");
            self.max_concurrency = 1;
        }
        if self.max_attempts == 0 {
            tracing::warn!("max_attempts 0 clamped to 1");
            self.max_attempts = 1;
        }
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_delay)
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    pub fn models_endpoint(&self) -> String {
        format!("{}/models", self.api_base.trim_end_matches('/'))
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, "ignoring invalid value: {e}");
            None
        }
    }
}

fn flag<F>(lookup: &F, key: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid boolean");
            None
        }
    }
}

fn secs(v: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(v).ok().filter(|d| !d.is_zero())
}
