use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::models::DEFAULT_MAX_ATTEMPTS;
use crate::telemetry::DEFAULT_CAPACITY;

pub const DEMO_KEY: &str = "DEMO_KEY";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_VISION_MODEL: &str = "gemini-1.5-flash";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got {value:?}")]
    Invalid { key: &'static str, expected: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gemini_api_key: String,
    pub gemini_api_base: String,
    pub text_model: String,
    pub vision_model: String,
    pub port: u16,
    pub generation_timeout: Duration,
    pub max_generation_attempts: u32,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
    pub telemetry_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Ok(Self {
            gemini_api_key: text("GEMINI_API_KEY", DEMO_KEY),
            gemini_api_base: text("GEMINI_API_BASE", DEFAULT_API_BASE).trim_end_matches('/').to_string(),
            text_model: text("GEMINI_TEXT_MODEL", DEFAULT_TEXT_MODEL),
            vision_model: text("GEMINI_VISION_MODEL", DEFAULT_VISION_MODEL),
            port: parse(&lookup, "PORT", "a port number", 8080)?,
            generation_timeout: Duration::from_secs(parse(
                &lookup,
                "GENERATION_TIMEOUT_SECS",
                "a number of seconds",
                20,
            )?),
            max_generation_attempts: parse(
                &lookup,
                "MAX_GENERATION_ATTEMPTS",
                "a non-negative integer",
                DEFAULT_MAX_ATTEMPTS,
            )?,
            allowed_origins: lookup("ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            telemetry_capacity: parse(&lookup, "TELEMETRY_CAPACITY", "a positive integer", DEFAULT_CAPACITY)?,
        })
    }

    /// Offline configuration: providers answer with canned data.
    pub fn demo() -> Self {
        Self {
            gemini_api_key: DEMO_KEY.to_string(),
            gemini_api_base: DEFAULT_API_BASE.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            port: 8080,
            generation_timeout: Duration::from_secs(20),
            max_generation_attempts: DEFAULT_MAX_ATTEMPTS,
            allowed_origins: Vec::new(),
            telemetry_capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn is_demo(&self) -> bool {
        self.gemini_api_key == DEMO_KEY
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, expected: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, expected, value }),
    }
}
