//! Configuration management.
//!
//! All settings come from environment variables (with `.env` support via
//! dotenvy), loaded once at startup and shared across components. Backends
//! are declared through per-provider variable sections: a backend is
//! registered exactly when its `<PREFIX>_API_KEY` is set.

use std::env;
use std::path::PathBuf;

use crate::manager::ManagerConfig;
use crate::state_log::StateLogConfig;
use crate::types::{PRIORITY_CONSUMABLES, PRIORITY_EXPENSIVE, PRIORITY_FREEBIE, PRIORITY_NORMAL};

/// Environment variable or fallback.
pub fn env_or(key: &str, fallback: &str) -> String {
    env::var(key).unwrap_or_else(|_| fallback.to_string())
}

/// Boolean environment parsing: "1"/"true"/"TRUE" and "0"/"false"/"FALSE";
/// anything else keeps the fallback.
pub fn bool_env(key: &str, fallback: bool) -> bool {
    match env::var(key).as_deref() {
        Ok("1") | Ok("true") | Ok("TRUE") => true,
        Ok("0") | Ok("false") | Ok("FALSE") => false,
        _ => fallback,
    }
}

/// Numeric environment parsing with fallback on absence or parse failure.
pub fn num_env<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}

/// Comma-separated values, trimmed, empties dropped.
pub fn parse_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// One configured upstream backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Model rotation pool; empty leaves the default model in place.
    pub models: Vec<String>,
    /// Token rotation pool; empty keeps the single `api_key`.
    pub tokens: Vec<String>,
    pub priority: i32,
    pub group_id: String,
    pub default_available: bool,
    pub proxy: Option<String>,
}

/// Known provider sections: prefix, default base URL, default model and
/// default scheduling priority. Overridable per variable.
const PROVIDERS: &[(&str, &str, &str, &str, i32)] = &[
    (
        "openai",
        "OPENAI",
        "https://api.openai.com/v1",
        "gpt-4o-mini",
        PRIORITY_EXPENSIVE,
    ),
    (
        "mistral",
        "MISTRAL",
        "https://api.mistral.ai/v1",
        "mistral-small-latest",
        PRIORITY_NORMAL,
    ),
    (
        "groq",
        "GROQ",
        "https://api.groq.com/openai/v1",
        "llama-3.1-70b-versatile",
        PRIORITY_CONSUMABLES,
    ),
    (
        "openrouter",
        "OPENROUTER",
        "https://openrouter.ai/api/v1",
        "meta-llama/llama-3.1-70b-instruct:free",
        PRIORITY_FREEBIE,
    ),
];

/// Complete application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Admin server bind address (host:port).
    pub bind_address: String,
    pub allowed_origins: Vec<String>,

    /// Health loop cadence; stable/fatal intervals derive from this base.
    pub base_check_interval_sec: u64,
    pub first_check_delay_sec: u64,

    pub state_log_enabled: bool,
    pub state_log_db_path: String,
    pub run_id: Option<String>,
    pub heartbeat_interval_sec: u64,
    pub heartbeat_grace_sec: u64,

    pub backends: Vec<BackendConfig>,
}

impl Config {
    /// Load everything from the environment, with sensible defaults for
    /// every missing value. Never panics.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let allowed_origins = env::var("ALLOWED_ORIGINS").ok();

        Self {
            bind_address: env_or("BIND_ADDRESS", "127.0.0.1:8080"),
            allowed_origins: parse_csv(allowed_origins.as_deref()),

            base_check_interval_sec: num_env("BASE_CHECK_INTERVAL_SEC", 60),
            first_check_delay_sec: num_env("FIRST_CHECK_DELAY_SEC", 10),

            state_log_enabled: bool_env("STATE_LOG_ENABLED", true),
            state_log_db_path: env_or("STATE_LOG_DB_PATH", "./ai_fleet_state.sqlite"),
            run_id: env::var("RUN_ID").ok().filter(|id| !id.is_empty()),
            heartbeat_interval_sec: num_env("HEARTBEAT_INTERVAL_SEC", 30),
            heartbeat_grace_sec: num_env("HEARTBEAT_GRACE_SEC", 120),

            backends: Self::backends_from_env(),
        }
    }

    fn backends_from_env() -> Vec<BackendConfig> {
        let mut backends = Vec::new();
        for (name, prefix, base_url, model, priority) in PROVIDERS {
            let api_key = env_or(&format!("{prefix}_API_KEY"), "");
            if api_key.is_empty() {
                continue;
            }

            let models = parse_csv(env::var(format!("{prefix}_MODELS")).ok().as_deref());
            let tokens = parse_csv(env::var(format!("{prefix}_TOKENS")).ok().as_deref());
            backends.push(BackendConfig {
                name: (*name).to_string(),
                api_key,
                base_url: env_or(&format!("{prefix}_BASE_URL"), base_url),
                model: env_or(&format!("{prefix}_MODEL"), model),
                models,
                tokens,
                priority: num_env(&format!("{prefix}_PRIORITY"), *priority),
                group_id: env_or(&format!("{prefix}_GROUP"), "default"),
                default_available: bool_env(&format!("{prefix}_DEFAULT_AVAILABLE"), false),
                proxy: env::var(format!("{prefix}_PROXY")).ok().filter(|p| !p.is_empty()),
            });
        }
        backends
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            base_check_interval_sec: self.base_check_interval_sec,
            first_check_delay_sec: self.first_check_delay_sec,
        }
    }

    pub fn state_log_config(&self) -> StateLogConfig {
        StateLogConfig {
            db_path: PathBuf::from(&self.state_log_db_path),
            run_id: self.run_id.clone(),
            heartbeat_interval_sec: self.heartbeat_interval_sec,
            heartbeat_grace_sec: self.heartbeat_grace_sec,
        }
    }
}
