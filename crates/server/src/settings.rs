use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

pub const SETTINGS_FILE: &str = "server";

/// Environment variables honoured without the `APP__` prefix.
const BARE_ENV_KEYS: [(&str, &str); 3] = [
    ("DATABASE_URL", "database_url"),
    ("JWT_SECRET", "jwt_secret"),
    ("ASSISTANT_API_KEY", "assistant_api_key"),
];

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
    pub bcrypt_cost: u32,
    pub assistant_url: String,
    #[serde(default)]
    pub assistant_api_key: Option<String>,
    pub assistant_model: String,
    pub assistant_timeout_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".into(),
            database_url: "sqlite://./data/chat.db".into(),
            jwt_secret: "dev-secret-change-me".into(),
            token_ttl_seconds: 7 * 24 * 60 * 60,
            bcrypt_cost: 10,
            assistant_url: "https://api.groq.com/openai/v1/chat/completions".into(),
            assistant_api_key: None,
            assistant_model: "llama-3.1-8b-instant".into(),
            assistant_timeout_seconds: 10,
        }
    }
}

impl Settings {
    pub fn assistant_timeout(&self) -> Duration {
        Duration::from_secs(self.assistant_timeout_seconds)
    }

    pub fn assistant_api_key(&self) -> Option<&str> {
        self.assistant_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

/// Defaults, then `server.toml`, then `APP__*` variables, then the bare
/// conventional variables.
pub fn load_settings() -> anyhow::Result<Settings> {
    settings_from(SETTINGS_FILE, std::env::vars().collect())
}

fn settings_from(
    file_name: &str,
    env: ::config::Map<String, String>,
) -> anyhow::Result<Settings> {
    let defaults = Settings::default();
    let mut builder = ::config::Config::builder()
        .set_default("bind_addr", defaults.bind_addr)?
        .set_default("database_url", defaults.database_url)?
        .set_default("jwt_secret", defaults.jwt_secret)?
        .set_default("token_ttl_seconds", defaults.token_ttl_seconds)?
        .set_default("bcrypt_cost", i64::from(defaults.bcrypt_cost))?
        .set_default("assistant_url", defaults.assistant_url)?
        .set_default("assistant_model", defaults.assistant_model)?
        .set_default(
            "assistant_timeout_seconds",
            i64::try_from(defaults.assistant_timeout_seconds).unwrap_or(10),
        )?
        .add_source(::config::File::with_name(file_name).required(false))
        .add_source(
            ::config::Environment::with_prefix("APP")
                .separator("__")
                .source(Some(env.clone())),
        );

    for (var, key) in BARE_ENV_KEYS {
        if let Some(value) = env.get(var) {
            builder = builder.set_override(key, value.clone())?;
        }
    }

    let settings = builder
        .build()
        .context("failed to assemble server settings")?
        .try_deserialize::<Settings>()
        .context("invalid server settings")?;
    Ok(settings)
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    let path = if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        path
    } else if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        path
    } else if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    } else {
        raw_database_url
    };

    let path = path.replace('\\', "/");
    if has_drive_prefix(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
