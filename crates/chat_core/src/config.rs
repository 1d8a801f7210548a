use std::{collections::HashMap, fs, path::Path};

use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "chat.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    /// Used when the conference has no `CHAT_CALLBACK_URL` configured.
    pub token_endpoint: Option<String>,
    pub message_page_size: usize,
    pub http_timeout_seconds: u64,
    pub provider_signing_secret: String,
    pub provider_token_ttl_seconds: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/chat.db".into(),
            token_endpoint: None,
            message_page_size: 30,
            http_timeout_seconds: 10,
            provider_signing_secret: "loopback-dev-secret".into(),
            provider_token_ttl_seconds: 3600,
        }
    }
}

pub fn load_settings() -> Settings {
    let settings = load_settings_from(Path::new(DEFAULT_SETTINGS_FILE));
    apply_env_overrides(settings, |key| std::env::var(key).ok())
}

/// Defaults overlaid with the keys present in `path`; a missing or malformed file is ignored.
pub fn load_settings_from(path: &Path) -> Settings {
    let mut settings = Settings::default();

    let Ok(raw) = fs::read_to_string(path) else {
        return settings;
    };
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) else {
        return settings;
    };

    if let Some(v) = file_cfg.get("database_url").and_then(toml::Value::as_str) {
        settings.database_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("token_endpoint").and_then(toml::Value::as_str) {
        settings.token_endpoint = Some(v.to_string());
    }
    if let Some(v) = file_cfg
        .get("message_page_size")
        .and_then(toml::Value::as_integer)
        .and_then(|v| usize::try_from(v).ok())
    {
        settings.message_page_size = v;
    }
    if let Some(v) = file_cfg
        .get("http_timeout_seconds")
        .and_then(toml::Value::as_integer)
        .and_then(|v| u64::try_from(v).ok())
    {
        settings.http_timeout_seconds = v;
    }
    if let Some(v) = file_cfg
        .get("provider_signing_secret")
        .and_then(toml::Value::as_str)
    {
        settings.provider_signing_secret = v.to_string();
    }
    if let Some(v) = file_cfg
        .get("provider_token_ttl_seconds")
        .and_then(toml::Value::as_integer)
    {
        settings.provider_token_ttl_seconds = v;
    }

    settings
}

/// `CHAT_*` variables apply first, then `APP__*` ones win.
pub fn apply_env_overrides(
    mut settings: Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Settings {
    let pick = |short: &str, namespaced: &str| lookup(namespaced).or_else(|| lookup(short));

    if let Some(v) = pick("CHAT_DATABASE_URL", "APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = pick("CHAT_TOKEN_ENDPOINT", "APP__TOKEN_ENDPOINT") {
        settings.token_endpoint = Some(v);
    }
    if let Some(v) = pick("CHAT_MESSAGE_PAGE_SIZE", "APP__MESSAGE_PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.message_page_size = parsed;
        }
    }
    if let Some(v) = pick("CHAT_HTTP_TIMEOUT_SECONDS", "APP__HTTP_TIMEOUT_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.http_timeout_seconds = parsed;
        }
    }
    if let Some(v) = pick("CHAT_SIGNING_SECRET", "APP__SIGNING_SECRET") {
        settings.provider_signing_secret = v;
    }
    if let Some(v) = lookup("APP__TOKEN_TTL_SECONDS") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.provider_token_ttl_seconds = parsed;
        }
    }

    settings
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}
