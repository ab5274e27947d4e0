use std::env;
use std::fs;
use std::path::Path;

use fitout_core::config::{resolve_config_path, AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct Entry {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

impl Entry {
    fn new(key: &'static str, value: impl Into<String>, env_keys: &'static [&'static str]) -> Self {
        Self { key, value: value.into(), env_keys }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = resolve_config_path(None);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for entry in entries(&config) {
        let source = field_source(
            entry.key,
            entry.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(entry.key, &entry.value, source));
    }

    lines.join("\n")
}

fn entries(config: &AppConfig) -> Vec<Entry> {
    let api_token = match &config.api.token {
        Some(token) => redact_token(token.expose_secret()),
        None => "<unset>".to_string(),
    };

    vec![
        Entry::new("database.url", &config.database.url, &["FITOUT_DATABASE_URL"]),
        Entry::new(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["FITOUT_DATABASE_MAX_CONNECTIONS"],
        ),
        Entry::new(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["FITOUT_DATABASE_TIMEOUT_SECS"],
        ),
        Entry::new(
            "server.bind_address",
            &config.server.bind_address,
            &["FITOUT_SERVER_BIND_ADDRESS"],
        ),
        Entry::new("server.port", config.server.port.to_string(), &["FITOUT_SERVER_PORT"]),
        Entry::new(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            &["FITOUT_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        Entry::new("api.base_url", &config.api.base_url, &["FITOUT_API_BASE_URL"]),
        Entry::new("api.token", api_token, &["FITOUT_API_TOKEN"]),
        Entry::new(
            "api.timeout_secs",
            config.api.timeout_secs.to_string(),
            &["FITOUT_API_TIMEOUT_SECS"],
        ),
        Entry::new(
            "api.max_read_retries",
            config.api.max_read_retries.to_string(),
            &["FITOUT_API_MAX_READ_RETRIES"],
        ),
        Entry::new(
            "api.files_cache_ttl_secs",
            config.api.files_cache_ttl_secs.to_string(),
            &["FITOUT_API_FILES_CACHE_TTL_SECS"],
        ),
        Entry::new(
            "documents.template_dir",
            config.documents.template_dir.display().to_string(),
            &["FITOUT_DOCUMENTS_TEMPLATE_DIR"],
        ),
        Entry::new(
            "documents.page_size",
            &config.documents.page_size,
            &["FITOUT_DOCUMENTS_PAGE_SIZE"],
        ),
        Entry::new(
            "business.default_currency",
            &config.business.default_currency,
            &["FITOUT_BUSINESS_DEFAULT_CURRENCY"],
        ),
        Entry::new(
            "logging.level",
            &config.logging.level,
            &["FITOUT_LOGGING_LEVEL", "FITOUT_LOG_LEVEL"],
        ),
        Entry::new(
            "logging.format",
            config.logging.format.as_str(),
            &["FITOUT_LOGGING_FORMAT", "FITOUT_LOG_FORMAT"],
        ),
    ]
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps at most a four character hint of the secret.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    match trimmed.char_indices().nth(4) {
        Some((cut, _)) if trimmed.len() > 12 => format!("{}***", &trimmed[..cut]),
        _ => "<redacted>".to_string(),
    }
}
