use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use fitout_cli::commands::{config, doctor, migrate};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("FITOUT_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert!(payload["message"].as_str().unwrap_or_default().contains("schema version 1"));
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("FITOUT_DATABASE_URL", "postgres://localhost/fitout")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn config_attributes_env_sources_and_redacts_the_api_token() {
    with_env(
        &[
            ("FITOUT_DATABASE_URL", "sqlite::memory:"),
            ("FITOUT_API_TOKEN", "portal-secret-value"),
            ("FITOUT_LOG_LEVEL", "debug"),
        ],
        || {
            let output = config::run();

            assert!(output.contains("- database.url = sqlite::memory: (source: env (FITOUT_DATABASE_URL))"));
            assert!(output.contains("- api.token = port*** (source: env (FITOUT_API_TOKEN))"));
            assert!(output.contains("- logging.level = debug (source: env (FITOUT_LOG_LEVEL))"));
            assert!(output.contains("- business.default_currency = AED (source: default)"));
            assert!(!output.contains("portal-secret-value"));
        },
    );
}

#[test]
fn doctor_fails_on_a_fresh_database_without_migrations() {
    with_env(&[("FITOUT_DATABASE_URL", "sqlite::memory:")], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 1);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "fail");
        let schema = check(&payload, "schema_migrations");
        assert_eq!(schema["status"], "fail");
        assert_eq!(check(&payload, "database_connectivity")["status"], "pass");
    });
}

#[test]
fn doctor_passes_after_migrate_on_a_file_database() {
    let path = temp_database("doctor-pass");
    let url = format!("sqlite://{}", path.display());

    with_env(&[("FITOUT_DATABASE_URL", url.as_str())], || {
        let migrated = migrate::run();
        assert_eq!(migrated.exit_code, 0, "{}", migrated.output);

        let result = doctor::run(true);
        let payload = parse_payload(&result.output);
        assert_eq!(result.exit_code, 0, "{}", result.output);
        assert_eq!(payload["overall_status"], "pass");
        assert_eq!(check(&payload, "schema_migrations")["status"], "pass");
    });

    remove_database(&path);
}

#[test]
fn doctor_skips_dependent_checks_when_config_is_invalid() {
    with_env(&[("FITOUT_SERVER_PORT", "eighty")], || {
        let result = doctor::run(false);
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("- [fail] config_validation"));
        assert!(result.output.contains("- [skip] database_connectivity"));
        assert!(result.output.contains("- [skip] schema_migrations"));
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn check<'a>(payload: &'a Value, name: &str) -> &'a Value {
    payload["checks"]
        .as_array()
        .and_then(|checks| checks.iter().find(|check| check["name"] == name))
        .unwrap_or_else(|| panic!("doctor report should include `{name}`"))
}

fn temp_database(label: &str) -> PathBuf {
    let path = env::temp_dir().join(format!("fitout-{label}-{}.db", std::process::id()));
    remove_database(&path);
    path
}

fn remove_database(path: &PathBuf) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "FITOUT_DATABASE_URL",
        "FITOUT_DATABASE_MAX_CONNECTIONS",
        "FITOUT_DATABASE_TIMEOUT_SECS",
        "FITOUT_SERVER_BIND_ADDRESS",
        "FITOUT_SERVER_PORT",
        "FITOUT_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "FITOUT_API_BASE_URL",
        "FITOUT_API_TOKEN",
        "FITOUT_API_TIMEOUT_SECS",
        "FITOUT_API_MAX_READ_RETRIES",
        "FITOUT_API_FILES_CACHE_TTL_SECS",
        "FITOUT_DOCUMENTS_TEMPLATE_DIR",
        "FITOUT_DOCUMENTS_PAGE_SIZE",
        "FITOUT_BUSINESS_DEFAULT_CURRENCY",
        "FITOUT_LOGGING_LEVEL",
        "FITOUT_LOGGING_FORMAT",
        "FITOUT_LOG_LEVEL",
        "FITOUT_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
