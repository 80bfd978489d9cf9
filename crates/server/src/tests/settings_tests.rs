use super::{normalize_database_url, prepare_database_url, settings_from, Settings};

use std::fs;

fn env(pairs: &[(&str, &str)]) -> ::config::Map<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn defaults_apply_without_file_or_environment() {
    let settings = settings_from("does-not-exist/server", env(&[])).expect("settings");
    let defaults = Settings::default();
    assert_eq!(settings.bind_addr, defaults.bind_addr);
    assert_eq!(settings.token_ttl_seconds, 7 * 24 * 60 * 60);
    assert!(settings.assistant_api_key().is_none());
}

#[test]
fn file_then_prefixed_environment_then_bare_variables() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let file_path = temp_root.path().join("server.toml");
    fs::write(
        &file_path,
        "bind_addr = \"0.0.0.0:9000\"\njwt_secret = \"from-file\"\nbcrypt_cost = 6\n",
    )
    .expect("write settings file");
    let file_name = temp_root.path().join("server");

    let settings = settings_from(
        file_name.to_string_lossy().as_ref(),
        env(&[
            ("APP__JWT_SECRET", "from-prefixed-env"),
            ("APP__TOKEN_TTL_SECONDS", "600"),
            ("DATABASE_URL", "sqlite::memory:"),
            ("ASSISTANT_API_KEY", "  key-123 "),
        ]),
    )
    .expect("settings");

    assert_eq!(settings.bind_addr, "0.0.0.0:9000");
    assert_eq!(settings.bcrypt_cost, 6);
    assert_eq!(settings.jwt_secret, "from-prefixed-env");
    assert_eq!(settings.token_ttl_seconds, 600);
    assert_eq!(settings.database_url, "sqlite::memory:");
    assert_eq!(settings.assistant_api_key(), Some("key-123"));
}

#[test]
fn bare_variable_overrides_prefixed_one() {
    let settings = settings_from(
        "does-not-exist/server",
        env(&[("APP__JWT_SECRET", "prefixed"), ("JWT_SECRET", "bare")]),
    )
    .expect("settings");
    assert_eq!(settings.jwt_secret, "bare");
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn empty_database_url_falls_back_to_default() {
    assert_eq!(normalize_database_url("   "), Settings::default().database_url);
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
}

#[test]
fn creates_parent_dir_for_relative_sqlite_url() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.path().join("data").exists());
}

#[test]
fn keeps_windows_absolute_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("sqlite:C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn normalizes_windows_plain_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn converts_sqlite_double_slash_windows_path() {
    assert_eq!(
        normalize_database_url("sqlite://C:/Users/alice/test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );
}
