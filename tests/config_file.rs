//! Integration tests for loading configuration files from disk.
//!
//! Each test uses its own temp file and unique env var names to avoid
//! parallel test interference.

use std::io::Write;

use minicpm_adapter::config::{Config, ConfigError, GatewayMode, ManualSessionSource};
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_full_omni_config_from_file() {
    std::env::set_var("TEST_CFG_FILE_01_HOST", "10.0.0.7");

    let file = write_config(
        r#"
[server]
listen = "127.0.0.1:9999"
mode = "omni"

[backend]
url = "http://${TEST_CFG_FILE_01_HOST}:19060"
timeout_secs = 120

[omni]
session_url = "http://${TEST_CFG_FILE_01_HOST}:8022"
inference_url = "http://localhost:9060/"
freshness_secs = 300
system_prompt = "Answer in French."

[omni.manual_session]
user_id = "op-user"
session_id = "op-session"
token = "op-token"

[logging]
level = "debug"
"#,
    );

    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.server.listen, "127.0.0.1:9999");
    assert_eq!(config.server.mode, GatewayMode::Omni);
    assert!(config.omni_enabled());
    assert_eq!(config.backend.url, "http://10.0.0.7:19060");
    assert_eq!(config.backend.timeout_secs, 120);
    assert_eq!(config.backend.health_timeout_secs, 5);
    assert_eq!(config.logging.level, "debug");

    let omni = config.omni.as_ref().unwrap();
    assert_eq!(omni.session_url, "http://10.0.0.7:8022");
    assert_eq!(omni.freshness_secs, 300);
    assert_eq!(omni.system_prompt, "Answer in French.");
    assert_eq!(omni.max_turns, 10);
    assert_eq!(omni.manual_source, ManualSessionSource::File);

    let manual = omni.manual_session.as_ref().unwrap();
    assert_eq!(manual.session_id, "op-session");
    assert_eq!(manual.token.as_ref().unwrap().expose_secret(), "op-token");
    assert!(!format!("{:?}", manual).contains("op-token"));
}

#[test]
fn test_manual_session_from_env_reference() {
    std::env::set_var("TEST_CFG_FILE_02_SESSION", "sess-from-env");

    let file = write_config(
        r#"
[server]
mode = "omni"

[omni]

[omni.manual_session]
user_id = "user"
session_id = "${TEST_CFG_FILE_02_SESSION}"
"#,
    );

    let config = Config::from_file(file.path()).unwrap();
    let omni = config.omni.as_ref().unwrap();
    assert_eq!(omni.manual_source, ManualSessionSource::EnvExpanded);
    assert_eq!(
        omni.manual_session.as_ref().unwrap().session_id,
        "sess-from-env"
    );
}

#[test]
fn test_missing_env_var_names_field() {
    let file = write_config(
        r#"
[backend]
url = "http://${TEST_CFG_FILE_03_NEVER_SET}:19060"
"#,
    );

    match Config::from_file(file.path()) {
        Err(ConfigError::EnvVar { var, field, .. }) => {
            assert_eq!(var, "TEST_CFG_FILE_03_NEVER_SET");
            assert_eq!(field, "backend.url");
        }
        other => panic!("expected EnvVar error, got {:?}", other),
    }
}

#[test]
fn test_omni_mode_requires_section() {
    let file = write_config("[server]\nmode = \"omni\"\n");

    let err = Config::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
    assert!(err.to_string().contains("[omni]"));
}

#[test]
fn test_unknown_mode_is_parse_error() {
    let file = write_config("[server]\nmode = \"mirror\"\n");
    assert!(matches!(
        Config::from_file(file.path()),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    match Config::from_file(&path) {
        Err(ConfigError::Io { path: reported, .. }) => {
            assert!(reported.ends_with("absent.toml"));
        }
        other => panic!("expected Io error, got {:?}", other),
    }
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = write_config("");
    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.server.listen, "0.0.0.0:8080");
    assert_eq!(config.server.mode, GatewayMode::Passthrough);
    assert_eq!(config.backend.url, "http://localhost:19060");
    assert_eq!(config.backend.model, "MiniCPM-o-4.5");
    assert!(config.omni.is_none());
}
