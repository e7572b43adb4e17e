use std::io::Write;
use std::path::{Path, PathBuf};

use serial_test::serial;

use super::*;

const ENV_KEYS: [&str; 13] = [
    "EMBER_LLM_BASE_URL",
    "EMBER_LLM_MODEL",
    "EMBER_LLM_API_KEY",
    "EMBER_LLM_AUX_MODEL",
    "EMBER_LLM_STREAM",
    "EMBER_DATA_DIR",
    "EMBER_TURN_TIMEOUT",
    "EMBER_COMPACTION_KEEP_RECENT",
    "EMBER_COMPACTION_LONG_THREAD",
    "EMBER_TOOLS_MAX_OUTPUT",
    "EMBER_EVOLUTION_SOURCE_DIR",
    "EMBER_EVOLUTION_BINARY",
    "EMBER_PLAYBOOK_ENABLED",
];

fn clear_env() {
    for key in ENV_KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("config.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(f, "{body}").unwrap();
    path
}

#[test]
fn defaults_when_file_missing() {
    let config = Config::default();
    assert_eq!(config.agent.name, "Ember");
    assert_eq!(config.agent.turn_timeout_secs, 180);
    assert_eq!(config.agent.doom_loop_window, 3);
    assert_eq!(config.llm.base_url, "http://localhost:8080/v1");
    assert!(config.llm.stream);
    assert!(config.llm.api_key.is_none());
    assert_eq!(config.memory.data_dir, PathBuf::from("./data"));
    assert!(config.compaction.keep_recent.is_none());
    assert_eq!(config.compaction.forced_keep_recent, 10);
    assert_eq!(config.compaction.forced_truncate_chars, 400);
    assert_eq!(config.compaction.long_thread_messages, 30);
    assert_eq!(config.self_state.max_snapshots, 50);
    assert_eq!(config.evolution.grace_ms, 1500);
    assert_eq!(config.evolution.restart, RestartMode::Exec);
    assert_eq!(config.playbook.max_bullets, 100);
    assert_eq!(config.tools.max_output_chars, 8000);
}

#[test]
#[serial]
fn load_missing_file_uses_defaults() {
    clear_env();
    let config = Config::load(Path::new("/nonexistent/ember.toml")).unwrap();
    assert_eq!(config.llm.model, "qwen3-8b");
    config.validate().unwrap();
}

#[test]
#[serial]
fn parse_valid_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
[agent]
name = "Spark"
turn_timeout_secs = 90

[llm]
base_url = "http://gpu:9000/v1"
model = "llama3:8b"
aux_model = "llama3:1b"
stream = false

[compaction]
keep_recent = 40
long_thread_messages = 50

[tools.shell]
timeout = 15

[evolution]
restart = "exit"
grace_ms = 10
"#,
    );

    clear_env();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.agent.name, "Spark");
    assert_eq!(config.agent.turn_timeout_secs, 90);
    assert_eq!(config.llm.base_url, "http://gpu:9000/v1");
    assert_eq!(config.llm.aux_model(), "llama3:1b");
    assert!(!config.llm.stream);
    assert_eq!(config.compaction.keep_recent, Some(40));
    assert_eq!(config.compaction.long_thread_messages, 50);
    assert_eq!(config.compaction.forced_keep_recent, 10);
    assert_eq!(config.tools.shell.timeout, 15);
    assert_eq!(config.evolution.restart, RestartMode::Exit);
    assert_eq!(config.evolution.grace_ms, 10);
}

#[test]
#[serial]
fn invalid_toml_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[agent\nname = ");
    clear_env();
    let err = Config::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("failed to parse config file"));
}

#[test]
#[serial]
fn env_overrides() {
    clear_env();
    unsafe {
        std::env::set_var("EMBER_LLM_MODEL", "phi4");
        std::env::set_var("EMBER_LLM_API_KEY", "sk-test");
        std::env::set_var("EMBER_DATA_DIR", "/var/lib/ember");
        std::env::set_var("EMBER_TURN_TIMEOUT", "45");
        std::env::set_var("EMBER_COMPACTION_KEEP_RECENT", "20");
        std::env::set_var("EMBER_PLAYBOOK_ENABLED", "false");
        std::env::set_var("EMBER_EVOLUTION_BINARY", "/opt/ember/bin/ember");
    }

    let config = Config::load(Path::new("/nonexistent/ember.toml")).unwrap();
    clear_env();

    assert_eq!(config.llm.model, "phi4");
    assert_eq!(config.llm.aux_model(), "phi4");
    assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
    assert_eq!(config.memory.data_dir, PathBuf::from("/var/lib/ember"));
    assert_eq!(config.agent.turn_timeout_secs, 45);
    assert_eq!(config.compaction.keep_recent, Some(20));
    assert!(!config.playbook.enabled);
    assert_eq!(
        config.evolution.binary,
        Some(PathBuf::from("/opt/ember/bin/ember"))
    );
}

#[test]
#[serial]
fn env_override_invalid_values_ignored() {
    clear_env();
    unsafe {
        std::env::set_var("EMBER_TURN_TIMEOUT", "soon");
        std::env::set_var("EMBER_TOOLS_MAX_OUTPUT", "-3");
        std::env::set_var("EMBER_LLM_STREAM", "maybe");
    }

    let config = Config::load(Path::new("/nonexistent/ember.toml")).unwrap();
    clear_env();

    assert_eq!(config.agent.turn_timeout_secs, 180);
    assert_eq!(config.tools.max_output_chars, 8000);
    assert!(config.llm.stream);
}

#[test]
#[serial]
fn empty_api_key_env_clears_key() {
    clear_env();
    unsafe { std::env::set_var("EMBER_LLM_API_KEY", "") };
    let config = Config::load(Path::new("/nonexistent/ember.toml")).unwrap();
    clear_env();
    assert!(config.llm.api_key.is_none());
}

#[test]
fn validate_rejects_zero_timeout() {
    let mut config = Config::default();
    config.agent.turn_timeout_secs = 0;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("turn_timeout_secs"));
}

#[test]
fn validate_rejects_empty_model() {
    let mut config = Config::default();
    config.llm.model = "  ".into();
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_zero_max_output() {
    let mut config = Config::default();
    config.tools.max_output_chars = 0;
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_zero_keep_recent() {
    let mut config = Config::default();
    config.compaction.keep_recent = Some(0);
    assert!(config.validate().is_err());
}

#[test]
fn debug_redacts_api_key() {
    let mut config = Config::default();
    config.llm.api_key = Some("sk-secret".into());
    let debug = format!("{:?}", config.llm);
    assert!(!debug.contains("sk-secret"));
    assert!(debug.contains("[REDACTED]"));
}

#[test]
fn blank_aux_model_falls_back_to_main() {
    let mut config = Config::default();
    config.llm.aux_model = Some(" ".into());
    assert_eq!(config.llm.aux_model(), config.llm.model);
}
