use std::io::Write;

use gateflow_core::config::AppConfig;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write config");
    tmp.flush().expect("flush");
    tmp
}

#[test]
fn test_load_full_config_from_file() {
    let tmp = write_config(
        r#"
[engine]
max_recycles = 5
episodic_top_k = 2
default_agent_timeout_secs = 30
default_max_workers = 8

[store]
path = "/tmp/gateflow-test/flows.db"

[log]
log_dir = "/tmp/gateflow-test/logs"
level = 3

[human_gate]
default_deadline_secs = 3600
actor = "compliance-desk"

[[agents]]
id = "drafter"
name = "Contract drafter"
tags = ["draft", "legal"]
command = "python3"
args = ["agents/drafter.py"]
timeout_secs = 60

[agents.env]
MODEL = "small"

[[agents]]
id = "reviewer"
tags = ["review"]
command = "./review.sh"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_recycles, 5);
    assert_eq!(config.engine.episodic_top_k, 2);
    assert_eq!(config.engine.default_agent_timeout_secs, Some(30));
    assert_eq!(config.engine.default_max_workers, 8);
    assert_eq!(
        config.store_path(),
        std::path::PathBuf::from("/tmp/gateflow-test/flows.db")
    );
    assert_eq!(
        config.log_dir(),
        Some(std::path::PathBuf::from("/tmp/gateflow-test/logs"))
    );
    assert_eq!(config.human_gate.default_deadline_secs, Some(3600));
    assert_eq!(config.human_gate.actor, "compliance-desk");

    assert_eq!(config.agents.len(), 2);
    assert_eq!(config.agents[0].tags, vec!["draft", "legal"]);
    assert_eq!(config.agents[0].env.get("MODEL").map(String::as_str), Some("small"));
    assert_eq!(config.agents[0].timeout_secs, 60);
    assert_eq!(config.agents[1].timeout_secs, 120);
    assert!(config.agents[1].args.is_empty());
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("GATEFLOW_TEST_DB", "/tmp/expanded.db");
    let tmp = write_config(
        r#"
[store]
path = "${GATEFLOW_TEST_DB}"

[[agents]]
id = "a"
command = "${GATEFLOW_TEST_UNSET_VAR}"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.store.path, "/tmp/expanded.db");
    // unset variables stay literal
    assert_eq!(config.agents[0].command, "${GATEFLOW_TEST_UNSET_VAR}");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let tmp = write_config("");
    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_recycles, 3);
    assert_eq!(config.engine.episodic_top_k, 3);
    assert_eq!(config.engine.default_max_workers, 4);
    assert!(config.engine.default_agent_timeout_secs.is_none());
    assert_eq!(config.store.path, "gateflow.db");
    assert!(config.log_dir().is_none());
    assert!(config.agents.is_empty());
}

#[test]
fn test_disabled_log_section_has_no_dir() {
    let tmp = write_config("[log]\nenabled = false\n");
    let config = AppConfig::load(tmp.path()).expect("load config");
    assert!(config.log_dir().is_none());
}

#[test]
fn test_invalid_configs_are_rejected() {
    let bad_level = write_config("[log]\nlevel = 7\n");
    assert!(AppConfig::load(bad_level.path()).is_err());

    let duplicate = write_config(
        r#"
[[agents]]
id = "same"
command = "a"

[[agents]]
id = "same"
command = "b"
"#,
    );
    let err = AppConfig::load(duplicate.path()).unwrap_err();
    assert!(err.to_string().contains("duplicate agent id"));
}

#[test]
fn test_missing_file() {
    let missing = std::path::Path::new("/nonexistent/gateflow.toml");
    assert!(AppConfig::load(missing).is_err());
    let config = AppConfig::load_or_default(missing).expect("defaults");
    assert_eq!(config.engine.max_recycles, 3);
}
