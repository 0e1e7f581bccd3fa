use std::path::PathBuf;
use std::time::Duration;

use crucible::config::Config;
use crucible::{CompilerKind, ConfigError};

use super::FIXTURES_PATH;

fn load(name: &str) -> Result<Config, ConfigError> {
    Config::from_file(format!("{FIXTURES_PATH}/configs/{name}"))
}

#[test]
fn test_load_valid_config() {
    let config = load("valid_full.toml").expect("Failed to load config");

    assert!(config.registry.strict_clash);
    assert_eq!(config.registry.rescan_interval(), Some(Duration::from_secs(300)));
    assert_eq!(config.queue.concurrency(), 2);
    assert_eq!(config.remote.max_receive_count, 2);
    assert_eq!(config.worker.extra_specialties, vec!["runtime:glibc".to_owned()]);
    assert_eq!(
        config.health.health_check_file,
        Some(PathBuf::from("/var/run/crucible/ready"))
    );
    assert!(!config.execution.local);
    assert_eq!(config.execution.wrapper[0], "nsjail");
    assert_eq!(config.cache.capacity, 16);

    assert_eq!(config.compilers.len(), 3);
    let cross = config.get_compiler("rv64-gcc-13").unwrap();
    assert_eq!(cross.specialty, vec!["arch:riscv64".to_owned()]);
    assert!(cross.supports_execution);

    let rustc = config.get_compiler("rustc-1.75").unwrap();
    assert_eq!(rustc.kind, CompilerKind::Rustc);
    assert!(!rustc.supports_execution);
    assert_eq!(rustc.probe_timeout(config.registry.probe_timeout()), Duration::from_secs(30));
}

#[test]
fn test_load_minimal_config() {
    let config = load("valid_minimal.toml").expect("Failed to load config");

    let gcc = config.get_compiler("gcc-12").unwrap();
    assert_eq!(gcc.kind, CompilerKind::Generic);
    assert!(gcc.options.is_empty());
    assert!(!config.worker.is_worker);
    assert!(config.execution.local);
}

#[test]
fn test_load_invalid_empty_lang() {
    assert!(matches!(load("invalid_empty_lang.toml"), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_load_invalid_zero_concurrency() {
    assert!(matches!(
        load("invalid_zero_concurrency.toml"),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn test_load_invalid_unknown_kind() {
    assert!(matches!(load("invalid_unknown_kind.toml"), Err(ConfigError::Parse(_))));
}

#[test]
fn test_load_invalid_heartbeat() {
    assert!(matches!(load("invalid_heartbeat.toml"), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_load_missing_file() {
    assert!(load("does_not_exist.toml").is_err());
}
