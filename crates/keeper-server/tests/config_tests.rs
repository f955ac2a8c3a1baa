//! Environment-driven configuration loading

use keeper_server::config::Config;
use serial_test::serial;
use std::path::PathBuf;
use std::time::Duration;

const VARS: [&str; 6] = [
    "KEEPER_DSN",
    "KEEPER_STAGING_ROOT",
    "KEEPER_STAGING_CLEANUP",
    "KEEPER_WRITER_MAX_WAIT",
    "KEEPER_WRITER_MAX_BUFFER_LENGTH",
    "KEEPER_QUEUE_WORKERS",
];

fn clear_env() {
    for var in VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_load_defaults() {
    clear_env();
    let config = Config::load().unwrap();

    assert_eq!(config.writer.max_wait(), Duration::from_secs(30));
    assert_eq!(config.writer.max_buffer_length, 30);
    assert_eq!(config.writer.channel_capacity, 10);
    assert_eq!(config.analyzer.intake_capacity, 5);
    assert_eq!(config.cache.wait_budget(), Duration::from_secs(20));
}

#[test]
#[serial]
fn test_load_env_overrides() {
    clear_env();
    std::env::set_var("KEEPER_DSN", "postgresql://keeper@db/components");
    std::env::set_var("KEEPER_STAGING_ROOT", "/var/lib/keeper/staging");
    std::env::set_var("KEEPER_STAGING_CLEANUP", "true");
    std::env::set_var("KEEPER_WRITER_MAX_WAIT", "5");
    std::env::set_var("KEEPER_WRITER_MAX_BUFFER_LENGTH", "500");

    let config = Config::load().unwrap();
    clear_env();

    assert_eq!(config.storage.database_url, "postgresql://keeper@db/components");
    assert_eq!(config.staging.root, PathBuf::from("/var/lib/keeper/staging"));
    assert!(config.staging.cleanup);
    assert_eq!(config.writer.max_wait_secs, 5);
    assert_eq!(config.writer.max_buffer_length, 500);
}

#[test]
#[serial]
fn test_unparsable_values_fall_back() {
    clear_env();
    std::env::set_var("KEEPER_WRITER_MAX_BUFFER_LENGTH", "lots");

    let config = Config::load().unwrap();
    clear_env();

    assert_eq!(config.writer.max_buffer_length, 30);
}

#[test]
#[serial]
fn test_invalid_values_rejected() {
    clear_env();
    std::env::set_var("KEEPER_QUEUE_WORKERS", "0");

    let result = Config::load();
    clear_env();

    assert!(result.is_err());
}
