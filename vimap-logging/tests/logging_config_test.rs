use vimap_logging::{build_env_filter, init_logging, init_worker_logging, LogFormat, LogLevel, LoggingConfig};

#[test]
fn test_logging_config_from_yaml() {
    let yaml_config = r#"
level: debug
format: json
include_location: true
"#;

    let config: LoggingConfig = serde_yaml::from_str(yaml_config).unwrap();

    assert_eq!(config.level, LogLevel::Debug);
    assert_eq!(config.format, LogFormat::Json);
    assert!(config.include_location);
}

#[test]
fn test_repeated_initialization_is_harmless() {
    let config = LoggingConfig::default();
    assert!(init_logging(&config).is_ok());
    assert!(init_logging(&config).is_ok());
    assert!(init_worker_logging(Some("debug")).is_ok());
}

#[test]
fn test_env_filter_accepts_directives() {
    let filter = build_env_filter(Some("vimap_pool=trace,info"));
    assert!(filter.to_string().contains("vimap_pool=trace"));
}
