//! Configuration behavior through the public API.

use std::time::Duration;

use loki_writer::config::RawConfig;
use loki_writer::duration::parse_duration;
use loki_writer::module::{LokiLog, WriterModule};

#[test]
fn test_minimal_config_gets_defaults() {
    let mut raw = RawConfig::from_json(
        r#"{"url":"http://example.com/loki/api/v1/push","labels":{"app":"svc"}}"#,
    )
    .unwrap();
    let config = raw.validate().unwrap();

    assert_eq!(config.url.as_str(), "http://example.com/loki/api/v1/push");
    assert_eq!(config.batch_wait, Duration::from_secs(1));
    assert_eq!(config.batch_size, 1_048_576);
    assert_eq!(config.timeout, Duration::from_secs(10));
    assert_eq!(config.backoff.min_period, Duration::from_millis(500));
    assert_eq!(config.backoff.max_period, Duration::from_secs(300));
    assert_eq!(config.backoff.max_retries, 10);
    assert!(config.tenant_id.is_none());
    assert!(config.auth.is_none());

    // Validating again gives the same result.
    assert_eq!(raw.validate().unwrap(), config);
}

#[test]
fn test_labels_are_required() {
    let mut module = LokiLog::from_directive("loki http://example.com/loki/api/v1/push").unwrap();
    let err = module.validate().unwrap_err();
    assert_eq!(err.field, "labels");
    assert_eq!(err.to_string(), "labels is nil, at least one label is required");
}

#[test]
fn test_url_errors_name_the_field() {
    for json in [
        r#"{"labels":{"app":"svc"}}"#,
        r#"{"url":"not a url","labels":{"app":"svc"}}"#,
    ] {
        let err = RawConfig::from_json(json).unwrap().validate().unwrap_err();
        assert_eq!(err.field, "url", "{json}");
    }
}

#[test]
fn test_durations_accept_shorthand_and_serialize_as_nanos() {
    let mut raw = RawConfig::from_json(
        r#"{"url":"http://example.com/loki/api/v1/push","labels":{"app":"svc"},"batchwait":"2h60m"}"#,
    )
    .unwrap();
    let config = raw.validate().unwrap();
    assert_eq!(config.batch_wait, Duration::from_secs(3 * 3600));

    let json = raw.to_json().unwrap();
    assert!(json.contains(r#""batchwait":10800000000000"#), "{json}");

    // The numeric form reads back to the same configuration.
    let mut again = RawConfig::from_json(&json).unwrap();
    assert_eq!(again.validate().unwrap(), config);
}

#[test]
fn test_duration_grammar() {
    assert_eq!(
        parse_duration("2h30m500ms").unwrap(),
        Duration::from_secs(2 * 3600 + 30 * 60) + Duration::from_millis(500)
    );
    assert_eq!(parse_duration("1w1d").unwrap(), Duration::from_secs(8 * 86_400));
    assert!(parse_duration("invalid").is_err());
    assert!(parse_duration("5y").is_err());
}
