//! End-to-end tests: module lifecycle, writer, shipper and a mock Loki.

use std::io::Write;
use std::time::Duration;

use mockito::{Matcher, Server};

use loki_writer::module::{lookup, LokiLog, WriterModule, MODULE_ID};
use loki_writer::shipper::Shipper;

fn block(url: &str, extra: &str) -> String {
    format!(
        r#"
loki {{
    url {url}/loki/api/v1/push
    tenant_id team-a
    batchwait 1m
    labels {{
        app svc
        env "prod eu"
    }}
    backoff_config {{
        min_period 1ms
        max_period 2ms
        max_retries 3
    }}
{extra}
}}
"#
    )
}

#[test]
fn test_lines_are_delivered_with_tenant_and_labels() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .match_header("x-scope-orgid", "team-a")
        .match_header("content-type", "application/json")
        .match_header("x-source", "pipeline-test")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""stream":\{"app":"svc","env":"prod eu"\}"#.to_string()),
            Matcher::Regex(r#""hello\\n"\].*"world\\n"\]"#.to_string()),
        ]))
        .with_status(204)
        .expect(1)
        .create();

    let mut module = LokiLog::from_directive(&block(
        &server.url(),
        "    headers {\n        X-Source pipeline-test\n    }",
    ))
    .unwrap();
    module.provision(None);
    module.validate().unwrap();

    let mut writer = module.open().unwrap();
    writer.write_all(b"hello\n").unwrap();
    writer.write_all(b"world\n").unwrap();

    let mut shipper = writer.into_shipper();
    shipper.stop();

    mock.assert();
    let stats = shipper.stats();
    assert_eq!(stats.entries_sent, 2);
    assert_eq!(stats.batches_sent, 1);
}

#[test]
fn test_server_errors_exhaust_retries() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .with_status(503)
        .expect(3)
        .create();

    let mut module = LokiLog::from_directive(&block(&server.url(), "")).unwrap();
    module.validate().unwrap();

    let mut writer = module.open().unwrap();
    writer.write_all(b"never delivered").unwrap();

    let mut shipper = writer.into_shipper();
    shipper.stop();

    mock.assert();
    let stats = shipper.stats();
    assert_eq!(stats.batches_dropped, 1);
    assert_eq!(stats.retries, 2);
}

#[test]
fn test_rate_limited_batches_are_dropped_once() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .with_status(429)
        .expect(1)
        .create();

    let mut module =
        LokiLog::from_directive(&block(&server.url(), "    drop_rate_limited_batches")).unwrap();
    module.validate().unwrap();

    let mut writer = module.open().unwrap();
    writer.write_all(b"throttled").unwrap();

    let mut shipper = writer.into_shipper();
    shipper.stop();

    mock.assert();
    let stats = shipper.stats();
    assert_eq!(stats.batches_dropped, 1);
    assert_eq!(stats.retries, 0);
}

#[test]
fn test_basic_auth_header() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .match_header("authorization", "Basic dXNlcjpwYXNz")
        .with_status(204)
        .expect(1)
        .create();

    let extra = "    basic_auth {\n        username user\n        password pass\n    }";
    let mut module = LokiLog::from_directive(&block(&server.url(), extra)).unwrap();
    module.validate().unwrap();

    let mut writer = module.open().unwrap();
    writer.write_all(b"authenticated").unwrap();
    writer.into_shipper().stop();

    mock.assert();
}

#[test]
fn test_bearer_token_file_is_read_per_request() {
    let path = std::env::temp_dir().join(format!("loki-writer-bearer-{}", std::process::id()));
    std::fs::write(&path, "from-file\n").unwrap();

    let mut server = Server::new();
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .match_header("authorization", "Bearer from-file")
        .with_status(204)
        .expect(1)
        .create();

    let extra = format!("    bearer_token_file {}", path.display());
    let mut module = LokiLog::from_directive(&block(&server.url(), &extra)).unwrap();
    module.validate().unwrap();

    let mut writer = module.open().unwrap();
    writer.write_all(b"authenticated").unwrap();
    writer.into_shipper().stop();

    mock.assert();
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_close_returns_without_waiting_for_delivery() {
    let mut server = Server::new();
    let _mock = server
        .mock("POST", "/loki/api/v1/push")
        .with_status(500)
        .create();

    // Slow retries: a graceful stop would wait minutes.
    let extra = "    backoff_config {\n        min_period 1m\n        max_period 5m\n        max_retries 0\n    }";
    let mut module = lookup(MODULE_ID).unwrap();
    module.unmarshal_directive(&block(&server.url(), extra)).unwrap();
    module.validate().unwrap();

    let mut writer = module.open_writer().unwrap();
    writer.write_all(b"queued").unwrap();

    let started = std::time::Instant::now();
    writer.close().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
}
