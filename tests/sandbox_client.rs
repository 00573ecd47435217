use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sandgate::config::types::SandgateConfig;
use sandgate::rpc::encode;
use sandgate::sandbox::{ExecOptions, RemoteShell};
use sandgate::{SandboxClient, SandgateError};

const API_KEY: &str = "test-key";

fn config_for(server: &MockServer) -> SandgateConfig {
    let mut config = SandgateConfig::default();
    config.api.url = server.uri();
    config.api.api_key = Some(API_KEY.to_string());
    config.forwarding.enabled = false;
    config.forwarding.use_sudo = false;
    config
}

/// A Start response: one envelope per event followed by an end-of-stream trailer.
fn stream_body(events: &[serde_json::Value]) -> Vec<u8> {
    let mut body = Vec::new();
    for event in events {
        body.extend(encode(&serde_json::to_vec(event).unwrap()));
    }
    body.extend([0x02, 0, 0, 0, 2, b'{', b'}']);
    body
}

async fn mount_sandbox(server: &MockServer, sandbox_id: &str) {
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .and(header("X-API-Key", API_KEY))
        .and(body_partial_json(json!({ "templateID": "base" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "sandboxID": sandbox_id,
            "templateID": "base",
            "clientID": "local",
            "envdURL": server.uri(),
        })))
        .mount(server)
        .await;
}

async fn mount_start(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/process.Process/Start"))
        .and(header("Connect-Protocol-Version", "1"))
        .and(header("Content-Type", "application/connect+json"))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_create_and_echo() {
    let server = MockServer::start().await;
    mount_sandbox(&server, "sb-echo").await;
    mount_start(
        &server,
        ResponseTemplate::new(200).set_body_bytes(stream_body(&[
            json!({ "event": { "start": { "pid": 17 } } }),
            json!({ "event": { "data": { "stdout": "aGVsbG8K" } } }),
            json!({ "event": { "end": { "exited": true, "status": "exit status 0" } } }),
        ])),
    )
    .await;

    let client = SandboxClient::new(&config_for(&server)).unwrap();
    let handle = client.create_sandbox("base", HashMap::new()).await.unwrap();
    assert_eq!(handle.id, "sb-echo");
    assert!(client.cache().contains("sb-echo"));

    let result = client
        .execute_command("sb-echo", "echo hello", &ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.exit_code, 0);
    assert!(!result.timed_out);
}

#[tokio::test]
async fn test_non_zero_exit_is_data() {
    let server = MockServer::start().await;
    mount_sandbox(&server, "sb-fail").await;
    mount_start(
        &server,
        ResponseTemplate::new(200).set_body_bytes(stream_body(&[
            json!({ "event": { "stderr": { "data": "Ym9vbQo=" } } }),
            json!({ "event": { "end": { "status": "exit status 137" } } }),
        ])),
    )
    .await;

    let client = SandboxClient::new(&config_for(&server)).unwrap();
    client.create_sandbox("base", HashMap::new()).await.unwrap();

    let result = client
        .execute_command("sb-fail", "exit 137", &ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stderr, "boom\n");
    assert_eq!(result.exit_code, 137);
    assert!(!result.success());
}

#[tokio::test]
async fn test_timeout_references_command() {
    let server = MockServer::start().await;
    mount_sandbox(&server, "sb-slow").await;
    mount_start(
        &server,
        ResponseTemplate::new(200)
            .set_body_bytes(stream_body(&[json!({ "event": { "end": {} } })]))
            .set_delay(Duration::from_secs(10)),
    )
    .await;

    let client = SandboxClient::new(&config_for(&server)).unwrap();
    client.create_sandbox("base", HashMap::new()).await.unwrap();

    let started = std::time::Instant::now();
    let err = client
        .execute_command(
            "sb-slow",
            "sleep 10",
            &ExecOptions::with_timeout(Duration::from_millis(500)),
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(err.is_timeout());
    assert!(err.to_string().contains("sleep 10"));
    match err {
        SandgateError::CommandTimeout {
            command,
            timeout_ms,
            partial,
        } => {
            assert_eq!(command, "sleep 10");
            assert_eq!(timeout_ms, 500);
            assert!(partial.timed_out);
        }
        other => panic!("expected CommandTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_endpoint_refetched_when_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sandboxes/sb-known"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sandboxID": "sb-known",
            "templateID": "base",
            "envdURL": server.uri(),
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_start(
        &server,
        ResponseTemplate::new(200).set_body_bytes(stream_body(&[
            json!({ "event": { "stdout": { "data": "b2sK" } } }),
        ])),
    )
    .await;

    let client = SandboxClient::new(&config_for(&server)).unwrap();
    for _ in 0..2 {
        let result = client
            .execute_command("sb-known", "echo ok", &ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.stdout, "ok\n");
        assert_eq!(result.exit_code, 0);
    }
}

#[tokio::test]
async fn test_unknown_sandbox() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sandboxes/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("sandbox not found"))
        .mount(&server)
        .await;

    let client = SandboxClient::new(&config_for(&server)).unwrap();
    let err = client
        .execute_command("missing", "true", &ExecOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SandgateError::UnknownSandbox { ref id } if id == "missing"));
}

#[tokio::test]
async fn test_lookup_auth_failure_is_not_unknown_sandbox() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sandboxes/sb-locked"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid API key"))
        .mount(&server)
        .await;

    let client = SandboxClient::new(&config_for(&server)).unwrap();
    let err = client
        .execute_command("sb-locked", "true", &ExecOptions::default())
        .await
        .unwrap_err();
    match err {
        SandgateError::BadRequest { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "invalid API key");
        }
        other => panic!("expected BadRequest, got {other:?}"),
    }
}

#[tokio::test]
async fn test_create_errors_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .and(body_partial_json(json!({ "templateID": "nope" })))
        .respond_with(ResponseTemplate::new(400).set_body_string("template nope not found"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .and(body_partial_json(json!({ "templateID": "base" })))
        .respond_with(ResponseTemplate::new(503).set_body_string("no capacity"))
        .mount(&server)
        .await;

    let client = SandboxClient::new(&config_for(&server)).unwrap();

    let err = client.create_sandbox("nope", HashMap::new()).await.unwrap_err();
    match err {
        SandgateError::BadRequest { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "template nope not found");
        }
        other => panic!("expected BadRequest, got {other:?}"),
    }

    let err = client.create_sandbox("base", HashMap::new()).await.unwrap_err();
    assert!(matches!(err, SandgateError::ServiceUnavailable { status: 503, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_delete_clears_cache_even_on_failure() {
    let server = MockServer::start().await;
    mount_sandbox(&server, "sb-gone").await;
    Mock::given(method("DELETE"))
        .and(path("/sandboxes/sb-gone"))
        .respond_with(ResponseTemplate::new(500).set_body_string("orchestrator exploded"))
        .expect(1)
        .mount(&server)
        .await;

    let client = SandboxClient::new(&config_for(&server)).unwrap();
    client.create_sandbox("base", HashMap::new()).await.unwrap();
    assert!(client.cache().contains("sb-gone"));

    let err = client.delete_sandbox("sb-gone").await.unwrap_err();
    assert!(matches!(err, SandgateError::ServiceUnavailable { status: 500, .. }));
    assert!(!client.cache().contains("sb-gone"));
}

#[tokio::test]
async fn test_url_without_forwarding_uses_private_ip() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sandboxes/sb-web"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sandboxID": "sb-web",
            "envdURL": "http://10.11.0.100:49983",
        })))
        .mount(&server)
        .await;

    let client = SandboxClient::new(&config_for(&server)).unwrap();
    let url = client.get_sandbox_url("sb-web", 3000).await.unwrap();
    assert_eq!(url, "http://10.11.0.100:3000");
}

#[tokio::test]
async fn test_write_file_and_run_code() {
    let server = MockServer::start().await;
    mount_sandbox(&server, "sb-files").await;
    mount_start(
        &server,
        ResponseTemplate::new(200).set_body_bytes(stream_body(&[
            json!({ "event": { "data": { "stdout": "Mgo=" } } }),
            json!({ "event": { "end": { "status": "exit status 0" } } }),
        ])),
    )
    .await;

    let client = SandboxClient::new(&config_for(&server)).unwrap();
    client.create_sandbox("base", HashMap::new()).await.unwrap();

    client
        .write_file("sb-files", "/root/app/main.py", "print(1 + 1)\n")
        .await
        .unwrap();

    let result = client.run_code("sb-files", "print(1 + 1)").await.unwrap();
    assert_eq!(result.stdout, "2\n");
    assert!(result.error.is_none());

    // create + mkdir + heredoc + python
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 4);
}

#[cfg(unix)]
mod forwarding {
    use std::net::Ipv4Addr;

    use sandgate::config::types::ForwardingConfig;
    use sandgate::forward::mapping::{RelayCommand, RelayPlan, RelayTopology};
    use sandgate::forward::PortForwarder;

    use super::*;

    fn placeholder_relays(_: &ForwardingConfig, _: &RelayTopology, _: u16, _: u16) -> RelayPlan {
        let sleep = RelayCommand {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
        };
        RelayPlan {
            inner: sleep.clone(),
            outer: sleep,
        }
    }

    #[tokio::test]
    async fn test_url_forwarding_lifecycle() {
        let server = MockServer::start().await;
        mount_sandbox(&server, "sb-public").await;
        Mock::given(method("DELETE"))
            .and(path("/sandboxes/sb-public"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let mut config = config_for(&server);
        config.forwarding.enabled = true;
        config.forwarding.external_address = Ipv4Addr::new(127, 0, 0, 1);
        config.forwarding.settle_delay_ms = 20;
        config.forwarding.relay_program = "sandgate-test-relay".to_string();

        let forwarder = PortForwarder::with_plan(config.forwarding.clone(), placeholder_relays);
        let client = SandboxClient::with_forwarder(reqwest::Client::new(), &config, forwarder);
        client.create_sandbox("base", HashMap::new()).await.unwrap();

        let expected_port = client.forwarder().external_port("sb-public");
        assert!((30_000..40_000).contains(&expected_port));

        let url = client.get_sandbox_url("sb-public", 3000).await.unwrap();
        assert_eq!(url, format!("http://127.0.0.1:{}", expected_port));
        let again = client.get_sandbox_url("sb-public", 3000).await.unwrap();
        assert_eq!(again, url);
        assert_eq!(client.forwarder().active(), 1);

        client.delete_sandbox("sb-public").await.unwrap();
        assert_eq!(client.forwarder().active(), 0);
        assert!(!client.cache().contains("sb-public"));
    }
}
