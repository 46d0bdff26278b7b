//! Tests for TLS/mTLS functionality.
//!
//! These tests verify:
//! - Certificate loading
//! - Server TLS configuration
//! - Role-based authorization over real mTLS connections
//! - Certificate rejection scenarios


use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tonic::Code;

use jobworker::config::TlsConfig;
use jobworker::grpc::JOB_ID_METADATA;
use jobworker::proto::worker_service_client::WorkerServiceClient;
use jobworker::proto::{JobState, QueryRequest, StartRequest, StopRequest, StreamRequest};
use jobworker::tls::{TlsError, TlsIdentity};
use test_harness::{generate_test_certs, tls_config, TestServer};

const WAIT: Duration = Duration::from_secs(5);

fn start_request(process_name: &str, args: &[&str]) -> StartRequest {
    StartRequest {
        process_name: process_name.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
    }
}

async fn wait_for_rpc_state(
    client: &mut WorkerServiceClient<Channel>,
    job_id: &str,
    state: JobState,
) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        let response = client
            .query(QueryRequest {
                job_id: job_id.to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        if response.status == state as i32 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ============================================================================
// Certificate Loading Tests
// ============================================================================

#[tokio::test]
async fn test_load_valid_certificates() {
    let temp_dir = generate_test_certs();
    let result = TlsIdentity::load(&tls_config(temp_dir.path(), "server")).await;
    assert!(result.is_ok(), "Should load valid certificates");
}

#[tokio::test]
async fn test_load_client_certificate() {
    let temp_dir = generate_test_certs();
    let result = TlsIdentity::load(&tls_config(temp_dir.path(), "client_read")).await;
    assert!(result.is_ok(), "Should load client certificates");
}

#[tokio::test]
async fn test_load_nonexistent_node_cert() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();

    let config = TlsConfig::new(
        cert_dir.join("ca.crt"),
        cert_dir.join("missing.crt"),
        cert_dir.join("server.key"),
    );
    let result = TlsIdentity::load(&config).await;
    assert!(matches!(result, Err(TlsError::CertNotFound(_))));
}

#[tokio::test]
async fn test_load_nonexistent_key() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();

    let config = TlsConfig::new(
        cert_dir.join("ca.crt"),
        cert_dir.join("server.crt"),
        cert_dir.join("missing.key"),
    );
    let result = TlsIdentity::load(&config).await;
    assert!(matches!(result, Err(TlsError::KeyNotFound(_))));
}

#[tokio::test]
async fn test_server_config_is_tls13_h2() {
    let temp_dir = generate_test_certs();
    let identity = TlsIdentity::load(&tls_config(temp_dir.path(), "server"))
        .await
        .unwrap();

    let config = identity.server_config().expect("Should build server config");
    assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
}

// ============================================================================
// Authorization over mTLS
// ============================================================================

#[tokio::test]
async fn test_write_client_runs_a_job_end_to_end() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();
    let server = TestServer::start(cert_dir).await;
    let mut client = server.connect(cert_dir, "client_write").await.unwrap();

    let job_id = client
        .start(start_request("echo", &["hello"]))
        .await
        .unwrap()
        .into_inner()
        .job_id;
    assert!(wait_for_rpc_state(&mut client, &job_id, JobState::Success).await);

    let query = client
        .query(QueryRequest {
            job_id: job_id.clone(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(query.exit_code, 0);
    assert!(query.process_id > 0);
    assert!(query.finished_at_ms.unwrap() >= query.started_at_ms);

    let mut stream = client
        .stream(StreamRequest { job_id })
        .await
        .unwrap()
        .into_inner();
    let message = tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("chunk should arrive")
        .expect("stream should be open")
        .unwrap();
    assert_eq!(&message.chunk[..], b"hello\n");

    server.stop().await;
}

#[tokio::test]
async fn test_write_client_stops_a_job() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();
    let server = TestServer::start(cert_dir).await;
    let mut client = server.connect(cert_dir, "client_write").await.unwrap();

    let job_id = client
        .start(start_request("sleep", &["30"]))
        .await
        .unwrap()
        .into_inner()
        .job_id;
    client
        .stop(StopRequest {
            job_id: job_id.clone(),
        })
        .await
        .unwrap();

    // No polling: the stop response implies the terminal status is visible.
    let query = client
        .query(QueryRequest {
            job_id: job_id.clone(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(query.status, JobState::Stopped as i32);
    assert!(query.finished_at_ms.is_some());

    let err = client.stop(StopRequest { job_id }).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    server.stop().await;
}

#[tokio::test]
async fn test_read_client_may_observe_but_not_control() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();
    let server = TestServer::start(cert_dir).await;
    let mut writer = server.connect(cert_dir, "client_write").await.unwrap();
    let mut reader = server.connect(cert_dir, "client_read").await.unwrap();

    let err = reader
        .start(start_request("echo", &["nope"]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert_eq!(err.message(), "unauthorized");
    assert!(server.registry.list().await.is_empty());

    let job_id = writer
        .start(start_request("echo", &["shared"]))
        .await
        .unwrap()
        .into_inner()
        .job_id;
    assert!(wait_for_rpc_state(&mut reader, &job_id, JobState::Success).await);

    let mut stream = reader
        .stream(StreamRequest {
            job_id: job_id.clone(),
        })
        .await
        .unwrap()
        .into_inner();
    let message = tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("chunk should arrive")
        .expect("stream should be open")
        .unwrap();
    assert_eq!(&message.chunk[..], b"shared\n");

    let err = reader.stop(StopRequest { job_id }).await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_role_is_denied_everything() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();
    let server = TestServer::start(cert_dir).await;
    let mut client = server.connect(cert_dir, "client_unknown").await.unwrap();

    let err = client
        .start(start_request("echo", &["x"]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    let job_id = uuid::Uuid::new_v4().to_string();
    let err = client
        .query(QueryRequest {
            job_id: job_id.clone(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    // Streaming calls are denied before any message is produced.
    let err = client.stream(StreamRequest { job_id }).await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert_eq!(err.message(), "unauthorized");

    server.stop().await;
}

#[tokio::test]
async fn test_untrusted_certificate_is_rejected() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();
    let server = TestServer::start(cert_dir).await;

    // Depending on timing the handshake failure surfaces either while
    // connecting or on the first call.
    match server.connect(cert_dir, "client_untrusted").await {
        Err(_) => {}
        Ok(mut client) => {
            let err = client
                .query(QueryRequest {
                    job_id: uuid::Uuid::new_v4().to_string(),
                })
                .await
                .unwrap_err();
            assert_ne!(err.code(), Code::NotFound);
            assert_ne!(err.code(), Code::PermissionDenied);
        }
    }

    server.stop().await;
}

// ============================================================================
// RPC error mapping
// ============================================================================

#[tokio::test]
async fn test_rpc_errors() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();
    let server = TestServer::start(cert_dir).await;
    let mut client = server.connect(cert_dir, "client_write").await.unwrap();

    let err = client
        .query(QueryRequest {
            job_id: uuid::Uuid::new_v4().to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    let err = client
        .query(QueryRequest {
            job_id: "not-a-uuid".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    let err = client.start(start_request("", &[])).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = client
        .start(start_request("/nonexistent/binary", &[]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    let job_id = err
        .metadata()
        .get(JOB_ID_METADATA)
        .expect("failed start carries the job id")
        .to_str()
        .unwrap()
        .to_string();
    let err = client.query(QueryRequest { job_id }).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    server.stop().await;
}

// ============================================================================
// Streaming over RPC
// ============================================================================

#[tokio::test]
async fn test_dropping_a_stream_leaves_the_job_running() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();
    let server = TestServer::start(cert_dir).await;
    let mut client = server.connect(cert_dir, "client_write").await.unwrap();

    let job_id = client
        .start(start_request(
            "bash",
            &["-c", "while true; do echo tick; sleep 0.1; done"],
        ))
        .await
        .unwrap()
        .into_inner()
        .job_id;

    let mut first = client
        .stream(StreamRequest {
            job_id: job_id.clone(),
        })
        .await
        .unwrap()
        .into_inner();
    let mut second = client
        .stream(StreamRequest {
            job_id: job_id.clone(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(tokio::time::timeout(WAIT, first.next()).await.is_ok());
    drop(first);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let query = client
        .query(QueryRequest {
            job_id: job_id.clone(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(query.status, JobState::Running as i32);

    let message = tokio::time::timeout(WAIT, second.next())
        .await
        .expect("other stream keeps receiving")
        .expect("other stream is still open")
        .unwrap();
    assert!(!message.chunk.is_empty());

    client.stop(StopRequest { job_id }).await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_server_shutdown_ends_streams_and_stops_jobs() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();
    let server = TestServer::start(cert_dir).await;
    let mut client = server.connect(cert_dir, "client_write").await.unwrap();

    let job_id = client
        .start(start_request("sleep", &["30"]))
        .await
        .unwrap()
        .into_inner()
        .job_id;
    let mut stream = client
        .stream(StreamRequest { job_id })
        .await
        .unwrap()
        .into_inner();

    let registry = server.registry.clone();
    server.stop().await;

    // The stream ends, cleanly or with a transport error.
    let ended = tokio::time::timeout(WAIT, async {
        while let Some(Ok(_)) = stream.next().await {}
    })
    .await;
    assert!(ended.is_ok());

    let jobs = registry.list().await;
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].status.state.is_terminal());
}

// ============================================================================
// Certificate File Tests
// ============================================================================

#[test]
fn test_cert_generation_script_exists() {
    let script_path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scripts/gen-test-certs.sh");
    assert!(
        script_path.exists(),
        "Certificate generation script should exist"
    );
}

#[test]
fn test_generated_certs_have_correct_files() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();

    let expected_files = [
        "ca.crt",
        "ca.key",
        "server.crt",
        "server.key",
        "client_write.crt",
        "client_write.key",
        "client_read.crt",
        "client_read.key",
        "client_unknown.crt",
        "client_unknown.key",
        "evil_ca.crt",
        "client_untrusted.crt",
        "client_untrusted.key",
    ];

    for file in &expected_files {
        let path = cert_dir.join(file);
        assert!(path.exists(), "Generated cert should include {}", file);
    }
}

#[test]
fn test_client_certs_are_signed_by_ca() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();

    for name in ["server.crt", "client_write.crt", "client_read.crt"] {
        let output = Command::new("openssl")
            .args([
                "verify",
                "-CAfile",
                cert_dir.join("ca.crt").to_str().unwrap(),
                cert_dir.join(name).to_str().unwrap(),
            ])
            .output()
            .expect("Failed to run openssl verify");

        assert!(
            output.status.success(),
            "{} should be signed by CA: {}",
            name,
            String::from_utf8_lossy(&output.stderr)
        );
    }
}

#[test]
fn test_untrusted_cert_is_not_signed_by_ca() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();

    let output = Command::new("openssl")
        .args([
            "verify",
            "-CAfile",
            cert_dir.join("ca.crt").to_str().unwrap(),
            cert_dir.join("client_untrusted.crt").to_str().unwrap(),
        ])
        .output()
        .expect("Failed to run openssl verify");

    assert!(!output.status.success());
}
