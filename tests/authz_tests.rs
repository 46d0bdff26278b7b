
use std::path::Path;
use std::sync::Arc;

use jobworker::authz::{methods, roles_from_certificate, AuthorizationGate, PolicyStore};
use jobworker::config::WorkerConfig;
use test_harness::generate_test_certs;

fn leaf_der(path: &Path) -> Vec<u8> {
    let pem = std::fs::read(path).unwrap();
    let cert = rustls_pemfile::certs(&mut pem.as_slice())
        .next()
        .expect("file holds a certificate")
        .unwrap();
    cert.to_vec()
}

#[test]
fn test_roles_come_from_dns_sans() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();

    let roles = roles_from_certificate(&leaf_der(&cert_dir.join("client_write.crt"))).unwrap();
    assert_eq!(roles, vec!["write".to_string()]);

    let roles = roles_from_certificate(&leaf_der(&cert_dir.join("client_read.crt"))).unwrap();
    assert_eq!(roles, vec!["read".to_string()]);
}

#[test]
fn test_ip_sans_are_not_roles() {
    let temp_dir = generate_test_certs();

    let roles =
        roles_from_certificate(&leaf_der(&temp_dir.path().join("server.crt"))).unwrap();
    assert_eq!(roles, vec!["localhost".to_string()]);
}

#[test]
fn test_ca_without_san_has_no_roles() {
    let temp_dir = generate_test_certs();

    let roles = roles_from_certificate(&leaf_der(&temp_dir.path().join("ca.crt"))).unwrap();
    assert!(roles.is_empty());
}

#[test]
fn test_certificate_roles_against_default_policy() {
    let temp_dir = generate_test_certs();
    let cert_dir = temp_dir.path();
    let gate = AuthorizationGate::new(Arc::new(PolicyStore::default()));

    let writer = roles_from_certificate(&leaf_der(&cert_dir.join("client_write.crt"))).unwrap();
    let reader = roles_from_certificate(&leaf_der(&cert_dir.join("client_read.crt"))).unwrap();
    let nobody = roles_from_certificate(&leaf_der(&cert_dir.join("client_unknown.crt"))).unwrap();

    for method in methods::ALL {
        assert!(gate.authorize(method, &writer).is_ok());
        assert!(gate.authorize(method, &nobody).is_err());
    }
    assert!(gate.authorize(methods::QUERY, &reader).is_ok());
    assert!(gate.authorize(methods::STREAM, &reader).is_ok());
    assert!(gate.authorize(methods::START, &reader).is_err());
    assert!(gate.authorize(methods::STOP, &reader).is_err());
}

#[test]
fn test_policy_from_config_file() {
    let config = WorkerConfig::from_toml_str(
        r#"
        [policy.roles]
        read = ["read"]
        operator = ["read", "control"]

        [policy.methods]
        "/worker.WorkerService/Start" = ["control"]
        "/worker.WorkerService/Stop" = ["control"]
        "/worker.WorkerService/Query" = ["read"]
        "/worker.WorkerService/Stream" = ["read"]
        "#,
    )
    .unwrap();
    let gate = AuthorizationGate::new(Arc::new(config.policy));

    assert!(gate.authorize(methods::START, &["operator"]).is_ok());
    assert!(gate.authorize(methods::STREAM, &["operator"]).is_ok());
    assert!(gate.authorize(methods::START, &["read"]).is_err());
    // Roles from the built-in table are gone.
    assert!(gate.authorize(methods::START, &["write"]).is_err());
}
