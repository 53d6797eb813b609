use super::*;
use crate::transport::DecodeFailurePolicy;

#[test]
fn backend_kind_names_are_stable() {
    assert_eq!(BackendKind::Sqs.as_str(), "sqs");
    assert_eq!(BackendKind::Stomp.as_str(), "stomp");
    assert_eq!(BackendKind::Memory.as_str(), "memory");
    assert_eq!(format!("{}", BackendKind::Stomp), "stomp");
}

#[test]
fn backend_kind_serializes_as_variant_name() {
    let json = serde_json::to_string(&BackendKind::Sqs).unwrap();
    assert_eq!(json, "\"Sqs\"");
    let parsed: BackendKind = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, BackendKind::Sqs);
}

#[test]
fn sqs_config_round_trips_through_json() {
    let config = SqsConfig {
        region: "eu-west-1".to_string(),
        access_key_id: Some("AKIAEXAMPLE".to_string()),
        secret_access_key: Some("secret".to_string()),
    };
    let json = serde_json::to_string(&config).unwrap();
    let parsed: SqsConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.region, "eu-west-1");
    assert_eq!(parsed.access_key_id.as_deref(), Some("AKIAEXAMPLE"));
}

#[test]
fn stomp_config_round_trips_through_json() {
    let config = StompConfig {
        host: "broker.internal".to_string(),
        port: 61614,
        login: None,
        passcode: None,
        use_tls: true,
    };
    let json = serde_json::to_string(&config).unwrap();
    let parsed: StompConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.host, "broker.internal");
    assert_eq!(parsed.port, 61614);
    assert!(parsed.use_tls);
    assert!(parsed.login.is_none());
}

#[test]
fn memory_config_defaults() {
    let config = MemoryConfig::default();
    assert_eq!(config.max_queue_size, 10000);
    assert_eq!(config.receive_batch, 10);
    assert!(config.concurrent_dispatch);
    assert_eq!(config.decode_failure, DecodeFailurePolicy::SkipMessage);
}
