use super::types::*;
use super::Config;
use std::path::Path;

#[test]
fn test_load_missing_file_uses_defaults() {
    let cfg = Config::load(Path::new("does-not-exist.toml")).unwrap();
    assert_eq!(cfg.traffic.id, "steerd");
    assert_eq!(cfg.traffic.cluster, "xds");
    assert!(!cfg.traffic.upstreams.is_empty());
}

#[test]
fn test_load_toml_config() {
    let toml = r#"
        [traffic]
        upstreams = ["grpc://10.0.0.1:18000", "grpc://10.0.0.2:18000"]
        id = "test-id"
        cluster = "mgmt"
        origins = ["lb.example.org."]
        ignore_health = true
        localities = ["us-east-1,us-east-1a"]
    "#;
    let tmp = std::env::temp_dir().join("steerd_test_config.toml");
    std::fs::write(&tmp, toml).unwrap();
    let cfg = Config::load(&tmp).unwrap();
    assert_eq!(cfg.traffic.upstreams.len(), 2);
    assert_eq!(cfg.traffic.id, "test-id");
    assert_eq!(cfg.traffic.cluster, "mgmt");
    assert_eq!(cfg.traffic.origins, vec!["lb.example.org.".to_string()]);
    assert!(cfg.traffic.ignore_health);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_validate_missing_scheme_fails() {
    let cfg = Config {
        traffic: TrafficConfig {
            upstreams: vec!["127.0.0.1:18000".into()],
            ..TrafficConfig::default()
        },
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_empty_upstreams_fails() {
    let cfg = Config {
        traffic: TrafficConfig {
            upstreams: vec![],
            ..TrafficConfig::default()
        },
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_key_without_cert_fails() {
    let cfg = Config {
        traffic: TrafficConfig {
            tls: Some(TlsConfig {
                key: Some("key.pem".into()),
                ..TlsConfig::default()
            }),
            ..TrafficConfig::default()
        },
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_bad_locality_fails() {
    let cfg = Config {
        traffic: TrafficConfig {
            localities: vec!["us-east-1,,a".into()],
            ..TrafficConfig::default()
        },
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_locality_parse() {
    let loc = Locality::parse("us-east-1,us-east-1a,rack-7").unwrap();
    assert_eq!(loc.region, "us-east-1");
    assert_eq!(loc.zone, "us-east-1a");
    assert_eq!(loc.sub_zone, "rack-7");

    let loc = Locality::parse("eu-west-2").unwrap();
    assert_eq!(loc.region, "eu-west-2");
    assert!(loc.zone.is_empty());
    assert!(loc.sub_zone.is_empty());

    assert!(Locality::parse("").is_err());
    assert!(Locality::parse("region,").is_err());
    assert!(Locality::parse("a,b,c,d").is_err());
}
