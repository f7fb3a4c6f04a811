use epuctl_config::{load_config, parse_config, PersistenceType};
use epuctl_domain::EngineId;
use std::io::Write;

const BASIC: &str = r#"
default_user: default
tick_interval: 2
default_site: fake
default_engine: default
engines:
  default:
    deployable_type: eeagent
    slots: 4
    base_need: 1
  bigmem:
    deployable_type: eeagent-bigmem
    slots: 2
    spare_slots: 1
    iaas_allocation: m1.large
    maximum_vms: 10
"#;

#[test]
fn parse_basic_config() {
    let config = parse_config(BASIC).expect("should parse without error");
    assert_eq!(config.persistence_type, PersistenceType::Memory);
    assert_eq!(config.default_user, "default");
    assert_eq!(config.tick_interval.as_secs(), 2);
    assert_eq!(config.heartbeat_timeout.as_secs(), 60, "default applies");
    assert_eq!(config.engines.len(), 2);

    let registry = config.engine_registry().unwrap();
    let spec = registry.get(&EngineId::new("default")).unwrap();
    assert_eq!(spec.slots, 4);
    assert_eq!(spec.base_need, 1);

    let bigmem = registry.get(&EngineId::new("bigmem")).unwrap();
    assert_eq!(bigmem.maximum_vms, Some(10));
    assert_eq!(bigmem.iaas_allocation.as_deref(), Some("m1.large"));

    // unknown engines fall back to the declared default
    let fallback = registry.get(&EngineId::new("missing")).unwrap();
    assert_eq!(fallback.engine_id.as_str(), "default");
}

#[test]
fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("epuctl.yml");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(BASIC.as_bytes()).unwrap();

    let config = load_config(&path).expect("should load without error");
    assert_eq!(config.default_site.as_ref().map(|s| s.as_str()), Some("fake"));
}

#[test]
fn missing_file_returns_error() {
    let path = std::path::Path::new("/nonexistent/path/does/not/exist.yml");
    assert!(load_config(path).is_err());
}

#[test]
fn coordination_requires_hosts() {
    let err = parse_config("persistence_type: coordination\n").unwrap_err();
    assert!(err.to_string().contains("coordination_hosts"));

    let config = parse_config(
        "persistence_type: coordination\ncoordination_hosts: [\"127.0.0.1:2379\"]\n",
    )
    .unwrap();
    assert_eq!(config.persistence_type, PersistenceType::Coordination);
    assert_eq!(config.coordination_path, "/epuctl");
}

#[test]
fn replicas_require_coordination() {
    let err = parse_config("replica_count: 3\n").unwrap_err();
    assert!(err.to_string().contains("coordination"));
}

#[test]
fn invalid_values_are_rejected() {
    assert!(parse_config("persistence_type: sqlite\n").is_err());
    assert!(parse_config("engines:\n  bad:\n    deployable_type: dt\n    slots: 0\n").is_err());
    assert!(parse_config("default_engine: ghost\n").is_err());
}
