use crate::engines::*;
use crate::ids::*;
use crate::records::*;
use crate::states::*;

#[test]
fn instance_state_wire_form() {
    assert_eq!(InstanceState::Running.to_string(), "600-RUNNING");
    assert_eq!(InstanceState::ErrorRetrying.to_string(), "300-ERROR_RETRYING");

    let json = serde_json::to_string(&InstanceState::Pending).unwrap();
    assert_eq!(json, "\"400-PENDING\"");
    let back: InstanceState = serde_json::from_str("\"850-FAILED\"").unwrap();
    assert_eq!(back, InstanceState::Failed);
}

#[test]
fn instance_state_parse_round_trip() {
    let s: InstanceState = "700-TERMINATING".parse().unwrap();
    assert_eq!(s, InstanceState::Terminating);
    assert!("TERMINATING".parse::<InstanceState>().is_err());
}

#[test]
fn instance_state_ordering_follows_codes() {
    assert!(InstanceState::Requested < InstanceState::Pending);
    assert!(InstanceState::Pending < InstanceState::Started);
    assert!(InstanceState::Terminated < InstanceState::Failed);
}

#[test]
fn transitions_monotonic_except_retry_edge() {
    assert!(InstanceState::Requested.can_transition(InstanceState::Pending));
    assert!(InstanceState::Pending.can_transition(InstanceState::Pending));
    assert!(!InstanceState::Started.can_transition(InstanceState::Requested));
    // the one documented backwards edge
    assert!(InstanceState::ErrorRetrying.can_transition(InstanceState::Requested));
    assert!(!InstanceState::ErrorRetrying.can_transition(InstanceState::Requesting));
}

#[test]
fn process_state_activity() {
    assert!(ProcessState::Requested.is_active());
    assert!(ProcessState::Running.is_active());
    assert!(!ProcessState::Exited.is_active());
    assert!(ProcessState::Failed.is_terminal());
}

#[test]
fn domain_id_helpers_validate() {
    let engine = EngineId::new("default");
    let domain = domain_id_from_engine(&engine).unwrap();
    assert_eq!(domain.as_str(), "pd_domain_default");
    assert_eq!(engine_id_from_domain(&domain).unwrap(), engine);

    assert!(engine_id_from_domain(&DomainId::new("dom1")).is_err());
    assert!(engine_id_from_domain(&DomainId::new("pd_domain_")).is_err());
    assert!(domain_id_from_engine(&EngineId::new("")).is_err());
}

#[test]
fn engine_spec_validation() {
    assert!(EngineSpec::new(EngineId::new("a"), "dt", 0, 1, 0, 0, None, None).is_err());
    assert!(EngineSpec::new(EngineId::new("a"), "dt", 1, 0, 0, 0, None, None).is_err());
    assert!(EngineSpec::new(EngineId::new("a"), "dt", 4, 1, 0, 1, None, Some(10)).is_ok());
}

#[test]
fn registry_default_fallback() {
    let default = EngineSpec::new(EngineId::new("default"), "eeagent", 4, 1, 0, 1, None, None)
        .unwrap();
    let registry =
        EngineRegistry::from_specs([default], Some(EngineId::new("default"))).unwrap();

    let spec = registry.get(&EngineId::new("no-such-engine")).unwrap();
    assert_eq!(spec.engine_id.as_str(), "default");
    assert!(registry.get_exact(&EngineId::new("no-such-engine")).is_none());
}

#[test]
fn registry_rejects_duplicates_and_missing_default() {
    let spec = EngineSpec::new(EngineId::new("a"), "dt", 4, 1, 0, 0, None, None).unwrap();
    let mut registry = EngineRegistry::new(None);
    registry.add(spec.clone()).unwrap();
    assert!(registry.add(spec).is_err());

    let spec = EngineSpec::new(EngineId::new("a"), "dt", 4, 1, 0, 0, None, None).unwrap();
    assert!(EngineRegistry::from_specs([spec], Some(EngineId::new("b"))).is_err());

    let empty = EngineRegistry::new(None);
    assert!(empty.get(&EngineId::new("a")).is_err());
}

#[test]
fn records_preserve_unknown_fields() {
    let json = serde_json::json!({
        "instance_id": "i-1",
        "launch_id": "l-1",
        "site": "site1",
        "state": "200-REQUESTED",
        "allocation": null,
        "deployable_type": null,
        "domain_id": null,
        "state_desc": null,
        "iaas_id": null,
        "public_ip": null,
        "private_ip": null,
        "last_heartbeat": null,
        "pending_timestamp": null,
        "running_timestamp": null,
        "terminated_timestamp": null,
        "creator": null,
        "some_future_field": {"nested": true},
    });

    let record: InstanceRecord = serde_json::from_value(json).unwrap();
    assert_eq!(record.state, InstanceState::Requested);
    assert_eq!(record.extra["some_future_field"]["nested"], true);

    let back = serde_json::to_value(&record).unwrap();
    assert_eq!(back["some_future_field"]["nested"], true);
}

#[test]
fn resource_free_slots_saturate() {
    let mut resource = ResourceRecord {
        resource_id: ResourceId::new("r1"),
        node_id: InstanceId::new("n1"),
        engine_id: EngineId::new("default"),
        slot_count: 2,
        assigned: vec![Upid::new("p1"), Upid::new("p2"), Upid::new("p3")],
        enabled: true,
        last_heartbeat: chrono::Utc::now(),
        extra: serde_json::Map::new(),
    };
    assert_eq!(resource.free_slots(), 0);
    resource.assigned.truncate(1);
    assert_eq!(resource.free_slots(), 1);
}
