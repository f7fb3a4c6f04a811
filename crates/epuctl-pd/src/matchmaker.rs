//! Pure matchmaking rules, kept free of store plumbing so they can be
//! exercised directly.

use epuctl_domain::{EngineSpec, ProcessRecord, ResourceRecord};

/// Pick the resource a process should land on.
///
/// Feasibility: the resource serves the process's engine and, when the
/// process pins a host, lives on that node. Among feasible resources the
/// one with the most free slots wins; ties go to the lowest resource id.
pub fn choose_resource<'a>(
    process: &ProcessRecord,
    resources: &'a [(ResourceRecord, u32)],
    engine: &EngineSpec,
) -> Option<&'a ResourceRecord> {
    let mut best: Option<(&ResourceRecord, u32)> = None;
    for (resource, free) in resources {
        if *free == 0 || resource.engine_id != engine.engine_id {
            continue;
        }
        if let Some(host) = &process.constraints.host {
            if resource.node_id.as_str() != host {
                continue;
            }
        }
        best = match best {
            None => Some((resource, *free)),
            Some((current, current_free)) => {
                if *free > current_free
                    || (*free == current_free && resource.resource_id < current.resource_id)
                {
                    Some((resource, *free))
                } else {
                    Some((current, current_free))
                }
            }
        };
    }
    best.map(|(resource, _)| resource)
}

/// VMs an engine needs to cover `demand` processes:
/// `max(base_need, ceil((demand + spare_slots) / slots))`, clamped to
/// `maximum_vms`.
pub fn compute_need(demand: u32, spec: &EngineSpec) -> u32 {
    let slots = spec.slots.max(1);
    let required = (demand + spec.spare_slots).div_ceil(slots);
    let need = required.max(spec.base_need);
    match spec.maximum_vms {
        Some(maximum) => need.min(maximum),
        None => need,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use epuctl_domain::{
        EngineId, InstanceId, ProcessConstraints, ProcessState, ResourceId, RestartPolicy, Upid,
    };
    use serde_json::{json, Map};

    fn spec(slots: u32, spare: u32, base: u32, maximum: Option<u32>) -> EngineSpec {
        EngineSpec::new(
            EngineId::new("default"),
            "eeagent",
            slots,
            1,
            spare,
            base,
            None,
            maximum,
        )
        .unwrap()
    }

    fn resource(id: &str, engine: &str, slots: u32, used: u32) -> (ResourceRecord, u32) {
        let record = ResourceRecord {
            resource_id: ResourceId::new(id),
            node_id: InstanceId::new(id),
            engine_id: EngineId::new(engine),
            slot_count: slots,
            assigned: (0..used).map(|i| Upid::new(format!("{}-{}", id, i))).collect(),
            enabled: true,
            last_heartbeat: Utc::now(),
            extra: Map::new(),
        };
        let free = record.free_slots();
        (record, free)
    }

    fn process(host: Option<&str>) -> ProcessRecord {
        ProcessRecord {
            upid: Upid::new("p1"),
            definition: json!({}),
            state: ProcessState::Requested,
            constraints: ProcessConstraints {
                engine_id: Some(EngineId::new("default")),
                host: host.map(str::to_string),
                extra: Map::new(),
            },
            assigned_resource: None,
            round: 0,
            restarts_remaining: 3,
            restart_policy: RestartPolicy::Always,
            priority: 0,
            enqueued_at: Some(Utc::now()),
            starved_rounds: 0,
            subscribers: vec![],
            extra: Map::new(),
        }
    }

    #[test]
    fn prefers_most_free_slots() {
        let resources = vec![
            resource("r1", "default", 4, 3),
            resource("r2", "default", 4, 1),
            resource("r3", "default", 4, 2),
        ];
        let chosen = choose_resource(&process(None), &resources, &spec(4, 0, 0, None)).unwrap();
        assert_eq!(chosen.resource_id.as_str(), "r2");
    }

    #[test]
    fn tie_breaks_on_lowest_resource_id() {
        let resources = vec![
            resource("r9", "default", 4, 0),
            resource("r2", "default", 4, 0),
        ];
        let chosen = choose_resource(&process(None), &resources, &spec(4, 0, 0, None)).unwrap();
        assert_eq!(chosen.resource_id.as_str(), "r2");
    }

    #[test]
    fn filters_engine_full_and_host() {
        let resources = vec![
            resource("other-engine", "bigmem", 4, 0),
            resource("full", "default", 2, 2),
            resource("r1", "default", 4, 0),
        ];
        let chosen = choose_resource(&process(None), &resources, &spec(4, 0, 0, None)).unwrap();
        assert_eq!(chosen.resource_id.as_str(), "r1");

        let pinned = process(Some("full"));
        assert!(choose_resource(&pinned, &resources, &spec(4, 0, 0, None)).is_none());

        let pinned = process(Some("r1"));
        let chosen = choose_resource(&pinned, &resources, &spec(4, 0, 0, None)).unwrap();
        assert_eq!(chosen.resource_id.as_str(), "r1");
    }

    #[test]
    fn need_formula_matches_contract() {
        // max(base_need, ceil((demand + spare)/slots)), clamped
        assert_eq!(compute_need(0, &spec(4, 0, 1, None)), 1);
        assert_eq!(compute_need(0, &spec(4, 0, 0, None)), 0);
        assert_eq!(compute_need(1, &spec(4, 0, 0, None)), 1);
        assert_eq!(compute_need(5, &spec(4, 0, 0, None)), 2);
        assert_eq!(compute_need(5, &spec(4, 2, 0, None)), 2);
        assert_eq!(compute_need(7, &spec(4, 2, 0, None)), 3);
        assert_eq!(compute_need(100, &spec(4, 0, 0, Some(10))), 10);
        assert_eq!(compute_need(0, &spec(4, 0, 5, Some(3))), 3);
    }
}
