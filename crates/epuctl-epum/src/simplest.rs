use epuctl_domain::{InstanceId, InstanceState};
use serde_json::Value;
use tracing::debug;

use crate::engine::{Action, DecisionEngine, DomainView};
use crate::error::EpumError;

pub const ENGINE_NAME: &str = "simplest";

/// The default decision engine: keep `preserve_n` instances alive.
///
/// Failed instances are terminated and replaced on the same tick's count;
/// surplus healthy instances are culled cheapest-first (the ones that are
/// not yet real VMs go before started ones).
#[derive(Debug, Default)]
pub struct SimplestEngine {
    preserve_n: u32,
}

fn read_preserve_n(conf: &Value) -> Result<Option<u32>, EpumError> {
    match conf.get("preserve_n") {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as u32))
            .ok_or_else(|| {
                EpumError::InvalidConfig(format!("preserve_n must be a non-negative integer, got {}", value))
            }),
    }
}

impl DecisionEngine for SimplestEngine {
    fn initialize(&mut self, conf: &Value) -> Result<(), EpumError> {
        self.preserve_n = read_preserve_n(conf)?.unwrap_or(0);
        Ok(())
    }

    fn decide(&mut self, view: &DomainView) -> Vec<Action> {
        let mut actions = Vec::new();

        // Dead instances are terminated and the count below replaces them.
        let failed: Vec<InstanceId> = view
            .instances
            .iter()
            .filter(|i| i.state == InstanceState::Failed)
            .map(|i| i.instance_id.clone())
            .collect();
        if !failed.is_empty() {
            actions.push(Action::Terminate { instance_ids: failed });
        }

        let mut alive: Vec<_> = view
            .instances
            .iter()
            .filter(|i| i.state <= InstanceState::Running)
            .collect();
        let count = alive.len() as u32;

        if count < self.preserve_n {
            debug!(
                domain_id = %view.domain.domain_id,
                count,
                preserve_n = self.preserve_n,
                "below target, launching"
            );
            actions.push(Action::Launch { count: self.preserve_n - count });
        } else if count > self.preserve_n {
            // cheapest first: REQUESTED before PENDING before STARTED,
            // oldest within a band
            alive.sort_by(|a, b| {
                a.state
                    .cmp(&b.state)
                    .then_with(|| a.pending_timestamp.cmp(&b.pending_timestamp))
            });
            let surplus = (count - self.preserve_n) as usize;
            let instance_ids: Vec<InstanceId> =
                alive.iter().take(surplus).map(|i| i.instance_id.clone()).collect();
            debug!(
                domain_id = %view.domain.domain_id,
                count,
                preserve_n = self.preserve_n,
                ?instance_ids,
                "above target, terminating surplus"
            );
            actions.push(Action::Terminate { instance_ids });
        }

        actions
    }

    fn reconfigure(&mut self, patch: &Value) -> Result<(), EpumError> {
        if let Some(preserve_n) = read_preserve_n(patch)? {
            self.preserve_n = preserve_n;
        }
        Ok(())
    }
}
