use std::sync::Arc;
use std::time::Duration;

use epuctl_store::{Elector, LeaderStatus, Role};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::core::ProvisionerCore;
use crate::error::ProvisionerError;

/// The provisioner's long-lived doer task.
///
/// Joins the `provisioner_doer` election; while leading, runs a recovery
/// pass and then a query/retry tick. On loss of leadership all writes stop
/// at the next suspension point and the task waits to be re-elected.
pub async fn run_provisioner_doer(
    core: Arc<ProvisionerCore>,
    elector: Arc<dyn Elector>,
    tick_interval: Duration,
) -> Result<(), ProvisionerError> {
    let handle = elector.join(Role::ProvisionerDoer).await?;
    let mut status = handle.subscribe();

    loop {
        while *status.borrow() != LeaderStatus::Leader {
            if status.changed().await.is_err() {
                return Ok(());
            }
        }
        info!("provisioner doer acquired leadership");

        if let Err(e) = core.recover().await {
            error!(error = %e, "recovery pass failed");
        }

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *status.borrow() != LeaderStatus::Leader {
                        break;
                    }
                    core.query().await;
                    if let Err(e) = core.retry_parked_nodes().await {
                        error!(error = %e, "retry pass failed");
                    }
                    if let Err(e) = core.resume_node_terminations().await {
                        error!(error = %e, "termination resume failed");
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    if *status.borrow() != LeaderStatus::Leader {
                        warn!("provisioner doer lost leadership, standing down");
                        break;
                    }
                }
            }
        }
    }
}
