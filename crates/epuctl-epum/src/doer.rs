use std::sync::Arc;
use std::time::Duration;

use epuctl_store::{Elector, LeaderStatus, Role};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::error::EpumError;
use crate::manager::EpuManagement;

/// The EPUM long-lived doer task: decision ticks while leading.
pub async fn run_epum_doer(
    manager: Arc<EpuManagement>,
    elector: Arc<dyn Elector>,
    tick_interval: Duration,
) -> Result<(), EpumError> {
    let handle = elector.join(Role::EpumDoer).await?;
    let mut status = handle.subscribe();

    loop {
        while *status.borrow() != LeaderStatus::Leader {
            if status.changed().await.is_err() {
                return Ok(());
            }
        }
        info!("epum doer acquired leadership");

        if let Err(e) = manager.recover().await {
            error!(error = %e, "epum recovery failed");
        }

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *status.borrow() != LeaderStatus::Leader {
                        break;
                    }
                    manager.tick().await;
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    if *status.borrow() != LeaderStatus::Leader {
                        warn!("epum doer lost leadership, standing down");
                        break;
                    }
                }
            }
        }
    }
}
