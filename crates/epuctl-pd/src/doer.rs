use std::sync::Arc;
use std::time::Duration;

use epuctl_store::{Elector, LeaderStatus, Role};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::core::PdCore;
use crate::error::PdError;

/// The dispatcher's long-lived doer task: scheduler passes while leading.
pub async fn run_pd_doer(
    core: Arc<PdCore>,
    elector: Arc<dyn Elector>,
    tick_interval: Duration,
) -> Result<(), PdError> {
    let handle = elector.join(Role::PdDoer).await?;
    let mut status = handle.subscribe();

    loop {
        while *status.borrow() != LeaderStatus::Leader {
            if status.changed().await.is_err() {
                return Ok(());
            }
        }
        info!("pd doer acquired leadership");

        if let Err(e) = core.recover().await {
            error!(error = %e, "pd recovery failed");
        }

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *status.borrow() != LeaderStatus::Leader {
                        break;
                    }
                    core.tick().await;
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    if *status.borrow() != LeaderStatus::Leader {
                        warn!("pd doer lost leadership, standing down");
                        break;
                    }
                }
            }
        }
    }
}
