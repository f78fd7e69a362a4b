//! Periodic CA maintenance.
//!
//! Retries initialization until it succeeds, keeps secondaries in sync
//! with the primary's roots and renews the signing intermediate once it
//! reaches its renewal deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, error, info, warn};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use crate::commons::error::Error;
use crate::commons::CaResult;
use super::manager::{CaManager, CaState};


//------------ RenewalScheduler ----------------------------------------------

pub struct RenewalScheduler {
    manager: Arc<CaManager>,
    interval: Duration,
}

impl RenewalScheduler {
    pub fn new(manager: Arc<CaManager>, interval: Duration) -> Self {
        RenewalScheduler { manager, interval }
    }

    /// Runs until `ctx` is cancelled.
    ///
    /// The first tick happens right away. A tick that is still running when
    /// the next one is due causes that one to be skipped.
    pub async fn run(self, ctx: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Starting CA maintenance for datacenter '{}' every {:?}",
            self.manager.datacenter(), self.interval
        );
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("Stopping CA maintenance");
                    return
                }
                _ = interval.tick() => {
                    let started = Instant::now();
                    self.tick(&ctx).await;
                    if started.elapsed() > self.interval {
                        warn!(
                            "CA maintenance took longer than {:?}, will skip \
                             and try again at the next interval",
                            self.interval
                        );
                    }
                }
            }
        }
    }

    /// Runs one round of maintenance. Only the leader does any work.
    pub async fn tick(&self, ctx: &CancellationToken) {
        if !self.manager.is_leader() {
            debug!("Not the leader, skipping CA maintenance");
            return
        }
        if let Err(e) = self.run_once(ctx).await {
            match e {
                Error::Busy(state) => {
                    debug!(
                        "CA manager busy in state {}, will try again later",
                        state
                    );
                }
                Error::Cancelled => debug!("CA maintenance cancelled"),
                e => error!("CA maintenance failed: {}", e),
            }
        }
    }

    async fn run_once(&self, ctx: &CancellationToken) -> CaResult<()> {
        if self.manager.state() == CaState::Uninitialized {
            return self.manager.initialize(ctx).await
        }
        if !self.manager.is_primary() {
            self.manager.update_roots_from_primary(ctx).await?;
        }
        self.manager.renew_intermediate(ctx, false).await
    }
}
