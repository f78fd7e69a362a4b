//! Starting the daemon.

use std::sync::Arc;
use log::{error, info};
use tokio::select;
use tokio_util::sync::CancellationToken;
use crate::commons::error::Error;
use crate::config::Config;
use super::endpoint::ConnectCaEndpoint;
use super::manager::CaManagerBuilder;
use super::router::DatacenterRouter;
use super::scheduler::RenewalScheduler;
use super::store::MemoryStore;


/// Runs a single datacenter CA until interrupted.
///
/// The replicated state is kept in memory, so the daemon can only serve as
/// its own primary.
pub async fn start_meshca_daemon(config: Arc<Config>) -> Result<(), Error> {
    let settings = config.manager_settings();
    if !settings.is_primary() {
        return Err(Error::invalid_config(format!(
            "datacenter '{}' cannot reach primary datacenter '{}'",
            settings.datacenter, settings.primary_datacenter
        )))
    }

    let store = Arc::new(MemoryStore::new());
    let router = DatacenterRouter::new();
    let manager = Arc::new(
        CaManagerBuilder::new(settings, store, router.clone()).build()
    );
    router.register(
        manager.datacenter().to_string(),
        ConnectCaEndpoint::new(manager.clone()),
    );

    let ctx = CancellationToken::new();
    manager.initialize(&ctx).await?;
    if let Some(root) = manager.active_root() {
        info!(
            "Serving CA for datacenter '{}' with root {}",
            manager.datacenter(), root
        );
    }

    let scheduler = RenewalScheduler::new(
        manager.clone(), config.intermediate_cert_renew_interval
    );
    let scheduler_future = tokio::spawn(scheduler.run(ctx.clone()));

    select!(
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("Cannot listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            ctx.cancel();
        }
        _ = scheduler_future => error!("scheduler stopped unexpectedly"),
    );
    Ok(())
}
