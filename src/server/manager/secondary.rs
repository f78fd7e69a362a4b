//! CA operations in secondary datacenters.
//!
//! A secondary has no root of its own. It uses the primary's active root
//! and gets its leaf signing intermediate signed by the primary.

use log::{debug, info};
use tokio_util::sync::CancellationToken;
use crate::api::ca::cluster_id_from_trust_domain;
use crate::api::{CaConfiguration, CaRequest, CaRoot, IndexedCaRoots};
use crate::commons::error::Error;
use crate::commons::CaResult;
use super::{
    provider_state, same_pem, with_active_root, ActiveCa, CaManager,
};

impl CaManager {
    /// Returns the active root of the primary and its cluster id.
    async fn primary_active_root(
        &self,
    ) -> CaResult<(IndexedCaRoots, CaRoot, String)> {
        let roots = self.forward_roots().await?;
        let active = roots.active()
            .cloned()
            .ok_or_else(|| {
                Error::PrimaryNoActiveRoot(self.primary_datacenter().into())
            })?;
        let cluster_id = cluster_id_from_trust_domain(&roots.trust_domain)
            .ok_or_else(|| Error::invalid_config(format!(
                "primary datacenter has unrecognized trust domain '{}'",
                roots.trust_domain
            )))?
            .to_string();
        Ok((roots, active, cluster_id))
    }

    /// Returns the configuration to use with the primary's cluster id and
    /// whether it needs to be stored.
    fn secondary_config(
        &self,
        cluster_id: String,
    ) -> CaResult<(CaConfiguration, bool)> {
        let (mut config, mut store) = match self.state.ca_config()? {
            Some(config) => (config, false),
            None => (self.settings.bootstrap.clone(), true),
        };
        if config.cluster_id != cluster_id {
            config.cluster_id = cluster_id;
            store = true;
        }
        Ok((config, store))
    }

    pub(super) async fn initialize_secondary(
        &self,
        ctx: &CancellationToken,
    ) -> CaResult<()> {
        self.state.servers_support_multi_dc_ca()?;
        let (primary_roots, primary_active, cluster_id) =
            self.primary_active_root().await?;

        let (config, store_config) = self.secondary_config(cluster_id)?;
        let provider = self.configure_provider(&config, false)?;

        let (index, stored_roots) = self.state.ca_roots()?;
        let stored_active = stored_roots.iter().find(|root| root.active);
        if let (Some(stored), Some(current)) =
            (stored_active, provider.active_intermediate()?)
        {
            if stored.id == primary_active.id
                && same_pem(&current, stored.signing_cert())
                && !store_config
            {
                info!(
                    "CA in secondary datacenter '{}' already initialized",
                    self.datacenter()
                );
                self.set_active(provider, stored.clone(), config);
                return Ok(())
            }
        }

        self.check_cancelled(ctx)?;
        let intermediate = self.derive_intermediate(
            ctx, provider.as_ref(), &primary_active.root_cert
        ).await?;

        let mut root = primary_active;
        root.push_intermediate(&intermediate)?;
        let roots = with_active_root(
            primary_roots.roots, root.clone(), self.now()
        );

        self.check_cancelled(ctx)?;
        let root = self.commit_roots(
            CaRequest::SetRoots {
                index,
                roots,
                config: store_config.then(|| config.clone()),
                provider_state: provider_state(provider.as_ref())?,
            },
            &root.id
        ).await?;

        info!(
            "Initialized CA in secondary datacenter '{}' under root {}",
            self.datacenter(), root.id
        );
        self.set_active(provider, root, config);
        Ok(())
    }

    pub(super) async fn update_secondary(
        &self,
        ctx: &CancellationToken,
        active: &ActiveCa,
        stored: &CaConfiguration,
        config: CaConfiguration,
    ) -> CaResult<()> {
        self.state.servers_support_multi_dc_ca()?;
        let type_changed = config.provider != stored.provider;
        let provider = self.configure_provider(&config, type_changed)?;

        self.check_cancelled(ctx)?;
        let intermediate = self.derive_intermediate(
            ctx, provider.as_ref(), &active.root.root_cert
        ).await?;

        let (index, roots, root) = self.extend_active_root(
            &active.root, &intermediate
        )?;

        self.check_cancelled(ctx)?;
        let root = self.commit_roots(
            CaRequest::SetRoots {
                index,
                roots,
                config: Some(config.clone()),
                provider_state: provider_state(provider.as_ref())?,
            },
            &root.id
        ).await?;

        info!(
            "Updated CA configuration for secondary datacenter '{}'",
            self.datacenter()
        );
        self.set_active(provider, root, config.clone());
        self.cleanup_provider(active.provider.as_ref(), stored, &config).await;
        Ok(())
    }

    pub(super) async fn secondary_update_roots(
        &self,
        ctx: &CancellationToken,
    ) -> CaResult<()> {
        self.state.servers_support_multi_dc_ca()?;
        let active = self.snapshot()?;
        let (primary_roots, primary_active, _) =
            self.primary_active_root().await?;

        if primary_active.id == active.root.id {
            debug!(
                "Primary root unchanged for datacenter '{}'",
                self.datacenter()
            );
            return Ok(())
        }

        info!(
            "Primary datacenter rotated root from {} to {}, renewing \
             intermediate for datacenter '{}'",
            active.root.id, primary_active.id, self.datacenter()
        );
        self.check_cancelled(ctx)?;
        let provider = self.configure_provider(&active.config, false)?;
        let intermediate = self.derive_intermediate(
            ctx, provider.as_ref(), &primary_active.root_cert
        ).await?;

        let (index, _) = self.state.ca_roots()?;
        let mut root = primary_active;
        root.push_intermediate(&intermediate)?;
        let roots = with_active_root(
            primary_roots.roots, root.clone(), self.now()
        );

        self.check_cancelled(ctx)?;
        let root = self.commit_roots(
            CaRequest::SetRoots {
                index,
                roots,
                config: None,
                provider_state: provider_state(provider.as_ref())?,
            },
            &root.id
        ).await?;

        self.set_active(provider, root, active.config.clone());
        Ok(())
    }
}
