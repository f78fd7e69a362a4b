//! CA operations in the primary datacenter.

use log::{info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::api::{CaConfiguration, CaRequest, CaRoot};
use crate::commons::crypto::{self, SpiffeId};
use crate::commons::error::Error;
use crate::commons::CaResult;
use super::{
    provider_state, same_pem, with_active_root, ActiveCa, CaManager,
};

impl CaManager {
    /// Returns the configuration to initialize with and whether it needs
    /// to be stored.
    fn primary_config(&self) -> CaResult<(CaConfiguration, bool)> {
        let (mut config, mut store) = match self.state.ca_config()? {
            Some(config) => (config, false),
            None => (self.settings.bootstrap.clone(), true),
        };
        if config.cluster_id.is_empty() {
            config.cluster_id = Uuid::new_v4().to_string();
            info!("Generated new cluster id {}", config.cluster_id);
            store = true;
        }
        Ok((config, store))
    }

    pub(super) async fn initialize_primary(
        &self,
        ctx: &CancellationToken,
    ) -> CaResult<()> {
        let (config, store_config) = self.primary_config()?;
        let provider = self.configure_provider(&config, false)?;
        let root_pem = provider.generate_root()?.pem;
        let new_root = CaRoot::from_root_pem(&root_pem)?;

        let (index, roots) = self.state.ca_roots()?;
        let stored_active = roots.iter()
            .find(|root| root.active && root.id == new_root.id)
            .cloned();

        if let Some(active) = stored_active.as_ref() {
            let current = provider.active_intermediate()?;
            let up_to_date = current
                .map(|pem| same_pem(&pem, active.signing_cert()))
                .unwrap_or(false);
            if up_to_date && !store_config {
                info!(
                    "CA in datacenter '{}' already initialized with root {}",
                    self.datacenter(), active.id
                );
                self.set_active(provider, active.clone(), config);
                return Ok(())
            }
        }

        self.check_cancelled(ctx)?;
        let intermediate = provider.generate_intermediate()?;
        let mut root = stored_active.unwrap_or(new_root);
        root.prune_expired_intermediates(self.now());
        root.push_intermediate(&intermediate)?;
        let roots = with_active_root(roots, root.clone(), self.now());

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
            "Initialized CA in primary datacenter '{}' with root {}",
            self.datacenter(), root.id
        );
        self.set_active(provider, root, config);
        Ok(())
    }

    pub(super) async fn update_primary(
        &self,
        ctx: &CancellationToken,
        active: &ActiveCa,
        stored: &CaConfiguration,
        config: CaConfiguration,
    ) -> CaResult<()> {
        let type_changed = config.provider != stored.provider;
        let provider = self.configure_provider(&config, type_changed)?;
        let new_root = CaRoot::from_root_pem(&provider.generate_root()?.pem)?;

        if new_root.id == active.root.id && !type_changed {
            self.check_cancelled(ctx)?;
            self.apply(
                CaRequest::SetConfig {
                    config: config.clone(),
                    cas_index: Some(stored.modify_index),
                },
                "CA configuration"
            ).await?;
            info!(
                "Updated CA configuration for datacenter '{}', root unchanged",
                self.datacenter()
            );
            self.set_active(provider, active.root.clone(), config.clone());
            self.cleanup_provider(
                active.provider.as_ref(), stored, &config
            ).await;
            return Ok(())
        }

        if new_root.id == active.root.id {
            // The new backend took over the root key. It still needs a
            // signing intermediate of its own.
            self.check_cancelled(ctx)?;
            let intermediate = provider.generate_intermediate()?;
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
                "Switched CA provider for datacenter '{}' from '{}' to '{}', \
                 root {} kept",
                self.datacenter(), stored.provider, config.provider, root.id
            );
            self.set_active(provider, root, config.clone());
            self.cleanup_provider(
                active.provider.as_ref(), stored, &config
            ).await;
            return Ok(())
        }

        if !provider.supports_cross_signing() {
            if !config.force_without_cross_signing {
                return Err(Error::CrossSigningUnsupported(config.provider))
            }
            warn!(
                "Rotating root for datacenter '{}' without cross-signing, \
                 existing leaf certificates will stop validating",
                self.datacenter()
            );
        }

        let mut root = new_root;
        if provider.supports_cross_signing() {
            let old_root = crypto::parse_cert(&active.root.root_cert)?;
            let bridge = provider.cross_sign_ca(&old_root)?;
            root.push_intermediate(&bridge)?;
        }
        self.check_cancelled(ctx)?;
        let intermediate = provider.generate_intermediate()?;
        root.push_intermediate(&intermediate)?;

        let (index, roots) = self.state.ca_roots()?;
        let roots = with_active_root(roots, root.clone(), self.now());

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
            "Rotated root for datacenter '{}' from {} to {}",
            self.datacenter(), active.root.id, root.id
        );
        self.set_active(provider, root, config.clone());
        self.cleanup_provider(active.provider.as_ref(), stored, &config).await;
        Ok(())
    }

    /// Signs an intermediate CA for a secondary datacenter.
    pub fn sign_intermediate(&self, csr_pem: &str) -> CaResult<String> {
        if !self.is_primary() {
            return Err(Error::NotPrimary(self.primary_datacenter().into()))
        }
        let active = self.snapshot()?;
        let csr = crypto::parse_verified_csr(csr_pem)?;

        let uris = crypto::csr_uris(&csr)?;
        let [uri] = uris.as_slice() else {
            return Err(Error::invalid_csr(
                "CSR must contain exactly one URI SAN"
            ))
        };
        let id: SpiffeId = uri.parse()?;
        if !id.is_signing() {
            return Err(Error::SpiffeIdRejected(
                format!("SPIFFE ID in CSR must be a signing ID, got {}", id)
            ))
        }
        if !active.config.signing_id().can_sign(&id) {
            return Err(Error::SpiffeIdRejected(format!(
                "SPIFFE ID in CSR from a different trust domain: {}", id
            )))
        }

        let pem = active.provider.sign_intermediate(&csr)?;
        info!("Signed intermediate for {}", id);
        Ok(pem)
    }
}
