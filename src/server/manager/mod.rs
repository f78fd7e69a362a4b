//! The CA manager.
//!
//! Owns the lifecycle of the root and intermediate certificates of one
//! datacenter. All mutating operations go through a single-flight state
//! machine and commit their result with exactly one apply to the
//! replicated log. Leaf signing works from a consistent snapshot of the
//! active root and provider and does not take part in the state machine.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use crate::api::{
    ApplyResponse, CaConfiguration, CaRequest, CaRoot, CaSignRequest,
    DcSpecificRequest, IndexedCaRoots, ProviderState,
};
use crate::commons::clock::{to_chrono, Clock, SystemClock};
use crate::commons::crypto;
use crate::commons::error::Error;
use crate::commons::CaResult;
use crate::constants::{DEFAULT_DRIFT_BUFFER, DEFAULT_RENEW_FRACTION};
use crate::provider::{
    provider_state_id, BuiltinProviders, Provider, ProviderConfig,
    ProviderFactory,
};
use super::delegate::{
    CaForwarder, CaStateAccess, RemoteCall, RemoteReply, RpcMethod,
};
use super::observer::{CaEvent, CaObserver, NoopObserver};

mod leaf;
mod primary;
mod secondary;
mod state;

pub use self::state::CaState;
use self::state::{StateCell, StateGuard};


//------------ ManagerSettings -----------------------------------------------

/// The static settings of a CA manager.
#[derive(Clone, Debug)]
pub struct ManagerSettings {
    /// The name of the local datacenter.
    pub datacenter: String,

    /// The name of the primary datacenter.
    pub primary_datacenter: String,

    /// The CA configuration used when none is stored yet.
    pub bootstrap: CaConfiguration,

    /// The fraction of an intermediate's lifetime after which it is
    /// renewed.
    pub renew_fraction: f64,

    /// Subtracted from renewal deadlines to allow for clock drift.
    pub drift_buffer: Duration,

    /// The maximum number of leaf signings in flight, 0 for no limit.
    pub csr_max_concurrent: usize,
}

impl ManagerSettings {
    pub fn new(
        datacenter: impl Into<String>,
        primary_datacenter: impl Into<String>,
        bootstrap: CaConfiguration,
    ) -> Self {
        ManagerSettings {
            datacenter: datacenter.into(),
            primary_datacenter: primary_datacenter.into(),
            bootstrap,
            renew_fraction: DEFAULT_RENEW_FRACTION,
            drift_buffer: DEFAULT_DRIFT_BUFFER,
            csr_max_concurrent: 0,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.datacenter == self.primary_datacenter
    }
}


//------------ CaManagerBuilder ----------------------------------------------

/// Builds a [`CaManager`] with its collaborators.
pub struct CaManagerBuilder {
    settings: ManagerSettings,
    state: Arc<dyn CaStateAccess>,
    forwarder: Arc<dyn CaForwarder>,
    factory: Option<Arc<dyn ProviderFactory>>,
    clock: Option<Arc<dyn Clock>>,
    observer: Option<Arc<dyn CaObserver>>,
}

impl CaManagerBuilder {
    pub fn new(
        settings: ManagerSettings,
        state: Arc<dyn CaStateAccess>,
        forwarder: Arc<dyn CaForwarder>,
    ) -> Self {
        CaManagerBuilder {
            settings,
            state,
            forwarder,
            factory: None,
            clock: None,
            observer: None,
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CaObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> CaManager {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(BuiltinProviders::new(clock.clone()))
        });
        let csr_limit = match self.settings.csr_max_concurrent {
            0 => None,
            n => Some(Semaphore::new(n)),
        };

        CaManager {
            settings: self.settings,
            state: self.state,
            forwarder: self.forwarder,
            factory,
            clock,
            observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            ca_state: StateCell::new(),
            active: RwLock::new(None),
            csr_limit,
        }
    }
}


//------------ ActiveCa ------------------------------------------------------

/// The provider and root currently used for signing.
///
/// Swapped as a whole so that signers never see a root from one provider
/// combined with another provider.
struct ActiveCa {
    provider: Arc<dyn Provider>,
    root: CaRoot,
    config: CaConfiguration,
}


//------------ CaManager -----------------------------------------------------

pub struct CaManager {
    settings: ManagerSettings,
    state: Arc<dyn CaStateAccess>,
    forwarder: Arc<dyn CaForwarder>,
    factory: Arc<dyn ProviderFactory>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn CaObserver>,

    /// The single-flight state machine.
    ca_state: StateCell,

    /// The snapshot used for signing, `None` until initialized.
    active: RwLock<Option<Arc<ActiveCa>>>,

    /// Limits concurrent leaf signing if configured.
    csr_limit: Option<Semaphore>,
}

/// # Accessors
impl CaManager {
    pub fn datacenter(&self) -> &str {
        &self.settings.datacenter
    }

    pub fn primary_datacenter(&self) -> &str {
        &self.settings.primary_datacenter
    }

    pub fn is_primary(&self) -> bool {
        self.settings.is_primary()
    }

    /// Returns the current state of the state machine.
    pub fn state(&self) -> CaState {
        self.ca_state.get()
    }

    /// Returns the root currently used for signing.
    pub fn active_root(&self) -> Option<CaRoot> {
        self.active.read().unwrap().as_ref().map(|ca| ca.root.clone())
    }

    /// Returns the configuration the active provider was set up with.
    pub fn active_config(&self) -> Option<CaConfiguration> {
        self.active.read().unwrap().as_ref().map(|ca| ca.config.clone())
    }

    /// Returns the roots of the local datacenter as served to others.
    pub fn roots(&self) -> CaResult<IndexedCaRoots> {
        let (index, roots) = self.state.ca_roots()?;
        let trust_domain = self.state.ca_config()?
            .map(|config| config.trust_domain())
            .unwrap_or_default();
        let active_root_id = roots.iter()
            .find(|root| root.active)
            .map(|root| root.id.clone())
            .unwrap_or_default();
        Ok(IndexedCaRoots { active_root_id, trust_domain, roots, index })
    }

    /// Returns the stored CA configuration, falling back to the one the
    /// active provider was set up with.
    pub fn configuration(&self) -> CaResult<CaConfiguration> {
        match self.state.ca_config()? {
            Some(config) => Ok(config),
            None => self.active_config().ok_or(Error::NotInitialized),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }
}

/// # Operations
impl CaManager {
    /// Sets up the CA for this datacenter.
    ///
    /// Safe to call repeatedly: if the stored state already matches the
    /// provider, nothing is written.
    pub async fn initialize(&self, ctx: &CancellationToken) -> CaResult<()> {
        let guard = self.transition(CaState::Initializing)?;
        if self.is_primary() {
            self.initialize_primary(ctx).await?;
        }
        else {
            self.initialize_secondary(ctx).await?;
        }
        guard.complete();
        Ok(())
    }

    /// Replaces the leaf signing intermediate.
    ///
    /// Unless `force_now` is set, this returns without doing anything if
    /// the current intermediate is not yet due for renewal.
    pub async fn renew_intermediate(
        &self,
        ctx: &CancellationToken,
        force_now: bool,
    ) -> CaResult<()> {
        let guard = self.transition(CaState::RenewingIntermediate)?;
        let active = self.snapshot()?;

        if !force_now && !self.renewal_due(&active.root)? {
            debug!(
                "Intermediate for datacenter '{}' not yet due for renewal",
                self.datacenter()
            );
            guard.complete();
            return Ok(())
        }

        // Work on a fresh copy so a failed renewal leaves the active
        // provider untouched.
        let provider = self.configure_provider(&active.config, false)?;
        let intermediate = if self.is_primary() {
            provider.generate_intermediate()?
        }
        else {
            self.derive_intermediate(
                ctx, provider.as_ref(), &active.root.root_cert
            ).await?
        };

        let (index, roots, root) = self.extend_active_root(
            &active.root, &intermediate
        )?;

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

        info!(
            "Renewed intermediate for datacenter '{}', signing key {}",
            self.datacenter(), root.signing_key_id
        );
        self.set_active(provider, root, active.config.clone());
        guard.complete();
        Ok(())
    }

    /// Changes the CA configuration, possibly switching provider or root.
    pub async fn update_configuration(
        &self,
        ctx: &CancellationToken,
        config: CaConfiguration,
    ) -> CaResult<()> {
        let guard = self.transition(CaState::ReconfiguringProvider)?;
        let active = self.snapshot()?;

        let stored = self.state.ca_config()?
            .unwrap_or_else(|| active.config.clone());
        let mut config = config;
        if config.cluster_id.is_empty() {
            config.cluster_id = stored.cluster_id.clone();
        }
        else if config.cluster_id != stored.cluster_id {
            return Err(Error::invalid_config("cluster id cannot be changed"))
        }
        config.create_index = stored.create_index;
        config.modify_index = stored.modify_index;

        if self.is_primary() {
            self.update_primary(ctx, &active, &stored, config).await?;
        }
        else {
            self.update_secondary(ctx, &active, &stored, config).await?;
        }
        guard.complete();
        Ok(())
    }

    /// Fetches the roots from the primary and re-derives the local
    /// intermediate if the primary's active root changed.
    ///
    /// Does nothing in the primary datacenter.
    pub async fn update_roots_from_primary(
        &self,
        ctx: &CancellationToken,
    ) -> CaResult<()> {
        if self.is_primary() {
            return Ok(())
        }
        let guard = self.transition(CaState::RenewingIntermediate)?;
        self.secondary_update_roots(ctx).await?;
        guard.complete();
        Ok(())
    }
}

/// # Helpers shared by the primary and secondary paths
impl CaManager {
    fn transition(&self, to: CaState) -> CaResult<StateGuard<'_>> {
        self.ca_state.transition(to, self.observer.as_ref())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn snapshot(&self) -> CaResult<Arc<ActiveCa>> {
        self.active.read().unwrap().clone().ok_or(Error::NotInitialized)
    }

    fn set_active(
        &self,
        provider: Arc<dyn Provider>,
        root: CaRoot,
        config: CaConfiguration,
    ) {
        *self.active.write().unwrap() = Some(Arc::new(ActiveCa {
            provider, root, config
        }));
    }

    fn check_cancelled(&self, ctx: &CancellationToken) -> CaResult<()> {
        if ctx.is_cancelled() {
            Err(Error::Cancelled)
        }
        else {
            Ok(())
        }
    }

    /// Creates and configures a provider for the given configuration.
    ///
    /// The provider gets the stored state for its id unless `fresh`.
    fn configure_provider(
        &self,
        config: &CaConfiguration,
        fresh: bool,
    ) -> CaResult<Arc<dyn Provider>> {
        let provider = self.factory.create(&config.provider)?;
        let state = if fresh {
            None
        }
        else {
            self.state.provider_state(
                &provider_state_id(&config.provider, self.datacenter())
            )?
        };
        provider.configure(ProviderConfig {
            cluster_id: config.cluster_id.clone(),
            datacenter: self.datacenter().to_string(),
            is_primary: self.is_primary(),
            raw: config.config.clone(),
            state,
        })?;
        debug!(
            "Configured CA provider '{}' for datacenter '{}'",
            config.provider, self.datacenter()
        );
        Ok(provider)
    }

    /// Returns whether the signing intermediate of `root` should be renewed.
    fn renewal_due(&self, root: &CaRoot) -> CaResult<bool> {
        if root.intermediate_certs.is_empty() {
            return Ok(false)
        }
        let cert = crypto::parse_cert(root.signing_cert())?;
        let not_before = crypto::not_before(&cert)?;
        let not_after = crypto::not_after(&cert)?;

        let lifetime = (not_after - not_before).to_std().unwrap_or_default();
        let deadline = not_before
            + to_chrono(lifetime.mul_f64(self.settings.renew_fraction))
            - to_chrono(self.settings.drift_buffer);
        Ok(self.now() >= deadline)
    }

    /// Forwards a roots request to the primary datacenter.
    async fn forward_roots(&self) -> CaResult<IndexedCaRoots> {
        let dc = self.primary_datacenter();
        let call = RemoteCall::Roots(DcSpecificRequest::new(dc));
        match self.forward(dc, call).await? {
            RemoteReply::Roots(roots) => Ok(roots),
            _ => Err(Error::forwarding(RpcMethod::Roots, dc, "unexpected reply")),
        }
    }

    /// Has the primary datacenter sign an intermediate CSR.
    async fn forward_sign_intermediate(&self, csr: String) -> CaResult<String> {
        let dc = self.primary_datacenter();
        let call = RemoteCall::SignIntermediate(CaSignRequest::new(dc, csr));
        match self.forward(dc, call).await? {
            RemoteReply::SignIntermediate(pem) => Ok(pem),
            _ => Err(Error::forwarding(
                RpcMethod::SignIntermediate, dc, "unexpected reply"
            )),
        }
    }

    /// Forwards a call on behalf of an endpoint to another datacenter.
    pub async fn forward_call(
        &self,
        datacenter: &str,
        call: RemoteCall,
    ) -> CaResult<RemoteReply> {
        self.forward(datacenter, call).await
    }

    async fn forward(
        &self,
        datacenter: &str,
        call: RemoteCall,
    ) -> CaResult<RemoteReply> {
        let method = call.method();
        self.observer.notify(&CaEvent::PreForward {
            method,
            datacenter: datacenter.to_string(),
        });
        debug!("Forwarding {} to datacenter '{}'", method, datacenter);
        self.forwarder.forward_dc(datacenter, call).await.map_err(|e| {
            match e {
                Error::Forwarding { .. } => e,
                other => Error::forwarding(method, datacenter, other),
            }
        })
    }

    /// Gets a new intermediate for a secondary: CSR, signed by the primary,
    /// installed in the provider.
    async fn derive_intermediate(
        &self,
        ctx: &CancellationToken,
        provider: &dyn Provider,
        primary_root_pem: &str,
    ) -> CaResult<String> {
        let csr = provider.generate_intermediate_csr()?;
        self.check_cancelled(ctx)?;
        let intermediate = self.forward_sign_intermediate(csr).await?;
        self.check_cancelled(ctx)?;
        provider.set_intermediate(&intermediate, primary_root_pem)?;
        Ok(intermediate)
    }

    /// Commits a request, failing if a compare-and-set was not met.
    async fn apply(
        &self,
        request: CaRequest,
        what: &'static str,
    ) -> CaResult<ApplyResponse> {
        self.observer.notify(&CaEvent::PreApply { op: request.op_name() });
        debug!("Applying {} for datacenter '{}'", request, self.datacenter());
        let response = self.state.apply_ca_request(request).await?;
        if response.applied {
            Ok(response)
        }
        else {
            Err(Error::CasFailed(what))
        }
    }

    /// Appends a new signing intermediate to the stored copy of `active`.
    ///
    /// Returns the roots index to compare against, the full new set of
    /// roots and the updated active root. Expired intermediates are dropped.
    fn extend_active_root(
        &self,
        active: &CaRoot,
        intermediate: &str,
    ) -> CaResult<(u64, Vec<CaRoot>, CaRoot)> {
        let (index, roots) = self.state.ca_roots()?;
        let mut root = roots.iter()
            .find(|root| root.active && root.id == active.id)
            .cloned()
            .unwrap_or_else(|| active.clone());
        root.prune_expired_intermediates(self.now());
        root.push_intermediate(intermediate)?;
        let roots = with_active_root(roots, root.clone(), self.now());
        Ok((index, roots, root))
    }

    /// Commits a new set of roots and returns the active one as stored.
    ///
    /// The stored root carries the log indexes it was committed at, so
    /// the signing snapshot always matches what readers of the state see.
    async fn commit_roots(
        &self,
        request: CaRequest,
        active_id: &str,
    ) -> CaResult<CaRoot> {
        self.apply(request, "CA roots").await?;
        match self.state.active_root()? {
            Some(root) if root.id == active_id => Ok(root),
            _ => Err(Error::CasFailed("CA roots")),
        }
    }

    /// Cleans up a replaced provider. Failures are only logged.
    async fn cleanup_provider(
        &self,
        old: &dyn Provider,
        old_config: &CaConfiguration,
        new_config: &CaConfiguration,
    ) {
        let type_changed = old_config.provider != new_config.provider;
        if let Err(e) = old.cleanup(type_changed, &new_config.config) {
            warn!(
                "Failed to clean up CA provider '{}': {}",
                old_config.provider, e
            );
        }
        if type_changed {
            let id = provider_state_id(&old_config.provider, self.datacenter());
            if let Err(e) = self.apply(
                CaRequest::DeleteProviderState { id: id.clone() },
                "provider state"
            ).await {
                warn!("Failed to delete provider state '{}': {}", id, e);
            }
        }
    }
}


//------------ Helper Functions ----------------------------------------------

/// Returns the provider state to persist, if there is any.
fn provider_state(provider: &dyn Provider) -> CaResult<Option<ProviderState>> {
    let state = provider.state()?;
    Ok(if state.is_empty() { None } else { Some(state) })
}

/// Returns `roots` with `active` as the only active root.
///
/// Other active roots are marked as rotated out at `now`. A root with the
/// same id as `active` is replaced.
fn with_active_root(
    roots: Vec<CaRoot>,
    active: CaRoot,
    now: DateTime<Utc>,
) -> Vec<CaRoot> {
    let mut res: Vec<CaRoot> = roots.into_iter()
        .filter(|root| root.id != active.id)
        .map(|mut root| {
            if root.active {
                root.active = false;
                root.rotated_out_at = Some(now);
            }
            root
        })
        .collect();
    let mut active = active;
    active.active = true;
    active.rotated_out_at = None;
    res.push(active);
    res
}

/// Compares two PEM strings, ignoring trailing whitespace.
fn same_pem(left: &str, right: &str) -> bool {
    left.trim_end() == right.trim_end()
}


//============ Tests =========================================================
