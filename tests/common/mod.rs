#![allow(dead_code)] // Different tests use different parts.

use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use chrono::Utc;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509Ref, X509ReqBuilder, X509ReqRef};
use tokio::sync::Notify;
use meshca::api::{
    ApplyResponse, CaConfiguration, CaRequest, CaRoot, ConfigMap,
    ProviderState,
};
use meshca::commons::clock::FixedClock;
use meshca::commons::crypto::{self, KeyType, SpiffeId};
use meshca::commons::error::Error;
use meshca::commons::CaResult;
use meshca::config::Config;
use meshca::constants::DEFAULT_NAMESPACE;
use meshca::provider::{
    BuiltinProvider, Keystore, MockProvider, Provider, ProviderConfig,
    ProviderFactory, ProviderKind, RootResult,
};
use meshca::server::{
    CaEvent, CaForwarder, CaManager, CaManagerBuilder, CaObserver,
    CaStateAccess, ConnectCaEndpoint, DatacenterRouter, ManagerSettings,
    MemoryStore, RemoteCall, RemoteReply,
};


//------------ Logging -------------------------------------------------------

pub fn init_logging() {
    let _ = stderrlog::new().verbosity(3).init();
}


//------------ Effects -------------------------------------------------------

/// The ordered log of externally visible effects of one datacenter.
#[derive(Debug, Default)]
pub struct Effects(Mutex<Vec<String>>);

impl Effects {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, effect: impl Into<String>) {
        self.0.lock().unwrap().push(effect.into())
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear()
    }

    pub fn count(&self, effect: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == effect).count()
    }
}

pub const APPLY: &str = "raftApply/ConnectCA";
pub const FORWARD_ROOTS: &str = "forwardDC/ConnectCA.Roots";
pub const FORWARD_SIGN_INTERMEDIATE: &str = "forwardDC/ConnectCA.SignIntermediate";
pub const GENERATE_CSR: &str = "provider/GenerateIntermediateCSR";
pub const SET_INTERMEDIATE: &str = "provider/SetIntermediate";
pub const GENERATE_INTERMEDIATE: &str = "provider/GenerateIntermediate";
pub const CROSS_SIGN: &str = "provider/CrossSignCA";


//------------ Gate ----------------------------------------------------------

/// Holds up the next occurrence of one effect until released.
#[derive(Debug, Default)]
pub struct Gate {
    armed: Mutex<Option<String>>,
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn arm(&self, effect: &str) {
        *self.armed.lock().unwrap() = Some(effect.to_string());
    }

    async fn pass(&self, effect: &str) {
        let hit = {
            let mut armed = self.armed.lock().unwrap();
            if armed.as_deref() == Some(effect) {
                armed.take();
                true
            }
            else {
                false
            }
        };
        if hit {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    /// Waits until an operation is held at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await
    }

    pub fn release(&self) {
        self.release.notify_one()
    }
}


//------------ RecordingStore ------------------------------------------------

pub struct RecordingStore {
    inner: MemoryStore,
    effects: Arc<Effects>,
    gate: Arc<Gate>,
    fail_apply: AtomicBool,
}

impl RecordingStore {
    pub fn new(effects: Arc<Effects>, gate: Arc<Gate>) -> Self {
        RecordingStore {
            inner: MemoryStore::new(),
            effects,
            gate,
            fail_apply: AtomicBool::new(false),
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn apply_count(&self) -> usize {
        self.inner.apply_count()
    }

    pub fn fail_applies(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst)
    }
}

#[async_trait]
impl CaStateAccess for RecordingStore {
    fn ca_config(&self) -> CaResult<Option<CaConfiguration>> {
        self.inner.ca_config()
    }

    fn ca_roots(&self) -> CaResult<(u64, Vec<CaRoot>)> {
        self.inner.ca_roots()
    }

    fn active_root(&self) -> CaResult<Option<CaRoot>> {
        self.inner.active_root()
    }

    fn provider_state(&self, id: &str) -> CaResult<Option<ProviderState>> {
        self.inner.provider_state(id)
    }

    fn is_leader(&self) -> bool {
        self.inner.is_leader()
    }

    fn servers_support_multi_dc_ca(&self) -> CaResult<()> {
        self.inner.servers_support_multi_dc_ca()
    }

    async fn apply_ca_request(
        &self,
        request: CaRequest,
    ) -> CaResult<ApplyResponse> {
        self.effects.record(APPLY);
        self.gate.pass(APPLY).await;
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(Error::apply("raft apply failed: leadership lost"))
        }
        self.inner.apply_ca_request(request).await
    }
}


//------------ RecordingForwarder --------------------------------------------

pub struct RecordingForwarder {
    target: Arc<dyn CaForwarder>,
    effects: Arc<Effects>,
    gate: Arc<Gate>,
    unreachable: AtomicBool,
}

impl RecordingForwarder {
    pub fn new(
        target: Arc<dyn CaForwarder>,
        effects: Arc<Effects>,
        gate: Arc<Gate>,
    ) -> Self {
        RecordingForwarder {
            target,
            effects,
            gate,
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst)
    }
}

#[async_trait]
impl CaForwarder for RecordingForwarder {
    async fn forward_dc(
        &self,
        datacenter: &str,
        call: RemoteCall,
    ) -> CaResult<RemoteReply> {
        let effect = format!("forwardDC/{}", call.method());
        self.effects.record(effect.as_str());
        self.gate.pass(&effect).await;
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused, "connection refused"
            )))
        }
        self.target.forward_dc(datacenter, call).await
    }
}


//------------ RecordingProvider ---------------------------------------------

/// A provider with its effectful calls recorded.
pub struct RecordingProvider {
    inner: Arc<dyn Provider>,
    effects: Arc<Effects>,
    cleanups: Arc<Mutex<Vec<(String, bool)>>>,
    cross_signing: bool,
}

impl Provider for RecordingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn configure(&self, config: ProviderConfig) -> CaResult<()> {
        self.inner.configure(config)
    }

    fn state(&self) -> CaResult<ProviderState> {
        self.inner.state()
    }

    fn generate_root(&self) -> CaResult<RootResult> {
        self.effects.record("provider/GenerateRoot");
        self.inner.generate_root()
    }

    fn generate_intermediate_csr(&self) -> CaResult<String> {
        self.effects.record(GENERATE_CSR);
        self.inner.generate_intermediate_csr()
    }

    fn set_intermediate(
        &self,
        intermediate_pem: &str,
        root_pem: &str,
    ) -> CaResult<()> {
        self.effects.record(SET_INTERMEDIATE);
        self.inner.set_intermediate(intermediate_pem, root_pem)
    }

    fn active_intermediate(&self) -> CaResult<Option<String>> {
        self.inner.active_intermediate()
    }

    fn generate_intermediate(&self) -> CaResult<String> {
        self.effects.record(GENERATE_INTERMEDIATE);
        self.inner.generate_intermediate()
    }

    fn sign(&self, csr: &X509ReqRef) -> CaResult<String> {
        self.effects.record("provider/Sign");
        self.inner.sign(csr)
    }

    fn sign_intermediate(&self, csr: &X509ReqRef) -> CaResult<String> {
        self.effects.record("provider/SignIntermediate");
        self.inner.sign_intermediate(csr)
    }

    fn cross_sign_ca(&self, cert: &X509Ref) -> CaResult<String> {
        self.effects.record(CROSS_SIGN);
        self.inner.cross_sign_ca(cert)
    }

    fn supports_cross_signing(&self) -> bool {
        self.cross_signing
    }

    fn cleanup(
        &self,
        provider_type_changed: bool,
        new_config: &ConfigMap,
    ) -> CaResult<()> {
        self.cleanups.lock().unwrap().push(
            (self.inner.name().to_string(), provider_type_changed)
        );
        self.inner.cleanup(provider_type_changed, new_config)
    }
}

pub struct RecordingProviders {
    clock: Arc<FixedClock>,
    effects: Arc<Effects>,
    keystore: Arc<Keystore>,
    cleanups: Arc<Mutex<Vec<(String, bool)>>>,
    cross_signing: AtomicBool,
}

impl RecordingProviders {
    pub fn set_cross_signing(&self, supported: bool) {
        self.cross_signing.store(supported, Ordering::SeqCst)
    }

    /// The keystore shared by the mock providers of this datacenter.
    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    /// The providers cleaned up so far, with whether the type changed.
    pub fn cleanups(&self) -> Vec<(String, bool)> {
        self.cleanups.lock().unwrap().clone()
    }
}

impl ProviderFactory for RecordingProviders {
    fn create(&self, name: &str) -> CaResult<Arc<dyn Provider>> {
        let inner: Arc<dyn Provider> = match ProviderKind::from_str(name)? {
            ProviderKind::Builtin => {
                Arc::new(BuiltinProvider::new(self.clock.clone()))
            }
            ProviderKind::Mock => {
                Arc::new(MockProvider::new(
                    self.clock.clone(), self.keystore.clone()
                ))
            }
        };
        Ok(Arc::new(RecordingProvider {
            inner,
            effects: self.effects.clone(),
            cleanups: self.cleanups.clone(),
            cross_signing: self.cross_signing.load(Ordering::SeqCst),
        }))
    }
}


//------------ RecordingObserver ---------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingObserver(Mutex<Vec<CaEvent>>);

impl RecordingObserver {
    pub fn events(&self) -> Vec<CaEvent> {
        self.0.lock().unwrap().clone()
    }
}

impl CaObserver for RecordingObserver {
    fn notify(&self, event: &CaEvent) {
        self.0.lock().unwrap().push(event.clone())
    }
}


//------------ TestCluster ---------------------------------------------------

/// Datacenters connected through one router, sharing a clock.
pub struct TestCluster {
    pub router: Arc<DatacenterRouter>,
    pub clock: Arc<FixedClock>,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCluster {
    pub fn new() -> Self {
        init_logging();
        TestCluster {
            router: DatacenterRouter::new(),
            clock: Arc::new(FixedClock::new(Utc::now())),
        }
    }

    pub fn add_dc(&self, name: &str, primary: &str) -> TestDc {
        self.add_dc_with(name, primary, |_| { })
    }

    /// Adds a datacenter after letting `op` adjust its settings.
    pub fn add_dc_with(
        &self,
        name: &str,
        primary: &str,
        op: impl FnOnce(&mut ManagerSettings),
    ) -> TestDc {
        let effects = Effects::new();
        let gate = Arc::new(Gate::default());
        let store = Arc::new(RecordingStore::new(effects.clone(), gate.clone()));
        let forwarder = Arc::new(RecordingForwarder::new(
            self.router.clone(), effects.clone(), gate.clone()
        ));
        let factory = Arc::new(RecordingProviders {
            clock: self.clock.clone(),
            effects: effects.clone(),
            keystore: Keystore::new(),
            cleanups: Arc::new(Mutex::new(Vec::new())),
            cross_signing: AtomicBool::new(true),
        });
        let observer = Arc::new(RecordingObserver::default());

        let mut settings = Config::test_config(name, primary).manager_settings();
        op(&mut settings);

        let manager = Arc::new(
            CaManagerBuilder::new(settings, store.clone(), forwarder.clone())
                .with_factory(factory.clone())
                .with_clock(self.clock.clone())
                .with_observer(observer.clone())
                .build()
        );
        let endpoint = ConnectCaEndpoint::new(manager.clone());
        self.router.register(name, endpoint.clone());

        TestDc {
            name: name.to_string(),
            effects,
            gate,
            store,
            forwarder,
            factory,
            observer,
            manager,
            endpoint,
        }
    }
}


//------------ TestDc --------------------------------------------------------

pub struct TestDc {
    pub name: String,
    pub effects: Arc<Effects>,
    pub gate: Arc<Gate>,
    pub store: Arc<RecordingStore>,
    pub forwarder: Arc<RecordingForwarder>,
    pub factory: Arc<RecordingProviders>,
    pub observer: Arc<RecordingObserver>,
    pub manager: Arc<CaManager>,
    pub endpoint: ConnectCaEndpoint,
}

impl TestDc {
    pub fn active_root(&self) -> CaRoot {
        self.manager.active_root().expect("no active root")
    }

    /// Returns a service identity in this datacenter's trust domain.
    pub fn service_id(&self, service: &str) -> SpiffeId {
        let config = self.manager.active_config().expect("not initialized");
        SpiffeId::service(
            config.trust_domain(), DEFAULT_NAMESPACE, &self.name, service
        )
    }
}


//------------ Certificates --------------------------------------------------

/// Creates a PEM encoded leaf CSR for the given identity.
pub fn leaf_csr(id: &SpiffeId) -> String {
    let key = crypto::generate_private_key(KeyType::Ec, 256).unwrap();
    let csr = crypto::create_leaf_csr(&key, "leaf", &id.to_string()).unwrap();
    crypto::csr_to_pem(&csr).unwrap()
}

/// Returns a copy of `config` with a different root key size.
///
/// The builtin provider generates a new root when the key size changes.
pub fn with_key_bits(config: &CaConfiguration, bits: u32) -> CaConfiguration {
    let mut config = config.clone();
    config.config.insert("private_key_bits".into(), bits.into());
    config
}

/// Returns a copy of `config` that selects another provider.
pub fn with_provider(
    config: &CaConfiguration,
    provider: &str,
) -> CaConfiguration {
    let mut config = config.clone();
    config.provider = provider.to_string();
    config
}

/// Creates a PEM encoded leaf CSR that asks for all of the given identities.
pub fn multi_id_csr(ids: &[&SpiffeId]) -> String {
    let key = crypto::generate_private_key(KeyType::Ec, 256).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "leaf").unwrap();
    let name = name.build();

    let mut builder = X509ReqBuilder::new().unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();

    let mut san = SubjectAlternativeName::new();
    for id in ids {
        san.uri(&id.to_string());
    }
    let san = san.build(&builder.x509v3_context(None)).unwrap();
    let mut extensions = Stack::new().unwrap();
    extensions.push(san).unwrap();
    builder.add_extensions(&extensions).unwrap();

    builder.sign(&key, MessageDigest::sha256()).unwrap();
    crypto::csr_to_pem(&builder.build()).unwrap()
}
