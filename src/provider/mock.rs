//! A provider that keeps its key material outside the replicated log.
//!
//! Keys live in a [`Keystore`] shared by all providers one factory creates,
//! the way they would live in a networked secrets store. The provider
//! never hands state to the manager for persisting, so a replacement
//! provider finds its keys through the keystore only.
//!
//! The certificate work itself is done by a [`BuiltinProvider`] that is
//! restored from and saved to the keystore around every operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use log::debug;
use openssl::x509::{X509Ref, X509ReqRef};
use crate::api::{ConfigMap, ProviderState};
use crate::commons::clock::Clock;
use crate::commons::CaResult;
use crate::constants::PROVIDER_MOCK;
use super::{
    provider_state_id, BuiltinProvider, Provider, ProviderConfig,
    ProviderError, RootResult,
};


//------------ Keystore ------------------------------------------------------

/// Key material of mock providers, by datacenter.
#[derive(Debug, Default)]
pub struct Keystore {
    entries: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl Keystore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns whether there is key material for the datacenter.
    pub fn contains(&self, datacenter: &str) -> bool {
        self.entries.lock().unwrap().contains_key(datacenter)
    }

    fn load(&self, datacenter: &str) -> Option<BTreeMap<String, String>> {
        self.entries.lock().unwrap().get(datacenter).cloned()
    }

    fn save(&self, datacenter: &str, data: BTreeMap<String, String>) {
        self.entries.lock().unwrap().insert(datacenter.to_string(), data);
    }

    fn remove(&self, datacenter: &str) {
        self.entries.lock().unwrap().remove(datacenter);
    }
}


//------------ MockProvider --------------------------------------------------

pub struct MockProvider {
    keys: BuiltinProvider,
    keystore: Arc<Keystore>,

    /// The datacenter the provider was configured for.
    datacenter: RwLock<Option<String>>,
}

impl MockProvider {
    pub fn new(clock: Arc<dyn Clock>, keystore: Arc<Keystore>) -> Self {
        MockProvider {
            keys: BuiltinProvider::new(clock),
            keystore,
            datacenter: RwLock::new(None),
        }
    }

    fn datacenter(&self) -> CaResult<String> {
        self.datacenter.read().unwrap()
            .clone()
            .ok_or_else(|| ProviderError::NotConfigured.into())
    }

    /// Runs an operation that changes the keys and saves them afterwards.
    fn saving<F, T>(&self, op: F) -> CaResult<T>
    where
        F: FnOnce(&BuiltinProvider) -> CaResult<T>,
    {
        let datacenter = self.datacenter()?;
        let res = op(&self.keys)?;
        self.keystore.save(&datacenter, self.keys.state()?.data);
        Ok(res)
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        PROVIDER_MOCK
    }

    fn configure(&self, config: ProviderConfig) -> CaResult<()> {
        let datacenter = config.datacenter.clone();
        let state = self.keystore.load(&datacenter).map(|data| {
            ProviderState::new(
                provider_state_id(PROVIDER_MOCK, &datacenter), data
            )
        });
        debug!(
            "Configuring mock provider for datacenter '{}' (stored keys: {})",
            datacenter, state.is_some()
        );
        self.keys.configure(ProviderConfig { state, ..config })?;
        *self.datacenter.write().unwrap() = Some(datacenter);
        Ok(())
    }

    fn state(&self) -> CaResult<ProviderState> {
        Ok(ProviderState::new(
            provider_state_id(PROVIDER_MOCK, &self.datacenter()?),
            BTreeMap::new()
        ))
    }

    fn generate_root(&self) -> CaResult<RootResult> {
        self.saving(|keys| keys.generate_root())
    }

    fn generate_intermediate_csr(&self) -> CaResult<String> {
        self.saving(|keys| keys.generate_intermediate_csr())
    }

    fn set_intermediate(
        &self,
        intermediate_pem: &str,
        root_pem: &str,
    ) -> CaResult<()> {
        self.saving(|keys| keys.set_intermediate(intermediate_pem, root_pem))
    }

    fn active_intermediate(&self) -> CaResult<Option<String>> {
        self.keys.active_intermediate()
    }

    fn generate_intermediate(&self) -> CaResult<String> {
        self.saving(|keys| keys.generate_intermediate())
    }

    fn sign(&self, csr: &X509ReqRef) -> CaResult<String> {
        self.keys.sign(csr)
    }

    fn sign_intermediate(&self, csr: &X509ReqRef) -> CaResult<String> {
        self.keys.sign_intermediate(csr)
    }

    fn cross_sign_ca(&self, cert: &X509Ref) -> CaResult<String> {
        self.keys.cross_sign_ca(cert)
    }

    fn supports_cross_signing(&self) -> bool {
        true
    }

    fn cleanup(
        &self,
        provider_type_changed: bool,
        new_config: &ConfigMap,
    ) -> CaResult<()> {
        if provider_type_changed {
            let datacenter = self.datacenter()?;
            debug!("Removing mock keys for datacenter '{}'", datacenter);
            self.keystore.remove(&datacenter);
        }
        self.keys.cleanup(provider_type_changed, new_config)
    }
}


//============ Tests =========================================================
