//! The built-in provider: a local CA backed by openssl keys.
//!
//! All key material lives in the provider state, which the manager
//! persists through the replicated log. A provider configured from the
//! same state therefore comes back with the same root.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use log::{debug, info};
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509, X509Ref, X509ReqRef};
use crate::api::ca::trust_domain_for_cluster;
use crate::api::{ConfigMap, ProviderState};
use crate::commons::clock::Clock;
use crate::commons::crypto::{self, SpiffeId, Validity};
use crate::commons::error::Error;
use crate::commons::CaResult;
use crate::constants::PROVIDER_BUILTIN;
use super::{
    provider_state_id, CommonCaConfig, Provider, ProviderConfig,
    ProviderError, RootResult,
};

const ROOT_KEY: &str = "root_key";
const ROOT_CERT: &str = "root_cert";
const INTERMEDIATE_KEY: &str = "intermediate_key";
const INTERMEDIATE_CERT: &str = "intermediate_cert";
const PENDING_KEY: &str = "pending_key";


//------------ KeyPair -------------------------------------------------------

struct KeyPair {
    key: PKey<Private>,
    cert: X509,
}


//------------ Inner ---------------------------------------------------------

struct Inner {
    config: ProviderConfig,
    common: CommonCaConfig,
    root: Option<KeyPair>,
    intermediate: Option<KeyPair>,

    /// The key of the last CSR, waiting for its certificate.
    pending_key: Option<PKey<Private>>,
}

impl Inner {
    fn trust_domain(&self) -> String {
        trust_domain_for_cluster(&self.config.cluster_id)
    }

    fn signing_uri(&self) -> String {
        SpiffeId::signing(&self.config.cluster_id).to_string()
    }

    /// Returns a common name for a new CA certificate.
    ///
    /// Names must be unique so that rotated roots and their bridges never
    /// get confused during path building.
    fn ca_name(&self, kind: &str) -> CaResult<String> {
        let mut bytes = [0; 4];
        openssl::rand::rand_bytes(&mut bytes)?;
        let prefix = if self.config.is_primary { "pri" } else { "sec" };
        Ok(format!(
            "{}-{}.{}.{}",
            prefix, hex::encode(bytes), kind, self.trust_domain()
        ))
    }

    fn root(&self) -> CaResult<&KeyPair> {
        self.root.as_ref().ok_or_else(|| ProviderError::NoRoot.into())
    }

    /// Returns the certificate and key that sign leaves.
    fn leaf_signer(&self) -> CaResult<&KeyPair> {
        match (&self.intermediate, &self.root) {
            (Some(intermediate), _) => Ok(intermediate),
            (None, Some(root)) => Ok(root),
            (None, None) => Err(ProviderError::NoIntermediate.into()),
        }
    }

    fn restore(&mut self, state: &ProviderState) -> CaResult<()> {
        let key = |name: &str| -> CaResult<Option<PKey<Private>>> {
            state.data.get(name)
                .map(|pem| crypto::parse_private_key(pem))
                .transpose()
                .map_err(|e| ProviderError::CorruptState(e.to_string()).into())
        };
        let cert = |name: &str| -> CaResult<Option<X509>> {
            state.data.get(name)
                .map(|pem| crypto::parse_cert(pem))
                .transpose()
                .map_err(|e| ProviderError::CorruptState(e.to_string()).into())
        };

        self.root = match (key(ROOT_KEY)?, cert(ROOT_CERT)?) {
            (Some(key), Some(cert)) => Some(KeyPair { key, cert }),
            _ => None,
        };
        self.intermediate = match (key(INTERMEDIATE_KEY)?, cert(INTERMEDIATE_CERT)?) {
            (Some(key), Some(cert)) => Some(KeyPair { key, cert }),
            _ => None,
        };
        self.pending_key = key(PENDING_KEY)?;
        Ok(())
    }

    /// Drops a restored root key if it does not match the configuration.
    fn drop_outdated_root(&mut self) -> CaResult<()> {
        let Some(key) = self.root.as_ref().map(|root| &root.key) else {
            return Ok(())
        };
        let wanted = self.common.key_type()?;
        let matches = match wanted {
            crypto::KeyType::Ec => key.id() == openssl::pkey::Id::EC,
            crypto::KeyType::Rsa => key.id() == openssl::pkey::Id::RSA,
        } && key.bits() == self.common.private_key_bits;

        if !matches {
            info!(
                "Root key for datacenter '{}' does not match configured key \
                 type {} ({} bits), a new root will be generated",
                self.config.datacenter,
                self.common.private_key_type,
                self.common.private_key_bits
            );
            self.root = None;
            self.intermediate = None;
        }
        Ok(())
    }

    fn state(&self) -> CaResult<ProviderState> {
        let mut data = BTreeMap::new();
        if let Some(root) = self.root.as_ref() {
            data.insert(ROOT_KEY.into(), crypto::private_key_to_pem(&root.key)?);
            data.insert(ROOT_CERT.into(), crypto::cert_to_pem(&root.cert)?);
        }
        if let Some(intermediate) = self.intermediate.as_ref() {
            data.insert(
                INTERMEDIATE_KEY.into(),
                crypto::private_key_to_pem(&intermediate.key)?
            );
            data.insert(
                INTERMEDIATE_CERT.into(),
                crypto::cert_to_pem(&intermediate.cert)?
            );
        }
        if let Some(key) = self.pending_key.as_ref() {
            data.insert(PENDING_KEY.into(), crypto::private_key_to_pem(key)?);
        }
        Ok(ProviderState::new(
            provider_state_id(PROVIDER_BUILTIN, &self.config.datacenter),
            data
        ))
    }
}


//------------ BuiltinProvider -----------------------------------------------

/// A provider that keeps its keys in memory and in its provider state.
pub struct BuiltinProvider {
    clock: Arc<dyn Clock>,
    inner: RwLock<Option<Inner>>,
}

impl BuiltinProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        BuiltinProvider {
            clock,
            inner: RwLock::new(None),
        }
    }

    fn read<F, T>(&self, op: F) -> CaResult<T>
    where
        F: FnOnce(&Inner) -> CaResult<T>,
    {
        let inner = self.inner.read().unwrap();
        match inner.as_ref() {
            Some(inner) => op(inner),
            None => Err(ProviderError::NotConfigured.into()),
        }
    }

    fn write<F, T>(&self, op: F) -> CaResult<T>
    where
        F: FnOnce(&mut Inner) -> CaResult<T>,
    {
        let mut inner = self.inner.write().unwrap();
        match inner.as_mut() {
            Some(inner) => op(inner),
            None => Err(ProviderError::NotConfigured.into()),
        }
    }
}

impl Provider for BuiltinProvider {
    fn name(&self) -> &str {
        PROVIDER_BUILTIN
    }

    fn configure(&self, config: ProviderConfig) -> CaResult<()> {
        let common = CommonCaConfig::parse(&config.raw)?;
        let mut inner = Inner {
            config,
            common,
            root: None,
            intermediate: None,
            pending_key: None,
        };

        if let Some(state) = inner.config.state.clone() {
            inner.restore(&state)?;
        }

        if let (Some(key), Some(cert)) = (
            inner.common.private_key.as_ref(),
            inner.common.root_cert.as_ref(),
        ) {
            let key = crypto::parse_private_key(key)?;
            let cert = crypto::parse_cert(cert)?;
            if !crypto::cert_matches_key(&cert, &key)? {
                return Err(Error::invalid_config(
                    "root_cert does not match private_key"
                ))
            }
            let keep = match inner.root.as_ref() {
                Some(root) => root.cert.to_der()? == cert.to_der()?,
                None => false,
            };
            if !keep {
                inner.intermediate = None;
            }
            inner.root = Some(KeyPair { key, cert });
        }
        else if inner.config.is_primary {
            inner.drop_outdated_root()?;
        }
        else {
            inner.root = None;
        }

        debug!(
            "Configured builtin provider for datacenter '{}' (primary: {})",
            inner.config.datacenter, inner.config.is_primary
        );
        *self.inner.write().unwrap() = Some(inner);
        Ok(())
    }

    fn state(&self) -> CaResult<ProviderState> {
        self.read(Inner::state)
    }

    fn generate_root(&self) -> CaResult<RootResult> {
        let now = self.clock.now();
        self.write(|inner| {
            if !inner.config.is_primary {
                return Err(ProviderError::Unsupported(
                    "generating a root in a secondary datacenter"
                ).into())
            }
            if let Some(root) = inner.root.as_ref() {
                return Ok(RootResult { pem: crypto::cert_to_pem(&root.cert)? })
            }

            let key = crypto::generate_private_key(
                inner.common.key_type()?,
                inner.common.private_key_bits
            )?;
            let name = inner.ca_name("root")?;
            let cert = crypto::create_root(
                &key,
                &name,
                &inner.signing_uri(),
                Validity::from_now(now, inner.common.root_cert_ttl)
            )?;
            info!(
                "Generated new root '{}' for datacenter '{}'",
                name, inner.config.datacenter
            );

            let pem = crypto::cert_to_pem(&cert)?;
            inner.root = Some(KeyPair { key, cert });
            inner.intermediate = None;
            Ok(RootResult { pem })
        })
    }

    fn generate_intermediate_csr(&self) -> CaResult<String> {
        self.write(|inner| {
            let key = crypto::generate_private_key(
                inner.common.key_type()?,
                inner.common.private_key_bits
            )?;
            let csr = crypto::create_ca_csr(
                &key, &inner.ca_name("ica")?, &inner.signing_uri()
            )?;
            inner.pending_key = Some(key);
            crypto::csr_to_pem(&csr)
        })
    }

    fn set_intermediate(
        &self,
        intermediate_pem: &str,
        root_pem: &str,
    ) -> CaResult<()> {
        let cert = crypto::parse_cert(intermediate_pem)?;
        let root = crypto::parse_cert(root_pem)?;

        self.write(|inner| {
            let key = match inner.pending_key.as_ref() {
                Some(key) => key.clone(),
                None => {
                    return Err(ProviderError::IntermediateMismatch(
                        "no pending intermediate key".into()
                    ).into())
                }
            };
            if !crypto::cert_matches_key(&cert, &key)? {
                return Err(ProviderError::IntermediateMismatch(
                    "certificate does not match the pending key".into()
                ).into())
            }
            let root_key = root.public_key()?;
            if !cert.verify(&root_key)? {
                return Err(ProviderError::IntermediateMismatch(
                    "certificate is not signed by the root".into()
                ).into())
            }

            inner.pending_key = None;
            inner.intermediate = Some(KeyPair { key, cert });
            Ok(())
        })
    }

    fn active_intermediate(&self) -> CaResult<Option<String>> {
        self.read(|inner| {
            inner.intermediate.as_ref()
                .map(|i| crypto::cert_to_pem(&i.cert))
                .transpose()
        })
    }

    fn generate_intermediate(&self) -> CaResult<String> {
        let now = self.clock.now();
        self.write(|inner| {
            let key = crypto::generate_private_key(
                inner.common.key_type()?,
                inner.common.private_key_bits
            )?;
            let csr = crypto::create_ca_csr(
                &key, &inner.ca_name("ica")?, &inner.signing_uri()
            )?;
            let root = inner.root()?;
            let validity = Validity::from_now(
                now, inner.common.intermediate_cert_ttl
            ).capped_at(crypto::not_after(&root.cert)?);
            let cert = crypto::sign_ca_csr(
                &root.cert, &root.key, &csr, validity
            )?;
            let pem = crypto::cert_to_pem(&cert)?;

            inner.intermediate = Some(KeyPair { key, cert });
            Ok(pem)
        })
    }

    fn sign(&self, csr: &X509ReqRef) -> CaResult<String> {
        let now = self.clock.now();
        self.read(|inner| {
            let signer = inner.leaf_signer()?;
            let validity = Validity::from_now(now, inner.common.leaf_cert_ttl)
                .capped_at(crypto::not_after(&signer.cert)?);
            let cert = crypto::sign_leaf_csr(
                &signer.cert, &signer.key, csr, validity
            )?;
            crypto::cert_to_pem(&cert)
        })
    }

    fn sign_intermediate(&self, csr: &X509ReqRef) -> CaResult<String> {
        let now = self.clock.now();
        self.read(|inner| {
            let root = inner.root()?;
            let validity = Validity::from_now(
                now, inner.common.intermediate_cert_ttl
            ).capped_at(crypto::not_after(&root.cert)?);
            let cert = crypto::sign_ca_csr(
                &root.cert, &root.key, csr, validity
            )?;
            crypto::cert_to_pem(&cert)
        })
    }

    fn cross_sign_ca(&self, cert: &X509Ref) -> CaResult<String> {
        let now = self.clock.now();
        self.read(|inner| {
            let root = inner.root()?;
            let cross = crypto::cross_sign(cert, &root.cert, &root.key, now)?;
            crypto::cert_to_pem(&cross)
        })
    }

    fn supports_cross_signing(&self) -> bool {
        true
    }

    fn cleanup(
        &self,
        provider_type_changed: bool,
        _new_config: &ConfigMap,
    ) -> CaResult<()> {
        if provider_type_changed {
            debug!("Dropping builtin provider key material");
            *self.inner.write().unwrap() = None;
        }
        Ok(())
    }
}


//============ Tests =========================================================
