//! Pluggable CA provider backends.
//!
//! A provider holds the CA key material and performs the actual signing.
//! The manager drives providers through the [`Provider`] trait and never
//! looks at keys itself. Providers are selected by name through a
//! [`ProviderFactory`].

use std::{error, fmt};
use std::str::FromStr;
use std::sync::Arc;
use openssl::x509::{X509Ref, X509ReqRef};
use crate::api::{ConfigMap, ProviderState};
use crate::commons::clock::{Clock, SystemClock};
use crate::commons::error::Error;
use crate::commons::CaResult;
use crate::constants::{PROVIDER_BUILTIN, PROVIDER_MOCK};

pub mod builtin;
pub use self::builtin::BuiltinProvider;

pub mod mock;
pub use self::mock::{Keystore, MockProvider};

mod config;
pub use self::config::CommonCaConfig;


//------------ ProviderConfig ------------------------------------------------

/// Everything a provider needs to know to configure itself.
#[derive(Clone, Debug, Default)]
pub struct ProviderConfig {
    /// The cluster id, from which the trust domain is derived.
    pub cluster_id: String,

    /// The datacenter this provider serves.
    pub datacenter: String,

    /// Whether the datacenter is the primary one.
    pub is_primary: bool,

    /// The opaque, provider specific configuration.
    pub raw: ConfigMap,

    /// State previously persisted on behalf of this provider, if any.
    pub state: Option<ProviderState>,
}


//------------ RootResult ----------------------------------------------------

/// The outcome of [`Provider::generate_root`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RootResult {
    /// The PEM encoded root certificate.
    pub pem: String,
}


//------------ Provider ------------------------------------------------------

/// The contract between the CA manager and a backend.
///
/// Calls may be slow. The manager never holds a lock over a provider call
/// other than the single-flight state guard. Implementations use interior
/// mutability so that a configured provider can be shared.
pub trait Provider: Send + Sync {
    /// Returns the name the provider is selected by.
    fn name(&self) -> &str;

    /// Configures the provider. Must be called before anything else.
    fn configure(&self, config: ProviderConfig) -> CaResult<()>;

    /// Returns the state that should be persisted for this provider.
    ///
    /// An empty state means there is nothing to persist.
    fn state(&self) -> CaResult<ProviderState>;

    /// Returns the root certificate, generating it if needed.
    ///
    /// Repeated calls return the same root as long as the configuration
    /// and state are unchanged.
    fn generate_root(&self) -> CaResult<RootResult>;

    /// Generates a new key and returns a CSR for an intermediate CA.
    fn generate_intermediate_csr(&self) -> CaResult<String>;

    /// Installs an intermediate signed by the primary for the key of the
    /// last generated CSR.
    fn set_intermediate(
        &self,
        intermediate_pem: &str,
        root_pem: &str,
    ) -> CaResult<()>;

    /// Returns the intermediate used for signing leaves, if any.
    fn active_intermediate(&self) -> CaResult<Option<String>>;

    /// Generates a fresh leaf signing intermediate under the local root.
    fn generate_intermediate(&self) -> CaResult<String>;

    /// Signs a leaf certificate. Returns the PEM of the leaf only.
    fn sign(&self, csr: &X509ReqRef) -> CaResult<String>;

    /// Signs an intermediate CA for another datacenter.
    fn sign_intermediate(&self, csr: &X509ReqRef) -> CaResult<String>;

    /// Cross-signs another root CA with this provider's root.
    fn cross_sign_ca(&self, cert: &X509Ref) -> CaResult<String>;

    /// Returns whether [`Provider::cross_sign_ca`] is available.
    fn supports_cross_signing(&self) -> bool;

    /// Releases resources once the provider has been replaced.
    fn cleanup(
        &self,
        provider_type_changed: bool,
        new_config: &ConfigMap,
    ) -> CaResult<()>;
}


//------------ ProviderKind --------------------------------------------------

/// The closed set of provider backends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderKind {
    Builtin,
    Mock,
}

impl ProviderKind {
    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::Builtin => PROVIDER_BUILTIN,
            ProviderKind::Mock => PROVIDER_MOCK,
        }
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> CaResult<Self> {
        match s {
            PROVIDER_BUILTIN => Ok(ProviderKind::Builtin),
            PROVIDER_MOCK => Ok(ProviderKind::Mock),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returns the id under which a provider's state is stored.
pub fn provider_state_id(provider: &str, datacenter: &str) -> String {
    format!("{}-{}", provider, datacenter)
}


//------------ ProviderFactory -----------------------------------------------

/// Creates unconfigured providers by name.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, name: &str) -> CaResult<Arc<dyn Provider>>;
}


//------------ BuiltinProviders ----------------------------------------------

/// The factory for the providers shipped with this crate.
///
/// All mock providers created by one factory share its keystore.
pub struct BuiltinProviders {
    clock: Arc<dyn Clock>,
    keystore: Arc<Keystore>,
}

impl BuiltinProviders {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        BuiltinProviders { clock, keystore: Keystore::new() }
    }
}

impl Default for BuiltinProviders {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl ProviderFactory for BuiltinProviders {
    fn create(&self, name: &str) -> CaResult<Arc<dyn Provider>> {
        match ProviderKind::from_str(name)? {
            ProviderKind::Builtin => {
                Ok(Arc::new(BuiltinProvider::new(self.clock.clone())))
            }
            ProviderKind::Mock => {
                Ok(Arc::new(MockProvider::new(
                    self.clock.clone(), self.keystore.clone()
                )))
            }
        }
    }
}


//------------ ProviderError -------------------------------------------------

/// Failures that originate in a provider backend.
#[derive(Debug)]
pub enum ProviderError {
    /// The provider was used before `configure`.
    NotConfigured,

    /// The operation needs a root this provider does not have.
    NoRoot,

    /// The operation needs an intermediate this provider does not have.
    NoIntermediate,

    /// The operation is not available for this kind of provider.
    Unsupported(&'static str),

    /// An intermediate does not fit the pending key or the given root.
    IntermediateMismatch(String),

    /// Persisted state could not be read.
    CorruptState(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProviderError::NotConfigured => {
                write!(f, "provider is not configured")
            }
            ProviderError::NoRoot => write!(f, "no root certificate"),
            ProviderError::NoIntermediate => {
                write!(f, "no intermediate certificate")
            }
            ProviderError::Unsupported(what) => {
                write!(f, "{} is not supported by this provider", what)
            }
            ProviderError::IntermediateMismatch(e) => {
                write!(f, "intermediate rejected: {}", e)
            }
            ProviderError::CorruptState(e) => {
                write!(f, "cannot restore provider state: {}", e)
            }
        }
    }
}

impl error::Error for ProviderError { }


//============ Tests =========================================================
