//! CA configuration and root data structures.
//!
//! These types are what is stored in the replicated CA state and what is
//! exchanged between datacenters.

use std::collections::BTreeMap;
use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::commons::CaResult;
use crate::commons::crypto::{self, SpiffeId};
use crate::constants::TRUST_DOMAIN_SUFFIX;


//------------ ConfigMap -----------------------------------------------------

/// An opaque, provider specific configuration map.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;


//------------ CaConfiguration -----------------------------------------------

/// The configuration of the CA for a trust domain.
///
/// There is exactly one of these per datacenter in the replicated state. It
/// names the provider backend and carries its opaque configuration.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CaConfiguration {
    /// The unique identifier of the cluster, used for the trust domain.
    #[serde(default)]
    pub cluster_id: String,

    /// The name of the provider backend.
    pub provider: String,

    /// The provider specific configuration.
    #[serde(default)]
    pub config: ConfigMap,

    /// Allow root rotation even if the provider cannot cross-sign.
    #[serde(default)]
    pub force_without_cross_signing: bool,

    /// The log index at which this configuration was created.
    #[serde(default)]
    pub create_index: u64,

    /// The log index at which this configuration was last modified.
    #[serde(default)]
    pub modify_index: u64,
}

impl CaConfiguration {
    /// Returns the trust domain derived from the cluster id.
    pub fn trust_domain(&self) -> String {
        trust_domain_for_cluster(&self.cluster_id)
    }

    /// Returns the SPIFFE id this CA signs with.
    pub fn signing_id(&self) -> SpiffeId {
        SpiffeId::signing(&self.cluster_id)
    }
}

/// Returns the trust domain for the given cluster id.
pub fn trust_domain_for_cluster(cluster_id: &str) -> String {
    format!("{}.{}", cluster_id, TRUST_DOMAIN_SUFFIX)
}

/// Returns the cluster id from a trust domain, if it is one of ours.
pub fn cluster_id_from_trust_domain(trust_domain: &str) -> Option<&str> {
    let (cluster_id, suffix) = trust_domain.split_once('.')?;
    if cluster_id.is_empty() || suffix != TRUST_DOMAIN_SUFFIX {
        None
    }
    else {
        Some(cluster_id)
    }
}


//------------ CaRoot --------------------------------------------------------

/// A root certificate together with the intermediates hanging off it.
///
/// The last entry in `intermediate_certs` is the certificate that is used
/// for signing leaf certificates. If there are no intermediates, the root
/// signs leaf certificates directly.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CaRoot {
    /// The identifier, derived from the root public key.
    pub id: String,

    /// A human friendly name, the common name of the root.
    pub name: String,

    /// The serial number of the root certificate, colon separated hex.
    pub serial_number: String,

    /// The key identifier of the certificate that signs leaf certificates.
    pub signing_key_id: String,

    /// The trust domain of an external CA, if this root came from one.
    #[serde(default)]
    pub external_trust_domain: String,

    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,

    /// The PEM encoded root certificate.
    pub root_cert: String,

    /// PEM encoded intermediate certificates, in chain order.
    #[serde(default)]
    pub intermediate_certs: Vec<String>,

    /// Whether this is the currently active root.
    pub active: bool,

    /// When this root stopped being the active one.
    #[serde(default)]
    pub rotated_out_at: Option<DateTime<Utc>>,

    pub private_key_type: String,
    pub private_key_bits: u32,

    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl CaRoot {
    /// Creates an active root entry from a PEM encoded root certificate.
    ///
    /// The signing key id is set to the root itself. Adding intermediates
    /// should go through [`CaRoot::push_intermediate`].
    pub fn from_root_pem(pem: &str) -> CaResult<Self> {
        let cert = crypto::parse_cert(pem)?;
        let (private_key_type, private_key_bits) =
            crypto::key_type_and_bits(&cert)?;

        Ok(CaRoot {
            id: crypto::public_key_id(&cert)?,
            name: crypto::common_name(&cert).unwrap_or_default(),
            serial_number: crypto::serial_hex(&cert)?,
            signing_key_id: crypto::key_id(&cert)?,
            external_trust_domain: String::new(),
            not_before: crypto::not_before(&cert)?,
            not_after: crypto::not_after(&cert)?,
            root_cert: crypto::ensure_trailing_newline(pem),
            intermediate_certs: vec![],
            active: true,
            rotated_out_at: None,
            private_key_type,
            private_key_bits,
            create_index: 0,
            modify_index: 0,
        })
    }

    /// Returns the PEM of the certificate that signs leaf certificates.
    pub fn signing_cert(&self) -> &str {
        self.intermediate_certs
            .last()
            .map(String::as_str)
            .unwrap_or(&self.root_cert)
    }

    /// Appends a new leaf signing intermediate and updates the signing key
    /// id accordingly.
    pub fn push_intermediate(&mut self, pem: &str) -> CaResult<()> {
        let cert = crypto::parse_cert(pem)?;
        self.signing_key_id = crypto::key_id(&cert)?;
        self.intermediate_certs.push(crypto::ensure_trailing_newline(pem));
        Ok(())
    }

    /// Drops intermediates that have expired at `now`.
    ///
    /// The current signing intermediate is always kept.
    pub fn prune_expired_intermediates(&mut self, now: DateTime<Utc>) {
        let Some(signing) = self.intermediate_certs.pop() else {
            return
        };
        self.intermediate_certs.retain(|pem| {
            match crypto::parse_cert(pem).and_then(|c| crypto::not_after(&c)) {
                Ok(not_after) => not_after > now,
                Err(_) => true,
            }
        });
        self.intermediate_certs.push(signing);
    }
}

impl fmt::Display for CaRoot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({}, active: {}, intermediates: {})",
            self.name,
            self.id,
            self.active,
            self.intermediate_certs.len()
        )
    }
}


//------------ IndexedCaRoots ------------------------------------------------

/// All roots known in a datacenter, as returned by `ConnectCA.Roots`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct IndexedCaRoots {
    /// The id of the active root, empty if there is none.
    pub active_root_id: String,

    /// The trust domain of the datacenter, empty if not yet configured.
    pub trust_domain: String,

    pub roots: Vec<CaRoot>,

    /// The log index of the roots.
    pub index: u64,
}

impl IndexedCaRoots {
    /// Returns the active root, if any.
    pub fn active(&self) -> Option<&CaRoot> {
        self.roots.iter().find(|r| r.id == self.active_root_id && r.active)
    }
}


//------------ ProviderState -------------------------------------------------

/// Opaque state persisted on behalf of a provider.
///
/// The manager never interprets the data, it only stores it through the
/// replicated log and hands it back when a provider is configured.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProviderState {
    pub id: String,
    pub data: BTreeMap<String, String>,
}

impl ProviderState {
    pub fn new(id: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        ProviderState { id: id.into(), data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}


//============ Tests =========================================================
