//! Request and response types for the CA endpoints and the replicated log.

use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use super::ca::{CaConfiguration, CaRoot, ProviderState};


//------------ DcSpecificRequest ---------------------------------------------

/// A request that is targeted at a datacenter.
///
/// An empty datacenter means the local one.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DcSpecificRequest {
    #[serde(default)]
    pub datacenter: String,
}

impl DcSpecificRequest {
    pub fn new(datacenter: impl Into<String>) -> Self {
        DcSpecificRequest { datacenter: datacenter.into() }
    }
}


//------------ CaSignRequest -------------------------------------------------

/// A request to sign a CSR.
///
/// Used both for leaf certificates, which are always signed locally, and
/// for intermediates, which are signed by the primary datacenter.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CaSignRequest {
    /// The datacenter that should handle the request, empty for local.
    #[serde(default)]
    pub datacenter: String,

    /// The PEM encoded certificate signing request.
    pub csr: String,
}

impl CaSignRequest {
    pub fn new(datacenter: impl Into<String>, csr: impl Into<String>) -> Self {
        CaSignRequest {
            datacenter: datacenter.into(),
            csr: csr.into(),
        }
    }
}


//------------ IssuedCert -----------------------------------------------------

/// A freshly signed leaf certificate.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IssuedCert {
    /// The serial number, colon separated hex.
    pub serial_number: String,

    /// The leaf certificate followed by the intermediate chain, all PEM.
    pub cert_pem: String,

    /// The service this certificate was issued to, if any.
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub service_uri: Option<String>,

    /// The agent this certificate was issued to, if any.
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub agent_uri: Option<String>,

    pub valid_after: DateTime<Utc>,
    pub valid_before: DateTime<Utc>,
}


//------------ CaRequest -----------------------------------------------------

/// A command for the replicated CA state.
///
/// Each committed request is applied exactly once, in log order, on every
/// replica.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CaRequest {
    /// Replaces the CA configuration.
    ///
    /// If `cas_index` is set, the request only applies if the stored
    /// configuration was last modified at that index.
    SetConfig {
        config: CaConfiguration,
        #[serde(default)]
        cas_index: Option<u64>,
    },

    /// Replaces the full set of roots, provided the roots were last
    /// modified at `index`.
    ///
    /// The configuration and provider state are updated in the same step
    /// if given. Provider state is only ever stored this way, together with
    /// the roots made from it.
    SetRoots {
        index: u64,
        roots: Vec<CaRoot>,
        #[serde(default)]
        config: Option<CaConfiguration>,
        #[serde(default)]
        provider_state: Option<ProviderState>,
    },

    /// Removes provider state.
    DeleteProviderState {
        id: String,
    },
}

impl CaRequest {
    /// Returns the name of the operation, for logging.
    pub fn op_name(&self) -> &'static str {
        match self {
            CaRequest::SetConfig { .. } => "set-config",
            CaRequest::SetRoots { .. } => "set-roots",
            CaRequest::DeleteProviderState { .. } => "delete-provider-state",
        }
    }
}

impl fmt::Display for CaRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.op_name())
    }
}


//------------ ApplyResponse -------------------------------------------------

/// The outcome of applying a [`CaRequest`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ApplyResponse {
    /// The log index the request was committed at.
    pub index: u64,

    /// Whether a compare-and-set condition was met.
    ///
    /// Requests without a condition always report `true`.
    pub applied: bool,
}


//============ Tests =========================================================
