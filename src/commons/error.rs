//! Defines all CA core errors.

use std::{error, fmt, io};
use chrono::{DateTime, Utc};
use openssl::error::ErrorStack;
use crate::provider::ProviderError;
use crate::server::{CaState, RpcMethod};


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // State machine
    //-----------------------------------------------------------------

    /// A mutating operation is already in flight.
    Busy(CaState),

    /// The operation needs an initialized CA.
    NotInitialized,

    /// The operation was cancelled before it committed anything.
    Cancelled,

    /// This node is not the leader and cannot change the CA.
    NotLeader,

    //-----------------------------------------------------------------
    // Expired signing material
    //-----------------------------------------------------------------

    RootExpired(DateTime<Utc>),
    IntermediateExpired(DateTime<Utc>),

    //-----------------------------------------------------------------
    // Forwarding to other datacenters
    //-----------------------------------------------------------------

    Forwarding {
        method: RpcMethod,
        datacenter: String,
        reason: String,
    },

    /// Servers in the cluster cannot do cross datacenter CA yet.
    MultiDcUnsupported(String),

    /// The primary datacenter has no active root.
    PrimaryNoActiveRoot(String),

    /// The operation is only available in the primary datacenter.
    NotPrimary(String),

    //-----------------------------------------------------------------
    // Provider
    //-----------------------------------------------------------------

    Provider(ProviderError),
    UnknownProvider(String),

    /// The secondary has no active intermediate.
    NoActiveIntermediate,

    /// Root rotation requires cross-signing that the provider can't do.
    CrossSigningUnsupported(String),

    //-----------------------------------------------------------------
    // Replicated log
    //-----------------------------------------------------------------

    Apply(String),

    /// A compare-and-set apply found the state modified concurrently.
    CasFailed(&'static str),

    //-----------------------------------------------------------------
    // Configuration and requests
    //-----------------------------------------------------------------

    InvalidCaConfig(String),
    InvalidCsr(String),
    InvalidCert(String),

    /// The identity in a CSR can't be signed by this CA.
    SpiffeIdRejected(String),

    /// Too many concurrent signing requests.
    RateLimited,

    //-----------------------------------------------------------------
    // System
    //-----------------------------------------------------------------

    OpenSsl(ErrorStack),
    Json(serde_json::Error),
    Io(io::Error),
}

impl Error {
    pub fn forwarding(
        method: RpcMethod,
        datacenter: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        Error::Forwarding {
            method,
            datacenter: datacenter.into(),
            reason: reason.to_string(),
        }
    }

    pub fn apply(e: impl fmt::Display) -> Self {
        Error::Apply(e.to_string())
    }

    pub fn invalid_config(e: impl fmt::Display) -> Self {
        Error::InvalidCaConfig(e.to_string())
    }

    pub fn invalid_csr(e: impl fmt::Display) -> Self {
        Error::InvalidCsr(e.to_string())
    }

    pub fn invalid_cert(e: impl fmt::Display) -> Self {
        Error::InvalidCert(e.to_string())
    }

    /// Returns whether the error is a busy state machine.
    ///
    /// Callers such as timers treat this as 'try again later'.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Busy(state) => {
                write!(f, "CA manager busy in state {}", state)
            }
            Error::NotInitialized => {
                write!(f, "CA manager is not initialized")
            }
            Error::Cancelled => write!(f, "CA operation cancelled"),
            Error::NotLeader => write!(f, "not the leader"),
            Error::RootExpired(at) => write!(
                f,
                "root expired: certificate expired, expiration date: {}",
                at
            ),
            Error::IntermediateExpired(at) => write!(
                f,
                "intermediate expired: certificate expired, expiration date: {}",
                at
            ),
            Error::Forwarding { method, datacenter, reason } => write!(
                f,
                "failed to forward {} to datacenter '{}': {}",
                method, datacenter, reason
            ),
            Error::MultiDcUnsupported(e) => write!(
                f,
                "servers do not support cross datacenter CA operations: {}",
                e
            ),
            Error::PrimaryNoActiveRoot(dc) => write!(
                f,
                "primary datacenter '{}' does not have an active root CA",
                dc
            ),
            Error::NotPrimary(dc) => write!(
                f,
                "intermediates can only be signed in the primary datacenter '{}'",
                dc
            ),
            Error::Provider(e) => write!(f, "CA provider error: {}", e),
            Error::UnknownProvider(name) => {
                write!(f, "unknown CA provider '{}'", name)
            }
            Error::NoActiveIntermediate => write!(
                f,
                "secondary datacenter doesn't have an active intermediate"
            ),
            Error::CrossSigningUnsupported(provider) => write!(
                f,
                "the current CA provider '{}' does not support cross-signing, \
                 try again with force_without_cross_signing set to true",
                provider
            ),
            Error::Apply(e) => write!(f, "raft apply failed: {}", e),
            Error::CasFailed(what) => write!(
                f,
                "could not atomically update {}, modified concurrently",
                what
            ),
            Error::InvalidCaConfig(e) => {
                write!(f, "invalid CA configuration: {}", e)
            }
            Error::InvalidCsr(e) => write!(f, "invalid CSR: {}", e),
            Error::InvalidCert(e) => write!(f, "invalid certificate: {}", e),
            Error::SpiffeIdRejected(e) => write!(f, "{}", e),
            Error::RateLimited => write!(
                f,
                "rate limit reached, try again later"
            ),
            Error::OpenSsl(e) => write!(f, "OpenSSL error: {}", e),
            Error::Json(e) => write!(f, "JSON error: {}", e),
            Error::Io(e) => e.fmt(f),
        }
    }
}

impl error::Error for Error { }

impl From<ProviderError> for Error {
    fn from(e: ProviderError) -> Self {
        Error::Provider(e)
    }
}

impl From<ErrorStack> for Error {
    fn from(e: ErrorStack) -> Self {
        Error::OpenSsl(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}


//============ Tests =========================================================
