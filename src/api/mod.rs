//! Data types used by the CA endpoints and the replicated CA state.

pub mod ca;
pub mod requests;

pub use self::ca::{
    CaConfiguration, CaRoot, ConfigMap, IndexedCaRoots, ProviderState,
};
pub use self::requests::{
    ApplyResponse, CaRequest, CaSignRequest, DcSpecificRequest, IssuedCert,
};
