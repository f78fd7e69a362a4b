//! The seams between the CA manager and the rest of the server.
//!
//! The manager reads and writes replicated state through [`CaStateAccess`]
//! and talks to other datacenters through [`CaForwarder`]. Both are kept
//! narrow so that tests can record every effect in order.

use std::fmt;
use async_trait::async_trait;
use crate::api::{
    ApplyResponse, CaConfiguration, CaRequest, CaRoot, CaSignRequest,
    DcSpecificRequest, IndexedCaRoots, ProviderState,
};
use crate::commons::CaResult;


//------------ CaStateAccess -------------------------------------------------

/// Access to the replicated CA state of the local datacenter.
#[async_trait]
pub trait CaStateAccess: Send + Sync {
    /// Returns the stored CA configuration, if any.
    fn ca_config(&self) -> CaResult<Option<CaConfiguration>>;

    /// Returns all roots and the index they were last modified at.
    fn ca_roots(&self) -> CaResult<(u64, Vec<CaRoot>)>;

    /// Returns the active root, if any.
    fn active_root(&self) -> CaResult<Option<CaRoot>>;

    fn provider_state(&self, id: &str) -> CaResult<Option<ProviderState>>;

    fn is_leader(&self) -> bool;

    /// Succeeds if all servers can take part in cross datacenter CA
    /// operations.
    fn servers_support_multi_dc_ca(&self) -> CaResult<()>;

    /// Commits a request to the replicated log and waits for it to apply.
    async fn apply_ca_request(
        &self,
        request: CaRequest,
    ) -> CaResult<ApplyResponse>;
}


//------------ RpcMethod -----------------------------------------------------

/// The remote methods the manager forwards to other datacenters.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RpcMethod {
    Roots,
    SignIntermediate,
}

impl RpcMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcMethod::Roots => "ConnectCA.Roots",
            RpcMethod::SignIntermediate => "ConnectCA.SignIntermediate",
        }
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ RemoteCall / RemoteReply --------------------------------------

#[derive(Clone, Debug)]
pub enum RemoteCall {
    Roots(DcSpecificRequest),
    SignIntermediate(CaSignRequest),
}

impl RemoteCall {
    pub fn method(&self) -> RpcMethod {
        match self {
            RemoteCall::Roots(_) => RpcMethod::Roots,
            RemoteCall::SignIntermediate(_) => RpcMethod::SignIntermediate,
        }
    }
}

#[derive(Clone, Debug)]
pub enum RemoteReply {
    Roots(IndexedCaRoots),

    /// The PEM of the signed intermediate.
    SignIntermediate(String),
}


//------------ CaForwarder ---------------------------------------------------

/// Sends calls to the CA endpoint of another datacenter.
#[async_trait]
pub trait CaForwarder: Send + Sync {
    async fn forward_dc(
        &self,
        datacenter: &str,
        call: RemoteCall,
    ) -> CaResult<RemoteReply>;
}
