//! The `ConnectCA` RPC handlers of a datacenter.

use std::sync::Arc;
use log::debug;
use tokio_util::sync::CancellationToken;
use crate::api::{
    CaConfiguration, CaSignRequest, DcSpecificRequest, IndexedCaRoots,
    IssuedCert,
};
use crate::commons::crypto::{self, SpiffeId};
use crate::commons::error::Error;
use crate::commons::CaResult;
use super::delegate::{RemoteCall, RemoteReply, RpcMethod};
use super::manager::CaManager;


//------------ ConnectCaEndpoint ---------------------------------------------

/// Answers CA calls for one datacenter.
///
/// Calls naming another datacenter are forwarded there, except for leaf
/// signing which is always answered locally.
#[derive(Clone)]
pub struct ConnectCaEndpoint {
    manager: Arc<CaManager>,
}

impl ConnectCaEndpoint {
    pub fn new(manager: Arc<CaManager>) -> Self {
        ConnectCaEndpoint { manager }
    }

    pub fn manager(&self) -> &Arc<CaManager> {
        &self.manager
    }

    fn is_remote(&self, datacenter: &str) -> bool {
        !datacenter.is_empty() && datacenter != self.manager.datacenter()
    }

    /// `ConnectCA.Roots`
    pub async fn roots(
        &self,
        req: DcSpecificRequest,
    ) -> CaResult<IndexedCaRoots> {
        if self.is_remote(&req.datacenter) {
            let dc = req.datacenter.clone();
            return match self.manager.forward_call(
                &dc, RemoteCall::Roots(req)
            ).await? {
                RemoteReply::Roots(roots) => Ok(roots),
                _ => Err(Error::forwarding(
                    RpcMethod::Roots, dc, "unexpected reply"
                )),
            }
        }
        self.manager.roots()
    }

    /// `ConnectCA.SignIntermediate`
    pub async fn sign_intermediate(
        &self,
        req: CaSignRequest,
    ) -> CaResult<String> {
        if self.is_remote(&req.datacenter) {
            let dc = req.datacenter.clone();
            return match self.manager.forward_call(
                &dc, RemoteCall::SignIntermediate(req)
            ).await? {
                RemoteReply::SignIntermediate(pem) => Ok(pem),
                _ => Err(Error::forwarding(
                    RpcMethod::SignIntermediate, dc, "unexpected reply"
                )),
            }
        }
        self.manager.sign_intermediate(&req.csr)
    }

    /// `ConnectCA.Sign`
    ///
    /// The identity to sign for is taken from the single URI SAN of the
    /// CSR.
    pub async fn sign(&self, req: CaSignRequest) -> CaResult<IssuedCert> {
        let csr = crypto::parse_csr(&req.csr)?;
        let uris = crypto::csr_uris(&csr)?;
        let [uri] = uris.as_slice() else {
            return Err(Error::invalid_csr(
                "CSR must contain exactly one URI SAN"
            ))
        };
        let id: SpiffeId = uri.parse()?;
        debug!("Sign request for {}", id);
        self.manager.sign_certificate(&req.csr, &id).await
    }

    /// `ConnectCA.ConfigurationGet`
    pub fn configuration_get(&self) -> CaResult<CaConfiguration> {
        self.manager.configuration()
    }

    /// `ConnectCA.ConfigurationSet`
    pub async fn configuration_set(
        &self,
        config: CaConfiguration,
    ) -> CaResult<()> {
        self.manager
            .update_configuration(&CancellationToken::new(), config)
            .await
    }

    /// Dispatches a call forwarded from another datacenter.
    pub async fn handle(&self, call: RemoteCall) -> CaResult<RemoteReply> {
        match call {
            RemoteCall::Roots(req) => {
                self.roots(req).await.map(RemoteReply::Roots)
            }
            RemoteCall::SignIntermediate(req) => {
                self.sign_intermediate(req)
                    .await
                    .map(RemoteReply::SignIntermediate)
            }
        }
    }
}
