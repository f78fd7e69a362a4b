//! Leaf certificate signing.

use log::debug;
use crate::api::{CaRoot, IssuedCert};
use crate::commons::crypto::{self, SpiffeId};
use crate::commons::error::Error;
use crate::commons::CaResult;
use super::CaManager;

impl CaManager {
    /// Signs a leaf certificate for a service or agent identity.
    ///
    /// Leaves are always signed locally, also in secondary datacenters.
    /// Certificates that are not valid yet are accepted as signing material
    /// on the assumption that they will be by the time the leaf is used.
    pub async fn sign_certificate(
        &self,
        csr_pem: &str,
        id: &SpiffeId,
    ) -> CaResult<IssuedCert> {
        let active = self.snapshot()?;
        let csr = crypto::parse_verified_csr(csr_pem)?;

        // The provider copies the URIs of the CSR into the leaf, so the
        // checked identity has to be the only one.
        let requested = id.to_string();
        match crypto::csr_uris(&csr)?.as_slice() {
            [uri] if *uri == requested => { }
            _ => {
                return Err(Error::SpiffeIdRejected(format!(
                    "CSR must request exactly the SPIFFE ID {}", requested
                )))
            }
        }
        if id.is_signing() {
            return Err(Error::SpiffeIdRejected(
                "SPIFFE ID in CSR must be a service or agent ID".into()
            ))
        }
        if !active.config.signing_id().can_sign(id) {
            return Err(Error::SpiffeIdRejected(format!(
                "SPIFFE ID in CSR from a different trust domain: {}", id
            )))
        }
        if id.datacenter() != Some(self.datacenter()) {
            return Err(Error::SpiffeIdRejected(format!(
                "SPIFFE ID in CSR from a different datacenter: {}", id
            )))
        }

        if !self.is_primary() && active.root.intermediate_certs.is_empty() {
            return Err(Error::NoActiveIntermediate)
        }
        self.check_expiry(&active.root)?;

        let _permit = match self.csr_limit.as_ref() {
            Some(limit) => {
                Some(limit.try_acquire().map_err(|_| Error::RateLimited)?)
            }
            None => None,
        };

        let leaf_pem = active.provider.sign(&csr)?;
        let leaf = crypto::parse_cert(&leaf_pem)?;

        let mut cert_pem = crypto::ensure_trailing_newline(&leaf_pem);
        for intermediate in &active.root.intermediate_certs {
            cert_pem.push_str(&crypto::ensure_trailing_newline(intermediate));
        }

        let (service, agent) = match id {
            SpiffeId::Service { service, .. } => (Some(service.clone()), None),
            SpiffeId::Agent { agent, .. } => (None, Some(agent.clone())),
            SpiffeId::Signing { .. } => (None, None),
        };
        let issued = IssuedCert {
            serial_number: crypto::serial_hex(&leaf)?,
            cert_pem,
            service_uri: service.as_ref().map(|_| requested.clone()),
            service,
            agent_uri: agent.as_ref().map(|_| requested.clone()),
            agent,
            valid_after: crypto::not_before(&leaf)?,
            valid_before: crypto::not_after(&leaf)?,
        };

        debug!(
            "Signed leaf certificate {} for {}",
            issued.serial_number, requested
        );
        self.observer.notify(&super::CaEvent::PostSign {
            signing_key_id: active.root.signing_key_id.clone(),
        });
        Ok(issued)
    }

    /// Checks that neither the root nor the signing intermediate expired.
    fn check_expiry(&self, root: &CaRoot) -> CaResult<()> {
        let now = self.now();

        let root_cert = crypto::parse_cert(&root.root_cert)?;
        let root_expiry = crypto::not_after(&root_cert)?;
        if root_expiry < now {
            return Err(Error::RootExpired(root_expiry))
        }

        if let Some(intermediate) = root.intermediate_certs.last() {
            let cert = crypto::parse_cert(intermediate)?;
            let expiry = crypto::not_after(&cert)?;
            if expiry < now {
                return Err(Error::IntermediateExpired(expiry))
            }
        }
        Ok(())
    }
}
