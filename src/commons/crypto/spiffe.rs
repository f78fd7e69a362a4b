//! SPIFFE workload identities.

use std::fmt;
use std::str::FromStr;
use url::Url;
use crate::api::ca::trust_domain_for_cluster;
use crate::commons::error::Error;


//------------ SpiffeId ------------------------------------------------------

/// The identity a certificate is issued for.
///
/// Identities are encoded as `spiffe://` URIs in the subject alternative
/// name of certificates and CSRs.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum SpiffeId {
    /// `spiffe://<td>/ns/<namespace>/dc/<datacenter>/svc/<service>`
    Service {
        host: String,
        namespace: String,
        datacenter: String,
        service: String,
    },

    /// `spiffe://<td>/agent/client/dc/<datacenter>/id/<agent>`
    Agent {
        host: String,
        datacenter: String,
        agent: String,
    },

    /// `spiffe://<td>`, carried by CA certificates.
    Signing {
        trust_domain: String,
    },
}

impl SpiffeId {
    pub fn service(
        host: impl Into<String>,
        namespace: impl Into<String>,
        datacenter: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        SpiffeId::Service {
            host: host.into(),
            namespace: namespace.into(),
            datacenter: datacenter.into(),
            service: service.into(),
        }
    }

    pub fn agent(
        host: impl Into<String>,
        datacenter: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        SpiffeId::Agent {
            host: host.into(),
            datacenter: datacenter.into(),
            agent: agent.into(),
        }
    }

    /// Returns the signing id for the cluster with the given id.
    pub fn signing(cluster_id: &str) -> Self {
        SpiffeId::Signing {
            trust_domain: trust_domain_for_cluster(cluster_id),
        }
    }

    /// Returns the trust domain the identity belongs to.
    pub fn host(&self) -> &str {
        match self {
            SpiffeId::Service { host, .. } => host,
            SpiffeId::Agent { host, .. } => host,
            SpiffeId::Signing { trust_domain } => trust_domain,
        }
    }

    pub fn datacenter(&self) -> Option<&str> {
        match self {
            SpiffeId::Service { datacenter, .. } => Some(datacenter),
            SpiffeId::Agent { datacenter, .. } => Some(datacenter),
            SpiffeId::Signing { .. } => None,
        }
    }

    pub fn is_signing(&self) -> bool {
        matches!(self, SpiffeId::Signing { .. })
    }

    /// Returns whether a CA with this signing id may sign for `other`.
    ///
    /// A signing id can sign leaf identities in its own trust domain and
    /// itself, for intermediates.
    pub fn can_sign(&self, other: &SpiffeId) -> bool {
        match self {
            SpiffeId::Signing { trust_domain } => {
                other.host().eq_ignore_ascii_case(trust_domain)
            }
            _ => false,
        }
    }
}

impl FromStr for SpiffeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            Error::SpiffeIdRejected(
                format!("invalid SPIFFE id '{}': {}", s, reason)
            )
        };

        let url = Url::parse(s).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "spiffe" {
            return Err(invalid("scheme must be spiffe"))
        }
        let host = url.host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing trust domain"))?
            .to_string();

        let segments: Vec<&str> = url.path_segments()
            .map(|segs| segs.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        match segments.as_slice() {
            [] => Ok(SpiffeId::Signing { trust_domain: host }),
            ["ns", ns, "dc", dc, "svc", svc] => {
                Ok(SpiffeId::service(host, *ns, *dc, *svc))
            }
            ["agent", "client", "dc", dc, "id", agent] => {
                Ok(SpiffeId::agent(host, *dc, *agent))
            }
            _ => Err(invalid("unrecognized path")),
        }
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SpiffeId::Service { host, namespace, datacenter, service } => {
                write!(
                    f,
                    "spiffe://{}/ns/{}/dc/{}/svc/{}",
                    host, namespace, datacenter, service
                )
            }
            SpiffeId::Agent { host, datacenter, agent } => {
                write!(
                    f,
                    "spiffe://{}/agent/client/dc/{}/id/{}",
                    host, datacenter, agent
                )
            }
            SpiffeId::Signing { trust_domain } => {
                write!(f, "spiffe://{}", trust_domain)
            }
        }
    }
}


//============ Tests =========================================================
