//! Routing of forwarded calls between datacenters in one process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use async_trait::async_trait;
use log::trace;
use crate::commons::error::Error;
use crate::commons::CaResult;
use super::delegate::{CaForwarder, RemoteCall, RemoteReply};
use super::endpoint::ConnectCaEndpoint;


//------------ DatacenterRouter ----------------------------------------------

/// A [`CaForwarder`] that hands calls to registered endpoints by name.
#[derive(Default)]
pub struct DatacenterRouter {
    endpoints: RwLock<HashMap<String, ConnectCaEndpoint>>,
}

impl DatacenterRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, datacenter: impl Into<String>, endpoint: ConnectCaEndpoint) {
        self.endpoints.write().unwrap().insert(datacenter.into(), endpoint);
    }

    pub fn deregister(&self, datacenter: &str) {
        self.endpoints.write().unwrap().remove(datacenter);
    }

    fn endpoint(&self, datacenter: &str) -> Option<ConnectCaEndpoint> {
        self.endpoints.read().unwrap().get(datacenter).cloned()
    }
}

#[async_trait]
impl CaForwarder for DatacenterRouter {
    async fn forward_dc(
        &self,
        datacenter: &str,
        call: RemoteCall,
    ) -> CaResult<RemoteReply> {
        let method = call.method();
        let endpoint = self.endpoint(datacenter).ok_or_else(|| {
            Error::forwarding(method, datacenter, "no path to datacenter")
        })?;
        trace!("Routing {} to datacenter '{}'", method, datacenter);
        endpoint.handle(call).await
    }
}
