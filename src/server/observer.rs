//! Hooks for watching the CA manager at its effect boundaries.

use crate::server::delegate::RpcMethod;
use crate::server::manager::CaState;


//------------ CaEvent -------------------------------------------------------

/// Something the CA manager is about to do or has just done.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CaEvent {
    /// A call is about to be forwarded to another datacenter.
    PreForward {
        method: RpcMethod,
        datacenter: String,
    },

    /// A leaf certificate was signed.
    PostSign {
        signing_key_id: String,
    },

    /// A request is about to be applied to the replicated log.
    PreApply {
        op: &'static str,
    },

    StateChanged {
        from: CaState,
        to: CaState,
    },
}


//------------ CaObserver ----------------------------------------------------

pub trait CaObserver: Send + Sync {
    fn notify(&self, event: &CaEvent);
}


//------------ NoopObserver --------------------------------------------------

/// The observer used when nobody is watching.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl CaObserver for NoopObserver {
    fn notify(&self, _event: &CaEvent) { }
}
