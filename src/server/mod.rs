//! The CA server: the manager, its collaborators and background tasks.

pub mod delegate;
pub mod endpoint;
pub mod manager;
pub mod observer;
pub mod router;
pub mod scheduler;
pub mod start;
pub mod store;

pub use self::delegate::{
    CaForwarder, CaStateAccess, RemoteCall, RemoteReply, RpcMethod,
};
pub use self::endpoint::ConnectCaEndpoint;
pub use self::manager::{CaManager, CaManagerBuilder, CaState, ManagerSettings};
pub use self::observer::{CaEvent, CaObserver, NoopObserver};
pub use self::router::DatacenterRouter;
pub use self::scheduler::RenewalScheduler;
pub use self::store::{CaStoreState, MemoryStore};
