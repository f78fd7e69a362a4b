//! Certificate handling and workload identities.

mod cert;
pub use self::cert::*;

mod spiffe;
pub use self::spiffe::*;
