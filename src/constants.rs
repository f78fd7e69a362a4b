//! Various crate-wide constants.

use std::time::Duration;


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `meshca` binary.
pub const MESHCA_SERVER_APP: &str = "meshca";

/// The version of this crate, as reported by the binary.
pub const MESHCA_VERSION: &str = env!("CARGO_PKG_VERSION");


//------------ Config Files Paths -------------------------------------------

/// The default path to the config file.
pub const MESHCA_DEFAULT_CONFIG_FILE: &str = "/etc/meshca.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const MESHCA_ENV_LOG_LEVEL: &str = "MESHCA_LOG_LEVEL";

/// The environment variable with the log target.
///
/// The variable should contain the name of a
/// [`LogType`][crate::config::LogType]. It will be overwritten by the config
/// file. The default is “stderr.”
pub const MESHCA_ENV_LOG_TYPE: &str = "MESHCA_LOG_TYPE";


//------------ Providers ----------------------------------------------------

/// The name of the built-in provider.
pub const PROVIDER_BUILTIN: &str = "builtin";

/// The name of the provider that keeps its keys outside the log.
pub const PROVIDER_MOCK: &str = "mock";


//------------ Trust Domain -------------------------------------------------

/// The suffix appended to a cluster id to form the trust domain.
pub const TRUST_DOMAIN_SUFFIX: &str = "mesh";

/// The namespace used for service identities that do not name one.
pub const DEFAULT_NAMESPACE: &str = "default";


//------------ Certificate Timing -------------------------------------------

/// The default lifetime of leaf certificates.
pub const DEFAULT_LEAF_CERT_TTL: Duration = Duration::from_secs(72 * 3600);

/// The default lifetime of intermediate certificates.
pub const DEFAULT_INTERMEDIATE_CERT_TTL: Duration =
    Duration::from_secs(365 * 24 * 3600);

/// The default lifetime of root certificates.
pub const DEFAULT_ROOT_CERT_TTL: Duration =
    Duration::from_secs(10 * 365 * 24 * 3600);

/// The shortest leaf certificate lifetime accepted in CA configuration.
pub const MIN_LEAF_CERT_TTL: Duration = Duration::from_secs(3600);

/// The longest leaf certificate lifetime accepted in CA configuration.
pub const MAX_LEAF_CERT_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

/// How far certificates are backdated to tolerate clock skew across nodes.
pub const CERT_BACKDATE: Duration = Duration::from_secs(60);

/// The default interval between renewal checks.
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(3600);

/// The default buffer subtracted from renewal deadlines for clock drift.
pub const DEFAULT_DRIFT_BUFFER: Duration = Duration::from_secs(60);

/// The default fraction of the intermediate lifetime after which it is
/// renewed.
pub const DEFAULT_RENEW_FRACTION: f64 = 0.5;


//------------ Keys ---------------------------------------------------------

/// The default private key type for generated CA keys.
pub const DEFAULT_PRIVATE_KEY_TYPE: &str = "ec";

/// The default private key size for generated CA keys.
pub const DEFAULT_PRIVATE_KEY_BITS: u32 = 256;
