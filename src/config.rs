//! Configuration of the `meshca` daemon.

use std::{env, fmt, io};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use clap::Parser;
use log::{error, info, LevelFilter};
use serde::{de, Deserialize, Deserializer};
use crate::api::{CaConfiguration, ConfigMap};
use crate::commons::ext_serde;
use crate::constants::*;
use crate::provider::{CommonCaConfig, ProviderKind};
use crate::server::manager::ManagerSettings;


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn datacenter() -> String {
        "dc1".to_string()
    }

    fn log_level() -> LevelFilter {
        match env::var(MESHCA_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {}",
                        MESHCA_ENV_LOG_LEVEL
                    );
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        match env::var(MESHCA_ENV_LOG_TYPE) {
            Ok(log_type) => match LogType::from_str(&log_type) {
                Ok(log_type) => log_type,
                Err(e) => {
                    eprintln!(
                        "Unrecognized value for log type in env var {}: {}",
                        MESHCA_ENV_LOG_TYPE, e
                    );
                    ::std::process::exit(1);
                }
            },
            _ => LogType::Stderr,
        }
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./meshca.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn ca() -> CaConfiguration {
        CaConfiguration {
            provider: PROVIDER_BUILTIN.to_string(),
            ..Default::default()
        }
    }

    fn renew_interval() -> Duration {
        DEFAULT_RENEW_INTERVAL
    }

    fn renew_fraction() -> f64 {
        DEFAULT_RENEW_FRACTION
    }

    fn drift_buffer() -> Duration {
        DEFAULT_DRIFT_BUFFER
    }

    fn csr_max_concurrent() -> usize {
        0
    }
}


//------------ Config --------------------------------------------------------

/// Global configuration for the daemon.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The name of the local datacenter.
    #[serde(default = "ConfigDefaults::datacenter")]
    pub datacenter: String,

    /// The name of the primary datacenter, the local one if not set.
    #[serde(default)]
    pub primary_datacenter: Option<String>,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "ext_serde::de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    /// The CA configuration to bootstrap with.
    #[serde(default = "ConfigDefaults::ca")]
    pub ca: CaConfiguration,

    /// How often to check whether the intermediate needs renewing.
    #[serde(
        default = "ConfigDefaults::renew_interval",
        deserialize_with = "ext_serde::de_duration"
    )]
    pub intermediate_cert_renew_interval: Duration,

    #[serde(default = "ConfigDefaults::renew_fraction")]
    pub renew_fraction: f64,

    #[serde(
        default = "ConfigDefaults::drift_buffer",
        deserialize_with = "ext_serde::de_duration"
    )]
    pub drift_buffer: Duration,

    /// The maximum number of leaf CSRs signed at once, 0 for no limit.
    #[serde(default = "ConfigDefaults::csr_max_concurrent")]
    pub csr_max_concurrent: usize,
}

/// # Accessors
impl Config {
    pub fn primary_datacenter(&self) -> &str {
        self.primary_datacenter.as_deref().unwrap_or(&self.datacenter)
    }

    /// Returns the settings for the CA manager of this datacenter.
    pub fn manager_settings(&self) -> ManagerSettings {
        let mut settings = ManagerSettings::new(
            self.datacenter.clone(),
            self.primary_datacenter().to_string(),
            self.ca.clone(),
        );
        settings.renew_fraction = self.renew_fraction;
        settings.drift_buffer = self.drift_buffer;
        settings.csr_max_concurrent = self.csr_max_concurrent;
        settings
    }
}

/// # Create and verify
impl Config {
    /// Creates a configuration for tests.
    pub fn test_config(datacenter: &str, primary_datacenter: &str) -> Self {
        let mut ca = ConfigDefaults::ca();
        ca.config = test_provider_config();

        Config {
            datacenter: datacenter.to_string(),
            primary_datacenter: Some(primary_datacenter.to_string()),
            log_level: LevelFilter::Debug,
            log_type: LogType::Stderr,
            log_file: ConfigDefaults::log_file(),
            syslog_facility: ConfigDefaults::syslog_facility(),
            ca,
            intermediate_cert_renew_interval: Duration::from_millis(100),
            renew_fraction: DEFAULT_RENEW_FRACTION,
            drift_buffer: DEFAULT_DRIFT_BUFFER,
            csr_max_concurrent: 0,
        }
    }

    /// Creates the config at startup from the file given on the command
    /// line and initializes logging.
    pub fn create() -> Result<Self, ConfigError> {
        let options = Options::parse();
        let config_file = options.config
            .unwrap_or_else(|| PathBuf::from(MESHCA_DEFAULT_CONFIG_FILE));

        let config = match Self::read_config(&config_file) {
            Err(e) => {
                if config_file == Path::new(MESHCA_DEFAULT_CONFIG_FILE) {
                    Err(ConfigError::other(
                        "Cannot find config file. Please use --config to \
                         specify its location.",
                    ))
                }
                else {
                    Err(ConfigError::Other(format!(
                        "Error parsing config file: {}, error: {}",
                        config_file.display(), e
                    )))
                }
            }
            Ok(config) => {
                config.init_logging()?;
                info!(
                    "{} uses configuration file: {}",
                    MESHCA_SERVER_APP, config_file.display()
                );
                Ok(config)
            }
        }?;
        config.verify().map_err(|e| {
            ConfigError::Other(format!(
                "Error parsing config file: {}, error: {}",
                config_file.display(), e
            ))
        })?;
        Ok(config)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.datacenter.is_empty() {
            return Err(ConfigError::other("datacenter must not be empty"))
        }
        if self.primary_datacenter().is_empty() {
            return Err(ConfigError::other(
                "primary_datacenter must not be empty"
            ))
        }
        if !(self.renew_fraction > 0.0 && self.renew_fraction < 1.0) {
            return Err(ConfigError::other(
                "renew_fraction must be between 0 and 1"
            ))
        }
        if self.intermediate_cert_renew_interval.is_zero() {
            return Err(ConfigError::other(
                "intermediate_cert_renew_interval must not be zero"
            ))
        }
        ProviderKind::from_str(&self.ca.provider)
            .map_err(|e| ConfigError::Other(e.to_string()))?;
        CommonCaConfig::parse(&self.ca.config)
            .map_err(|e| ConfigError::Other(format!("[ca.config]: {}", e)))?;
        Ok(())
    }

    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let mut v = String::new();
        let mut f = File::open(file)?;
        f.read_to_string(&mut v)?;

        let c: Config = toml::from_str(&v)?;
        Ok(c)
    }
}

/// # Logging
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            LogType::Syslog => self.syslog_logger(),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| {
                ConfigError::Other(format!(
                    "Failed to init stderr logging: {}", e
                ))
            })
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!(
                    "Failed to open log file '{}': {}",
                    path.display(), err
                );
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| {
                ConfigError::Other(format!(
                    "Failed to init file logging: {}", e
                ))
            })
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(&self) -> Result<(), ConfigError> {
        let facility = syslog::Facility::from_str(&self.syslog_facility)
            .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from(MESHCA_SERVER_APP));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| {
                syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514))
            });
        match logger {
            Ok(logger) => {
                self.fern_logger()
                    .chain(logger)
                    .apply()
                    .map_err(|e| {
                        ConfigError::Other(format!(
                            "Failed to init syslog: {}", e
                        ))
                    })
            }
            Err(err) => {
                let msg = format!("Cannot connect to syslog: {}", err);
                Err(ConfigError::Other(msg))
            }
        }
    }

    #[cfg(not(unix))]
    fn syslog_logger(&self) -> Result<(), ConfigError> {
        Err(ConfigError::other("syslog is only supported on unix"))
    }

    /// Creates and returns a fern logger with log level tweaks.
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace
            || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                }
                else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("mio", framework_level)
            .level_for("tokio", framework_level)
            .level_for("tokio_util", framework_level)
    }
}


//------------ Options -------------------------------------------------------

/// The command line options of the daemon.
#[derive(Clone, Debug, Parser)]
#[command(name = MESHCA_SERVER_APP, version = MESHCA_VERSION)]
struct Options {
    /// Override the path to the config file (default: '/etc/meshca.conf')
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError { }

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}


//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{}\"",
                s
            )),
        }
    }
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        LogType::from_str(&string).map_err(de::Error::custom)
    }
}


//------------ Helpers -------------------------------------------------------

/// Provider options with short lifetimes and fast keys, for tests.
fn test_provider_config() -> ConfigMap {
    let mut map = ConfigMap::new();
    map.insert("leaf_cert_ttl".into(), "1h".into());
    map.insert("intermediate_cert_ttl".into(), "72h".into());
    map.insert("private_key_type".into(), "ec".into());
    map.insert("private_key_bits".into(), 256.into());
    map
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::io::Write;
    use super::*;

    #[test]
    fn parse_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"
datacenter = "dc2"
primary_datacenter = "dc1"
log_level = "debug"
log_type = "stderr"
intermediate_cert_renew_interval = "30m"
drift_buffer = 120
csr_max_concurrent = 4

[ca]
provider = "builtin"

[ca.config]
leaf_cert_ttl = "24h"
intermediate_cert_ttl = "2160h"
private_key_type = "rsa"
private_key_bits = 2048
"#).unwrap();

        let config = Config::read_config(file.path()).unwrap();
        config.verify().unwrap();
        assert_eq!(config.datacenter, "dc2");
        assert_eq!(config.primary_datacenter(), "dc1");
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(
            config.intermediate_cert_renew_interval,
            Duration::from_secs(1800)
        );
        assert_eq!(config.drift_buffer, Duration::from_secs(120));

        let settings = config.manager_settings();
        assert!(!settings.is_primary());
        assert_eq!(settings.csr_max_concurrent, 4);
        assert_eq!(settings.bootstrap.provider, "builtin");

        let common = CommonCaConfig::parse(&settings.bootstrap.config).unwrap();
        assert_eq!(common.leaf_cert_ttl, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn defaults_make_a_primary() {
        let config: Config = toml::from_str("log_level = \"info\"").unwrap();
        assert_eq!(config.datacenter, "dc1");
        assert_eq!(config.primary_datacenter(), "dc1");
        assert_eq!(config.ca.provider, PROVIDER_BUILTIN);
        assert!(config.manager_settings().is_primary());
        config.verify().unwrap();
    }

    #[test]
    fn verify_rejects_bad_values() {
        let mut config = Config::test_config("dc1", "dc1");
        config.verify().unwrap();

        config.renew_fraction = 1.5;
        assert!(config.verify().is_err());

        let mut config = Config::test_config("dc1", "dc1");
        config.ca.provider = "vault".into();
        assert!(config.verify().is_err());

        let mut config = Config::test_config("dc1", "dc1");
        config.ca.config.insert("leaf_cert_ttl".into(), "1m".into());
        assert!(config.verify().is_err());
    }

    #[test]
    fn log_type_names() {
        assert_eq!(LogType::from_str("syslog"), Ok(LogType::Syslog));
        assert!(LogType::from_str("journal").is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let res = Config::read_config(&dir.path().join("nope.conf"));
        assert!(matches!(res, Err(ConfigError::IoError(_))));
    }
}
