//! Configuration options shared by all providers.

use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::api::ConfigMap;
use crate::commons::crypto::KeyType;
use crate::commons::error::Error;
use crate::commons::ext_serde;
use crate::commons::CaResult;
use crate::constants::{
    DEFAULT_INTERMEDIATE_CERT_TTL, DEFAULT_LEAF_CERT_TTL,
    DEFAULT_PRIVATE_KEY_BITS, DEFAULT_PRIVATE_KEY_TYPE, DEFAULT_ROOT_CERT_TTL,
    MAX_LEAF_CERT_TTL, MIN_LEAF_CERT_TTL,
};


//------------ CommonCaConfigDefaults ----------------------------------------

struct CommonCaConfigDefaults;

impl CommonCaConfigDefaults {
    fn leaf_cert_ttl() -> Duration {
        DEFAULT_LEAF_CERT_TTL
    }

    fn intermediate_cert_ttl() -> Duration {
        DEFAULT_INTERMEDIATE_CERT_TTL
    }

    fn root_cert_ttl() -> Duration {
        DEFAULT_ROOT_CERT_TTL
    }

    fn private_key_type() -> String {
        DEFAULT_PRIVATE_KEY_TYPE.to_string()
    }

    fn private_key_bits() -> u32 {
        DEFAULT_PRIVATE_KEY_BITS
    }
}


//------------ CommonCaConfig ------------------------------------------------

/// The part of the opaque provider configuration every provider honours.
///
/// Durations are given as strings such as `"72h"`, or as seconds.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CommonCaConfig {
    #[serde(
        default = "CommonCaConfigDefaults::leaf_cert_ttl",
        deserialize_with = "ext_serde::de_duration",
        serialize_with = "ext_serde::ser_duration"
    )]
    pub leaf_cert_ttl: Duration,

    #[serde(
        default = "CommonCaConfigDefaults::intermediate_cert_ttl",
        deserialize_with = "ext_serde::de_duration",
        serialize_with = "ext_serde::ser_duration"
    )]
    pub intermediate_cert_ttl: Duration,

    #[serde(
        default = "CommonCaConfigDefaults::root_cert_ttl",
        deserialize_with = "ext_serde::de_duration",
        serialize_with = "ext_serde::ser_duration"
    )]
    pub root_cert_ttl: Duration,

    #[serde(default = "CommonCaConfigDefaults::private_key_type")]
    pub private_key_type: String,

    #[serde(default = "CommonCaConfigDefaults::private_key_bits")]
    pub private_key_bits: u32,

    /// An operator supplied root key, PEM encoded.
    #[serde(default)]
    pub private_key: Option<String>,

    /// An operator supplied root certificate, PEM encoded.
    #[serde(default)]
    pub root_cert: Option<String>,
}

impl CommonCaConfig {
    /// Parses and validates the common options from a provider config map.
    pub fn parse(raw: &ConfigMap) -> CaResult<Self> {
        let config: Self = serde_json::from_value(
            serde_json::Value::Object(raw.clone())
        ).map_err(Error::invalid_config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CaResult<()> {
        if self.leaf_cert_ttl < MIN_LEAF_CERT_TTL {
            return Err(Error::invalid_config(format!(
                "leaf_cert_ttl must be at least {}",
                ext_serde::format_duration(MIN_LEAF_CERT_TTL)
            )))
        }
        if self.leaf_cert_ttl > MAX_LEAF_CERT_TTL {
            return Err(Error::invalid_config(format!(
                "leaf_cert_ttl must be at most {}",
                ext_serde::format_duration(MAX_LEAF_CERT_TTL)
            )))
        }
        if self.intermediate_cert_ttl < self.leaf_cert_ttl * 3 {
            return Err(Error::invalid_config(format!(
                "intermediate_cert_ttl must be at least 3x leaf_cert_ttl ({})",
                ext_serde::format_duration(self.leaf_cert_ttl * 3)
            )))
        }
        if self.root_cert_ttl < self.intermediate_cert_ttl {
            return Err(Error::invalid_config(
                "root_cert_ttl must not be shorter than intermediate_cert_ttl"
            ))
        }
        self.key_type()?.check_bits(self.private_key_bits)?;
        if self.private_key.is_some() != self.root_cert.is_some() {
            return Err(Error::invalid_config(
                "private_key and root_cert must be given together"
            ))
        }
        Ok(())
    }

    pub fn key_type(&self) -> CaResult<KeyType> {
        KeyType::from_str(&self.private_key_type)
    }
}

impl Default for CommonCaConfig {
    fn default() -> Self {
        CommonCaConfig {
            leaf_cert_ttl: CommonCaConfigDefaults::leaf_cert_ttl(),
            intermediate_cert_ttl:
                CommonCaConfigDefaults::intermediate_cert_ttl(),
            root_cert_ttl: CommonCaConfigDefaults::root_cert_ttl(),
            private_key_type: CommonCaConfigDefaults::private_key_type(),
            private_key_bits: CommonCaConfigDefaults::private_key_bits(),
            private_key: None,
            root_cert: None,
        }
    }
}


//============ Tests =========================================================
