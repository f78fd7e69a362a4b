//! Common types and helpers used throughout the CA core.

pub mod clock;
pub mod crypto;
pub mod error;
pub mod ext_serde;

//------------ Response Aliases ----------------------------------------------

pub type CaResult<T> = std::result::Result<T, self::error::Error>;
