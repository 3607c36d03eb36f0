//! DeviceId: stable identifier for one local install of the engine.
//!
//! Generated once when a vault's file index is first created and persisted
//! with it. Used as the key of this device's entry in every vector clock.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceIdError {
    #[error("Invalid device ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Identifier of a device participating in vault sync.
///
/// Displays (and serializes) as a 16-character lowercase hex string, which is
/// also the form used as a vector clock key.
///
/// # Examples
/// ```
/// use sync_core::DeviceId;
///
/// let parsed: DeviceId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.to_string(), "a1b2c3d4e5f67890");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    /// Generate a new random device ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DeviceIdError::InvalidFormat);
        }
        let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
        Ok(Self(id))
    }
}

impl From<u64> for DeviceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
