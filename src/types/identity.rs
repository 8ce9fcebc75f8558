//! Stable device identity.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Short, stable identifier of a device.
///
/// Derived from the vendor's full identifier (e.g. `0x000000000015243f`)
/// by keeping its last six hexadecimal digits, lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    const LEN: usize = 6;

    /// Derive the identity from a vendor-supplied full identifier.
    ///
    /// ```
    /// use yeelight_rs::DeviceId;
    ///
    /// let id = DeviceId::from_full_id("0x000000000015243F").unwrap();
    /// assert_eq!(id.as_str(), "15243f");
    /// assert!(DeviceId::from_full_id("0x12").is_err());
    /// ```
    pub fn from_full_id(full_id: &str) -> Result<Self, Error> {
        let trimmed = full_id.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.len() < Self::LEN || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidIdentity(full_id.to_string()));
        }

        Ok(DeviceId(digits[digits.len() - Self::LEN..].to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
