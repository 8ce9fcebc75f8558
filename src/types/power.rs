//! Power mode for light control.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Power state for a light.
///
/// Serializes to the protocol's `"on"` / `"off"` tokens.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PowerMode {
    /// Turn the light on
    On,
    /// Turn the light off
    Off,
}

impl PowerMode {
    /// Whether this mode means the light is emitting.
    pub fn is_on(&self) -> bool {
        matches!(self, PowerMode::On)
    }
}

impl From<bool> for PowerMode {
    fn from(on: bool) -> Self {
        if on { PowerMode::On } else { PowerMode::Off }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_power_tokens() {
        assert_eq!(PowerMode::On.as_ref(), "on");
        assert_eq!(PowerMode::from_str("off").unwrap(), PowerMode::Off);
        assert!(PowerMode::from_str("reboot").is_err());
        assert!(PowerMode::from(true).is_on());
    }
}
