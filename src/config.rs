//! Session/discovery configuration and device capability detection.

use std::net::SocketAddrV4;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use strum_macros::{AsRefStr, Display, EnumIter};

use crate::types::Transition;

/// Tuning of a device session's command dispatcher.
///
/// Every field has a default, so a partial JSON document such as
/// `{"retries": 3}` is a valid configuration.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Extra attempts after the first one.
    pub retries: u32,
    /// Deadline of the first attempt; doubled on every retry.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_timeout: Duration,
    /// Effect appended to mutating commands built by [`crate::Light`].
    pub transition: Transition,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            base_timeout: Duration::from_millis(100),
            transition: Transition::default(),
        }
    }
}

/// Settings of the multicast discovery listener.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Group and port search requests are sent to.
    pub multicast_addr: SocketAddrV4,
    /// Local address of the listening socket.
    pub bind_addr: String,
    /// Pause between proactive searches.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub search_interval: Duration,
    /// Join the multicast group to hear unsolicited advertisements.
    pub join_multicast: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_addr: SocketAddrV4::new([239, 255, 255, 250].into(), 1982),
            bind_addr: "0.0.0.0:1982".to_string(),
            search_interval: Duration::from_secs(15),
            join_multicast: true,
        }
    }
}

/// A capability a device may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    Power,
    Brightness,
    ColorTemperature,
    Color,
    BacklightPower,
    BacklightBrightness,
    BacklightColor,
    Flow,
}

impl Capability {
    /// The advertised `support` token that grants this capability.
    pub fn support_token(&self) -> &'static str {
        match self {
            Capability::Power => "set_power",
            Capability::Brightness => "set_bright",
            Capability::ColorTemperature => "set_ct_abx",
            Capability::Color => "set_hsv",
            Capability::BacklightPower => "bg_set_power",
            Capability::BacklightBrightness => "bg_set_bright",
            Capability::BacklightColor => "bg_set_hsv",
            Capability::Flow => "start_cf",
        }
    }
}

/// Feature flags for a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    pub power: bool,
    pub brightness: bool,
    pub color_temperature: bool,
    pub color: bool,
    pub backlight_power: bool,
    pub backlight_brightness: bool,
    pub backlight_color: bool,
    pub flow: bool,
}

impl Features {
    /// Parse the advertised space-separated `support` tokens.
    pub fn from_support<S: AsRef<str>>(support: &[S]) -> Self {
        let has = |cap: Capability| support.iter().any(|t| t.as_ref() == cap.support_token());
        Features {
            power: has(Capability::Power),
            brightness: has(Capability::Brightness),
            color_temperature: has(Capability::ColorTemperature),
            color: has(Capability::Color),
            backlight_power: has(Capability::BacklightPower),
            backlight_brightness: has(Capability::BacklightBrightness),
            backlight_color: has(Capability::BacklightColor),
            flow: has(Capability::Flow),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Power => self.power,
            Capability::Brightness => self.brightness,
            Capability::ColorTemperature => self.color_temperature,
            Capability::Color => self.color,
            Capability::BacklightPower => self.backlight_power,
            Capability::BacklightBrightness => self.backlight_brightness,
            Capability::BacklightColor => self.backlight_color,
            Capability::Flow => self.flow,
        }
    }
}

/// Color temperature range (Kelvin).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KelvinRange {
    pub min: u16,
    pub max: u16,
}

impl Default for KelvinRange {
    fn default() -> Self {
        KelvinRange {
            min: 2700,
            max: 6500,
        }
    }
}

impl KelvinRange {
    /// Static per-model lookup of the supported color temperature band.
    pub fn for_model(model: &str) -> Self {
        match model {
            m if m.starts_with("color") || m.starts_with("strip") || m == "stripe" => {
                KelvinRange {
                    min: 1700,
                    max: 6500,
                }
            }
            m if m.starts_with("bslamp") => KelvinRange {
                min: 1700,
                max: 6500,
            },
            m if m.starts_with("ceiling") || m.starts_with("ct") || m == "lamp" => KelvinRange {
                min: 2700,
                max: 6500,
            },
            _ => KelvinRange::default(),
        }
    }

    pub fn clamp(&self, kelvin: u16) -> u16 {
        kelvin.clamp(self.min, self.max)
    }
}

/// Complete type information for a device.
#[derive(Debug, Clone)]
pub struct DeviceType {
    pub model: String,
    pub features: Features,
    pub kelvin_range: KelvinRange,
}

impl DeviceType {
    /// Build type information from an advertisement's `model` and `support` headers.
    pub fn from_advertisement<S: AsRef<str>>(model: &str, support: &[S]) -> Self {
        DeviceType {
            model: model.to_string(),
            features: Features::from_support(support),
            kelvin_range: KelvinRange::for_model(model),
        }
    }

    /// The fixed set of capabilities to attach to this device's session.
    pub fn capabilities(&self) -> Vec<Capability> {
        use strum::IntoEnumIterator;
        Capability::iter()
            .filter(|c| self.features.supports(*c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.retries, 5);
        assert_eq!(config.base_timeout, Duration::from_millis(100));
        assert_eq!(config.transition, Transition::Smooth(400));
    }

    #[test]
    fn test_partial_json_config() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"retries": 2, "base_timeout": 250}"#).unwrap();
        assert_eq!(config.retries, 2);
        assert_eq!(config.base_timeout, Duration::from_millis(250));
        assert_eq!(config.transition, Transition::Smooth(400));

        let discovery: DiscoveryConfig =
            serde_json::from_str(r#"{"search_interval": 1000}"#).unwrap();
        assert_eq!(discovery.search_interval, Duration::from_secs(1));
        assert_eq!(discovery.multicast_addr.port(), 1982);
    }

    #[test]
    fn test_capabilities_from_support() {
        let support = "get_prop set_default set_power toggle set_bright start_cf stop_cf set_ct_abx";
        let tokens: Vec<&str> = support.split_whitespace().collect();
        let device = DeviceType::from_advertisement("mono", &tokens);
        assert_eq!(
            device.capabilities(),
            vec![
                Capability::Power,
                Capability::Brightness,
                Capability::ColorTemperature,
                Capability::Flow
            ]
        );
        assert!(!device.features.color);
    }

    #[test]
    fn test_kelvin_range_lookup() {
        assert_eq!(KelvinRange::for_model("color4").min, 1700);
        assert_eq!(KelvinRange::for_model("ceiling4").min, 2700);
        assert_eq!(KelvinRange::for_model("ceiling4").clamp(1000), 2700);
        assert_eq!(KelvinRange::for_model("unknown"), KelvinRange::default());
    }
}
