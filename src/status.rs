//! Snapshot of a light's state as reported by `get_prop`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::properties::{parse_number, parse_power};
use crate::types::{Brightness, HueSaturation, Kelvin, PowerMode};

/// Properties requested by [`Light::status`](crate::Light::status).
pub const STATUS_PROPERTIES: [&str; 8] = [
    "power",
    "bright",
    "ct",
    "hue",
    "sat",
    "color_mode",
    "bg_power",
    "name",
];

/// Which setting currently drives the main light's color.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Rgb,
    Temperature,
    Hsv,
}

impl ColorMode {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ColorMode::Rgb),
            2 => Some(ColorMode::Temperature),
            3 => Some(ColorMode::Hsv),
            _ => None,
        }
    }
}

/// State reported by a device.
///
/// Devices answer unsupported properties with an empty string; those end up
/// as `None`.
#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LightStatus {
    power: Option<PowerMode>,
    brightness: Option<Brightness>,
    temperature: Option<Kelvin>,
    color: Option<HueSaturation>,
    color_mode: Option<ColorMode>,
    backlight_power: Option<PowerMode>,
    name: Option<String>,
}

impl LightStatus {
    /// Build a status from a `query` result keyed by property name.
    pub fn from_properties(props: &HashMap<String, Value>) -> Self {
        let get = |name: &str| props.get(name);
        let power = |name: &str| get(name).and_then(parse_power).map(PowerMode::from);

        let color = match (
            get("hue").and_then(parse_number::<u16>),
            get("sat").and_then(parse_number::<u8>),
        ) {
            (Some(hue), Some(sat)) => HueSaturation::create(hue, sat),
            _ => None,
        };

        LightStatus {
            power: power("power"),
            brightness: get("bright")
                .and_then(parse_number::<u8>)
                .and_then(Brightness::create),
            temperature: get("ct").and_then(parse_number::<u16>).and_then(Kelvin::create),
            color,
            color_mode: get("color_mode")
                .and_then(parse_number::<u8>)
                .and_then(ColorMode::from_code),
            backlight_power: power("bg_power"),
            name: get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .map(String::from),
        }
    }

    pub fn power(&self) -> Option<PowerMode> {
        self.power
    }

    /// Whether the main light is on; `false` when unknown.
    pub fn emitting(&self) -> bool {
        self.power.is_some_and(|p| p.is_on())
    }

    pub fn brightness(&self) -> Option<&Brightness> {
        self.brightness.as_ref()
    }

    pub fn temperature(&self) -> Option<&Kelvin> {
        self.temperature.as_ref()
    }

    pub fn color(&self) -> Option<&HueSaturation> {
        self.color.as_ref()
    }

    pub fn color_mode(&self) -> Option<ColorMode> {
        self.color_mode
    }

    pub fn backlight_power(&self) -> Option<PowerMode> {
        self.backlight_power
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(values: &[(&str, Value)]) -> HashMap<String, Value> {
        values
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_full_status() {
        let status = LightStatus::from_properties(&props(&[
            ("power", json!("on")),
            ("bright", json!("75")),
            ("ct", json!("4000")),
            ("hue", json!("120")),
            ("sat", json!("80")),
            ("color_mode", json!("2")),
            ("bg_power", json!("off")),
            ("name", json!("desk")),
        ]));

        assert!(status.emitting());
        assert_eq!(status.brightness().map(|b| b.value()), Some(75));
        assert_eq!(status.temperature().map(|k| k.kelvin()), Some(4000));
        assert_eq!(status.color().map(|c| (c.hue(), c.saturation())), Some((120, 80)));
        assert_eq!(status.color_mode(), Some(ColorMode::Temperature));
        assert_eq!(status.backlight_power(), Some(PowerMode::Off));
        assert_eq!(status.name(), Some("desk"));
    }

    #[test]
    fn test_unsupported_properties_are_empty() {
        let status = LightStatus::from_properties(&props(&[
            ("power", json!("off")),
            ("bright", json!("")),
            ("hue", json!("")),
            ("sat", json!("50")),
            ("bg_power", json!("")),
            ("name", json!("")),
        ]));

        assert_eq!(status.power(), Some(PowerMode::Off));
        assert!(!status.emitting());
        assert!(status.brightness().is_none());
        assert!(status.color().is_none());
        assert!(status.backlight_power().is_none());
        assert!(status.name().is_none());
    }
}
