//! Locally mirrored device properties.

use serde::Serialize;
use serde_json::Value;

use crate::types::PowerMode;

/// A property change the accessory layer may mirror into its own model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Property {
    Power(bool),
    Brightness(u8),
    ColorTemperature(u16),
    Hue(u16),
    Saturation(u8),
    BacklightPower(bool),
}

/// Best-effort cache of device state.
///
/// Updated optimistically after successful mutating commands and reactively
/// from `props` pushes; the device is authoritative, so a push always
/// overwrites whatever was assumed locally.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MirroredProperties {
    power: Option<bool>,
    bright: Option<u8>,
    ct: Option<u16>,
    hue: Option<u16>,
    sat: Option<u8>,
    bg_power: Option<bool>,
}

impl MirroredProperties {
    pub fn power(&self) -> Option<bool> {
        self.power
    }

    pub fn brightness(&self) -> Option<u8> {
        self.bright
    }

    pub fn color_temperature(&self) -> Option<u16> {
        self.ct
    }

    pub fn hue(&self) -> Option<u16> {
        self.hue
    }

    pub fn saturation(&self) -> Option<u8> {
        self.sat
    }

    pub fn backlight_power(&self) -> Option<bool> {
        self.bg_power
    }

    /// Apply one pushed property.
    ///
    /// Returns the change if the property has a local representation and its
    /// value differs from the mirrored one.
    pub fn apply(&mut self, name: &str, value: &Value) -> Option<Property> {
        let property = match name {
            "power" => Property::Power(parse_power(value)?),
            "bright" => Property::Brightness(parse_number(value)?),
            "ct" => Property::ColorTemperature(parse_number(value)?),
            "hue" => Property::Hue(parse_number(value)?),
            "sat" => Property::Saturation(parse_number(value)?),
            "bg_power" => Property::BacklightPower(parse_power(value)?),
            _ => return None,
        };
        self.set(property)
    }

    /// Apply the optimistic effect of a mutating command that succeeded.
    pub fn apply_command(&mut self, method: &str, params: &[Value]) -> Vec<Property> {
        let first = params.first();
        let second = params.get(1);
        let updates: Vec<(&str, Option<&Value>)> = match method {
            "set_power" => vec![("power", first)],
            "bg_set_power" => vec![("bg_power", first)],
            "set_bright" => vec![("bright", first)],
            "set_ct_abx" => vec![("ct", first)],
            "set_hsv" => vec![("hue", first), ("sat", second)],
            _ => Vec::new(),
        };
        updates
            .into_iter()
            .filter_map(|(name, value)| value.and_then(|v| self.apply(name, v)))
            .collect()
    }

    fn set(&mut self, property: Property) -> Option<Property> {
        let changed = match property {
            Property::Power(v) => replace(&mut self.power, v),
            Property::Brightness(v) => replace(&mut self.bright, v),
            Property::ColorTemperature(v) => replace(&mut self.ct, v),
            Property::Hue(v) => replace(&mut self.hue, v),
            Property::Saturation(v) => replace(&mut self.sat, v),
            Property::BacklightPower(v) => replace(&mut self.bg_power, v),
        };
        changed.then_some(property)
    }
}

fn replace<T: PartialEq>(slot: &mut Option<T>, value: T) -> bool {
    if slot.as_ref() == Some(&value) {
        return false;
    }
    *slot = Some(value);
    true
}

pub(crate) fn parse_power(value: &Value) -> Option<bool> {
    value.as_str()?.parse::<PowerMode>().ok().map(|p| p.is_on())
}

// Devices report numbers either as JSON numbers or as decimal strings.
pub(crate) fn parse_number<T: TryFrom<u64>>(value: &Value) -> Option<T> {
    let n = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    T::try_from(n).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_updates_known_properties() {
        let mut props = MirroredProperties::default();
        assert_eq!(props.apply("power", &json!("on")), Some(Property::Power(true)));
        assert_eq!(props.apply("bright", &json!("42")), Some(Property::Brightness(42)));
        assert_eq!(props.apply("ct", &json!(4000)), Some(Property::ColorTemperature(4000)));
        assert_eq!(props.power(), Some(true));
        assert_eq!(props.brightness(), Some(42));
    }

    #[test]
    fn test_unchanged_and_unknown_are_ignored() {
        let mut props = MirroredProperties::default();
        props.apply("power", &json!("off"));
        assert_eq!(props.apply("power", &json!("off")), None);
        assert_eq!(props.apply("music_on", &json!(1)), None);
        assert_eq!(props.apply("bright", &json!("bright")), None);
        assert_eq!(props.apply("bright", &json!(1000)), None);
    }

    #[test]
    fn test_optimistic_command_update() {
        let mut props = MirroredProperties::default();
        let changes =
            props.apply_command("set_power", &[json!("on"), json!("smooth"), json!(400)]);
        assert_eq!(changes, vec![Property::Power(true)]);

        let changes = props.apply_command("set_hsv", &[json!(120), json!(80), json!("sudden")]);
        assert_eq!(changes, vec![Property::Hue(120), Property::Saturation(80)]);

        assert!(props.apply_command("start_cf", &[json!(1)]).is_empty());
    }
}
