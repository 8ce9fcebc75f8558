//! Transition effect attached to mutating commands.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// How a device moves from its current state to the requested one.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    /// Jump straight to the target value.
    Sudden,
    /// Fade over the given number of milliseconds.
    Smooth(u32),
}

impl Default for Transition {
    fn default() -> Self {
        Transition::Smooth(Self::DEFAULT_MS)
    }
}

impl Transition {
    const MIN_SMOOTH_MS: u32 = 30;
    const DEFAULT_MS: u32 = 400;

    /// A smooth transition, rejected below the device minimum of 30ms.
    ///
    /// ```
    /// use std::time::Duration;
    /// use yeelight_rs::Transition;
    ///
    /// assert!(Transition::smooth(Duration::from_millis(10)).is_none());
    /// assert_eq!(
    ///     Transition::smooth(Duration::from_millis(400)),
    ///     Some(Transition::Smooth(400))
    /// );
    /// ```
    pub fn smooth(duration: Duration) -> Option<Self> {
        let ms = u32::try_from(duration.as_millis()).ok()?;
        (ms >= Self::MIN_SMOOTH_MS).then_some(Transition::Smooth(ms))
    }

    /// The trailing `effect, duration` pair of a mutating command.
    pub fn params(&self) -> [Value; 2] {
        match self {
            Transition::Sudden => [json!("sudden"), json!(0)],
            Transition::Smooth(ms) => [json!("smooth"), json!(ms)],
        }
    }
}
