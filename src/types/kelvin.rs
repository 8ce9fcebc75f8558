//! Color temperature control.

use serde::{Deserialize, Serialize};

/// Color temperature in Kelvin, with valid protocol values from 1700K to 6500K.
///
/// Individual models accept a narrower band; see
/// [`KelvinRange`](crate::KelvinRange) for the per-model limits.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Kelvin {
    pub(crate) kelvin: u16,
}

impl Kelvin {
    pub(crate) const MIN: u16 = 1700;
    pub(crate) const MAX: u16 = 6500;

    /// Get the kelvin value.
    pub fn kelvin(&self) -> u16 {
        self.kelvin
    }

    /// Create a new Kelvin with the given value.
    ///
    /// Returns `None` if value is outside the valid range (1700-6500).
    ///
    /// # Examples
    ///
    /// ```
    /// use yeelight_rs::Kelvin;
    ///
    /// assert!(Kelvin::create(1699).is_none());
    /// assert!(Kelvin::create(1700).is_some());
    /// assert!(Kelvin::create(6500).is_some());
    /// assert!(Kelvin::create(6501).is_none());
    /// ```
    pub fn create(kelvin: u16) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&kelvin) {
            Some(Kelvin { kelvin })
        } else {
            None
        }
    }

    /// Convert a HomeKit-style mired value into Kelvin, clamped to the valid range.
    pub fn from_mired(mired: u32) -> Self {
        let kelvin = 1_000_000 / mired.max(1);
        Kelvin {
            kelvin: kelvin.clamp(Self::MIN as u32, Self::MAX as u32) as u16,
        }
    }

    /// The mired equivalent of this temperature.
    pub fn mired(&self) -> u32 {
        1_000_000 / self.kelvin as u32
    }
}
