//! Brightness control.

use serde::{Deserialize, Serialize};

/// Brightness level from 1 to 100 percent.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Brightness {
    pub(crate) value: u8,
}

impl Default for Brightness {
    fn default() -> Self {
        Self::new()
    }
}

impl Brightness {
    const MIN: u8 = 1;
    const MAX: u8 = 100;

    /// Full brightness.
    pub fn new() -> Self {
        Brightness { value: Self::MAX }
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    /// Returns None if value is outside valid range (1-100).
    ///
    /// ```
    /// use yeelight_rs::Brightness;
    ///
    /// assert!(Brightness::create(0).is_none());
    /// assert_eq!(Brightness::create(1).unwrap().value(), 1);
    /// assert!(Brightness::create(101).is_none());
    /// ```
    pub fn create(value: u8) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Some(Brightness { value })
        } else {
            None
        }
    }

    /// Clamps into the valid range instead of rejecting.
    pub fn saturating(value: u8) -> Self {
        Brightness {
            value: value.clamp(Self::MIN, Self::MAX),
        }
    }
}
