//! Value types shared by sessions, discovery and the capability facade.

mod brightness;
mod endpoint;
mod hue_saturation;
mod identity;
mod kelvin;
mod power;
mod transition;

pub use brightness::Brightness;
pub use endpoint::Endpoint;
pub use hue_saturation::HueSaturation;
pub use identity::DeviceId;
pub use kelvin::Kelvin;
pub use power::PowerMode;
pub use transition::Transition;
