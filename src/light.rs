//! Capability facade over a device session.

use serde_json::{Value, json};

use crate::config::{Capability, DeviceType, SessionConfig};
use crate::discovery::DeviceRecord;
use crate::errors::Error;
use crate::session::DeviceSession;
use crate::status::{LightStatus, STATUS_PROPERTIES};
use crate::types::{Brightness, DeviceId, HueSaturation, Kelvin, PowerMode, Transition};

type Result<T> = std::result::Result<T, Error>;

/// A device's advertised capabilities, driven through its session.
///
/// Every operation first checks that the device advertised the matching
/// capability and fails with [`Error::Unsupported`] otherwise. State changes
/// are sent as mutating commands, so they are cached by the session and
/// replayed after reconnects; they never fail because the device is offline.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use yeelight_rs::{Brightness, DiscoveryConfig, DiscoveryListener, Light, PowerMode, SessionRegistry};
///
/// # async fn demo() -> Result<(), yeelight_rs::Error> {
/// let registry = Arc::new(SessionRegistry::default());
/// let listener = DiscoveryListener::new(DiscoveryConfig::default(), Arc::clone(&registry));
/// listener.on_discovered(|record, session| {
///     let light = Light::from_record(record, session.clone(), &Default::default());
///     println!("{} can {:?}", record.identity, light.capabilities());
/// });
/// listener.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Light {
    session: DeviceSession,
    device: DeviceType,
    transition: Transition,
}

impl Light {
    pub fn new(session: DeviceSession, device: DeviceType, transition: Transition) -> Self {
        Light {
            session,
            device,
            transition,
        }
    }

    /// Attach the capabilities advertised in `record` to `session`.
    pub fn from_record(record: &DeviceRecord, session: DeviceSession, config: &SessionConfig) -> Self {
        let device = DeviceType::from_advertisement(&record.model, &record.support);
        Light::new(session, device, config.transition)
    }

    pub fn id(&self) -> &DeviceId {
        self.session.id()
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn device_type(&self) -> &DeviceType {
        &self.device
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.device.capabilities()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.device.features.supports(capability)
    }

    /// Use `transition` for every following state change.
    pub fn set_transition(&mut self, transition: Transition) {
        self.transition = transition;
    }

    fn require(&self, capability: Capability) -> Result<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(Error::unsupported(self.id(), &capability))
        }
    }

    async fn change(&self, capability: Capability, mut params: Vec<Value>) -> Result<()> {
        self.require(capability)?;
        params.extend(self.transition.params());
        self.session
            .set_state(capability.support_token(), params)
            .await
            .map(|_| ())
    }

    pub async fn set_power(&self, power: PowerMode) -> Result<()> {
        self.change(Capability::Power, vec![json!(power.as_ref())]).await
    }

    /// Invert the power state.
    ///
    /// Sent as an explicit `set_power` so that a replay after a reconnect
    /// cannot flip the light twice.
    pub async fn toggle(&self) -> Result<()> {
        self.require(Capability::Power)?;
        let on = match self.session.properties().power() {
            Some(on) => on,
            None => self.status().await?.emitting(),
        };
        self.set_power(PowerMode::from(!on)).await
    }

    pub async fn set_brightness(&self, brightness: &Brightness) -> Result<()> {
        self.change(Capability::Brightness, vec![json!(brightness.value())])
            .await
    }

    /// Set the white color temperature, clamped to the model's range.
    pub async fn set_color_temperature(&self, kelvin: &Kelvin) -> Result<()> {
        let kelvin = self.device.kelvin_range.clamp(kelvin.kelvin());
        self.change(Capability::ColorTemperature, vec![json!(kelvin)])
            .await
    }

    pub async fn set_hue_saturation(&self, color: &HueSaturation) -> Result<()> {
        self.change(
            Capability::Color,
            vec![json!(color.hue()), json!(color.saturation())],
        )
        .await
    }

    pub async fn set_backlight_power(&self, power: PowerMode) -> Result<()> {
        self.change(Capability::BacklightPower, vec![json!(power.as_ref())])
            .await
    }

    pub async fn set_backlight_brightness(&self, brightness: &Brightness) -> Result<()> {
        self.change(Capability::BacklightBrightness, vec![json!(brightness.value())])
            .await
    }

    pub async fn set_backlight_hue_saturation(&self, color: &HueSaturation) -> Result<()> {
        self.change(
            Capability::BacklightColor,
            vec![json!(color.hue()), json!(color.saturation())],
        )
        .await
    }

    /// Flash the light.
    pub async fn identify(&self) -> Result<()> {
        self.require(Capability::Flow)?;
        self.session.identify().await
    }

    /// Query the current state from the device.
    pub async fn status(&self) -> Result<LightStatus> {
        let props = self.session.query(&STATUS_PROPERTIES).await?;
        Ok(LightStatus::from_properties(&props))
    }
}
