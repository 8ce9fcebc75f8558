//! # yeelight_rs
//!
//! An async Rust library for controlling Yeelight smart lights on the local network.
//!
//! Devices are found with an SSDP-style multicast search and controlled over a
//! plain TCP socket carrying one JSON object per line. This crate keeps that
//! socket alive for you:
//!
//! - every request gets a process-unique id and is correlated with its response
//! - failed attempts are retried with an exponentially growing deadline
//! - state changes are cached as *desired state* and replayed after every reconnect
//! - unsolicited `props` notifications keep a local mirror of the device's state
//! - a device that changes its address is followed without losing queued state
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use yeelight_rs::{DiscoveryConfig, DiscoveryListener, Light, PowerMode, SessionRegistry};
//!
//! # async fn demo() -> Result<(), yeelight_rs::Error> {
//! let registry = Arc::new(SessionRegistry::default());
//! let listener = DiscoveryListener::new(DiscoveryConfig::default(), Arc::clone(&registry));
//! let handle = listener.start().await?;
//!
//! // ...later, once devices were found:
//! for session in registry.sessions_snapshot() {
//!     session
//!         .set_state("set_power", vec!["on".into(), "smooth".into(), 500.into()])
//!         .await?;
//! }
//!
//! listener.stop();
//! handle.await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Mutating commands and queries
//!
//! [`DeviceSession::set_state`] never fails because a device is offline: the
//! command stays cached and is replayed, in a fixed priority order, the next
//! time a socket to the device is opened. [`DeviceSession::query`] reports
//! failures immediately with [`Error::CommandFailed`].
//!
//! ## Capabilities
//!
//! [`Light`] wraps a session with the capabilities the device advertised
//! (power, brightness, color temperature, color, backlight, flows) and
//! refuses the ones it did not with [`Error::Unsupported`].
//!
//! ## Runtime Selection
//!
//! This library is runtime-agnostic. Select your preferred runtime using feature flags:
//!
//! ### Using tokio (default)
//!
//! ```toml
//! [dependencies]
//! yeelight-rs = "0.1"
//! tokio = { version = "1", features = ["rt-multi-thread", "macros"] }
//! ```
//!
//! ### Using async-std
//!
//! ```toml
//! [dependencies]
//! yeelight-rs = { version = "0.1", default-features = false, features = ["runtime-async-std"] }
//! async-std = { version = "1.12", features = ["attributes"] }
//! ```
//!
//! ### Using smol
//!
//! ```toml
//! [dependencies]
//! yeelight-rs = { version = "0.1", default-features = false, features = ["runtime-smol"] }
//! smol = "2"
//! ```
//!
//! ## Feature Flags
//!
//! - `runtime-tokio` (default): Use the tokio async runtime
//! - `runtime-async-std`: Use the async-std runtime
//! - `runtime-smol`: Use the smol runtime

mod config;
mod connection;
mod discovery;
pub mod dispatcher;
mod errors;
mod light;
mod pending;
mod properties;
pub mod protocol;
mod registry;
pub mod runtime;
mod session;
mod status;
mod types;

#[cfg(all(test, feature = "runtime-tokio"))]
mod testing;

// Re-export public API
pub use config::{Capability, DeviceType, DiscoveryConfig, Features, KelvinRange, SessionConfig};
pub use connection::{Connection, ConnectionEvent, EventSink};
pub use discovery::{
    DatagramOutcome, DeviceRecord, DiscoveryListener, DiscoveryPhase, SEARCH_REQUEST, discover,
    parse_advertisement,
};
pub use errors::Error;
pub use light::Light;
pub use pending::{PendingCommand, PendingState, REPLAY_ORDER};
pub use properties::{MirroredProperties, Property};
pub use registry::SessionRegistry;
pub use session::{DeviceSession, SessionDiagnostics, SessionState};
pub use status::{ColorMode, LightStatus, STATUS_PROPERTIES};
pub use types::{
    Brightness, DeviceId, Endpoint, HueSaturation, Kelvin, PowerMode, Transition,
};
