//! Network address of a device's control socket.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Host and port at which a device accepts control connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Default control port of Yeelight devices.
    pub const DEFAULT_PORT: u16 = 55443;

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse a `Location`-style header such as `yeelight://192.168.1.239:55443`.
    ///
    /// Everything after the scheme separator is the endpoint; a missing port
    /// falls back to [`Endpoint::DEFAULT_PORT`].
    ///
    /// ```
    /// use yeelight_rs::Endpoint;
    ///
    /// let ep = Endpoint::from_location("yeelight://192.168.1.239:55443").unwrap();
    /// assert_eq!(ep, Endpoint::new("192.168.1.239", 55443));
    /// ```
    pub fn from_location(location: &str) -> Result<Self, Error> {
        let rest = location
            .trim()
            .split_once("://")
            .map_or(location.trim(), |(_, rest)| rest);
        let rest = rest.trim_end_matches('/');

        if rest.contains(':') {
            rest.parse()
        } else if rest.is_empty() {
            Err(Error::InvalidEndpoint(location.to_string()))
        } else {
            Ok(Endpoint::new(rest, Self::DEFAULT_PORT))
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parse from `host:port`.
    fn from_str(s: &str) -> Result<Self, Error> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidEndpoint(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidEndpoint(s.to_string()))?;
        if host.is_empty() || port == 0 {
            return Err(Error::InvalidEndpoint(s.to_string()));
        }
        Ok(Endpoint::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
