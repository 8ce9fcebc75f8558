//! Wire format of the control channel: one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::Error;

type Result<T> = std::result::Result<T, Error>;

/// Method name of unsolicited property notifications.
pub const PUSH_METHOD: &str = "props";

const LINE_TERMINATOR: &str = "\r\n";

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: &'a [Value],
}

/// Error payload of a response the device declined.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// A decoded line received from a device.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply correlated to an earlier request.
    Response {
        id: u64,
        outcome: std::result::Result<Vec<Value>, DeviceError>,
    },
    /// Unsolicited state change pushed by the device.
    Props(Map<String, Value>),
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<DeviceError>,
    method: Option<String>,
    params: Option<Value>,
}

/// Encode a request as a terminated line ready to be written to the socket.
pub fn encode_request(id: u64, method: &str, params: &[Value]) -> Result<String> {
    let mut line = serde_json::to_string(&Request { id, method, params }).map_err(Error::JsonDump)?;
    line.push_str(LINE_TERMINATOR);
    Ok(line)
}

/// Decode one inbound line.
///
/// Returns `None` for blank, malformed or unrecognised lines; those are
/// dropped by the caller rather than tearing the session down.
pub fn decode_line(line: &str) -> Option<Inbound> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let raw: RawMessage = serde_json::from_str(line).ok()?;

    if let Some(id) = raw.id {
        let outcome = match (raw.error, raw.result) {
            (Some(err), _) => Err(err),
            (None, Some(Value::Array(values))) => Ok(values),
            (None, Some(Value::Null)) | (None, None) => Ok(Vec::new()),
            (None, Some(other)) => Ok(vec![other]),
        };
        return Some(Inbound::Response { id, outcome });
    }

    match (raw.method.as_deref(), raw.params) {
        (Some(PUSH_METHOD), Some(Value::Object(props))) => Some(Inbound::Props(props)),
        _ => None,
    }
}
