use std::io;

/// All error types that can occur when talking to Yeelight devices.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to serialize data to JSON.
    #[error("failed to dump json: {0:?}")]
    JsonDump(serde_json::Error),

    /// A network socket operation failed while communicating with a device.
    #[error("socket {action} error: {err:?}")]
    Socket { action: String, err: io::Error },

    /// A query-class command could not be completed on any attempt.
    #[error("command {id} ({method}) failed")]
    CommandFailed { id: u64, method: String },

    /// The device understood the request and explicitly declined it.
    #[error("device rejected command {id}: {message} (code {code})")]
    Device { id: u64, code: i64, message: String },

    /// No response arrived before the attempt's deadline.
    #[error("command {id} timed out")]
    TimedOut { id: u64 },

    /// The socket closed while a response was still outstanding.
    #[error("connection closed")]
    Disconnected,

    /// An endpoint string could not be parsed as `host:port`.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A vendor identifier did not contain enough hexadecimal digits.
    #[error("invalid device identifier: {0}")]
    InvalidIdentity(String),

    /// A discovery datagram was missing required headers.
    #[error("malformed advertisement: {0}")]
    MalformedAdvertisement(String),

    /// The device does not advertise the requested capability.
    #[error("device {id} does not support {capability}")]
    Unsupported { id: String, capability: String },
}

impl Error {
    /// Create a new socket error
    pub fn socket(action: &str, err: io::Error) -> Self {
        Error::Socket {
            action: action.to_string(),
            err,
        }
    }

    /// Create a new command failed error
    pub fn command_failed(id: u64, method: &str) -> Self {
        Error::CommandFailed {
            id,
            method: method.to_string(),
        }
    }

    /// Create a new unsupported capability error
    pub fn unsupported(id: &impl ToString, capability: &impl ToString) -> Self {
        Error::Unsupported {
            id: id.to_string(),
            capability: capability.to_string(),
        }
    }

    /// Whether retrying against the same endpoint is pointless.
    ///
    /// Covers the "host unreachable" class of socket failures.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Error::Socket { err, .. } => matches!(
                err.kind(),
                io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable
            ),
            _ => false,
        }
    }

    /// The request id this error refers to, if any.
    pub fn command_id(&self) -> Option<u64> {
        match self {
            Error::CommandFailed { id, .. } | Error::Device { id, .. } | Error::TimedOut { id } => {
                Some(*id)
            }
            _ => None,
        }
    }
}

/// Hacky implementation of PartialEq for testing
#[cfg(test)]
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}
