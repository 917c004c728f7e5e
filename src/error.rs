//! # Error Types Module
//!
//! Centralized error handling for the heart-rate client.
//! Each stage of the connection lifecycle has its own error type so the
//! supervisor can decide between retrying and terminating with a `match`.
//!
//! ## Error Types
//! - `ScanError`: adapter access and discovery failures
//! - `ConnectError`: transport connection failures (always retried)
//! - `SubscribeError`: characteristic discovery/subscription failures (always retried)
//! - `DecodeError`: malformed notification payloads (never fatal)
//! - `LinkError`: what a transport reports back to the supervisor
//! - `FatalReason`: why a supervisor reached `Terminated`
//! - `ConnectionError` / `SessionError`: I/O runtime and session management
//! - `ConfigError`: configuration file I/O and parsing errors

use std::fmt;

/// Errors that can occur during device scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The local BLE radio could not be opened
    AdapterUnavailable,
    /// The adapter was opened but the scan itself failed
    ScanFailed(String),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::AdapterUnavailable => {
                write!(f, "No Bluetooth adapter available. Please ensure Bluetooth is enabled.")
            }
            ScanError::ScanFailed(msg) => {
                write!(f, "Scan operation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ScanError {}

/// Errors that can occur while opening the transport connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The peripheral did not complete the connection in time
    Timeout,
    /// The address was not seen by the adapter
    DeviceUnreachable,
    /// The BLE stack refused the connection
    TransportRejected(String),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Timeout => write!(f, "connection attempt timed out"),
            ConnectError::DeviceUnreachable => write!(f, "device is not reachable"),
            ConnectError::TransportRejected(msg) => {
                write!(f, "transport rejected the connection: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConnectError {}

/// Errors that can occur while subscribing to heart-rate notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// The peripheral does not expose the Heart Rate Measurement characteristic
    CharacteristicNotFound,
    /// The characteristic exists but cannot notify
    NotSupported,
}

impl fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeError::CharacteristicNotFound => {
                write!(f, "heart rate measurement characteristic not found")
            }
            SubscribeError::NotSupported => {
                write!(f, "heart rate measurement characteristic does not support notifications")
            }
        }
    }
}

impl std::error::Error for SubscribeError {}

/// Errors produced by the heart-rate payload decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload is shorter than its flags byte requires
    TooShort,
    /// Flags declare optional fields the payload cannot hold; carries the raw flags byte
    MalformedFlags(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooShort => write!(f, "heart rate payload too short"),
            DecodeError::MalformedFlags(flags) => {
                write!(f, "heart rate payload does not match its flags: {:#04x}", flags)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Failure reported by a `HeartRateLink` to the supervisor.
///
/// `Connect` and `Subscribe` lead to a retry; the other variants terminate the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    Connect(ConnectError),
    Subscribe(SubscribeError),
    AdapterUnavailable,
    Unrecoverable(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Connect(e) => write!(f, "{}", e),
            LinkError::Subscribe(e) => write!(f, "{}", e),
            LinkError::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            LinkError::Unrecoverable(msg) => write!(f, "unrecoverable transport error: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkError::Connect(e) => Some(e),
            LinkError::Subscribe(e) => Some(e),
            LinkError::AdapterUnavailable | LinkError::Unrecoverable(_) => None,
        }
    }
}

impl From<ConnectError> for LinkError {
    fn from(e: ConnectError) -> Self {
        LinkError::Connect(e)
    }
}

impl From<ScanError> for LinkError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::AdapterUnavailable => LinkError::AdapterUnavailable,
            ScanError::ScanFailed(msg) => LinkError::Unrecoverable(msg),
        }
    }
}

impl From<SubscribeError> for LinkError {
    fn from(e: SubscribeError) -> Self {
        LinkError::Subscribe(e)
    }
}

/// Why a supervisor ended up in `Terminated`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// The operator cancelled the session
    Cancelled,
    /// The transport failed in a way retrying cannot fix
    UnrecoverableTransport(String),
    /// The local radio disappeared or could not be opened
    AdapterUnavailable,
    /// The retry policy's attempt cap was reached; `attempts` counts failed connection attempts
    RetriesExhausted { attempts: u32 },
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::Cancelled => write!(f, "cancelled by operator"),
            FatalReason::UnrecoverableTransport(msg) => {
                write!(f, "unrecoverable transport error: {}", msg)
            }
            FatalReason::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            FatalReason::RetriesExhausted { attempts } => {
                write!(f, "gave up after {} failed attempts", attempts)
            }
        }
    }
}

impl std::error::Error for FatalReason {}

/// Errors that can occur while setting up the I/O context
#[derive(Debug)]
pub enum ConnectionError {
    /// Failed to create Tokio runtime
    RuntimeCreation(std::io::Error),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::RuntimeCreation(e) => {
                write!(f, "Failed to create async runtime: {}", e)
            }
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::RuntimeCreation(e) => Some(e),
        }
    }
}

/// Errors returned when starting a monitoring session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A supervisor is still running; stop it first
    AlreadyActive { address: String },
    /// The operator supplied an empty address
    EmptyAddress,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyActive { address } => {
                write!(f, "A monitoring session for {} is already active", address)
            }
            SessionError::EmptyAddress => write!(f, "Device address must not be empty"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
    /// A value parsed but is out of range
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::WriteFailed(e) => write!(f, "Failed to write config file: {}", e),
            ConfigError::ParseFailed(e) => write!(f, "Failed to parse config file: {}", e),
            ConfigError::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_scan_error_display() {
        let err = ScanError::AdapterUnavailable;
        assert!(err.to_string().contains("Bluetooth"));
    }

    #[test]
    fn test_link_error_chain() {
        let err = LinkError::from(ConnectError::Timeout);
        assert!(err.source().is_some());
        assert!(LinkError::Unrecoverable("gone".into()).source().is_none());
    }

    #[test]
    fn test_config_error_chain() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ConfigError::ReadFailed(io_err);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_decode_error_reports_flags() {
        let err = DecodeError::MalformedFlags(0x18);
        assert!(err.to_string().contains("0x18"));
    }

    #[test]
    fn test_retries_exhausted_counts_failed_attempts() {
        let reason = FatalReason::RetriesExhausted { attempts: 3 };
        assert_eq!(reason.to_string(), "gave up after 3 failed attempts");
    }
}
