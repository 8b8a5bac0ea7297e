//! Error types for vpnctl

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Reason tag carried by every connection failure.
///
/// Drivers and the service report exactly one of these per failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectFailure {
    /// A helper program could not be started
    ProcessStartFailure,
    /// A helper program exited with a non-zero status (or exited early)
    ProcessExitedNonZero,
    /// A control socket never reached the listening state
    SocketNotReady,
    /// A configuration file could not be written
    ConfigWriteFailure,
    /// Status or DNS output was malformed or ambiguous
    ParseFailure,
    /// The connect timeout expired
    ConnectTimeout,
    /// The underlying physical network changed or went away
    NetworkChange,
    /// An internal invariant was violated
    InternalFailure,
    /// The profile was rejected before any side effect
    InvalidConfig,
    /// PPP authentication failed
    Authentication,
    /// The remote end or the tunnel app ended an established tunnel
    Disconnect,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ConnectFailure::ProcessStartFailure => "process-start-failure",
            ConnectFailure::ProcessExitedNonZero => "process-exited-non-zero",
            ConnectFailure::SocketNotReady => "socket-not-ready",
            ConnectFailure::ConfigWriteFailure => "config-write-failure",
            ConnectFailure::ParseFailure => "parse-failure",
            ConnectFailure::ConnectTimeout => "connect-timeout",
            ConnectFailure::NetworkChange => "network-change",
            ConnectFailure::InternalFailure => "internal-failure",
            ConnectFailure::InvalidConfig => "invalid-config",
            ConnectFailure::Authentication => "authentication",
            ConnectFailure::Disconnect => "disconnect",
        };
        f.write_str(tag)
    }
}

#[derive(Debug, Error)]
pub enum VpnctlError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Command execution failed
    #[error("Command '{cmd}' failed{}: {stderr}", code_suffix(.code))]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },
    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),
    /// Not supported
    #[error("Not supported: {0}")]
    NotSupported(String),
    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Connection attempt failed
    #[error("Connection failed ({reason}): {detail}")]
    ConnectionFailed { reason: ConnectFailure, detail: String },
}

impl VpnctlError {
    /// Build a tagged connection failure.
    pub fn failure(reason: ConnectFailure, detail: impl Into<String>) -> Self {
        VpnctlError::ConnectionFailed { reason, detail: detail.into() }
    }

    /// The failure tag this error surfaces as when it ends a connect attempt.
    pub fn connect_failure(&self) -> ConnectFailure {
        match self {
            VpnctlError::ConnectionFailed { reason, .. } => *reason,
            VpnctlError::CommandFailed { .. } => ConnectFailure::ProcessExitedNonZero,
            VpnctlError::InvalidParameter(_) | VpnctlError::ConfigError(_) => ConnectFailure::InvalidConfig,
            VpnctlError::ParseError(_) => ConnectFailure::ParseFailure,
            VpnctlError::Timeout(_) => ConnectFailure::ConnectTimeout,
            VpnctlError::Io(_)
            | VpnctlError::NotSupported(_)
            | VpnctlError::NotFound(_)
            | VpnctlError::InvalidState(_) => ConnectFailure::InternalFailure,
        }
    }

    /// Human readable detail without the failure tag prefix.
    pub fn detail(&self) -> String {
        match self {
            VpnctlError::ConnectionFailed { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for VpnctlError {
    fn from(error: serde_json::Error) -> Self {
        VpnctlError::ParseError(error.to_string())
    }
}

fn code_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" with code {}", c)).unwrap_or_default()
}

pub type VpnctlResult<T> = Result<T, VpnctlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_tags() {
        let err = VpnctlError::failure(ConnectFailure::SocketNotReady, "vici socket missing");
        assert_eq!(err.connect_failure(), ConnectFailure::SocketNotReady);
        assert_eq!(err.detail(), "vici socket missing");
        assert_eq!(err.to_string(), "Connection failed (socket-not-ready): vici socket missing");
    }

    #[test]
    fn test_untagged_errors_map_to_failures() {
        let err = VpnctlError::CommandFailed {
            cmd: "swanctl --load-all".to_string(),
            code: Some(2),
            stderr: "bad config".to_string(),
        };
        assert_eq!(err.connect_failure(), ConnectFailure::ProcessExitedNonZero);
        assert_eq!(err.to_string(), "Command 'swanctl --load-all' failed with code 2: bad config");

        let err = VpnctlError::InvalidParameter("remote".to_string());
        assert_eq!(err.connect_failure(), ConnectFailure::InvalidConfig);

        let err = VpnctlError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.connect_failure(), ConnectFailure::InternalFailure);
    }
}
