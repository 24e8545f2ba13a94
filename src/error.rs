//! Gateway error taxonomy.
//!
//! Every failure that can reach a job record or an API response is one of
//! these kinds. The framing layer retries, the session layer classifies, the
//! job executor converts whatever is left into a failed job while the full
//! machine-readable context stays in the log table.

use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Transport-level failure, classified at open time.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port {port} is busy (another process holds it)")]
    PortBusy { port: String },

    #[error("serial port {port} not found")]
    PortMissing { port: String },

    #[error("cannot reach {addr}: {source}")]
    NetUnreachable { addr: String, source: io::Error },

    #[error("transport not configured: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed frame on the wire (bad preamble/postamble, BCC mismatch,
    /// length mismatch, NAK). Retransmitted up to twice before surfacing.
    #[error("framing error: {0}")]
    Framing(String),

    #[error("timeout after {0:?} waiting for device response")]
    Timeout(Duration),

    /// Device rejected a command with a negative error code. Carries the
    /// localised composite message; the machine code and status snapshot go
    /// to the log table.
    #[error("{message}")]
    Device {
        code: i64,
        context: &'static str,
        message: String,
    },

    /// A payment left a remainder due; the receipt stays open for the caller.
    #[error("{message}")]
    PaymentIncomplete { remainder: String, message: String },

    /// Pinpad rejected a command with a non-zero status byte.
    #[error("pinpad error: {name} (0x{status:02X})")]
    PinpadStatus { status: u8, name: &'static str },

    /// Input failed adapter-level preconditions; never reaches the wire.
    #[error("{0}")]
    Validation(String),
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GatewayError::Validation(msg.into())
    }

    pub fn framing(msg: impl Into<String>) -> Self {
        GatewayError::Framing(msg.into())
    }

    /// Whether the framing layer should retransmit the same frame.
    pub fn is_retryable_frame(&self) -> bool {
        matches!(self, GatewayError::Framing(_) | GatewayError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_errors_are_retryable() {
        assert!(GatewayError::framing("bad BCC").is_retryable_frame());
        assert!(GatewayError::Timeout(Duration::from_secs(1)).is_retryable_frame());
        assert!(!GatewayError::validation("no operator").is_retryable_frame());
    }

    #[test]
    fn test_transport_error_messages() {
        let e = TransportError::PortMissing {
            port: "COM9".into(),
        };
        assert!(e.to_string().contains("COM9"));
    }
}
