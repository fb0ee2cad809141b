//! Error types for dualprog.
//!
//! The variants follow the failure classes an operator has to tell apart:
//! transport problems (busy or missing adapters), a UART handle that died
//! mid-run, protocol mismatches, verification mismatches, ambiguous pairing
//! and malformed firmware images.

use std::io;
use thiserror::Error;

/// Result type for dualprog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for dualprog operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// USB error reported by libusb.
    #[cfg(feature = "native")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Adapter busy, access denied or backend missing.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The UART handle died while a command was in flight.
    #[error("Port closed: {0}")]
    PortClosed(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A response arrived but did not match.
    #[error("Unexpected response: expected '{expected}', got '{actual}'")]
    ProtocolMismatch {
        /// Expected response text.
        expected: String,
        /// Response text actually received.
        actual: String,
    },

    /// Flash content read back differs from what was written.
    #[error("Verification failed: {0}")]
    VerificationMismatch(String),

    /// Several UART adapters match and nothing ties one to the probe.
    #[error(
        "Manual port selection required: {0} UART adapters found and none is linked to the probe"
    )]
    PairingAmbiguous(usize),

    /// Invalid firmware image.
    #[error("Invalid firmware image: {0}")]
    Format(String),

    /// Probe or port not present.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Flash backend not installed or not usable on this host.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Invalid or unreadable test plan.
    #[error("Test plan error: {0}")]
    TestPlan(String),

    /// Invalid argument or setting.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller asked the run to stop.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error means the serial handle is gone and a
    /// close/reopen cycle may help.
    pub fn is_port_closed(&self) -> bool {
        match self {
            Self::PortClosed(_) => true,
            Self::Io(e) => is_closed_io_kind(e.kind()),
            #[cfg(feature = "native")]
            Self::Serial(e) => matches!(e.kind(), serialport::ErrorKind::NoDevice),
            _ => false,
        }
    }

    /// Whether this error looks like another process holding the device.
    pub fn is_access_denied(&self) -> bool {
        let text = self.to_string().to_lowercase();
        text.contains("access denied")
            || text.contains("access is denied")
            || text.contains("permission denied")
            || text.contains("busy")
    }
}

pub(crate) fn is_closed_io_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_closed_classification() {
        assert!(Error::PortClosed("gone".into()).is_port_closed());
        assert!(Error::Io(io::Error::new(io::ErrorKind::NotConnected, "x")).is_port_closed());
        assert!(Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "x")).is_port_closed());
        assert!(!Error::Io(io::Error::new(io::ErrorKind::TimedOut, "x")).is_port_closed());
        assert!(!Error::Timeout("slow".into()).is_port_closed());
    }

    #[test]
    fn test_access_denied_classification() {
        assert!(Error::Transport("Access denied".into()).is_access_denied());
        assert!(
            Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "Permission denied"))
                .is_access_denied()
        );
        assert!(Error::Transport("Device or resource busy".into()).is_access_denied());
        assert!(!Error::Timeout("no answer".into()).is_access_denied());
    }

    #[test]
    fn test_pairing_message_names_manual_selection() {
        let msg = Error::PairingAmbiguous(2).to_string();
        assert!(msg.contains("Manual port selection required"));
        assert!(msg.contains('2'));
    }
}
