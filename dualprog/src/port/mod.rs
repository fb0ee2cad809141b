//! Port abstraction for the UART control channel.
//!
//! The protocol engine in [`crate::uart`] only talks to the [`Port`] trait,
//! so it runs unchanged against a real adapter or a scripted test double.
//!
//! ```text
//! +-------------------+
//! |   UartSession     |  command/response, late arrival, recovery
//! +---------+---------+
//!           |
//!           v
//! +---------+---------+        +-------------------+
//! |    Port trait     | <----- |  PortOpener trait |  (re)opening by name
//! +---------+---------+        +-------------------+
//!           |
//!           v
//! +---------+---------+
//! | NativePort        |
//! |   (serialport)    |
//! +-------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Read timeout applied to the UART when it is opened.
pub const DEFAULT_PORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Data bits.
    pub data_bits: DataBits,
    /// Parity.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Flow control.
    pub flow_control: FlowControl,
    /// DTR level after opening.
    pub dtr: bool,
    /// RTS level after opening.
    pub rts: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115_200,
            timeout: DEFAULT_PORT_TIMEOUT,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            dtr: false,
            rts: false,
        }
    }
}

impl SerialConfig {
    /// Create an 8N1 configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the port name, keeping every other setting.
    #[must_use]
    pub fn with_port_name(mut self, port_name: impl Into<String>) -> Self {
        self.port_name = port_name.into();
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
}

/// An open serial connection.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Number of bytes waiting in the input buffer.
    fn bytes_to_read(&mut self) -> Result<usize>;

    /// Discard everything in the input buffer.
    fn clear_input(&mut self) -> Result<()>;

    /// Discard both input and output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Whether the handle is still usable.
    fn is_open(&self) -> bool;

    /// Close the port and release resources.
    ///
    /// Closing an already closed port is not an error.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes and flush.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        Write::write_all(self, buf)?;
        Write::flush(self)?;
        Ok(())
    }

    /// Read whatever is already buffered without blocking.
    fn read_available(&mut self) -> Result<Vec<u8>> {
        let pending = self.bytes_to_read()?;
        if pending == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; pending];
        let n = Read::read(self, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// Opens ports by name, used for the initial open and for every reopen
/// after the handle died.
pub trait PortOpener {
    /// Concrete port type.
    type Port: Port;

    /// Open a port with the given configuration.
    fn open(&self, config: &SerialConfig) -> Result<Self::Port>;
}

#[cfg(feature = "native")]
pub use native::{NativeOpener, NativePort};
