//! # dualprog
//!
//! Programming and acceptance testing of dual-mode (LV/HV) STM32 power
//! boards.
//!
//! A board carries two microcontrollers behind one SWD connector. A small
//! control controller, reached over a USB-UART adapter, switches the 12 V
//! supply and a relay that routes the probe's SWD lines to either variant.
//! A run therefore interleaves UART commands with flash writes:
//!
//! ```text
//! power on -> select LV -> write+verify -> power cycle -> re-find probe
//!          -> select HV -> write+verify -> power cycle -> test plan -> power off
//! ```
//!
//! ## Components
//!
//! - [`device`]: probe and UART discovery, probe/UART pairing
//! - [`uart`]: line-oriented command/response engine with recovery
//! - [`mode`]: power and SWD-mode state machine
//! - [`flash`]: backend chain with read-back verification
//! - [`image`]: Intel HEX and raw binary loading
//! - [`testplan`]: declarative acceptance tests
//! - [`orchestrator`]: the complete run
//!
//! ## Features
//!
//! - `native` (default): serial ports via `serialport`, ST-Link access via `rusb`
//! - `probe-rs`: flash through probe-rs before the external tools
//!
//! ## Example
//!
//! ```rust,no_run
//! use dualprog::{FirmwareImage, Mode, NoProgress, RunRequest, Timing, UartSettings};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let request = RunRequest {
//!         images: vec![
//!             (Mode::Lv, FirmwareImage::load("lv.hex")?),
//!             (Mode::Hv, FirmwareImage::load("hv.hex")?),
//!         ],
//!         probe_index: 1,
//!         uart_port: None,
//!         test_plan: None,
//!     };
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let orchestrator = dualprog::host::native_orchestrator(UartSettings::default(), Timing::default());
//!         let report = orchestrator.run(&request, &mut NoProgress, &|| false);
//!         println!("{}", report.message);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod flash;
#[cfg(feature = "native")]
pub mod host;
pub mod image;
pub mod mode;
pub mod orchestrator;
pub mod port;
pub mod progress;
pub mod testplan;
pub mod timing;
pub mod uart;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use {
    device::NativeDevices,
    port::{NativeOpener, NativePort},
};
pub use {
    device::{DeviceRegistry, DeviceSource, ProbeDevice, ProbeModel, SerialPortInfo, pair},
    error::{Error, Result},
    flash::{BackendProvider, FlashBackend, VerifiedWriter, WriteOutcome, compare_readback},
    image::{DEFAULT_FLASH_ADDRESS, FirmwareImage},
    mode::{Mode, ModeState, ModeSwitcher},
    orchestrator::{ProgrammingOrchestrator, RunReport, RunRequest},
    port::{Port, PortOpener, SerialConfig},
    progress::{NoProgress, ProgressSink},
    testplan::{TestPlan, TestReport, TestRunner, TestStep, Validation},
    timing::Timing,
    uart::{LineEnding, UartSession, UartSettings},
};
