//! Ready-made wiring for the machine this process runs on.
//!
//! These helpers plug the native device source, serial opener and default
//! backend chain into the generic components.

use crate::{
    device::{DeviceRegistry, NativeDevices, ProbeDevice, SerialPortInfo},
    error::Result,
    flash::{VerifiedWriter, default_backends},
    orchestrator::ProgrammingOrchestrator,
    port::NativeOpener,
    timing::Timing,
    uart::{UartSession, UartSettings},
};

/// Orchestrator using the host's USB and serial devices.
#[must_use]
pub fn native_orchestrator(
    settings: UartSettings,
    timing: Timing,
) -> ProgrammingOrchestrator<NativeDevices, NativeOpener> {
    let writer = native_writer(&timing);
    ProgrammingOrchestrator::new(NativeDevices, NativeOpener, writer)
        .with_settings(settings)
        .with_timing(timing)
}

/// Verified writer over the default backend chain.
#[must_use]
pub fn native_writer(timing: &Timing) -> VerifiedWriter {
    VerifiedWriter::new(default_backends(timing), timing.clone())
}

/// Registry over the host's devices.
#[must_use]
pub fn native_registry() -> DeviceRegistry<NativeDevices> {
    DeviceRegistry::new(NativeDevices)
}

/// Open the UART control channel, following the port if it re-enumerates
/// under another name.
pub fn open_uart(port: &str, settings: UartSettings, timing: Timing) -> Result<UartSession<NativeOpener>> {
    let lookup = native_registry();
    let session = UartSession::open(NativeOpener, port, settings, timing)?;
    Ok(session.with_resolver(Box::new(move |name| lookup.find_port(name).map(|p| p.name))))
}

/// Enumerate probes on the host.
pub fn discover_probes() -> Result<Vec<ProbeDevice>> {
    native_registry().discover_probes()
}

/// UART adapter candidates on the host.
#[must_use]
pub fn discover_uart_candidates() -> Vec<SerialPortInfo> {
    native_registry().discover_uart_candidates()
}
