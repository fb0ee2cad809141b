//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod info;
pub(crate) mod memory;
pub(crate) mod monitor;
pub(crate) mod program;
pub(crate) mod uart;

use {
    crate::{
        Cli, CliError,
        config::{Config, State},
        serial::{self, SelectedPort},
        was_interrupted,
    },
    anyhow::Result,
    dualprog::{DeviceRegistry, NativeDevices, NativeOpener, ProbeDevice, Timing, UartSession, host},
};

/// Fail with [`CliError::Cancelled`] once Ctrl-C was pressed.
pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted by user".into()).into())
    } else {
        Ok(())
    }
}

/// A selected probe and the UART it pairs with.
pub(crate) struct Target {
    pub registry: DeviceRegistry<NativeDevices>,
    pub probe_index: usize,
    pub probe: ProbeDevice,
    pub port: SelectedPort,
}

/// Select the probe and its paired UART port.
pub(crate) fn select_target(cli: &Cli, config: &Config, state: &State) -> Result<Target> {
    let registry = host::native_registry();
    let options = cli.selection();
    let (probe_index, probe) = serial::select_probe(&registry, &options, config)?;
    let port = serial::select_uart_port(&registry, &probe, &options, config, state)?;
    Ok(Target {
        registry,
        probe_index,
        probe,
        port,
    })
}

/// Open the UART control channel on `port`.
pub(crate) fn open_session(cli: &Cli, config: &Config, port: &str) -> Result<UartSession<NativeOpener>> {
    let settings = cli.uart_settings(config)?;
    host::open_uart(port, settings, Timing::default())
        .map_err(|e| CliError::Device(format!("Cannot open UART {port}: {e}")).into())
}
