//! Probe and UART port selection.
//!
//! Explicit choices win, then configuration, then what was remembered for
//! the probe, then automatic pairing. When pairing cannot decide, the user
//! is asked; in non-interactive mode that is a usage error instead.

use {
    crate::{
        CliError,
        config::{Config, State},
    },
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    dualprog::{DeviceRegistry, DeviceSource, Error as LibError, ProbeDevice, SerialPortInfo},
    log::{debug, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for probe and port selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Explicit 1-based probe index specified via CLI.
    pub probe: Option<usize>,
    /// Non-interactive mode (fail instead of prompting).
    pub non_interactive: bool,
}

/// Where a port choice came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    /// `--port` or `DUALPROG_PORT`.
    Explicit,
    /// `[uart] port` in a config file.
    Config,
    /// Remembered pairing for this probe.
    Remembered,
    /// Paired automatically with the probe.
    Paired,
    /// Picked by the user from a list.
    Prompted,
}

/// A selected UART port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPort {
    /// Port name.
    pub name: String,
    /// How it was chosen.
    pub source: PortSource,
}

fn usage_err(message: impl Into<String>) -> anyhow::Error {
    CliError::Usage(message.into()).into()
}

fn device_err(error: &LibError) -> anyhow::Error {
    CliError::Device(error.to_string()).into()
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Interactive selection requires a terminal; use --non-interactive with --port/--probe",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Selection cancelled".to_string()).into()
            } else {
                usage_err(format!("Prompt failed: {io_err}"))
            }
        },
    }
}

fn prompt(title: &str, items: &[String]) -> Result<usize> {
    ensure_interactive_terminal()?;
    let term_width = usize::from(console::Term::stderr().size().1);
    let items: Vec<String> = items
        .iter()
        .map(|n| console::truncate_str(n, term_width.saturating_sub(4), "\u{2026}").into_owned())
        .collect();
    Select::with_theme(&ColorfulTheme::default())
        .with_prompt(title)
        .items(&items)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?
        .ok_or_else(|| CliError::Cancelled("Selection cancelled".to_string()).into())
}

/// Ask a yes/no question; `--non-interactive` without `--yes` is a usage
/// error.
pub fn confirm(question: &str, non_interactive: bool) -> Result<bool> {
    if non_interactive {
        return Err(usage_err("Confirmation required; pass --yes"));
    }
    ensure_interactive_terminal()?;
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(question)
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .ok_or_else(|| CliError::Cancelled("Confirmation cancelled".to_string()).into())
}

/// Pick from `count` candidates without prompting: exactly one is chosen,
/// none or several is a usage error.
fn choose_non_interactive(count: usize, none: &str, many: &str) -> Result<usize> {
    match count.cmp(&1) {
        Ordering::Equal => Ok(0),
        Ordering::Greater => Err(usage_err(many)),
        Ordering::Less => Err(usage_err(none)),
    }
}

/// Select the probe: explicit index, then configured index, then the only
/// probe, then a prompt.
pub fn select_probe<S: DeviceSource>(
    registry: &DeviceRegistry<S>,
    options: &SelectionOptions,
    config: &Config,
) -> Result<(usize, ProbeDevice)> {
    let probes = registry.discover_probes().map_err(|e| device_err(&e))?;
    if probes.is_empty() {
        return Err(CliError::Device("No ST-Link probe found. Connect the programmer and retry".into()).into());
    }

    if let Some(index) = options.probe.or(config.program.probe_index) {
        let probe = index
            .checked_sub(1)
            .and_then(|i| probes.get(i))
            .cloned()
            .ok_or_else(|| usage_err(format!("Probe index {index} out of range (1..={})", probes.len())))?;
        debug!("Using probe {index}: {probe}");
        return Ok((index, probe));
    }

    let chosen = if options.non_interactive || probes.len() == 1 {
        choose_non_interactive(
            probes.len(),
            "No ST-Link probe found",
            "Multiple ST-Link probes found; pass --probe N",
        )?
    } else {
        eprintln!("{} {} probes found", style("ℹ").blue(), probes.len());
        prompt("Select the ST-Link probe", &dualprog::device::format_probe_list(&probes))?
    };
    let probe = probes[chosen].clone();
    info!("Auto-selected probe {}: {probe}", chosen + 1);
    Ok((chosen + 1, probe))
}

/// Select the UART port paired with `probe`.
pub fn select_uart_port<S: DeviceSource>(
    registry: &DeviceRegistry<S>,
    probe: &ProbeDevice,
    options: &SelectionOptions,
    config: &Config,
    state: &State,
) -> Result<SelectedPort> {
    if let Some(name) = &options.port {
        return Ok(SelectedPort {
            name: name.clone(),
            source: PortSource::Explicit,
        });
    }
    if let Some(name) = &config.uart.port {
        debug!("Using port from config: {name}");
        return Ok(SelectedPort {
            name: name.clone(),
            source: PortSource::Config,
        });
    }
    if let Some(name) = state.port_for(&probe.identity_key()) {
        if let Some(port) = registry.find_port(name) {
            debug!("Using remembered port {} for {probe}", port.name);
            return Ok(SelectedPort {
                name: port.name,
                source: PortSource::Remembered,
            });
        }
        debug!("Remembered port {name} is gone, pairing again");
    }

    match registry.resolve_port(probe) {
        Ok(port) => {
            info!("{probe} pairs with {}", port.name);
            Ok(SelectedPort {
                name: port.name,
                source: PortSource::Paired,
            })
        },
        Err(e @ LibError::PairingAmbiguous(_)) => {
            if options.non_interactive {
                return Err(usage_err(format!("{e}; pass --port")));
            }
            let candidates = registry.discover_uart_candidates();
            let index = prompt(
                "Select the UART control port",
                &dualprog::device::format_port_list(&candidates),
            )?;
            Ok(SelectedPort {
                name: candidates[index].name.clone(),
                source: PortSource::Prompted,
            })
        },
        Err(e) => Err(device_err(&e)),
    }
}

/// All UART candidates, or every port with `all`.
pub fn list_ports<S: DeviceSource>(registry: &DeviceRegistry<S>, all: bool) -> Result<Vec<SerialPortInfo>> {
    if all {
        registry
            .source()
            .serial_ports()
            .map_err(|e| device_err(&e))
    } else {
        Ok(registry.discover_uart_candidates())
    }
}
