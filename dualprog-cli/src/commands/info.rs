//! Probe and port listing command implementations.

use {
    super::select_target,
    crate::{
        Cli,
        config::{Config, State},
        serial::{self, PortSource},
    },
    anyhow::Result,
    console::style,
    dualprog::{ProbeDevice, SerialPortInfo, host},
};

fn probe_json(index: usize, probe: &ProbeDevice) -> serde_json::Value {
    serde_json::json!({
        "index": index,
        "name": probe.name(),
        "model": probe.model().map(|m| m.name()),
        "vid": probe.vid,
        "pid": probe.pid,
        "serial": probe.serial,
        "bus": probe.bus,
        "address": probe.address,
    })
}

fn print_json(data: serde_json::Value) -> Result<()> {
    let output = serde_json::json!({
        "ok": true,
        "data": data,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// List probes command implementation.
pub(crate) fn cmd_list_probes(json: bool) -> Result<()> {
    let probes = host::discover_probes()?;

    if json {
        let list: Vec<serde_json::Value> = probes
            .iter()
            .enumerate()
            .map(|(i, p)| probe_json(i + 1, p))
            .collect();
        return print_json(serde_json::json!({ "probes": list }));
    }

    eprintln!("{}", style("ST-Link probes:").bold().underlined());
    if probes.is_empty() {
        eprintln!("  {}", style("No probes found").dim());
        return Ok(());
    }
    for line in dualprog::device::format_probe_list(&probes) {
        eprintln!("  {} {line}", style("•").green());
    }
    Ok(())
}

fn port_json(port: &SerialPortInfo) -> serde_json::Value {
    serde_json::json!({
        "name": port.name,
        "hwid": port.hwid,
        "vid": port.vid,
        "pid": port.pid,
        "serial": port.serial,
        "description": port.description,
        "uart_adapter": port.is_target_uart(),
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool, all: bool) -> Result<()> {
    let ports = serial::list_ports(&host::native_registry(), all)?;

    if json {
        let list: Vec<serde_json::Value> = ports.iter().map(port_json).collect();
        return print_json(serde_json::json!({ "ports": list }));
    }

    eprintln!(
        "{}",
        style(if all { "Serial ports:" } else { "UART adapters:" })
            .bold()
            .underlined()
    );
    if ports.is_empty() {
        eprintln!("  {}", style("No ports found").dim());
        return Ok(());
    }
    for (port, line) in ports.iter().zip(dualprog::device::format_port_list(&ports)) {
        let marker = if port.is_target_uart() {
            style("•").green()
        } else {
            style("•").dim()
        };
        eprintln!("  {marker} {line}");
    }
    Ok(())
}

fn describe_source(source: PortSource) -> &'static str {
    match source {
        PortSource::Explicit => "given on the command line",
        PortSource::Config => "from the config file",
        PortSource::Remembered => "remembered from a previous run",
        PortSource::Paired => "paired by USB identity",
        PortSource::Prompted => "chosen interactively",
    }
}

fn source_key(source: PortSource) -> &'static str {
    match source {
        PortSource::Explicit => "explicit",
        PortSource::Config => "config",
        PortSource::Remembered => "remembered",
        PortSource::Paired => "paired",
        PortSource::Prompted => "prompted",
    }
}

/// Pair command implementation.
pub(crate) fn cmd_pair(cli: &Cli, config: &Config, state: &State, json: bool) -> Result<()> {
    let target = select_target(cli, config, state)?;

    if json {
        return print_json(serde_json::json!({
            "probe": probe_json(target.probe_index, &target.probe),
            "port": target.port.name,
            "source": source_key(target.port.source),
        }));
    }

    eprintln!(
        "{} {} {} {} ({})",
        style("→").green().bold(),
        style(target.probe.name()).cyan(),
        style("pairs with").dim(),
        style(&target.port.name).cyan().bold(),
        describe_source(target.port.source)
    );
    Ok(())
}
