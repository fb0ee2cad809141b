//! Serial monitor command implementation.
//!
//! Prints whatever the control board sends until Ctrl-C. Output goes to
//! stdout so it can be piped; status lines stay on stderr.

use {
    super::select_target,
    crate::{
        Cli,
        config::{Config, State},
        was_interrupted,
    },
    anyhow::{Context, Result},
    console::style,
    dualprog::{NativePort, Port, SerialConfig},
    std::{
        io::{self, Write as _},
        thread,
        time::Duration,
    },
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Monitor command implementation.
pub(crate) fn cmd_monitor(cli: &Cli, config: &Config, state: &State) -> Result<()> {
    let settings = cli.uart_settings(config)?;
    let port_name = match cli.port.as_ref().or(config.uart.port.as_ref()) {
        Some(port) => port.clone(),
        None => select_target(cli, config, state)?.port.name,
    };
    let serial_config =
        SerialConfig::new(&port_name, settings.baud_rate).with_timeout(POLL_INTERVAL);
    let mut port = NativePort::open(&serial_config)
        .with_context(|| format!("Cannot open UART {port_name}"))?;

    eprintln!(
        "{} Monitoring {port_name} at {} baud (Ctrl-C to exit)",
        style("ℹ").blue(),
        settings.baud_rate
    );

    let mut stdout = io::stdout().lock();
    while !was_interrupted() {
        let chunk = port.read_available()?;
        if chunk.is_empty() {
            thread::sleep(POLL_INTERVAL);
            continue;
        }
        stdout.write_all(String::from_utf8_lossy(&chunk).as_bytes())?;
        stdout.flush()?;
    }
    port.close()?;
    eprintln!("\n{} Monitor closed", style("✓").green());
    Ok(())
}
