//! Memory read and erase through the backend chain.

use {
    crate::{Cli, CliError, config::Config, serial},
    anyhow::{Context, Result},
    console::style,
    dualprog::{FirmwareImage, ProbeDevice, Timing, VerifiedWriter, host},
    std::{fs, path::PathBuf},
};

const DUMP_WIDTH: usize = 16;

/// Classic hex dump, one line per 16 bytes.
fn hex_dump(address: u32, data: &[u8]) -> Vec<String> {
    let mut line_address = address;
    data.chunks(DUMP_WIDTH)
        .map(|chunk| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
            let ascii: String = chunk
                .iter()
                .map(|&b| {
                    if b.is_ascii_graphic() || b == b' ' {
                        char::from(b)
                    } else {
                        '.'
                    }
                })
                .collect();
            let line = format!(
                "{line_address:08X}  {:<width$}  |{ascii}|",
                hex.join(" "),
                width = DUMP_WIDTH * 3 - 1
            );
            line_address = line_address.wrapping_add(u32::try_from(chunk.len()).unwrap_or(0));
            line
        })
        .collect()
}

fn connect(cli: &Cli, config: &Config) -> Result<(ProbeDevice, VerifiedWriter)> {
    let registry = host::native_registry();
    let (_, probe) = serial::select_probe(&registry, &cli.selection(), config)?;
    Ok((probe, host::native_writer(&Timing::default())))
}

/// Read command implementation.
pub(crate) fn cmd_read(cli: &Cli, config: &Config, address: u32, size: usize, output: Option<&PathBuf>) -> Result<()> {
    let (probe, writer) = connect(cli, config)?;
    let data = writer.read_memory(&probe, size, address)?;

    match output {
        Some(path) => {
            fs::write(path, &data).with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!(
                "{} Saved {} bytes from 0x{address:08X} to {}",
                style("✓").green(),
                data.len(),
                path.display()
            );
        },
        None => {
            for line in hex_dump(address, &data) {
                println!("{line}");
            }
        },
    }
    Ok(())
}

/// Erase command implementation.
pub(crate) fn cmd_erase(
    cli: &Cli,
    config: &Config,
    address: u32,
    size: Option<usize>,
    all: bool,
    yes: bool,
) -> Result<()> {
    let what = match size {
        Some(size) if !all => format!("{size} bytes at 0x{address:08X}"),
        _ => "the whole flash".to_string(),
    };
    if !yes && !serial::confirm(&format!("Erase {what}?"), cli.non_interactive)? {
        return Err(CliError::Cancelled("Erase cancelled".into()).into());
    }

    let (probe, writer) = connect(cli, config)?;
    match size {
        Some(size) if !all => {
            let outcome = writer.write_verified(&probe, &FirmwareImage::new(address, vec![0; size]));
            if !outcome.success {
                anyhow::bail!(
                    "Erase failed: {}",
                    outcome.error_detail.unwrap_or_default()
                );
            }
        },
        _ => {
            let backend = writer.mass_erase(&probe)?;
            log::debug!("Mass erase done via {backend}");
        },
    }
    eprintln!("{} Erased {what}", style("✓").green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump_full_line() {
        let data: Vec<u8> = (0x41..0x51).collect();
        let lines = hex_dump(0x0800_0000, &data);
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            "08000000  41 42 43 44 45 46 47 48 49 4A 4B 4C 4D 4E 4F 50  |ABCDEFGHIJKLMNOP|"
        );
    }

    #[test]
    fn test_hex_dump_partial_line_is_padded() {
        let lines = hex_dump(0x0800_0010, &[0x00; 18]);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("08000020  00 00  "));
        assert!(lines[1].ends_with("|..|"));
        assert_eq!(lines[0].len(), lines[1].len() + 14);
    }
}
