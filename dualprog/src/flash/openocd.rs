//! OpenOCD backend.
//!
//! Each operation writes a throwaway config for the ST-Link/STM32G4 pair
//! and runs one `openocd` invocation that ends with `shutdown`.

use {
    super::{
        BackendProvider, FlashBackend, hex_address, locate_tool,
        process::{ToolOutput, run_with_timeout},
    },
    crate::{
        device::ProbeDevice,
        error::{Error, Result},
        timing::Timing,
    },
    log::{debug, info},
    std::{
        fmt::Write as _,
        fs,
        io::Write,
        path::{Path, PathBuf},
        process::Command,
        time::Duration,
    },
    tempfile::TempDir,
};

const TOOL_NAMES: &[&str] = &["openocd", "openocd.exe"];

fn install_locations() -> Vec<PathBuf> {
    ["/usr/bin/openocd", "/usr/local/bin/openocd", "/opt/homebrew/bin/openocd"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

/// Generate the adapter/target configuration.
pub fn config_script(serial: Option<&str>) -> String {
    let mut cfg = String::from("source [find interface/stlink.cfg]\ntransport select hla_swd\n");
    if let Some(sn) = serial {
        let _ = writeln!(cfg, "hla_serial {sn}");
    }
    cfg.push_str("source [find target/stm32g4x.cfg]\nadapter speed 100\nreset_config none\n");
    cfg
}

fn tcl_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

/// Finds `openocd` and opens sessions with it.
#[derive(Debug, Clone)]
pub struct OpenOcdProvider {
    tool: Option<PathBuf>,
    probe_timeout: Duration,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl OpenOcdProvider {
    /// Provider that searches `PATH` and the usual locations.
    pub fn new(timing: &Timing) -> Self {
        Self {
            tool: None,
            probe_timeout: timing.tool_probe_timeout,
            write_timeout: timing.tool_write_timeout,
            read_timeout: timing.tool_read_timeout,
        }
    }

    /// Use this executable instead of searching for one.
    #[must_use]
    pub fn with_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.tool = Some(tool.into());
        self
    }
}

impl BackendProvider for OpenOcdProvider {
    fn name(&self) -> &'static str {
        "OpenOCD"
    }

    fn probe(&self, probe: &ProbeDevice) -> Result<Box<dyn FlashBackend>> {
        let tool = self
            .tool
            .clone()
            .or_else(|| locate_tool(TOOL_NAMES, &install_locations()))
            .ok_or_else(|| Error::BackendUnavailable("openocd not found".into()))?;

        // openocd prints its version on stderr
        let output = run_with_timeout(Command::new(&tool).arg("--version"), self.probe_timeout)?;
        if !output.status.success() {
            return Err(Error::BackendUnavailable(format!(
                "{} --version failed: {}",
                tool.display(),
                output.last_line()
            )));
        }
        debug!("Using {}", tool.display());

        Ok(Box::new(OpenOcd {
            tool,
            serial: probe.serial.clone(),
            write_timeout: self.write_timeout,
            read_timeout: self.read_timeout,
        }))
    }
}

/// Session driving `openocd`.
pub struct OpenOcd {
    tool: PathBuf,
    serial: Option<String>,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl OpenOcd {
    fn run(&self, workdir: &TempDir, commands: &[String], timeout: Duration) -> Result<ToolOutput> {
        let cfg = workdir.path().join("stlink_g4.cfg");
        fs::write(&cfg, config_script(self.serial.as_deref()))?;

        let mut cmd = Command::new(&self.tool);
        cmd.arg("-f").arg(&cfg);
        for c in commands {
            cmd.arg("-c").arg(c);
        }
        let output = run_with_timeout(&mut cmd, timeout)?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(Error::Transport(format!("openocd failed: {}", output.last_line())))
        }
    }
}

fn commands(steps: &[&str]) -> Vec<String> {
    steps.iter().map(|s| (*s).to_string()).collect()
}

impl FlashBackend for OpenOcd {
    fn name(&self) -> &'static str {
        "OpenOCD"
    }

    fn write(&mut self, data: &[u8], address: u32) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("firmware.bin");
        fs::File::create(&image)?.write_all(data)?;

        info!("openocd: writing {} bytes at {}", data.len(), hex_address(address));
        let write = format!("flash write_image erase {} {}", tcl_path(&image), hex_address(address));
        self.run(
            &dir,
            &commands(&["init", "reset run", "sleep 1000", "halt", write.as_str(), "reset run", "shutdown"]),
            self.write_timeout,
        )
        .map(drop)
    }

    fn read(&mut self, size: usize, address: u32) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let dump = dir.path().join("readback.bin");
        let read = format!("dump_image {} {} {size}", tcl_path(&dump), hex_address(address));
        self.run(&dir, &commands(&["init", "reset halt", read.as_str(), "shutdown"]), self.read_timeout)?;
        Ok(fs::read(&dump)?)
    }

    fn mass_erase(&mut self) -> Result<()> {
        let dir = tempfile::tempdir()?;
        self.run(
            &dir,
            &commands(&["init", "reset halt", "stm32l4x mass_erase 0", "shutdown"]),
            self.read_timeout,
        )
        .map(drop)
    }
}
