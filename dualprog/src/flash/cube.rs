//! STM32CubeProgrammer command line backend.

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
        fs,
        io::Write,
        path::PathBuf,
        process::Command,
        time::Duration,
    },
};

const TOOL_NAMES: &[&str] = &["STM32_Programmer_CLI", "STM32_Programmer_CLI.exe"];

fn install_locations() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from(r"C:\Program Files\STMicroelectronics\STM32Cube\STM32CubeProgrammer\bin\STM32_Programmer_CLI.exe"),
        PathBuf::from(r"C:\Program Files (x86)\STMicroelectronics\STM32Cube\STM32CubeProgrammer\bin\STM32_Programmer_CLI.exe"),
        PathBuf::from("/Applications/STMicroelectronics/STM32Cube/STM32CubeProgrammer/STM32CubeProgrammer.app/Contents/MacOs/bin/STM32_Programmer_CLI"),
        PathBuf::from("/usr/local/bin/STM32_Programmer_CLI"),
        PathBuf::from("/opt/STM32CubeProgrammer/bin/STM32_Programmer_CLI"),
    ];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join("STMicroelectronics/STM32Cube/STM32CubeProgrammer/bin/STM32_Programmer_CLI"));
    }
    paths
}

/// Finds STM32_Programmer_CLI and opens sessions with it.
#[derive(Debug, Clone)]
pub struct CubeProgrammerProvider {
    tool: Option<PathBuf>,
    probe_timeout: Duration,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl CubeProgrammerProvider {
    /// Provider that searches the usual install locations.
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

impl BackendProvider for CubeProgrammerProvider {
    fn name(&self) -> &'static str {
        "STM32CubeProgrammer"
    }

    fn probe(&self, probe: &ProbeDevice) -> Result<Box<dyn FlashBackend>> {
        let tool = self
            .tool
            .clone()
            .or_else(|| locate_tool(TOOL_NAMES, &install_locations()))
            .ok_or_else(|| Error::BackendUnavailable("STM32_Programmer_CLI not found".into()))?;

        let output = run_with_timeout(Command::new(&tool).arg("--version"), self.probe_timeout)?;
        if !output.status.success() {
            return Err(Error::BackendUnavailable(format!(
                "{} --version failed: {}",
                tool.display(),
                output.last_line()
            )));
        }
        debug!("Using {}", tool.display());

        Ok(Box::new(CubeProgrammer {
            tool,
            serial: probe.serial.clone(),
            write_timeout: self.write_timeout,
            read_timeout: self.read_timeout,
        }))
    }
}

/// Session driving STM32_Programmer_CLI.
pub struct CubeProgrammer {
    tool: PathBuf,
    serial: Option<String>,
    write_timeout: Duration,
    read_timeout: Duration,
}

/// `-c port=SWD [sn=<serial>]`
pub(crate) fn connect_args(serial: Option<&str>) -> Vec<String> {
    let mut args = vec!["-c".to_string(), "port=SWD".to_string()];
    if let Some(sn) = serial {
        args.push(format!("sn={sn}"));
    }
    args
}

fn check(output: &ToolOutput, action: &str) -> Result<()> {
    let text = output.text();
    if output.status.success() && !text.contains("Error") {
        Ok(())
    } else {
        Err(Error::Transport(format!(
            "STM32_Programmer_CLI {action} failed: {}",
            output.last_line()
        )))
    }
}

impl CubeProgrammer {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.tool);
        cmd.args(connect_args(self.serial.as_deref()));
        cmd
    }
}

impl FlashBackend for CubeProgrammer {
    fn name(&self) -> &'static str {
        "STM32CubeProgrammer"
    }

    fn write(&mut self, data: &[u8], address: u32) -> Result<()> {
        let mut file = tempfile::Builder::new().prefix("dualprog-").suffix(".bin").tempfile()?;
        file.write_all(data)?;
        file.flush()?;

        info!("STM32_Programmer_CLI: writing {} bytes at {}", data.len(), hex_address(address));
        let mut cmd = self.command();
        cmd.arg("-w").arg(file.path()).arg(hex_address(address)).arg("-v");
        let output = run_with_timeout(&mut cmd, self.write_timeout)?;
        check(&output, "write")
    }

    fn read(&mut self, size: usize, address: u32) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("readback.bin");
        let mut cmd = self.command();
        cmd.arg("-u")
            .arg(hex_address(address))
            .arg(size.to_string())
            .arg(&target);
        let output = run_with_timeout(&mut cmd, self.read_timeout)?;
        check(&output, "read")?;
        Ok(fs::read(&target)?)
    }

    fn mass_erase(&mut self) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["-e", "all"]);
        let output = run_with_timeout(&mut cmd, self.read_timeout)?;
        check(&output, "erase")
    }
}
