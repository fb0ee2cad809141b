//! Configuration file support for dualprog.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (DUALPROG_*)
//! 3. Local config file (./dualprog.toml)
//! 4. Global config file (~/.config/dualprog/config.toml)
//!
//! What worked on the last run (paired port, firmware paths, mode) is kept
//! apart from the configuration in `state.toml` next to the global config.

use {
    directories::ProjectDirs,
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    std::{
        collections::BTreeMap,
        fs,
        path::{Path, PathBuf},
    },
};

/// UART control channel settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UartConfig {
    /// Serial port of the control adapter (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Line ending appended to commands: LF, CR or CRLF.
    pub line_ending: Option<String>,
}

/// Defaults for the `program` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgramConfig {
    /// 1-based probe position.
    pub probe_index: Option<usize>,
    /// LV firmware image.
    pub lv_firmware: Option<PathBuf>,
    /// HV firmware image.
    pub hv_firmware: Option<PathBuf>,
    /// Acceptance test plan.
    pub test_plan: Option<PathBuf>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// UART settings.
    #[serde(default)]
    pub uart: UartConfig,
    /// Programming defaults.
    #[serde(default)]
    pub program: ProgramConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new("dualprog.toml")) {
            debug!("Loaded local config from dualprog.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        read_toml(path)
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "dualprog").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        let Self { uart, program } = other;
        if uart.port.is_some() {
            self.uart.port = uart.port;
        }
        if uart.baud.is_some() {
            self.uart.baud = uart.baud;
        }
        if uart.line_ending.is_some() {
            self.uart.line_ending = uart.line_ending;
        }

        if program.probe_index.is_some() {
            self.program.probe_index = program.probe_index;
        }
        if program.lv_firmware.is_some() {
            self.program.lv_firmware = program.lv_firmware;
        }
        if program.hv_firmware.is_some() {
            self.program.hv_firmware = program.hv_firmware;
        }
        if program.test_plan.is_some() {
            self.program.test_plan = program.test_plan;
        }
    }
}

/// What is remembered about one probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceState {
    /// UART port that worked with this probe.
    pub port: Option<String>,
    /// Mode used last.
    pub mode: Option<String>,
}

/// Values remembered between runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct State {
    /// Port of the last successful run.
    pub last_port: Option<String>,
    /// Probe index of the last successful run.
    pub last_probe_index: Option<usize>,
    /// Mode of the last switch.
    pub last_mode: Option<String>,
    /// LV image of the last run.
    pub last_lv_firmware: Option<PathBuf>,
    /// HV image of the last run.
    pub last_hv_firmware: Option<PathBuf>,
    /// Per-probe pairing, keyed by probe identity.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceState>,
}

impl State {
    /// Default location of the state file.
    pub fn default_path() -> Option<PathBuf> {
        Config::global_config_dir().map(|dir| dir.join("state.toml"))
    }

    /// Load the state from its default location.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    /// Load the state from `path`; missing or broken files yield `None`.
    pub fn load_from(path: &Path) -> Option<Self> {
        read_toml(path)
    }

    /// Save to the default location.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::default_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine the configuration directory"))?;
        self.save_to(&path)
    }

    /// Save to `path`, creating its directory.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved state to {}", path.display());
        Ok(())
    }

    /// Port remembered for a probe identity.
    pub fn port_for(&self, identity: &str) -> Option<&str> {
        self.devices.get(identity).and_then(|d| d.port.as_deref())
    }

    /// Remember that `port` belongs to the probe `identity`.
    pub fn remember_pairing(&mut self, identity: &str, port: &str) {
        self.devices.entry(identity.to_string()).or_default().port = Some(port.to_string());
        self.last_port = Some(port.to_string());
    }

    /// Remember the mode last selected on the probe `identity`.
    pub fn remember_mode(&mut self, identity: &str, mode: &str) {
        self.devices.entry(identity.to_string()).or_default().mode = Some(mode.to_string());
        self.last_mode = Some(mode.to_string());
    }
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to parse TOML file {}: {}", path.display(), e);
                None
            },
        },
        Err(e) => {
            warn!("Failed to read file {}: {}", path.display(), e);
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tempfile::tempdir};

    // ---- Default values ----

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.uart.port.is_none());
        assert!(config.uart.baud.is_none());
        assert!(config.program.probe_index.is_none());
        assert!(config.program.test_plan.is_none());
    }

    // ---- merge ----

    #[test]
    fn test_config_merge_overrides_set_fields() {
        let mut config = Config::default();
        config.uart.port = Some("COM1".into());
        config.uart.baud = Some(9600);

        let mut other = Config::default();
        other.uart.port = Some("COM3".into());
        other.program.lv_firmware = Some(PathBuf::from("lv.hex"));
        config.merge(other);

        assert_eq!(config.uart.port.as_deref(), Some("COM3"));
        assert_eq!(config.uart.baud, Some(9600));
        assert_eq!(config.program.lv_firmware, Some(PathBuf::from("lv.hex")));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut config = Config::default();
        config.program.probe_index = Some(2);
        config.uart.line_ending = Some("CRLF".into());
        config.merge(Config::default());
        assert_eq!(config.program.probe_index, Some(2));
        assert_eq!(config.uart.line_ending.as_deref(), Some("CRLF"));
    }

    // ---- TOML ----

    #[test]
    fn test_config_from_toml() {
        let config: Config = toml::from_str(
            r#"
[uart]
port = "/dev/ttyUSB0"
baud = 115200
line_ending = "LF"

[program]
probe_index = 2
lv_firmware = "fw/lv.hex"
hv_firmware = "fw/hv.hex"
test_plan = "plan.json"
"#,
        )
        .unwrap();
        assert_eq!(config.uart.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.uart.baud, Some(115_200));
        assert_eq!(config.program.probe_index, Some(2));
        assert_eq!(config.program.test_plan, Some(PathBuf::from("plan.json")));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dualprog.toml");
        fs::write(&path, "[uart]\nport = \"COM9\"\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.uart.port.as_deref(), Some("COM9"));
    }

    #[test]
    fn test_load_from_path_invalid_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dualprog.toml");
        fs::write(&path, "invalid toml [[[").unwrap();
        assert_eq!(Config::load_from_path(&path), Config::default());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.uart.port.is_none());
    }

    #[test]
    fn test_global_config_path_is_some() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_string_lossy().contains("dualprog"));
            assert!(p.to_string_lossy().ends_with("config.toml"));
        }
    }

    // ---- State ----

    #[test]
    fn test_state_pairing_and_mode() {
        let mut state = State::default();
        state.remember_pairing("serial:066DFF", "COM7");
        state.remember_mode("serial:066DFF", "HV");
        assert_eq!(state.port_for("serial:066DFF"), Some("COM7"));
        assert_eq!(state.port_for("serial:OTHER"), None);
        assert_eq!(state.last_port.as_deref(), Some("COM7"));
        assert_eq!(state.devices["serial:066DFF"].mode.as_deref(), Some("HV"));
    }

    #[test]
    fn test_state_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.toml");
        let mut state = State {
            last_probe_index: Some(1),
            last_lv_firmware: Some(PathBuf::from("lv.hex")),
            ..State::default()
        };
        state.remember_pairing("serial:ABC", "/dev/ttyUSB1");
        state.save_to(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("[devices.\"serial:ABC\"]"), "{text}");
        assert_eq!(State::load_from(&path), Some(state));
    }

    #[test]
    fn test_state_broken_file_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.toml");
        fs::write(&path, "devices = 3").unwrap();
        assert!(State::load_from(&path).is_none());
    }
}
