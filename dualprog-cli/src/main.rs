//! dualprog CLI - Command-line tool for programming and testing dual-mode
//! STM32 power boards.
//!
//! ## Features
//!
//! - Program LV and HV firmware with read-back verification
//! - Automatic probe/UART pairing, remembered between runs
//! - Acceptance test plans over the UART control channel
//! - Standalone mode switching, UART commands and status queries
//! - Memory read and erase through the backend chain
//! - Shell completion generation
//! - Environment variable support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    dualprog::{LineEnding, Mode, UartSettings, uart::DEFAULT_BAUD_RATE},
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod serial;

use {
    config::{Config, State},
    serial::SelectionOptions,
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad arguments or an impossible selection (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Invalid configuration (exit 3).
    #[error("{0}")]
    Config(String),
    /// Probe or port missing (exit 4).
    #[error("{0}")]
    Device(String),
    /// Interrupted by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::Device(_) => 4,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return cli_err.exit_code();
    }
    match err.downcast_ref::<dualprog::Error>() {
        Some(dualprog::Error::Cancelled) => 130,
        Some(dualprog::Error::InvalidArgument(_) | dualprog::Error::PairingAmbiguous(_)) => 2,
        Some(dualprog::Error::DeviceNotFound(_)) => 4,
        _ => 1,
    }
}

/// dualprog - program and test dual-mode STM32 power boards.
///
/// Environment variables:
///   DUALPROG_PORT              - UART control port
///   DUALPROG_BAUD              - UART baud rate (default: 115200)
///   DUALPROG_PROBE             - 1-based ST-Link probe index
///   DUALPROG_LINE_ENDING       - Command line ending: LF, CR or CRLF
///   DUALPROG_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "dualprog")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// UART control port (paired with the probe if not specified).
    #[arg(short, long, global = true, env = "DUALPROG_PORT")]
    port: Option<String>,

    /// UART baud rate.
    #[arg(short, long, global = true, env = "DUALPROG_BAUD")]
    baud: Option<u32>,

    /// Line ending appended to UART commands (LF, CR, CRLF).
    #[arg(long, global = true, env = "DUALPROG_LINE_ENDING")]
    line_ending: Option<String>,

    /// 1-based ST-Link probe index.
    #[arg(long, global = true, env = "DUALPROG_PROBE")]
    probe: Option<usize>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "DUALPROG_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Program LV and/or HV firmware, then run the test plan.
    Program {
        /// LV firmware (Intel HEX, or raw .bin at 0x08000000).
        #[arg(long)]
        lv: Option<PathBuf>,

        /// HV firmware (Intel HEX, or raw .bin at 0x08000000).
        #[arg(long)]
        hv: Option<PathBuf>,

        /// Acceptance test plan (JSON).
        #[arg(long)]
        test_plan: Option<PathBuf>,

        /// Skip the test plan even if one is configured.
        #[arg(long, conflicts_with = "test_plan")]
        no_test: bool,

        /// Print the run report as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List connected ST-Link probes.
    ListProbes {
        /// Output probe list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List UART adapter candidates.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Include every serial port, not only UART adapters.
        #[arg(long)]
        all: bool,
    },

    /// Show which UART port the selected probe pairs with.
    Pair {
        /// Output the pairing as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Switch the SWD relay to LV or HV.
    Mode {
        /// Target mode.
        #[arg(value_parser = parse_mode)]
        mode: Mode,
    },

    /// Send one command over the UART.
    Send {
        /// Command line, e.g. "SET EN_12V=ON".
        command: String,

        /// Expected reply (derived from SET commands if omitted).
        #[arg(long)]
        expect: Option<String>,
    },

    /// Query and print the board status.
    Status {
        /// Output the status as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Read target memory and hex-dump it.
    Read {
        /// Start address.
        #[arg(short, long, value_parser = parse_hex_u32, default_value = "0x08000000")]
        address: u32,

        /// Number of bytes.
        #[arg(short, long, value_parser = parse_size)]
        size: usize,

        /// Write the raw bytes to this file instead.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Overwrite a memory range with zeros, or erase the whole flash.
    Erase {
        /// Start address.
        #[arg(short, long, value_parser = parse_hex_u32, default_value = "0x08000000")]
        address: u32,

        /// Number of bytes.
        #[arg(short, long, value_parser = parse_size, required_unless_present = "all")]
        size: Option<usize>,

        /// Mass erase the whole flash.
        #[arg(long, conflicts_with = "size")]
        all: bool,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Run an acceptance test plan on the paired UART.
    Test {
        /// Test plan (JSON).
        plan: PathBuf,
    },

    /// Print everything the UART sends until Ctrl-C.
    Monitor,

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn parse_mode(s: &str) -> Result<Mode, String> {
    s.parse::<Mode>().map_err(|e| e.to_string())
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    // Support underscore separators like 0x0800_0000
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

/// Parse a byte count: decimal, 0x-prefixed hex, or with a K suffix.
fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).ok()
    } else if let Some(kib) = s.strip_suffix(['K', 'k']) {
        kib.parse::<usize>().ok().and_then(|k| k.checked_mul(1024))
    } else {
        s.parse::<usize>().ok()
    };
    match parsed {
        Some(0) => Err("Size must be greater than zero".to_string()),
        Some(size) => Ok(size),
        None => Err(format!("Invalid size: '{s}'")),
    }
}

impl Cli {
    fn selection(&self) -> SelectionOptions {
        SelectionOptions {
            port: self.port.clone(),
            probe: self.probe,
            non_interactive: self.non_interactive,
        }
    }

    /// UART settings from flags/env, then config, then defaults.
    fn uart_settings(&self, config: &Config) -> Result<UartSettings> {
        let baud = match (self.baud, config.uart.baud) {
            (Some(baud), _) => baud,
            (None, Some(baud)) => {
                UartSettings::new(baud, LineEnding::default())
                    .map_err(|e| CliError::Config(format!("[uart] baud: {e}")))?;
                baud
            },
            (None, None) => DEFAULT_BAUD_RATE,
        };
        let line_ending = match (&self.line_ending, &config.uart.line_ending) {
            (Some(le), _) => le
                .parse::<LineEnding>()
                .map_err(|e| CliError::Usage(e.to_string()))?,
            (None, Some(le)) => le
                .parse::<LineEnding>()
                .map_err(|e| CliError::Config(format!("[uart] line_ending: {e}")))?,
            (None, None) => LineEnding::default(),
        };
        UartSettings::new(baud, line_ending).map_err(|e| CliError::Usage(e.to_string()).into())
    }
}

fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            eprintln!("\n{} Aborted", style("✗").red());
            std::process::exit(130);
        }
        eprintln!(
            "\n{} Stopping after the current step (press Ctrl-C again to abort)",
            style("⚠").yellow()
        );
    });
    if let Err(e) = result {
        debug!("Could not install Ctrl-C handler: {e}");
    }
}

fn main() {
    // --- NO_COLOR and TTY detection (clig.dev best practice) ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        // Disable all color output
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "dualprog v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };
    let mut state = State::load();

    match &cli.command {
        Commands::Program {
            lv,
            hv,
            test_plan,
            no_test,
            json,
        } => commands::program::cmd_program(
            cli,
            &config,
            &mut state,
            &commands::program::ProgramArgs {
                lv: lv.clone(),
                hv: hv.clone(),
                test_plan: test_plan.clone(),
                no_test: *no_test,
                json: *json,
            },
        ),
        Commands::ListProbes { json } => commands::info::cmd_list_probes(*json),
        Commands::ListPorts { json, all } => commands::info::cmd_list_ports(*json, *all),
        Commands::Pair { json } => commands::info::cmd_pair(cli, &config, &state, *json),
        Commands::Mode { mode } => commands::uart::cmd_mode(cli, &config, &mut state, *mode),
        Commands::Send { command, expect } => {
            commands::uart::cmd_send(cli, &config, &state, command, expect.as_deref())
        },
        Commands::Status { json } => commands::uart::cmd_status(cli, &config, &state, *json),
        Commands::Read {
            address,
            size,
            output,
        } => commands::memory::cmd_read(cli, &config, *address, *size, output.as_ref()),
        Commands::Erase {
            address,
            size,
            all,
            yes,
        } => commands::memory::cmd_erase(cli, &config, *address, *size, *all, *yes),
        Commands::Test { plan } => commands::uart::cmd_test(cli, &config, &state, plan),
        Commands::Monitor => commands::monitor::cmd_monitor(cli, &config, &state),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("dualprog").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_program() {
        let cli = parse(&["program", "--lv", "lv.hex", "--hv", "hv.hex", "--test-plan", "plan.json"]);
        match cli.command {
            Commands::Program {
                lv,
                hv,
                test_plan,
                no_test,
                json,
            } => {
                assert_eq!(lv, Some(PathBuf::from("lv.hex")));
                assert_eq!(hv, Some(PathBuf::from("hv.hex")));
                assert_eq!(test_plan, Some(PathBuf::from("plan.json")));
                assert!(!no_test);
                assert!(!json);
            },
            _ => panic!("Expected Program command"),
        }
    }

    #[test]
    fn test_cli_program_no_test_conflicts_with_plan() {
        let result = Cli::try_parse_from(["dualprog", "program", "--test-plan", "p.json", "--no-test"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_mode() {
        let cli = parse(&["mode", "hv"]);
        assert!(matches!(cli.command, Commands::Mode { mode: Mode::Hv }));
        assert!(Cli::try_parse_from(["dualprog", "mode", "mv"]).is_err());
    }

    #[test]
    fn test_cli_parse_send() {
        let cli = parse(&["send", "SET EN_12V=ON"]);
        match cli.command {
            Commands::Send { command, expect } => {
                assert_eq!(command, "SET EN_12V=ON");
                assert!(expect.is_none());
            },
            _ => panic!("Expected Send command"),
        }
    }

    #[test]
    fn test_cli_parse_read_defaults() {
        let cli = parse(&["read", "--size", "4K"]);
        match cli.command {
            Commands::Read { address, size, output } => {
                assert_eq!(address, 0x0800_0000);
                assert_eq!(size, 4096);
                assert!(output.is_none());
            },
            _ => panic!("Expected Read command"),
        }
    }

    #[test]
    fn test_cli_erase_requires_size_or_all() {
        assert!(Cli::try_parse_from(["dualprog", "erase"]).is_err());
        assert!(Cli::try_parse_from(["dualprog", "erase", "--all", "--size", "16"]).is_err());
        let cli = parse(&["erase", "--all", "--yes"]);
        assert!(matches!(cli.command, Commands::Erase { all: true, yes: true, size: None, .. }));
    }

    #[test]
    fn test_cli_global_options() {
        let cli = parse(&["-p", "COM7", "-b", "9600", "--probe", "2", "--line-ending", "crlf", "-vv", "status"]);
        assert_eq!(cli.port.as_deref(), Some("COM7"));
        assert_eq!(cli.baud, Some(9600));
        assert_eq!(cli.probe, Some(2));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.selection().probe, Some(2));

        let settings = cli.uart_settings(&Config::default()).unwrap();
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.line_ending, LineEnding::CrLf);
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["dualprog"]).is_err());
    }

    #[test]
    fn test_uart_settings_from_config() {
        let cli = parse(&["status"]);
        let mut config = Config::default();
        config.uart.baud = Some(57_600);
        config.uart.line_ending = Some("CR".into());
        let settings = cli.uart_settings(&config).unwrap();
        assert_eq!(settings.baud_rate, 57_600);
        assert_eq!(settings.line_ending, LineEnding::Cr);

        config.uart.baud = Some(12_345);
        let err = cli.uart_settings(&config).unwrap_err();
        assert_eq!(exit_code_for(&err), 3);
    }

    #[test]
    fn test_uart_settings_bad_flag_is_usage() {
        let cli = parse(&["-b", "12345", "status"]);
        let err = cli.uart_settings(&Config::default()).unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&CliError::Usage("u".into()).into()), 2);
        assert_eq!(exit_code_for(&CliError::Config("c".into()).into()), 3);
        assert_eq!(exit_code_for(&CliError::Device("d".into()).into()), 4);
        assert_eq!(exit_code_for(&CliError::Cancelled("x".into()).into()), 130);
        assert_eq!(exit_code_for(&dualprog::Error::Cancelled.into()), 130);
        assert_eq!(exit_code_for(&dualprog::Error::DeviceNotFound("p".into()).into()), 4);
        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn test_parse_hex_u32() {
        assert_eq!(parse_hex_u32("0x08000000"), Ok(0x0800_0000));
        assert_eq!(parse_hex_u32("0800_0000"), Ok(0x0800_0000));
        assert!(parse_hex_u32("0xZZ").is_err());
        assert!(parse_hex_u32("0x1_0000_0000").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("256"), Ok(256));
        assert_eq!(parse_size("0x100"), Ok(256));
        assert_eq!(parse_size("2k"), Ok(2048));
        assert!(parse_size("0").is_err());
        assert!(parse_size("lots").is_err());
    }
}
