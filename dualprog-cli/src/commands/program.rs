//! Program command: flash LV/HV firmware and run the acceptance test.

use {
    super::{ensure_not_interrupted, select_target},
    crate::{
        Cli, CliError,
        config::{Config, State},
        use_fancy_output, was_interrupted,
    },
    anyhow::{Context, Result},
    console::style,
    dualprog::{FirmwareImage, Mode, ProgressSink, RunReport, RunRequest, TestPlan, Timing, host},
    indicatif::{ProgressBar, ProgressStyle},
    log::warn,
    std::path::PathBuf,
};

/// Arguments of `dualprog program`.
pub(crate) struct ProgramArgs {
    pub lv: Option<PathBuf>,
    pub hv: Option<PathBuf>,
    pub test_plan: Option<PathBuf>,
    pub no_test: bool,
    pub json: bool,
}

/// Progress bar fed by the orchestrator.
///
/// Log lines already reach stderr through `log`, so only the phase and
/// percentages are shown here.
struct ProgressReporter {
    pb: ProgressBar,
    phase: String,
}

impl ProgressReporter {
    fn new(quiet: bool) -> Self {
        let pb = if quiet || !use_fancy_output() {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new(100);
            #[allow(clippy::unwrap_used)] // Static template string
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            pb
        };
        Self {
            pb,
            phase: String::new(),
        }
    }

    fn finish(&self, success: bool) {
        if success {
            self.pb.finish_with_message("Done");
        } else {
            self.pb.abandon_with_message("Failed");
        }
    }
}

impl ProgressSink for ProgressReporter {
    fn status(&mut self, text: &str) {
        self.phase = text.to_string();
        self.pb.set_message(self.phase.clone());
    }

    fn percent(&mut self, value: u8) {
        self.pb.set_position(u64::from(value));
    }

    fn flash_percent(&mut self, value: u8) {
        self.pb.set_message(format!("{} (flash {value}%)", self.phase));
    }

    fn test_percent(&mut self, value: u8) {
        self.pb.set_message(format!("{} (test {value}%)", self.phase));
    }
}

fn load_images(lv: Option<&PathBuf>, hv: Option<&PathBuf>) -> Result<Vec<(Mode, FirmwareImage)>> {
    let mut images = Vec::new();
    for (mode, path) in [(Mode::Lv, lv), (Mode::Hv, hv)] {
        let Some(path) = path else { continue };
        let image = FirmwareImage::load(path)
            .with_context(|| format!("Failed to load {mode} firmware {}", path.display()))?;
        eprintln!(
            "{} {mode} firmware: {} bytes at 0x{:08X} ({})",
            style("ℹ").blue(),
            image.len(),
            image.start_address,
            path.display()
        );
        images.push((mode, image));
    }
    Ok(images)
}

fn remember_run(state: &mut State, report: &RunReport, probe_index: usize, lv: Option<PathBuf>, hv: Option<PathBuf>, last_mode: Mode) {
    state.last_probe_index = Some(probe_index);
    if lv.is_some() {
        state.last_lv_firmware = lv;
    }
    if hv.is_some() {
        state.last_hv_firmware = hv;
    }
    state.last_mode = Some(last_mode.to_string());
    if let (Some(identity), Some(port)) = (&report.probe, &report.port) {
        state.remember_pairing(identity, port);
        state.remember_mode(identity, last_mode.as_str());
    }
    if let Err(e) = state.save() {
        warn!("Could not save state: {e:#}");
    }
}

fn print_report(report: &RunReport) {
    for (mode, outcome) in &report.outcomes {
        if outcome.success {
            eprintln!(
                "{} {mode} programmed and verified via {}",
                style("✓").green(),
                outcome.backend.as_deref().unwrap_or("?")
            );
        } else {
            eprintln!(
                "{} {mode}: {}",
                style("✗").red(),
                outcome.error_detail.as_deref().unwrap_or("failed")
            );
        }
    }
    if let Some(test) = &report.test {
        let mark = if test.all_passed {
            style("✓").green()
        } else {
            style("✗").red()
        };
        eprintln!("{mark} {}", test.report);
    }
    if report.success {
        eprintln!("{} {}", style("✓").green().bold(), report.message);
    }
}

/// Program command implementation.
pub(crate) fn cmd_program(cli: &Cli, config: &Config, state: &mut State, args: &ProgramArgs) -> Result<()> {
    let lv = args.lv.clone().or_else(|| config.program.lv_firmware.clone());
    let hv = args.hv.clone().or_else(|| config.program.hv_firmware.clone());
    if lv.is_none() && hv.is_none() {
        return Err(CliError::Usage("No firmware given; pass --lv and/or --hv".into()).into());
    }
    let images = load_images(lv.as_ref(), hv.as_ref())?;
    let last_mode = images.last().map_or(Mode::Lv, |(mode, _)| *mode);

    let plan_path = if args.no_test {
        None
    } else {
        args.test_plan
            .clone()
            .or_else(|| config.program.test_plan.clone())
    };
    let test_plan = plan_path
        .map(|path| {
            TestPlan::from_file(&path).with_context(|| format!("Failed to load test plan {}", path.display()))
        })
        .transpose()?;

    let target = select_target(cli, config, state)?;
    ensure_not_interrupted()?;

    let orchestrator = host::native_orchestrator(cli.uart_settings(config)?, Timing::default());
    let request = RunRequest {
        images,
        probe_index: target.probe_index,
        uart_port: Some(target.port.name.clone()),
        test_plan,
    };

    let mut reporter = ProgressReporter::new(cli.quiet);
    let report = orchestrator.run(&request, &mut reporter, &was_interrupted);
    reporter.finish(report.success);

    if args.json {
        let output = serde_json::json!({
            "ok": report.success,
            "data": report,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_report(&report);
    }

    if report.success {
        remember_run(state, &report, target.probe_index, lv, hv, last_mode);
        return Ok(());
    }
    if was_interrupted() || report.message == dualprog::Error::Cancelled.to_string() {
        return Err(CliError::Cancelled(report.message).into());
    }
    Err(anyhow::anyhow!(report.message))
}
