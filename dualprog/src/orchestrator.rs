//! Top-level programming run.
//!
//! One run powers the board, programs each requested image in its own
//! mode with read-back verification, power-cycles between images and
//! finally runs the acceptance test plan. Whatever happens, the board is
//! powered off before the run returns.
//!
//! Failure handling is deliberately asymmetric: a mode that cannot be
//! selected only marks that image as failed, while a failed or unverified
//! write ends the run at once.

use {
    crate::{
        device::{DeviceRegistry, DeviceSource, ProbeDevice},
        error::{Error, Result},
        flash::{VerifiedWriter, WriteOutcome},
        image::{DEFAULT_FLASH_ADDRESS, FirmwareImage},
        mode::{Mode, ModeSwitcher},
        port::PortOpener,
        progress::ProgressSink,
        testplan::{TestPlan, TestReport, TestRunner},
        timing::{Timing, pause, pause_unless_stopped},
        uart::{PortResolver, UartSession, UartSettings, command},
    },
    log::{error, info, warn},
    serde::Serialize,
};

/// Percent at which the test phase starts.
const TEST_PHASE_START: u8 = 80;

/// What to program.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Images in programming order, conventionally LV first.
    pub images: Vec<(Mode, FirmwareImage)>,
    /// 1-based probe position in discovery order.
    pub probe_index: usize,
    /// UART port; `None` pairs it with the probe.
    pub uart_port: Option<String>,
    /// Plan to run after every image was programmed.
    pub test_plan: Option<TestPlan>,
}

/// Result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Every image programmed and every test passed.
    pub success: bool,
    /// Summary for the operator.
    pub message: String,
    /// Per-image outcomes in programming order.
    pub outcomes: Vec<(Mode, WriteOutcome)>,
    /// Test plan results, when the plan ran.
    pub test: Option<TestReport>,
    /// Free-text lines emitted during the run.
    pub log: Vec<String>,
    /// Identity of the probe used.
    pub probe: Option<String>,
    /// UART port used.
    pub port: Option<String>,
}

/// State threaded through the steps of one run.
struct RunContext<'s> {
    sink: &'s mut dyn ProgressSink,
    log: Vec<String>,
    probe: Option<ProbeDevice>,
    port: Option<String>,
    outcomes: Vec<(Mode, WriteOutcome)>,
    test: Option<TestReport>,
}

impl<'s> RunContext<'s> {
    fn new(sink: &'s mut dyn ProgressSink) -> Self {
        Self {
            sink,
            log: Vec::new(),
            probe: None,
            port: None,
            outcomes: Vec::new(),
            test: None,
        }
    }

    fn into_report(self, success: bool, message: String) -> RunReport {
        RunReport {
            success,
            message,
            outcomes: self.outcomes,
            test: self.test,
            log: self.log,
            probe: self.probe.as_ref().map(ProbeDevice::identity_key),
            port: self.port,
        }
    }
}

impl ProgressSink for RunContext<'_> {
    fn line(&mut self, text: &str) {
        info!("{text}");
        self.log.push(text.to_string());
        self.sink.line(text);
    }

    fn status(&mut self, text: &str) {
        self.sink.status(text);
    }

    fn percent(&mut self, value: u8) {
        self.sink.percent(value);
    }

    fn flash_percent(&mut self, value: u8) {
        self.sink.flash_percent(value);
    }

    fn test_percent(&mut self, value: u8) {
        self.sink.test_percent(value);
        self.sink.percent(TEST_PHASE_START + value / 5);
    }
}

/// Overall percent inside the span of one image.
struct Span {
    base: u8,
    width: u8,
}

impl Span {
    fn of(index: usize, count: usize) -> Self {
        let width = u8::try_from(usize::from(TEST_PHASE_START) / count.max(1)).unwrap_or(TEST_PHASE_START);
        let base = u8::try_from(index).map_or(0, |i| i.saturating_mul(width));
        Self { base, width }
    }

    /// Milestone `offset`, given on a single-image scale of 0..80.
    fn at(&self, offset: u8) -> u8 {
        let scaled = u16::from(offset) * u16::from(self.width) / u16::from(TEST_PHASE_START);
        self.base.saturating_add(u8::try_from(scaled).unwrap_or(self.width))
    }
}

/// Runs complete programming sessions against one board.
pub struct ProgrammingOrchestrator<S, O> {
    registry: DeviceRegistry<S>,
    opener: O,
    settings: UartSettings,
    timing: Timing,
    writer: VerifiedWriter,
}

impl<S, O> ProgrammingOrchestrator<S, O>
where
    S: DeviceSource + Clone + Send + 'static,
    O: PortOpener + Clone,
{
    /// Orchestrator over a device source, a port opener and a writer.
    pub fn new(source: S, opener: O, writer: VerifiedWriter) -> Self {
        Self {
            registry: DeviceRegistry::new(source),
            opener,
            settings: UartSettings::default(),
            timing: Timing::default(),
            writer,
        }
    }

    /// Use these UART settings.
    #[must_use]
    pub fn with_settings(mut self, settings: UartSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use these delays and retry schedules.
    #[must_use]
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// The device registry.
    pub fn registry(&self) -> &DeviceRegistry<S> {
        &self.registry
    }

    /// Program every requested image and run the test plan.
    ///
    /// `should_stop` is polled between steps; a step that started always
    /// completes. The report's `log` holds every line sent to `sink`.
    pub fn run(
        &self,
        request: &RunRequest,
        sink: &mut dyn ProgressSink,
        should_stop: &dyn Fn() -> bool,
    ) -> RunReport {
        let mut ctx = RunContext::new(sink);
        ctx.percent(0);
        ctx.status("Initializing");

        match self.execute(request, &mut ctx, should_stop) {
            Ok(message) => {
                info!("{message}");
                ctx.status("Done");
                ctx.percent(100);
                ctx.into_report(true, message)
            },
            Err(message) => {
                error!("{message}");
                ctx.status("Failed");
                ctx.into_report(false, message)
            },
        }
    }

    fn execute(
        &self,
        request: &RunRequest,
        ctx: &mut RunContext<'_>,
        should_stop: &dyn Fn() -> bool,
    ) -> std::result::Result<String, String> {
        validate_request(request).map_err(|e| e.to_string())?;
        let probe = self
            .registry
            .select_probe(request.probe_index)
            .map_err(|e| format!("Probe selection failed: {e}"))?;
        info!("Using probe {probe}");
        ctx.probe = Some(probe.clone());

        let port = match &request.uart_port {
            Some(port) => port.clone(),
            None => self.resolve_port(&probe)?,
        };
        ctx.port = Some(port.clone());

        let mut session = UartSession::open(self.opener.clone(), &port, self.settings.clone(), self.timing.clone())
            .map_err(|e| format!("Cannot open UART {port}: {e}"))?
            .with_resolver(self.resolver());

        let result = self.program(&mut session, probe, request, ctx, should_stop);
        shutdown(&mut session, ctx);
        result
    }

    fn resolve_port(&self, probe: &ProbeDevice) -> std::result::Result<String, String> {
        match self.registry.resolve_port(probe) {
            Ok(port) => {
                info!("{probe} pairs with {}", port.name);
                Ok(port.name)
            },
            Err(e @ Error::PairingAmbiguous(_)) => Err(e.to_string()),
            Err(e) => Err(format!("UART port not found: {e}")),
        }
    }

    fn resolver(&self) -> PortResolver {
        let lookup = DeviceRegistry::new(self.registry.source().clone());
        Box::new(move |name| lookup.find_port(name).map(|port| port.name))
    }

    fn program(
        &self,
        session: &mut UartSession<O>,
        mut probe: ProbeDevice,
        request: &RunRequest,
        ctx: &mut RunContext<'_>,
        should_stop: &dyn Fn() -> bool,
    ) -> std::result::Result<String, String> {
        let count = request.images.len();
        {
            let mut switcher = ModeSwitcher::new(session, &self.registry, should_stop);
            ctx.status("Powering on");
            ctx.line(&format!("->> {}", command::power(true)));
            switcher
                .power_on()
                .map_err(|e| format!("Failed to power on the board: {e}"))?;
            ctx.line(&format!("<<- {}=ON", command::POWER));
            ctx.percent(Span::of(0, count).at(2));

            for (index, (mode, image)) in request.images.iter().enumerate() {
                if should_stop() {
                    return Err(cancelled());
                }
                let span = Span::of(index, count);
                probe = match self.program_image(&mut switcher, probe, request.probe_index, *mode, image, &span, ctx) {
                    ImageStep::Done(probe) => probe,
                    ImageStep::Skipped(previous) => {
                        probe = previous;
                        continue;
                    },
                    ImageStep::Fatal(message) => return Err(message),
                };
                if should_stop() {
                    return Err(cancelled());
                }
                if *mode == Mode::Lv && index + 1 < count {
                    probe = self.rediscover(&mut switcher, probe, request.probe_index, ctx, should_stop)?;
                    ctx.percent(span.at(75));
                }
                ctx.percent(span.at(TEST_PHASE_START));
            }
        }

        let failed: Vec<String> = ctx
            .outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.success)
            .map(|(mode, outcome)| format!("{mode}: {}", outcome.error_detail.as_deref().unwrap_or("failed")))
            .collect();
        if !failed.is_empty() {
            return Err(format!("Programming failed. {}", failed.join("; ")));
        }

        ctx.percent(TEST_PHASE_START);
        let Some(plan) = &request.test_plan else {
            return Ok("Programming completed successfully. Test plan skipped".to_string());
        };
        if should_stop() {
            return Err(cancelled());
        }
        ctx.status("Testing");
        let report = TestRunner::new(session, should_stop).run(plan, ctx);
        let passed = report.all_passed;
        let summary = report.report.clone();
        ctx.test = Some(report);
        if passed {
            Ok("Programming completed successfully. All tests passed".to_string())
        } else {
            Err(format!("Programming completed, but testing failed.\n{summary}"))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn program_image(
        &self,
        switcher: &mut ModeSwitcher<'_, O, S>,
        probe: ProbeDevice,
        probe_index: usize,
        mode: Mode,
        image: &FirmwareImage,
        span: &Span,
        ctx: &mut RunContext<'_>,
    ) -> ImageStep {
        ctx.status(&format!("Switching mode: {mode}"));
        ctx.percent(span.at(2));
        ctx.line(&format!("->> {}", command::set(command::SWD_MODE, mode.as_str())));
        let probe = match switcher.switch(mode, &probe, probe_index) {
            Ok(probe) => probe,
            Err(Error::Cancelled) => return ImageStep::Fatal(cancelled()),
            Err(e) if e.is_port_closed() => {
                ctx.line(&format!("Mode switch to {mode} failed: {e}"));
                ctx.outcomes
                    .push((mode, WriteOutcome::failed(format!("mode switch failed: {e}"), None)));
                return ImageStep::Fatal(format!("UART lost while switching to {mode}: {e}"));
            },
            Err(e) => {
                warn!("Mode switch to {mode} failed, skipping its image: {e}");
                ctx.line(&format!("Mode switch to {mode} failed: {e}"));
                ctx.outcomes
                    .push((mode, WriteOutcome::failed(format!("mode switch failed: {e}"), None)));
                return ImageStep::Skipped(probe);
            },
        };
        ctx.line(&format!("<<- {}={mode}", command::SWD_MODE));
        ctx.percent(span.at(10));

        if image.start_address != DEFAULT_FLASH_ADDRESS {
            warn!(
                "{mode} image starts at 0x{:08X}, not 0x{DEFAULT_FLASH_ADDRESS:08X}; writing at its own address",
                image.start_address
            );
        }
        ctx.status(&format!("Writing firmware: {mode}"));
        ctx.percent(span.at(15));
        ctx.line(&format!("Writing {} bytes for {mode} at 0x{:08X}", image.len(), image.start_address));
        ctx.percent(span.at(20));
        let outcome = self
            .writer
            .write_verified_reporting(&probe, image, &mut |p| ctx.flash_percent(p));
        ctx.outcomes.push((mode, outcome.clone()));
        if !outcome.success {
            let detail = outcome.error_detail.unwrap_or_default();
            return ImageStep::Fatal(format!("Programming {mode} failed: {detail}"));
        }
        ctx.line(&format!(
            "{mode} firmware written and verified via {}",
            outcome.backend.as_deref().unwrap_or("unknown backend")
        ));
        ctx.percent(span.at(60));

        ctx.status("Power cycling");
        ctx.percent(span.at(65));
        ctx.line(&format!("->> {}", command::power(false)));
        if let Err(e) = switcher.power_cycle() {
            return ImageStep::Fatal(format!("Power cycle after {mode} failed: {e}"));
        }
        ctx.line(&format!("<<- {}=ON", command::POWER));
        ctx.percent(span.at(70));
        ImageStep::Done(probe)
    }

    /// Flashing the LV image can make the probe re-enumerate silently, so
    /// it is looked up again even when nothing failed.
    fn rediscover(
        &self,
        switcher: &mut ModeSwitcher<'_, O, S>,
        probe: ProbeDevice,
        probe_index: usize,
        ctx: &mut RunContext<'_>,
        should_stop: &dyn Fn() -> bool,
    ) -> std::result::Result<ProbeDevice, String> {
        ctx.status("Reconnecting probe");
        if !pause_unless_stopped(self.timing.post_lv_wait, self.timing.stop_slice, should_stop) {
            return Err(cancelled());
        }
        match switcher.reenumerate(
            &probe,
            probe_index,
            self.timing.post_lv_reconnect_attempts,
            self.timing.post_lv_reconnect_delay,
            self.timing.post_lv_select_wait,
        ) {
            Ok(found) => Ok(found),
            Err(Error::Cancelled) => Err(cancelled()),
            Err(e) => {
                warn!("{e}; continuing with the previous probe handle");
                pause(self.timing.post_lv_fallback_wait);
                Ok(probe)
            },
        }
    }
}

enum ImageStep {
    Done(ProbeDevice),
    Skipped(ProbeDevice),
    Fatal(String),
}

fn cancelled() -> String {
    Error::Cancelled.to_string()
}

/// Power the board off and close the port. Never fails.
fn shutdown<O: PortOpener>(session: &mut UartSession<O>, ctx: &mut RunContext<'_>) {
    if !session.is_open() {
        warn!("UART lost, reopening to power off");
        if let Err(e) = session.recover() {
            warn!("Cannot reopen UART, board left powered: {e}");
            ctx.line(&format!("Power off skipped: {e}"));
            session.close();
            return;
        }
    }
    let off = command::power(false);
    ctx.line(&format!("->> {off}"));
    match session.send_and_expect(&off, &format!("{}=OFF", command::POWER)) {
        Ok(true) => ctx.line(&format!("<<- {}=OFF", command::POWER)),
        Ok(false) | Err(_) => {
            warn!("Power off not acknowledged, sending it without waiting");
            if let Err(e) = session.send_raw(&off) {
                warn!("Power off failed: {e}");
            }
        },
    }
    session.close();
}

/// Check a request before touching hardware.
pub fn validate_request(request: &RunRequest) -> Result<()> {
    if request.images.is_empty() {
        return Err(Error::InvalidArgument("no firmware image selected".into()));
    }
    for (i, (mode, _)) in request.images.iter().enumerate() {
        if request.images[..i].iter().any(|(m, _)| m == mode) {
            return Err(Error::InvalidArgument(format!("{mode} image given twice")));
        }
    }
    if let Some((mode, _)) = request.images.iter().find(|(_, image)| image.is_empty()) {
        return Err(Error::Format(format!("{mode} image is empty")));
    }
    Ok(())
}
