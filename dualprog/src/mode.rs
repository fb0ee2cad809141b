//! Power and SWD-mode sequencing over the UART control channel.
//!
//! Selecting a mode flips a relay that re-routes the probe's SWD lines to
//! the LV or HV microcontroller. The probe typically drops off the bus and
//! comes back, so a complete switch is:
//!
//! ```text
//! PoweredOn -> ModeSwitching(m) -> ModeConfirmed(m) -> Stabilizing(m) -> Reenumerated(m)
//!                    |                   |                  |                 |
//!                    +-------------------+------------------+-----------------+--> Failed
//! ```
//!
//! The SET echo alone is not trusted: the controller can acknowledge before
//! the relay has moved, so the mode is queried again afterwards.

use {
    crate::{
        device::{DeviceRegistry, DeviceSource, ProbeDevice},
        error::{Error, Result},
        port::PortOpener,
        timing::{Timing, pause, pause_unless_stopped},
        uart::{UartSession, command},
    },
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::{fmt, str::FromStr, time::Duration},
};

/// Board variant selected by the SWD relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Low-voltage variant.
    Lv,
    /// High-voltage variant.
    Hv,
}

impl Mode {
    /// Value used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lv => "LV",
            Self::Hv => "HV",
        }
    }

    /// The other variant.
    pub fn other(self) -> Self {
        match self {
            Self::Lv => Self::Hv,
            Self::Hv => Self::Lv,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "LV" => Ok(Self::Lv),
            "HV" => Ok(Self::Hv),
            other => Err(Error::InvalidArgument(format!("unknown mode '{other}', expected LV or HV"))),
        }
    }
}

/// Where the board is in the power/mode sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeState {
    /// 12 V supply off.
    PoweredOff,
    /// 12 V supply on, mode not yet driven.
    PoweredOn,
    /// Relay position unknown.
    ModeUnknown,
    /// SET sent, waiting for the echo.
    ModeSwitching(Mode),
    /// The controller reports the mode.
    ModeConfirmed(Mode),
    /// Waiting for the SWD lines to settle.
    Stabilizing(Mode),
    /// The probe is back on the bus.
    Reenumerated(Mode),
    /// A step exhausted its retries.
    Failed(String),
}

/// Extract the relay position from a query reply.
///
/// Accepts `SWICH_SWD1__2=HV`, `SWICH_SWD1__2: HV` or a bare `HV`.
pub fn parse_mode(reply: &str) -> Option<Mode> {
    for line in reply.lines() {
        let line = line.trim();
        if let Some(pos) = line.find(command::SWD_MODE) {
            let rest = line[pos + command::SWD_MODE.len()..].trim_start();
            let value = rest.strip_prefix(['=', ':']).map(str::trim);
            if let Some(mode) = value.and_then(|v| v.split_whitespace().next()).and_then(|v| v.parse::<Mode>().ok()) {
                return Some(mode);
            }
        } else if let Ok(mode) = line.parse::<Mode>() {
            return Some(mode);
        }
    }
    None
}

/// Drives one UART session through power and mode changes.
pub struct ModeSwitcher<'a, O: PortOpener, S: DeviceSource> {
    session: &'a mut UartSession<O>,
    registry: &'a DeviceRegistry<S>,
    should_stop: &'a dyn Fn() -> bool,
    timing: Timing,
    state: ModeState,
    history: Vec<ModeState>,
    query_unanswered: bool,
}

impl<'a, O: PortOpener, S: DeviceSource> ModeSwitcher<'a, O, S> {
    /// Switcher over an open session. The board is assumed unpowered.
    pub fn new(
        session: &'a mut UartSession<O>,
        registry: &'a DeviceRegistry<S>,
        should_stop: &'a dyn Fn() -> bool,
    ) -> Self {
        let timing = session.timing().clone();
        Self {
            session,
            registry,
            should_stop,
            timing,
            state: ModeState::PoweredOff,
            history: vec![ModeState::PoweredOff],
            query_unanswered: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> &ModeState {
        &self.state
    }

    /// Every state entered so far, oldest first.
    pub fn history(&self) -> &[ModeState] {
        &self.history
    }

    fn enter(&mut self, state: ModeState) {
        debug!("Mode state: {:?} -> {state:?}", self.state);
        self.state = state.clone();
        self.history.push(state);
    }

    fn fail(&mut self, error: Error) -> Error {
        self.enter(ModeState::Failed(error.to_string()));
        error
    }

    fn check_stop(&mut self) -> Result<()> {
        if (self.should_stop)() {
            Err(self.fail(Error::Cancelled))
        } else {
            Ok(())
        }
    }

    /// Send `SET EN_12V=ON` until acknowledged.
    fn drive_power_on(&mut self) -> Result<()> {
        let cmd = command::power(true);
        let expected = format!("{}=ON", command::POWER);
        let attempts = self.timing.power_attempts;
        for attempt in 1..=attempts {
            if attempt > 1 {
                pause(self.timing.power_retry_delay);
            }
            match self.session.send_and_expect_recovering(&cmd, &expected, None) {
                Ok(true) => {
                    self.enter(ModeState::PoweredOn);
                    self.enter(ModeState::ModeUnknown);
                    return Ok(());
                },
                Ok(false) => warn!(
                    "Power on not acknowledged (attempt {attempt}/{attempts}): got '{}'",
                    self.session.last_response()
                ),
                Err(e) if e.is_port_closed() => return Err(self.fail(e)),
                Err(e) => warn!("Power on failed (attempt {attempt}/{attempts}): {e}"),
            }
        }
        let actual = self.session.last_response().to_string();
        Err(self.fail(Error::ProtocolMismatch { expected, actual }))
    }

    /// Power the board: let the UART settle, clear it, then switch the
    /// 12 V supply on with retries.
    pub fn power_on(&mut self) -> Result<()> {
        pause(self.timing.power_on_warmup);
        if let Err(e) = self.session.clear_buffers() {
            warn!("Clearing UART buffers before power on failed: {e}");
        }
        self.drive_power_on()?;
        info!("Board powered on");
        pause(self.timing.power_settle);
        Ok(())
    }

    /// Switch the 12 V supply off. Returns whether it was acknowledged.
    pub fn power_off(&mut self) -> Result<bool> {
        let acked = self
            .session
            .send_and_expect(&command::power(false), &format!("{}=OFF", command::POWER))?;
        if acked {
            self.enter(ModeState::PoweredOff);
        }
        Ok(acked)
    }

    /// Off, wait, on. Resets controller state latched during flashing.
    pub fn power_cycle(&mut self) -> Result<()> {
        info!("Power cycling the board");
        let off = self
            .session
            .send_and_expect_recovering(&command::power(false), &format!("{}=OFF", command::POWER), None)?;
        if off {
            self.enter(ModeState::PoweredOff);
        } else {
            warn!("Power off not acknowledged: got '{}'", self.session.last_response());
        }
        pause(self.timing.power_cycle_gap);
        self.drive_power_on()?;
        pause(self.timing.power_settle);
        Ok(())
    }

    /// Ask the controller which mode is active. `None` when no query form
    /// produced a parseable answer.
    pub fn query_mode(&mut self) -> Result<Option<Mode>> {
        let forms = [
            command::get(command::SWD_MODE),
            format!("{}?", command::SWD_MODE),
            format!("{} {}", command::STATUS, command::SWD_MODE),
        ];
        let tries = self.timing.mode_query_tries;
        for attempt in 1..=tries {
            if attempt > 1 {
                pause(self.timing.mode_query_delay);
            }
            for form in &forms {
                let reply = self.session.query(
                    form,
                    self.timing.status_idle,
                    self.timing.status_idle.max(self.timing.poll_interval),
                    self.timing.status_poll,
                )?;
                if let Some(mode) = parse_mode(&reply) {
                    debug!("'{form}' reports {mode}");
                    return Ok(Some(mode));
                }
            }
        }
        Ok(None)
    }

    /// Send the mode SET with backoff; fall back to a query and a compact
    /// resend. On success the controller has acknowledged `target`.
    pub fn select_mode(&mut self, target: Mode) -> Result<()> {
        self.enter(ModeState::ModeSwitching(target));
        let cmd = command::set(command::SWD_MODE, target.as_str());
        let expected = format!("{}={target}", command::SWD_MODE);
        let attempts = self.timing.mode_set_delays.len();

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.check_stop()?;
                pause(self.timing.mode_set_delays[attempt - 2]);
            }
            match self.session.send_and_expect_recovering(&cmd, &expected, None) {
                Ok(true) => {
                    info!("Mode {target} acknowledged");
                    return Ok(());
                },
                Ok(false) => warn!(
                    "Mode {target} not acknowledged (attempt {attempt}/{attempts}): got '{}'",
                    self.session.last_response()
                ),
                Err(e) if e.is_port_closed() => return Err(self.fail(e)),
                Err(e) => warn!("Mode {target} failed (attempt {attempt}/{attempts}): {e}"),
            }
        }

        match self.query_mode() {
            Ok(Some(mode)) if mode == target => {
                info!("Mode {target} confirmed by query despite missing acknowledgement");
                return Ok(());
            },
            Ok(Some(mode)) => {
                return Err(self.fail(Error::ProtocolMismatch {
                    expected: target.to_string(),
                    actual: mode.to_string(),
                }));
            },
            Ok(None) => debug!("Mode query unanswered, trying compact form"),
            Err(e) => return Err(self.fail(e)),
        }

        let compact = format!("SET{}={target}", command::SWD_MODE);
        match self.session.send_and_expect(&compact, &expected) {
            Ok(true) => {
                info!("Mode {target} acknowledged to compact command");
                Ok(())
            },
            Ok(false) => {
                let actual = self.session.last_response().to_string();
                Err(self.fail(Error::ProtocolMismatch { expected, actual }))
            },
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Query the mode up to `mode_confirm_checks` times. A reply naming
    /// the other mode fails; silence does not.
    fn confirm(&mut self, target: Mode) -> Result<()> {
        let checks = self.timing.mode_confirm_checks;
        let mut wrong = None;
        for check in 1..=checks {
            if check > 1 {
                pause(self.timing.mode_confirm_delay);
            }
            if self.query_unanswered {
                break;
            }
            match self.query_mode() {
                Ok(Some(mode)) if mode == target => {
                    self.enter(ModeState::ModeConfirmed(target));
                    return Ok(());
                },
                Ok(Some(mode)) => {
                    warn!("Controller reports {mode} after switching to {target} (check {check}/{checks})");
                    wrong = Some(mode);
                },
                Ok(None) => {
                    if wrong.is_none() {
                        debug!("Controller does not answer mode queries, trusting the acknowledgement");
                        self.query_unanswered = true;
                    }
                },
                Err(e) => return Err(self.fail(e)),
            }
        }
        if let Some(mode) = wrong {
            return Err(self.fail(Error::ProtocolMismatch {
                expected: target.to_string(),
                actual: mode.to_string(),
            }));
        }
        self.enter(ModeState::ModeConfirmed(target));
        Ok(())
    }

    fn stabilize(&mut self, target: Mode) -> Result<()> {
        self.enter(ModeState::Stabilizing(target));
        let wait = match target {
            Mode::Lv => self.timing.stabilize_lv,
            Mode::Hv => self.timing.stabilize_hv,
        };
        info!("Waiting {}s for the SWD lines to settle", wait.as_secs());
        if pause_unless_stopped(wait, self.timing.stop_slice, self.should_stop) {
            Ok(())
        } else {
            Err(self.fail(Error::Cancelled))
        }
    }

    /// Find the probe again after the relay moved.
    pub fn reenumerate(
        &mut self,
        previous: &ProbeDevice,
        probe_index: usize,
        attempts: usize,
        delay: Duration,
        settle: Duration,
    ) -> Result<ProbeDevice> {
        for attempt in 1..=attempts {
            if attempt > 1 {
                self.check_stop()?;
                pause(delay);
            }
            match self.registry.reselect_probe(previous, probe_index) {
                Ok(probe) => {
                    info!("Probe {} back on the bus", probe.name());
                    if !pause_unless_stopped(settle, self.timing.stop_slice, self.should_stop) {
                        return Err(self.fail(Error::Cancelled));
                    }
                    return Ok(probe);
                },
                Err(e) => warn!("Probe not found yet (attempt {attempt}/{attempts}): {e}"),
            }
        }
        Err(self.fail(Error::DeviceNotFound(format!(
            "{} did not reappear",
            previous.name()
        ))))
    }

    /// Full switch: select, confirm, stabilize and re-select the probe.
    /// Returns the probe as it enumerates after the switch.
    pub fn switch(&mut self, target: Mode, previous: &ProbeDevice, probe_index: usize) -> Result<ProbeDevice> {
        info!("Switching to {target} mode");
        self.select_mode(target)?;
        self.confirm(target)?;
        self.stabilize(target)?;
        let settle = match target {
            Mode::Lv => self.timing.post_select_lv,
            Mode::Hv => self.timing.post_select_hv,
        };
        let probe = self.reenumerate(
            previous,
            probe_index,
            self.timing.reenumerate_attempts,
            self.timing.reenumerate_delay,
            settle,
        )?;
        self.enter(ModeState::Reenumerated(target));
        Ok(probe)
    }
}
