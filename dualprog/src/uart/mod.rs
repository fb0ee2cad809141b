//! UART command/response engine.
//!
//! A [`UartSession`] owns one open control port. Every exchange follows the
//! same framing:
//!
//! 1. discard stale input,
//! 2. write the command followed by the configured line ending,
//! 3. read until a CR/LF arrives, the expected text shows up, or the
//!    response window ends,
//! 4. strip one trailing line ending and compare byte for byte.
//!
//! An empty (or truncated) first read gets exactly one extra late-arrival
//! window, since the controller sometimes answers a few hundred
//! milliseconds late. Retrying a command is the caller's business: only the
//! caller knows whether the command is idempotent.
//!
//! A handle that dies mid-exchange surfaces as [`Error::PortClosed`];
//! [`UartSession::send_and_expect_recovering`] turns that into bounded
//! close/reopen/retry cycles on the same port name.

pub mod command;

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortOpener, SerialConfig},
        timing::{Timing, pause},
    },
    log::{debug, info, trace, warn},
    serde::{Deserialize, Serialize},
    std::{
        fmt,
        str::FromStr,
        time::{Duration, Instant},
    },
};

/// Baud rates the control firmware supports.
pub const ALLOWED_BAUD_RATES: &[u32] = &[
    9600, 19200, 38400, 57600, 115_200, 230_400, 460_800, 921_600,
];

/// Baud rate of the control firmware out of the box.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Terminator appended to every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LineEnding {
    /// `\n`
    #[default]
    Lf,
    /// `\r`
    Cr,
    /// `\r\n`
    CrLf,
}

impl LineEnding {
    /// Terminator bytes.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Lf => b"\n",
            Self::Cr => b"\r",
            Self::CrLf => b"\r\n",
        }
    }

    /// Setting name (`LF`, `CR`, `CRLF`).
    pub fn name(self) -> &'static str {
        match self {
            Self::Lf => "LF",
            Self::Cr => "CR",
            Self::CrLf => "CRLF",
        }
    }
}

impl fmt::Display for LineEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LineEnding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "LF" | "\\N" => Ok(Self::Lf),
            "CR" | "\\R" => Ok(Self::Cr),
            "CRLF" | "\\R\\N" => Ok(Self::CrLf),
            other => Err(Error::InvalidArgument(format!(
                "unknown line ending '{other}', expected LF, CR or CRLF"
            ))),
        }
    }
}

/// Operator-tunable UART settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UartSettings {
    /// Baud rate, one of [`ALLOWED_BAUD_RATES`].
    pub baud_rate: u32,
    /// Command terminator.
    pub line_ending: LineEnding,
    /// Response window overriding the platform default.
    pub read_timeout: Option<Duration>,
}

impl Default for UartSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            line_ending: LineEnding::default(),
            read_timeout: None,
        }
    }
}

impl UartSettings {
    /// Validated settings.
    pub fn new(baud_rate: u32, line_ending: LineEnding) -> Result<Self> {
        let settings = Self {
            baud_rate,
            line_ending,
            read_timeout: None,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject baud rates the firmware does not support.
    pub fn validate(&self) -> Result<()> {
        if ALLOWED_BAUD_RATES.contains(&self.baud_rate) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "unsupported baud rate {}, expected one of {ALLOWED_BAUD_RATES:?}",
                self.baud_rate
            )))
        }
    }
}

/// Strip exactly one trailing CR, LF or CRLF.
pub fn strip_line_ending(bytes: &[u8]) -> &[u8] {
    if let Some(rest) = bytes.strip_suffix(b"\r\n") {
        rest
    } else if let Some(rest) = bytes.strip_suffix(b"\n") {
        rest
    } else if let Some(rest) = bytes.strip_suffix(b"\r") {
        rest
    } else {
        bytes
    }
}

fn is_eol(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}

fn skip_leading_eol(buf: &[u8]) -> &[u8] {
    let start = buf.iter().position(|b| !is_eol(*b)).unwrap_or(buf.len());
    &buf[start..]
}

/// First complete line of `buf` including its terminator, ignoring
/// terminators left over from a previous line.
fn first_line(buf: &[u8]) -> Option<&[u8]> {
    let body = skip_leading_eol(buf);
    let end = body.iter().position(|b| is_eol(*b))?;
    let stop = if body[end] == b'\r' && body.get(end + 1) == Some(&b'\n') {
        end + 2
    } else {
        end + 1
    };
    Some(&body[..stop])
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Maps a port name that may have vanished to the name it has now.
pub type PortResolver = Box<dyn Fn(&str) -> Option<String> + Send>;

/// One open UART control channel.
pub struct UartSession<O: PortOpener> {
    opener: O,
    config: SerialConfig,
    settings: UartSettings,
    timing: Timing,
    port: Option<O::Port>,
    resolver: Option<PortResolver>,
    last_response: String,
}

fn open_with_retry<O: PortOpener>(opener: &O, config: &SerialConfig, timing: &Timing) -> Result<O::Port> {
    match opener.open(config) {
        Ok(port) => Ok(port),
        Err(e) if e.is_access_denied() => {
            warn!("{} is busy ({e}), retrying once", config.port_name);
            pause(timing.open_retry_delay);
            opener.open(config).map_err(|e| {
                Error::Transport(format!(
                    "cannot open {}: {e}. The port may be held by STM32CubeProgrammer, a serial monitor or another process",
                    config.port_name
                ))
            })
        },
        Err(e) => Err(e),
    }
}

impl<O: PortOpener> UartSession<O> {
    /// Open the port 8N1 with DTR/RTS deasserted, let it settle and clear
    /// both buffers.
    ///
    /// "Access denied"/"busy" gets one retry after a short pause.
    pub fn open(opener: O, port_name: &str, settings: UartSettings, timing: Timing) -> Result<Self> {
        settings.validate()?;
        let config = SerialConfig::new(port_name, settings.baud_rate);
        let port = open_with_retry(&opener, &config, &timing)?;
        let mut session = Self {
            opener,
            config,
            settings,
            timing,
            port: Some(port),
            resolver: None,
            last_response: String::new(),
        };
        session.prepare()?;
        info!(
            "Opened UART {} at {} baud ({})",
            session.config.port_name, session.settings.baud_rate, session.settings.line_ending
        );
        Ok(session)
    }

    /// Install a resolver consulted when reopening after the handle died.
    #[must_use]
    pub fn with_resolver(mut self, resolver: PortResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Current port name.
    pub fn port_name(&self) -> &str {
        &self.config.port_name
    }

    /// Settings in use.
    pub fn settings(&self) -> &UartSettings {
        &self.settings
    }

    /// Timing profile in use.
    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Whether the handle is usable.
    pub fn is_open(&self) -> bool {
        self.port.as_ref().is_some_and(Port::is_open)
    }

    /// Response captured by the last exchange, line ending stripped.
    pub fn last_response(&self) -> &str {
        &self.last_response
    }

    fn prepare(&mut self) -> Result<()> {
        pause(self.timing.open_settle);
        self.io(Port::clear_buffers)
    }

    fn discard_port(&mut self) {
        if let Some(mut port) = self.port.take() {
            let _ = port.close();
        }
    }

    fn io<T>(&mut self, op: impl FnOnce(&mut O::Port) -> Result<T>) -> Result<T> {
        let name = self.config.port_name.clone();
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| Error::PortClosed(format!("{name} is not open")))?;
        match op(port) {
            Ok(value) => Ok(value),
            Err(e) if e.is_port_closed() => {
                warn!("UART {name} closed unexpectedly: {e}");
                self.discard_port();
                Err(Error::PortClosed(format!("{name}: {e}")))
            },
            Err(e) if e.is_access_denied() => Err(Error::Transport(format!(
                "{name}: {e}. The port may be held by STM32CubeProgrammer or another process"
            ))),
            Err(e) => Err(e),
        }
    }

    fn frame(&self, command: &str) -> Vec<u8> {
        let mut frame = command.as_bytes().to_vec();
        frame.extend_from_slice(self.settings.line_ending.as_bytes());
        frame
    }

    fn write_command(&mut self, command: &str) -> Result<()> {
        let frame = self.frame(command);
        trace!("-> {command:?} ({frame:02X?})");
        self.io(|port| {
            port.clear_input()?;
            port.write_all_bytes(&frame)
        })
    }

    fn read_response(
        &mut self,
        expected: &[u8],
        window: Duration,
        poll: Duration,
        mut buffer: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + window;
        loop {
            let chunk = self.io(Port::read_available)?;
            if !chunk.is_empty() {
                trace!("<- {chunk:02X?}");
                buffer.extend_from_slice(&chunk);
            }
            if let Some(line) = first_line(&buffer) {
                return Ok(line.to_vec());
            }
            if contains(&buffer, expected) || Instant::now() >= deadline {
                return Ok(skip_leading_eol(&buffer).to_vec());
            }
            pause(poll);
        }
    }

    fn exchange(&mut self, command: &str, expected: &str, window: Option<Duration>) -> Result<bool> {
        let command = command.trim();
        let expected = expected.trim().as_bytes();
        let window = window
            .or(self.settings.read_timeout)
            .unwrap_or(self.timing.response_timeout);

        self.write_command(command)?;
        pause(self.timing.post_write_delay);

        let mut captured = self.read_response(expected, window, self.timing.poll_interval, Vec::new())?;
        let partial = strip_line_ending(&captured);
        if partial.is_empty() || (partial.len() < expected.len() && expected.starts_with(partial)) {
            debug!("No complete reply to '{command}' yet, waiting for a late one");
            pause(self.timing.late_arrival_delay);
            captured = self.read_response(
                expected,
                self.timing.late_arrival_window,
                self.timing.late_arrival_poll,
                captured,
            )?;
        }

        let response = strip_line_ending(&captured);
        self.last_response = String::from_utf8_lossy(response).into_owned();
        let matched = response == expected;
        if matched {
            debug!("'{command}' acknowledged with '{}'", self.last_response);
        } else {
            debug!(
                "'{command}': expected '{}', got '{}'",
                String::from_utf8_lossy(expected),
                self.last_response
            );
        }
        Ok(matched)
    }

    /// Send `command` and report whether the reply equals `expected`, using
    /// the session's response window.
    pub fn send_and_expect(&mut self, command: &str, expected: &str) -> Result<bool> {
        self.exchange(command, expected, None)
    }

    /// Like [`Self::send_and_expect`] with an explicit response window.
    pub fn send_and_expect_within(
        &mut self,
        command: &str,
        expected: &str,
        window: Duration,
    ) -> Result<bool> {
        self.exchange(command, expected, Some(window))
    }

    /// [`Self::send_and_expect`] with up to `max_reopen_attempts`
    /// close/reopen cycles when the handle dies.
    pub fn send_and_expect_recovering(
        &mut self,
        command: &str,
        expected: &str,
        window: Option<Duration>,
    ) -> Result<bool> {
        let max = self.timing.max_reopen_attempts;
        let mut cycles = 0;
        loop {
            match self.exchange(command, expected, window) {
                Err(e) if e.is_port_closed() && cycles < max => {
                    cycles += 1;
                    warn!("{e}; reopening (cycle {cycles}/{max})");
                    if let Err(reopen) = self.recover() {
                        warn!("Reopen failed: {reopen}");
                    }
                },
                other => return other,
            }
        }
    }

    /// Discard everything buffered in both directions.
    pub fn clear_buffers(&mut self) -> Result<()> {
        self.io(Port::clear_buffers)
    }

    /// Write `command` without waiting for any reply.
    pub fn send_raw(&mut self, command: &str) -> Result<()> {
        self.write_command(command.trim())
    }

    /// Send `command` and collect everything that arrives until the line
    /// has been idle for `idle` or `total` has elapsed.
    pub fn query(&mut self, command: &str, idle: Duration, total: Duration, poll: Duration) -> Result<String> {
        self.write_command(command.trim())?;
        let start = Instant::now();
        let mut last_data: Option<Instant> = None;
        let mut buffer = Vec::new();
        loop {
            let chunk = self.io(Port::read_available)?;
            let now = Instant::now();
            if !chunk.is_empty() {
                trace!("<- {chunk:02X?}");
                buffer.extend_from_slice(&chunk);
                last_data = Some(now);
            }
            if last_data.is_some_and(|t| now.duration_since(t) >= idle) {
                break;
            }
            if now.duration_since(start) >= total {
                break;
            }
            pause(poll);
        }
        let text = String::from_utf8_lossy(&buffer).into_owned();
        self.last_response = text.trim().to_string();
        Ok(text)
    }

    /// Close the current handle, wait, and open the port again, following
    /// the resolver if the name changed.
    pub fn recover(&mut self) -> Result<()> {
        let previous = self.config.port_name.clone();
        self.discard_port();
        pause(self.timing.reopen_delay);

        let name = self
            .resolver
            .as_ref()
            .and_then(|resolve| resolve(&previous))
            .unwrap_or_else(|| previous.clone());
        if name != previous {
            info!("UART {previous} re-enumerated as {name}");
        }
        self.config = self.config.clone().with_port_name(name);

        let port = open_with_retry(&self.opener, &self.config, &self.timing)?;
        self.port = Some(port);
        self.prepare()?;
        info!("Reopened UART {}", self.config.port_name);
        Ok(())
    }

    /// Drain and clear pending data, then close. Never fails and may be
    /// called on an already closed session.
    pub fn close(&mut self) {
        let Some(mut port) = self.port.take() else {
            return;
        };
        match port.read_available() {
            Ok(pending) if !pending.is_empty() => {
                trace!("Discarding {} unread bytes", pending.len());
            },
            Ok(_) => {},
            Err(e) => debug!("Drain before close failed: {e}"),
        }
        if let Err(e) = port.clear_buffers() {
            debug!("Clearing buffers before close failed: {e}");
        }
        if let Err(e) = port.close() {
            debug!("Close failed: {e}");
        }
        pause(self.timing.close_delay);
        debug!("Closed UART {}", self.config.port_name);
    }
}

impl<O: PortOpener> Drop for UartSession<O> {
    fn drop(&mut self) {
        self.discard_port();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockOpener, Reply, echo_board};

    fn session(opener: MockOpener) -> UartSession<MockOpener> {
        UartSession::open(opener, "/dev/ttyUSB0", UartSettings::default(), Timing::immediate()).unwrap()
    }

    fn session_with(opener: MockOpener, line_ending: LineEnding) -> UartSession<MockOpener> {
        let settings = UartSettings::new(115_200, line_ending).unwrap();
        UartSession::open(opener, "/dev/ttyUSB0", settings, Timing::immediate()).unwrap()
    }

    #[test]
    fn test_strip_line_ending_removes_exactly_one() {
        assert_eq!(strip_line_ending(b"OK\r\n"), b"OK");
        assert_eq!(strip_line_ending(b"OK\n"), b"OK");
        assert_eq!(strip_line_ending(b"OK\r"), b"OK");
        assert_eq!(strip_line_ending(b"OK\n\n"), b"OK\n");
        assert_eq!(strip_line_ending(b"OK"), b"OK");
    }

    #[test]
    fn test_first_line_skips_stale_terminators() {
        assert_eq!(first_line(b"\r\nA=1\r\nB=2"), Some(&b"A=1\r\n"[..]));
        assert_eq!(first_line(b"A=1\rrest"), Some(&b"A=1\r"[..]));
        assert_eq!(first_line(b"partial"), None);
        assert_eq!(first_line(b"\r\n"), None);
    }

    #[test]
    fn test_framing_independent_of_send_line_ending() {
        for send in [LineEnding::Lf, LineEnding::Cr, LineEnding::CrLf] {
            for reply in [&b"\r\n"[..], b"\n", b"\r"] {
                let reply = reply.to_vec();
                let opener = MockOpener::new(move |_| {
                    let mut bytes = b"EN_12V=ON".to_vec();
                    bytes.extend_from_slice(&reply);
                    Reply::Raw(bytes)
                });
                let mut s = session_with(opener, send);
                assert!(s.send_and_expect("SET EN_12V=ON", "EN_12V=ON").unwrap());
            }
        }
    }

    #[test]
    fn test_command_is_trimmed_and_terminated() {
        let opener = MockOpener::new(echo_board);
        let transcript = opener.transcript();
        let mut s = session(opener);
        assert!(s.send_and_expect("  SET EN_12V=ON \n", " EN_12V=ON ").unwrap());
        assert_eq!(transcript.lines(), vec!["SET EN_12V=ON".to_string()]);
    }

    #[test]
    fn test_mismatch_is_reported_not_raised() {
        let opener = MockOpener::new(|_| Reply::Line("ERR".into()));
        let mut s = session(opener);
        assert!(!s.send_and_expect("SET EN_12V=ON", "EN_12V=ON").unwrap());
        assert_eq!(s.last_response(), "ERR");
    }

    #[test]
    fn test_expected_text_without_terminator() {
        let opener = MockOpener::new(|_| Reply::Raw(b"SWICH_SWD1__2=HV".to_vec()));
        let mut s = session(opener);
        assert!(s.send_and_expect("SET SWICH_SWD1__2=HV", "SWICH_SWD1__2=HV").unwrap());
    }

    #[test]
    fn test_late_reply_is_accepted_once() {
        let opener = MockOpener::new(|_| Reply::Late("EN_12V=ON".into(), 1));
        let mut s = session(opener);
        assert!(s.send_and_expect("SET EN_12V=ON", "EN_12V=ON").unwrap());
    }

    #[test]
    fn test_reply_later_than_late_window_fails() {
        let opener = MockOpener::new(|_| Reply::Late("EN_12V=ON".into(), 5));
        let mut s = session(opener);
        assert!(!s.send_and_expect("SET EN_12V=ON", "EN_12V=ON").unwrap());
    }

    #[test]
    fn test_closed_handle_is_port_closed() {
        let opener = MockOpener::new(|_| Reply::Close);
        let mut s = session(opener);
        let err = s.send_and_expect("SET EN_12V=ON", "EN_12V=ON").unwrap_err();
        assert!(matches!(err, Error::PortClosed(_)));
        assert!(!s.is_open());
    }

    #[test]
    fn test_recovering_send_reopens_same_port() {
        let mut first = true;
        let opener = MockOpener::new(move |line| {
            if first {
                first = false;
                Reply::Close
            } else {
                echo_board(line)
            }
        });
        let mut s = session(opener.clone());
        assert!(s.send_and_expect_recovering("SET EN_12V=ON", "EN_12V=ON", None).unwrap());
        assert_eq!(opener.opens(), vec!["/dev/ttyUSB0".to_string(); 2]);
        assert_eq!(opener.transcript().count("SET EN_12V=ON"), 2);
    }

    #[test]
    fn test_recovery_follows_resolver() {
        let mut first = true;
        let opener = MockOpener::new(move |line| {
            if first {
                first = false;
                Reply::Close
            } else {
                echo_board(line)
            }
        });
        let mut s = session(opener.clone()).with_resolver(Box::new(|_| Some("/dev/ttyUSB3".into())));
        assert!(s.send_and_expect_recovering("SET EN_12V=ON", "EN_12V=ON", None).unwrap());
        assert_eq!(s.port_name(), "/dev/ttyUSB3");
        assert_eq!(opener.opens().last().map(String::as_str), Some("/dev/ttyUSB3"));
    }

    #[test]
    fn test_recovery_is_bounded() {
        let opener = MockOpener::new(|_| Reply::Close);
        let mut s = session(opener.clone());
        let err = s
            .send_and_expect_recovering("SET EN_12V=ON", "EN_12V=ON", None)
            .unwrap_err();
        assert!(err.is_port_closed());
        // initial open plus two reopen cycles
        assert_eq!(opener.opens().len(), 3);
    }

    #[test]
    fn test_busy_port_is_retried_once() {
        let opener = MockOpener::new(echo_board).deny_first(1);
        let s = UartSession::open(opener.clone(), "COM3", UartSettings::default(), Timing::immediate());
        assert!(s.is_ok());
        assert_eq!(opener.opens().len(), 2);

        let opener = MockOpener::new(echo_board).deny_first(2);
        let err = UartSession::open(opener, "COM3", UartSettings::default(), Timing::immediate())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Transport(ref m) if m.contains("another process")));
    }

    #[test]
    fn test_query_collects_multiline_reply() {
        let opener = MockOpener::new(|_| Reply::Raw(b"EN_12V: ON\r\nSWICH_SWD1__2: LV\r\n".to_vec()));
        let mut s = session(opener);
        let t = Timing::immediate();
        let text = s.query("GET STATUS", t.status_idle, t.status_total, t.status_poll).unwrap();
        assert!(text.contains("EN_12V: ON"));
        assert!(text.contains("SWICH_SWD1__2: LV"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let opener = MockOpener::new(echo_board);
        let mut s = session(opener);
        s.close();
        s.close();
        assert!(!s.is_open());
        assert!(matches!(s.send_and_expect("SET EN_12V=ON", "EN_12V=ON"), Err(Error::PortClosed(_))));
    }

    #[test]
    fn test_settings_validation() {
        assert!(UartSettings::new(115_200, LineEnding::Lf).is_ok());
        assert!(UartSettings::new(921_600, LineEnding::CrLf).is_ok());
        assert!(UartSettings::new(12_345, LineEnding::Lf).is_err());
        let opener = MockOpener::new(echo_board);
        let bad = UartSettings {
            baud_rate: 1,
            ..UartSettings::default()
        };
        assert!(UartSession::open(opener, "COM1", bad, Timing::immediate()).is_err());
    }

    #[test]
    fn test_line_ending_parse() {
        assert_eq!("lf".parse::<LineEnding>().unwrap(), LineEnding::Lf);
        assert_eq!("CRLF".parse::<LineEnding>().unwrap(), LineEnding::CrLf);
        assert_eq!(" cr ".parse::<LineEnding>().unwrap(), LineEnding::Cr);
        assert!("tab".parse::<LineEnding>().is_err());
        assert_eq!(LineEnding::CrLf.as_bytes(), b"\r\n");
    }
}
