//! Scripted in-memory port for unit tests.
//!
//! Every line written to a [`MockPort`] is recorded in a shared
//! [`Transcript`] and handed to a responder closure whose [`Reply`] is
//! queued on the input side. A [`MockOpener`] hands out ports sharing one
//! responder and one transcript, so reopen cycles keep their script.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortOpener, SerialConfig},
    },
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        sync::{Arc, Mutex, MutexGuard},
        time::Duration,
    },
};

/// What the simulated board does with one received line.
pub(crate) enum Reply {
    /// Answer with the text followed by CRLF.
    Line(String),
    /// Answer with exactly these bytes.
    Raw(Vec<u8>),
    /// Answer only after this many further input polls.
    Late(String, usize),
    /// Stay quiet.
    Silent,
    /// The handle dies after this line.
    Close,
}

pub(crate) type Responder = Box<dyn FnMut(&str) -> Reply + Send>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Shared record of every line written, in order.
#[derive(Clone, Default)]
pub(crate) struct Transcript(Arc<Mutex<Vec<String>>>);

impl Transcript {
    pub(crate) fn lines(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    pub(crate) fn count(&self, line: &str) -> usize {
        lock(&self.0).iter().filter(|l| l.as_str() == line).count()
    }

    fn push(&self, line: String) {
        lock(&self.0).push(line);
    }
}

pub(crate) struct MockPort {
    name: String,
    rx: VecDeque<u8>,
    late: Option<(Vec<u8>, usize)>,
    partial: Vec<u8>,
    responder: Arc<Mutex<Responder>>,
    transcript: Transcript,
    open: bool,
    timeout: Duration,
}

impl MockPort {
    pub(crate) fn new(name: &str, responder: impl FnMut(&str) -> Reply + Send + 'static) -> Self {
        Self::with_shared(
            name,
            Arc::new(Mutex::new(Box::new(responder))),
            Transcript::default(),
        )
    }

    fn with_shared(name: &str, responder: Arc<Mutex<Responder>>, transcript: Transcript) -> Self {
        Self {
            name: name.to_string(),
            rx: VecDeque::new(),
            late: None,
            partial: Vec::new(),
            responder,
            transcript,
            open: true,
            timeout: Duration::ZERO,
        }
    }

    pub(crate) fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }

    fn dispatch(&mut self, line: String) {
        self.transcript.push(line.clone());
        let reply = (lock(&self.responder))(&line);
        match reply {
            Reply::Line(text) => {
                self.rx.extend(text.bytes());
                self.rx.extend(b"\r\n");
            },
            Reply::Raw(bytes) => self.rx.extend(bytes),
            Reply::Late(text, polls) => {
                let mut bytes = text.into_bytes();
                bytes.extend_from_slice(b"\r\n");
                self.late = Some((bytes, polls));
            },
            Reply::Silent => {},
            Reply::Close => self.open = false,
        }
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"))
        }
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        for &byte in buf {
            if byte == b'\r' || byte == b'\n' {
                if !self.partial.is_empty() {
                    let line = String::from_utf8_lossy(&self.partial).into_owned();
                    self.partial.clear();
                    self.dispatch(line);
                }
            } else {
                self.partial.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ensure_open()
    }
}

impl Port for MockPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        115_200
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        self.ensure_open()?;
        if let Some((bytes, polls)) = self.late.take() {
            if polls == 0 {
                self.rx.extend(bytes);
            } else {
                self.late = Some((bytes, polls - 1));
            }
        }
        Ok(self.rx.len())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.rx.clear();
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.clear_input()
    }

    fn set_dtr(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

/// Opens [`MockPort`]s that share one script.
#[derive(Clone)]
pub(crate) struct MockOpener {
    responder: Arc<Mutex<Responder>>,
    transcript: Transcript,
    opens: Arc<Mutex<Vec<String>>>,
    deny_first: Arc<Mutex<usize>>,
}

impl MockOpener {
    pub(crate) fn new(responder: impl FnMut(&str) -> Reply + Send + 'static) -> Self {
        Self {
            responder: Arc::new(Mutex::new(Box::new(responder))),
            transcript: Transcript::default(),
            opens: Arc::new(Mutex::new(Vec::new())),
            deny_first: Arc::new(Mutex::new(0)),
        }
    }

    /// Fail the next `count` opens with "Access denied".
    pub(crate) fn deny_first(self, count: usize) -> Self {
        *lock(&self.deny_first) = count;
        self
    }

    pub(crate) fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }

    /// Port names passed to successful and failed opens, in order.
    pub(crate) fn opens(&self) -> Vec<String> {
        lock(&self.opens).clone()
    }
}

impl PortOpener for MockOpener {
    type Port = MockPort;

    fn open(&self, config: &SerialConfig) -> Result<MockPort> {
        lock(&self.opens).push(config.port_name.clone());
        let mut deny = lock(&self.deny_first);
        if *deny > 0 {
            *deny -= 1;
            return Err(Error::Transport(format!(
                "could not open {}: Access denied",
                config.port_name
            )));
        }
        Ok(MockPort::with_shared(
            &config.port_name,
            Arc::clone(&self.responder),
            self.transcript.clone(),
        ))
    }
}

/// A board that acknowledges every `SET K=V` with `K=V`.
pub(crate) fn echo_board(line: &str) -> Reply {
    match line.strip_prefix("SET ") {
        Some(rest) => Reply::Line(rest.to_string()),
        None => Reply::Silent,
    }
}
