//! Simulated flash and scripted backends for unit tests.

use {
    super::{BackendProvider, FlashBackend},
    crate::{
        device::ProbeDevice,
        error::{Error, Result},
    },
    std::{
        collections::BTreeMap,
        sync::{Arc, Mutex, MutexGuard},
    },
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Byte-addressed flash; unwritten bytes read as 0xFF.
#[derive(Clone, Default)]
pub(crate) struct SimFlash {
    mem: Arc<Mutex<BTreeMap<u32, u8>>>,
    flipped: Arc<Mutex<Option<u32>>>,
}

impl SimFlash {
    /// Reads of `address` return the inverted stored byte.
    pub(crate) fn flip_at(&self, address: u32) {
        *lock(&self.flipped) = Some(address);
    }

    pub(crate) fn contents(&self, address: u32, len: usize) -> Vec<u8> {
        let mem = lock(&self.mem);
        (0..len)
            .map(|i| *mem.get(&(address + i as u32)).unwrap_or(&0xFF))
            .collect()
    }

    fn store(&self, address: u32, data: &[u8]) {
        let mut mem = lock(&self.mem);
        for (i, byte) in data.iter().enumerate() {
            mem.insert(address + i as u32, *byte);
        }
    }

    fn load(&self, address: u32, len: usize) -> Vec<u8> {
        let mut data = self.contents(address, len);
        if let Some(flip) = *lock(&self.flipped) {
            if let Some(offset) = flip.checked_sub(address).map(|o| o as usize) {
                if let Some(byte) = data.get_mut(offset) {
                    *byte = !*byte;
                }
            }
        }
        data
    }
}

/// How a scripted backend behaves.
#[derive(Clone)]
pub(crate) enum Behavior {
    /// Writes and reads go to the simulated flash.
    Works,
    /// The provider cannot open a session.
    Unavailable(String),
    /// Sessions open but every write fails.
    WriteFails(String),
    /// Writes work, reads come back empty.
    ReadsEmpty,
}

/// Shared record of backend calls such as `"cube:write"`.
#[derive(Clone, Default)]
pub(crate) struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub(crate) fn calls(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    fn push(&self, name: &str, what: &str) {
        lock(&self.0).push(format!("{name}:{what}"));
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct MockProvider {
    name: &'static str,
    behavior: Behavior,
    flash: SimFlash,
    log: CallLog,
    on_write: Option<Hook>,
}

impl MockProvider {
    pub(crate) fn new(name: &'static str, behavior: Behavior, flash: &SimFlash, log: &CallLog) -> Self {
        Self {
            name,
            behavior,
            flash: flash.clone(),
            log: log.clone(),
            on_write: None,
        }
    }

    /// Run `hook` while a write is in progress.
    pub(crate) fn on_write(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_write = Some(Arc::new(hook));
        self
    }
}

impl BackendProvider for MockProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn probe(&self, _probe: &ProbeDevice) -> Result<Box<dyn FlashBackend>> {
        self.log.push(self.name, "probe");
        if let Behavior::Unavailable(reason) = &self.behavior {
            return Err(Error::BackendUnavailable(reason.clone()));
        }
        Ok(Box::new(MockBackend {
            name: self.name,
            behavior: self.behavior.clone(),
            flash: self.flash.clone(),
            log: self.log.clone(),
            on_write: self.on_write.clone(),
        }))
    }
}

struct MockBackend {
    name: &'static str,
    behavior: Behavior,
    flash: SimFlash,
    log: CallLog,
    on_write: Option<Hook>,
}

impl FlashBackend for MockBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn write(&mut self, data: &[u8], address: u32) -> Result<()> {
        self.log.push(self.name, "write");
        if let Some(hook) = &self.on_write {
            hook();
        }
        match &self.behavior {
            Behavior::WriteFails(reason) => Err(Error::Transport(reason.clone())),
            _ => {
                self.flash.store(address, data);
                Ok(())
            },
        }
    }

    fn read(&mut self, size: usize, address: u32) -> Result<Vec<u8>> {
        self.log.push(self.name, "read");
        match &self.behavior {
            Behavior::ReadsEmpty => Ok(Vec::new()),
            Behavior::WriteFails(reason) => Err(Error::Transport(reason.clone())),
            _ => Ok(self.flash.load(address, size)),
        }
    }

    fn mass_erase(&mut self) -> Result<()> {
        self.log.push(self.name, "erase");
        lock(&self.flash.mem).clear();
        Ok(())
    }

    fn close(&mut self) {
        self.log.push(self.name, "close");
    }
}
