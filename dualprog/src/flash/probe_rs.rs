//! Native debug-probe library backend.
//!
//! Only functional with the `probe-rs` cargo feature; without it the
//! provider reports itself unavailable and the chain moves on.

#[cfg(not(feature = "probe-rs"))]
use {
    super::{BackendProvider, FlashBackend},
    crate::{
        device::ProbeDevice,
        error::{Error, Result},
    },
};

/// Target name of the board's MCU in the probe-rs target database.
pub const TARGET_CHIP: &str = "STM32G474RETx";

/// Opens probe-rs sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeRsProvider;

impl ProbeRsProvider {
    /// New provider.
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(feature = "probe-rs"))]
impl BackendProvider for ProbeRsProvider {
    fn name(&self) -> &'static str {
        "probe-rs"
    }

    fn probe(&self, _probe: &ProbeDevice) -> Result<Box<dyn FlashBackend>> {
        Err(Error::BackendUnavailable(
            "built without the probe-rs feature".into(),
        ))
    }
}

#[cfg(feature = "probe-rs")]
pub use native::ProbeRsBackend;

#[cfg(feature = "probe-rs")]
mod native {
    use {
        super::{ProbeRsProvider, TARGET_CHIP},
        crate::{
            device::ProbeDevice,
            error::{Error, Result},
            flash::{BackendProvider, FlashBackend, hex_address},
        },
        log::{debug, info},
        probe_rs::{
            MemoryInterface, Permissions, Session,
            flashing::DownloadOptions,
            probe::{DebugProbeInfo, list::Lister},
        },
    };

    fn transport(e: impl std::fmt::Display) -> Error {
        Error::Transport(format!("probe-rs: {e}"))
    }

    fn matching_probe(probe: &ProbeDevice) -> Result<DebugProbeInfo> {
        let probes = Lister::new().list_all();
        let same_ids = |info: &&DebugProbeInfo| info.vendor_id == probe.vid && info.product_id == probe.pid;
        let found = match &probe.serial {
            Some(serial) => probes
                .iter()
                .filter(same_ids)
                .find(|info| info.serial_number.as_deref() == Some(serial.as_str())),
            None => probes.iter().find(same_ids),
        };
        found
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(format!("probe-rs does not see {}", probe.name())))
    }

    impl BackendProvider for ProbeRsProvider {
        fn name(&self) -> &'static str {
            "probe-rs"
        }

        fn probe(&self, probe: &ProbeDevice) -> Result<Box<dyn FlashBackend>> {
            let info = matching_probe(probe)?;
            let backend = ProbeRsBackend { info };
            // fail here rather than at write time if the target is unreachable
            drop(backend.attach()?);
            debug!("probe-rs attached to {TARGET_CHIP}");
            Ok(Box::new(backend))
        }
    }

    /// Flash access through the probe-rs library.
    ///
    /// Each operation attaches anew so no session outlives a call.
    pub struct ProbeRsBackend {
        info: DebugProbeInfo,
    }

    impl ProbeRsBackend {
        fn attach(&self) -> Result<Session> {
            let probe = self.info.open().map_err(transport)?;
            probe.attach(TARGET_CHIP, Permissions::default()).map_err(transport)
        }
    }

    impl FlashBackend for ProbeRsBackend {
        fn name(&self) -> &'static str {
            "probe-rs"
        }

        fn write(&mut self, data: &[u8], address: u32) -> Result<()> {
            let mut session = self.attach()?;
            info!("probe-rs: writing {} bytes at {}", data.len(), hex_address(address));
            let mut loader = session.target().flash_loader();
            loader.add_data(u64::from(address), data).map_err(transport)?;
            loader
                .commit(&mut session, DownloadOptions::default())
                .map_err(transport)
        }

        fn read(&mut self, size: usize, address: u32) -> Result<Vec<u8>> {
            let mut session = self.attach()?;
            let mut core = session.core(0).map_err(transport)?;
            let mut data = vec![0u8; size];
            core.read_8(u64::from(address), &mut data).map_err(transport)?;
            Ok(data)
        }
    }
}
