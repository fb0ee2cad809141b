//! Flash backends and the verified writer.
//!
//! Every way of getting bytes into target flash sits behind
//! [`FlashBackend`]. A [`BackendProvider`] checks whether its tool or
//! library is usable for a probe and opens a backend session; the
//! [`VerifiedWriter`] walks providers in priority order and stops at the
//! first one that succeeds.
//!
//! ```text
//! VerifiedWriter
//!   |-- ProbeRsProvider        (native library, `probe-rs` feature)
//!   |-- CubeProgrammerProvider (STM32_Programmer_CLI)
//!   |-- OpenOcdProvider        (openocd)
//!   `-- StLinkUsbProvider      (raw ST-Link bulk protocol)
//! ```

pub mod cube;
pub mod openocd;
pub(crate) mod process;
pub mod probe_rs;
#[cfg(feature = "native")]
pub mod stlink_usb;
pub mod verify;

#[cfg(test)]
pub(crate) mod mock;

use {
    crate::{
        device::ProbeDevice,
        error::{Error, Result},
        timing::Timing,
    },
    std::path::{Path, PathBuf},
};

pub use verify::{VerifiedWriter, WriteOutcome, compare_readback};

/// An open session with one flashing tool or library.
///
/// Sessions are short-lived: the writer opens one per attempt and closes it
/// before moving on, so a failed backend never keeps the probe locked.
pub trait FlashBackend: Send {
    /// Backend name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Program `data` at `address`.
    fn write(&mut self, data: &[u8], address: u32) -> Result<()>;

    /// Read `size` bytes starting at `address`.
    ///
    /// An empty result counts as a failed read.
    fn read(&mut self, size: usize, address: u32) -> Result<Vec<u8>>;

    /// Erase the whole flash.
    fn mass_erase(&mut self) -> Result<()> {
        Err(Error::BackendUnavailable(format!(
            "{} cannot mass erase",
            self.name()
        )))
    }

    /// Release the probe. Must tolerate repeated calls.
    fn close(&mut self) {}
}

/// Factory for one backend kind.
pub trait BackendProvider: Send + Sync {
    /// Backend name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Open a backend session for `probe`, or explain why this backend is
    /// not usable.
    fn probe(&self, probe: &ProbeDevice) -> Result<Box<dyn FlashBackend>>;
}

/// Ordered list of providers, highest priority first.
pub type BackendChain = Vec<Box<dyn BackendProvider>>;

/// The shipped providers in priority order: native library, vendor CLI,
/// OpenOCD, raw USB.
pub fn default_backends(timing: &Timing) -> BackendChain {
    let mut chain: BackendChain = vec![
        Box::new(probe_rs::ProbeRsProvider::new()),
        Box::new(cube::CubeProgrammerProvider::new(timing)),
        Box::new(openocd::OpenOcdProvider::new(timing)),
    ];
    #[cfg(feature = "native")]
    chain.push(Box::new(stlink_usb::StLinkUsbProvider::new()));
    chain
}

/// Find an executable on `PATH`, then in `fallbacks`.
pub(crate) fn locate_tool(names: &[&str], fallbacks: &[PathBuf]) -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path) {
            for name in names {
                let candidate = dir.join(name);
                if is_executable(&candidate) {
                    return Some(candidate);
                }
            }
        }
    }
    fallbacks.iter().find(|p| is_executable(p)).cloned()
}

fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Format an address the way the tools expect it.
pub(crate) fn hex_address(address: u32) -> String {
    format!("0x{address:08X}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_chain_order() {
        let names: Vec<_> = default_backends(&Timing::immediate())
            .iter()
            .map(|p| p.name())
            .collect();
        assert_eq!(&names[..3], &["probe-rs", "STM32CubeProgrammer", "OpenOCD"]);
        #[cfg(feature = "native")]
        assert_eq!(names[3], "ST-Link USB");
    }

    #[test]
    fn test_locate_tool_uses_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("definitely-not-on-path-tool");
        std::fs::write(&tool, b"").unwrap();
        let found = locate_tool(&["definitely-not-on-path-tool"], &[tool.clone()]);
        assert_eq!(found, Some(tool));
        assert_eq!(locate_tool(&["definitely-not-on-path-tool"], &[]), None);
    }

    #[test]
    fn test_hex_address() {
        assert_eq!(hex_address(0x0800_0000), "0x08000000");
        assert_eq!(hex_address(0x1F), "0x0000001F");
    }
}
