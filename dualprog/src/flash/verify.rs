//! Write-then-read-back verification over the backend chain.

use {
    super::{BackendChain, FlashBackend},
    crate::{
        device::ProbeDevice,
        error::{Error, Result},
        image::{ERASED, FirmwareImage},
        timing::{Timing, pause},
    },
    log::{debug, info, warn},
    serde::Serialize,
};

/// Extra bytes read back past the image end.
pub const READBACK_SLACK: usize = 1024;

/// Result of one verified write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    /// Written and verified.
    pub success: bool,
    /// Why it failed: backends tried, mismatch offset and values.
    pub error_detail: Option<String>,
    /// Backend that performed the write, if any did.
    pub backend: Option<String>,
}

impl WriteOutcome {
    /// Verified write via `backend`.
    pub fn ok(backend: &str) -> Self {
        Self {
            success: true,
            error_detail: None,
            backend: Some(backend.to_string()),
        }
    }

    /// Failed write or verification.
    pub fn failed(detail: impl Into<String>, backend: Option<&str>) -> Self {
        Self {
            success: false,
            error_detail: Some(detail.into()),
            backend: backend.map(str::to_string),
        }
    }
}

fn trim_erased(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|b| *b != ERASED).map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Compare written bytes with a read-back of the same range.
///
/// The read-back is cut to the written length and a short read-back is
/// padded with erased bytes. Every written byte is checked, including
/// trailing 0xFF. Returns `None` when they agree, otherwise a description
/// naming the first differing offset and, for a read-back that stops
/// before the last programmed byte, the length difference.
pub fn compare_readback(written: &[u8], readback: &[u8]) -> Option<String> {
    let window = &readback[..readback.len().min(written.len())];
    let actual = |i: usize| window.get(i).copied().unwrap_or(ERASED);

    let mut problems = Vec::new();
    if let Some(offset) = (0..written.len()).find(|&i| written[i] != actual(i)) {
        problems.push(format!(
            "first mismatch at offset {offset}: expected 0x{:02X}, got 0x{:02X}",
            written[offset],
            actual(offset)
        ));
    }
    let programmed = trim_erased(written).len();
    if window.len() < programmed {
        problems.push(format!(
            "length mismatch: expected {programmed} bytes, got {} bytes",
            window.len()
        ));
    }
    if problems.is_empty() {
        None
    } else {
        Some(problems.join(" | "))
    }
}

fn describe_failures(action: &str, failures: &[(&'static str, String)]) -> String {
    if failures.is_empty() {
        return format!("no flash backend configured to {action}");
    }
    let tried = failures
        .iter()
        .map(|(name, error)| format!("{name}: {error}"))
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "no backend could {action} ({tried}). Make sure STM32CubeProgrammer or another debugger is not holding the ST-Link"
    )
}

/// Flash writer that only reports success after a read-back matched.
pub struct VerifiedWriter {
    chain: BackendChain,
    timing: Timing,
}

impl VerifiedWriter {
    /// Writer over `chain`, highest priority first.
    pub fn new(chain: BackendChain, timing: Timing) -> Self {
        Self { chain, timing }
    }

    /// Backend names in priority order.
    pub fn backend_names(&self) -> Vec<&'static str> {
        self.chain.iter().map(|p| p.name()).collect()
    }

    /// Run `op` on each backend in turn until one succeeds. Every session
    /// is closed before the next provider is probed.
    fn first_success<T>(
        &self,
        probe: &ProbeDevice,
        action: &str,
        mut op: impl FnMut(&mut dyn FlashBackend) -> Result<T>,
    ) -> std::result::Result<(T, &'static str), Vec<(&'static str, String)>> {
        let mut failures = Vec::new();
        for provider in &self.chain {
            let name = provider.name();
            let mut backend = match provider.probe(probe) {
                Ok(backend) => backend,
                Err(e) => {
                    debug!("{name} unavailable: {e}");
                    failures.push((name, e.to_string()));
                    continue;
                },
            };
            let result = op(backend.as_mut());
            backend.close();
            match result {
                Ok(value) => return Ok((value, name)),
                Err(e) => {
                    warn!("{action} via {name} failed: {e}");
                    failures.push((name, e.to_string()));
                },
            }
        }
        Err(failures)
    }

    /// Read `size` bytes at `address` through the first backend that
    /// returns data.
    pub fn read_memory(&self, probe: &ProbeDevice, size: usize, address: u32) -> Result<Vec<u8>> {
        self.first_success(probe, "read", |backend| {
            let data = backend.read(size, address)?;
            if data.is_empty() {
                Err(Error::Transport("read returned no data".into()))
            } else {
                Ok(data)
            }
        })
        .map(|(data, name)| {
            debug!("Read {} bytes via {name}", data.len());
            data
        })
        .map_err(|failures| Error::Transport(describe_failures("read memory", &failures)))
    }

    /// Mass erase through the first backend that supports it.
    pub fn mass_erase(&self, probe: &ProbeDevice) -> Result<&'static str> {
        self.first_success(probe, "erase", |backend| backend.mass_erase())
            .map(|((), name)| name)
            .map_err(|failures| Error::Transport(describe_failures("erase flash", &failures)))
    }

    /// Write and verify `image`.
    pub fn write_verified(&self, probe: &ProbeDevice, image: &FirmwareImage) -> WriteOutcome {
        self.write_verified_reporting(probe, image, &mut |_| {})
    }

    /// [`Self::write_verified`] reporting 0..=100 as it goes.
    pub fn write_verified_reporting(
        &self,
        probe: &ProbeDevice,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(u8),
    ) -> WriteOutcome {
        progress(0);
        let written = self.first_success(probe, "write", |backend| {
            backend.write(&image.data, image.start_address)
        });
        let backend = match written {
            Ok(((), name)) => name,
            Err(failures) => return WriteOutcome::failed(describe_failures("write the image", &failures), None),
        };
        info!(
            "Wrote {} bytes at 0x{:08X} via {backend}",
            image.len(),
            image.start_address
        );
        progress(60);

        pause(self.timing.verify_settle);
        let readback = match self.read_memory(probe, image.len() + READBACK_SLACK, image.start_address) {
            Ok(data) => data,
            Err(e) => {
                return WriteOutcome::failed(
                    format!("wrote via {backend} but verification failed: {e}"),
                    Some(backend),
                );
            },
        };
        progress(90);

        let outcome = match compare_readback(&image.data, &readback) {
            None => {
                info!("Verification passed");
                WriteOutcome::ok(backend)
            },
            Some(detail) => {
                warn!("Verification failed: {detail}");
                WriteOutcome::failed(
                    format!("wrote via {backend} but verification failed: {detail}"),
                    Some(backend),
                )
            },
        };
        progress(100);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::testing::probe,
        flash::mock::{Behavior, CallLog, MockProvider, SimFlash},
        image::DEFAULT_FLASH_ADDRESS,
    };

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::new(DEFAULT_FLASH_ADDRESS, (0..len).map(|i| (i % 200) as u8).collect())
    }

    fn writer(providers: Vec<MockProvider>) -> VerifiedWriter {
        let chain: BackendChain = providers
            .into_iter()
            .map(|p| Box::new(p) as Box<dyn crate::flash::BackendProvider>)
            .collect();
        VerifiedWriter::new(chain, Timing::immediate())
    }

    #[test]
    fn test_compare_identical() {
        assert_eq!(compare_readback(&[1, 2, 3], &[1, 2, 3, 0xFF, 0xFF]), None);
    }

    #[test]
    fn test_compare_ignores_erased_tail() {
        assert_eq!(compare_readback(&[1, 2, 0xFF, 0xFF], &[1, 2, 0xFF, 0xFF, 0xFF]), None);
    }

    #[test]
    fn test_compare_reports_first_mismatch() {
        let detail = compare_readback(&[1, 2, 3, 4], &[1, 9, 3, 8]).unwrap();
        assert_eq!(detail, "first mismatch at offset 1: expected 0x02, got 0x09");
    }

    #[test]
    fn test_compare_reports_short_readback() {
        let detail = compare_readback(&[1, 2, 3, 4], &[1, 2]).unwrap();
        assert_eq!(
            detail,
            "first mismatch at offset 2: expected 0x03, got 0xFF | length mismatch: expected 4 bytes, got 2 bytes"
        );
        // a read-back missing only erased bytes is complete
        assert_eq!(compare_readback(&[1, 2, 0xFF], &[1, 2]), None);
    }

    #[test]
    fn test_compare_catches_last_byte_left_erased() {
        let detail = compare_readback(&[1, 2, 3, 0x42], &[1, 2, 3, 0xFF, 0xFF]).unwrap();
        assert_eq!(detail, "first mismatch at offset 3: expected 0x42, got 0xFF");
    }

    #[test]
    fn test_compare_catches_written_ff_read_as_data() {
        let detail = compare_readback(&[1, 2, 3, 0xFF], &[1, 2, 3, 0x00]).unwrap();
        assert_eq!(detail, "first mismatch at offset 3: expected 0xFF, got 0x00");
    }

    #[test]
    fn test_compare_reports_both() {
        let detail = compare_readback(&[1, 2, 3, 4], &[7, 2]).unwrap();
        assert!(detail.contains("offset 0"));
        assert!(detail.contains(" | length mismatch"));
    }

    #[test]
    fn test_fallback_stops_at_first_working_backend() {
        let flash = SimFlash::default();
        let log = CallLog::default();
        let w = writer(vec![
            MockProvider::new("a", Behavior::Unavailable("not installed".into()), &flash, &log),
            MockProvider::new("b", Behavior::WriteFails("target not found".into()), &flash, &log),
            MockProvider::new("c", Behavior::Works, &flash, &log),
            MockProvider::new("d", Behavior::Works, &flash, &log),
        ]);
        let outcome = w.write_verified(&probe(Some("X1"), 1, 2), &image(64));
        assert_eq!(outcome, WriteOutcome::ok("c"));

        let calls = log.calls();
        let write_calls: Vec<_> = calls.iter().filter(|c| c.ends_with(":write")).collect();
        assert_eq!(write_calls, vec!["b:write", "c:write"]);
        assert!(!calls.iter().any(|c| c.starts_with("d:")));
        let closed_b = calls.iter().position(|c| c == "b:close").unwrap();
        let probed_c = calls.iter().position(|c| c == "c:probe").unwrap();
        assert!(closed_b < probed_c);
    }

    #[test]
    fn test_mismatch_at_offset_37() {
        let flash = SimFlash::default();
        let log = CallLog::default();
        flash.flip_at(DEFAULT_FLASH_ADDRESS + 37);
        let w = writer(vec![MockProvider::new("cube", Behavior::Works, &flash, &log)]);
        let img = image(128);
        let outcome = w.write_verified(&probe(None, 1, 2), &img);

        assert!(!outcome.success);
        let detail = outcome.error_detail.unwrap();
        assert!(detail.starts_with("wrote via cube but verification failed: "));
        assert!(detail.contains("offset 37"));
        assert!(detail.contains(&format!("0x{:02X}", img.data[37])));
        assert!(detail.contains(&format!("0x{:02X}", !img.data[37])));
        assert_eq!(outcome.backend.as_deref(), Some("cube"));
    }

    #[test]
    fn test_all_backends_failing_lists_each() {
        let flash = SimFlash::default();
        let log = CallLog::default();
        let w = writer(vec![
            MockProvider::new("a", Behavior::Unavailable("not installed".into()), &flash, &log),
            MockProvider::new("b", Behavior::WriteFails("held by another process".into()), &flash, &log),
        ]);
        let outcome = w.write_verified(&probe(None, 1, 2), &image(16));
        assert!(!outcome.success);
        assert_eq!(outcome.backend, None);
        let detail = outcome.error_detail.unwrap();
        assert!(detail.contains("a: Backend unavailable: not installed"));
        assert!(detail.contains("b: Transport error: held by another process"));
        assert!(detail.contains("STM32CubeProgrammer"));
    }

    #[test]
    fn test_empty_read_falls_through_to_next_backend() {
        let flash = SimFlash::default();
        let log = CallLog::default();
        let w = writer(vec![
            MockProvider::new("a", Behavior::ReadsEmpty, &flash, &log),
            MockProvider::new("b", Behavior::Works, &flash, &log),
        ]);
        let outcome = w.write_verified(&probe(None, 1, 2), &image(32));
        assert_eq!(outcome, WriteOutcome::ok("a"));
        assert!(log.calls().contains(&"b:read".to_string()));
    }

    #[test]
    fn test_unreadable_after_write_is_failure() {
        let flash = SimFlash::default();
        let log = CallLog::default();
        let w = writer(vec![MockProvider::new("a", Behavior::ReadsEmpty, &flash, &log)]);
        let outcome = w.write_verified(&probe(None, 1, 2), &image(32));
        assert!(!outcome.success);
        assert!(outcome.error_detail.unwrap().starts_with("wrote via a but verification failed"));
    }

    #[test]
    fn test_image_ending_in_erased_bytes_verifies() {
        let flash = SimFlash::default();
        let log = CallLog::default();
        let w = writer(vec![MockProvider::new("a", Behavior::Works, &flash, &log)]);
        let img = FirmwareImage::new(DEFAULT_FLASH_ADDRESS, vec![1, 2, 3, 0xFF, 0xFF]);
        assert!(w.write_verified(&probe(None, 1, 2), &img).success);
    }

    #[test]
    fn test_progress_reaches_100() {
        let flash = SimFlash::default();
        let log = CallLog::default();
        let w = writer(vec![MockProvider::new("a", Behavior::Works, &flash, &log)]);
        let mut seen = Vec::new();
        w.write_verified_reporting(&probe(None, 1, 2), &image(8), &mut |p| seen.push(p));
        assert_eq!(seen, vec![0, 60, 90, 100]);
    }

    #[test]
    fn test_read_memory_and_erase() {
        let flash = SimFlash::default();
        let log = CallLog::default();
        let w = writer(vec![MockProvider::new("a", Behavior::Works, &flash, &log)]);
        let p = probe(None, 1, 2);
        assert!(w.write_verified(&p, &image(4)).success);
        assert_eq!(w.read_memory(&p, 4, DEFAULT_FLASH_ADDRESS).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(w.mass_erase(&p).unwrap(), "a");
        assert_eq!(flash.contents(DEFAULT_FLASH_ADDRESS, 2), vec![0xFF, 0xFF]);
    }
}
