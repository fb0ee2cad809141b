//! Firmware image loading.
//!
//! Intel HEX files are decoded with the `ihex` crate into one contiguous
//! image starting at the lowest address seen; gaps between records read as
//! erased flash (`0xFF`). Raw `.bin` files are loaded at an explicit
//! address. Every failure is [`Error::Format`] so callers can reject a bad
//! file before touching any hardware.

use {
    crate::error::{Error, Result},
    ihex::{Reader, Record},
    log::{debug, warn},
    std::{fs, path::Path},
};

/// Base of STM32 main flash.
pub const DEFAULT_FLASH_ADDRESS: u32 = 0x0800_0000;

/// Largest address span a single image may cover.
const MAX_IMAGE_SPAN: u64 = 16 * 1024 * 1024;

/// Erased flash byte value.
pub const ERASED: u8 = 0xFF;

/// A contiguous firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Address of the first byte.
    pub start_address: u32,
    /// Image content.
    pub data: Vec<u8>,
}

impl FirmwareImage {
    /// Image from raw bytes.
    pub fn new(start_address: u32, data: Vec<u8>) -> Self {
        Self { start_address, data }
    }

    /// Number of bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image has no content.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Load a firmware file, picking the decoder from the extension:
    /// `.bin` loads raw at [`DEFAULT_FLASH_ADDRESS`], everything else is
    /// treated as Intel HEX.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let is_bin = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("bin"));
        if is_bin {
            Self::from_bin(path, DEFAULT_FLASH_ADDRESS)
        } else {
            Self::from_hex_file(path)
        }
    }

    /// Load an Intel HEX file.
    pub fn from_hex_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Format(format!("cannot read {}: {e}", path.display())))?;
        let image = Self::parse_hex(&text)
            .map_err(|e| Error::Format(format!("{}: {}", path.display(), format_reason(&e))))?;
        debug!(
            "Loaded {} ({} bytes at 0x{:08X})",
            path.display(),
            image.data.len(),
            image.start_address
        );
        Ok(image)
    }

    /// Load a raw binary at `address`.
    pub fn from_bin(path: impl AsRef<Path>, address: u32) -> Result<Self> {
        let path = path.as_ref();
        let data =
            fs::read(path).map_err(|e| Error::Format(format!("cannot read {}: {e}", path.display())))?;
        if data.is_empty() {
            return Err(Error::Format(format!("{} is empty", path.display())));
        }
        Ok(Self::new(address, data))
    }

    /// Decode Intel HEX text.
    pub fn parse_hex(text: &str) -> Result<Self> {
        let mut base: u32 = 0;
        let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();
        let mut saw_eof = false;

        for record in Reader::new(text) {
            let record = record.map_err(|e| Error::Format(e.to_string()))?;
            match record {
                Record::Data { offset, value } => {
                    let address = base
                        .checked_add(u32::from(offset))
                        .ok_or_else(|| Error::Format("record address overflows".into()))?;
                    if !value.is_empty() {
                        chunks.push((address, value));
                    }
                },
                Record::ExtendedSegmentAddress(segment) => base = u32::from(segment) << 4,
                Record::ExtendedLinearAddress(upper) => base = u32::from(upper) << 16,
                Record::EndOfFile => {
                    saw_eof = true;
                    break;
                },
                Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {},
            }
        }

        if !saw_eof {
            warn!("HEX data has no end-of-file record");
        }
        assemble(&chunks)
    }
}

fn format_reason(e: &Error) -> String {
    match e {
        Error::Format(reason) => reason.clone(),
        other => other.to_string(),
    }
}

fn assemble(chunks: &[(u32, Vec<u8>)]) -> Result<FirmwareImage> {
    let start = chunks
        .iter()
        .map(|(address, _)| *address)
        .min()
        .ok_or_else(|| Error::Format("image contains no data".into()))?;
    let end = chunks
        .iter()
        .map(|(address, data)| u64::from(*address) + data.len() as u64)
        .max()
        .unwrap_or(u64::from(start));

    let span = end - u64::from(start);
    if span > MAX_IMAGE_SPAN {
        return Err(Error::Format(format!(
            "image spans {span} bytes from 0x{start:08X}, more than {MAX_IMAGE_SPAN}"
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let mut data = vec![ERASED; span as usize];
    for (address, bytes) in chunks {
        let offset = (address - start) as usize;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
    Ok(FirmwareImage::new(start, data))
}
