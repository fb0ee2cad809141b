//! Raw ST-Link bulk protocol over libusb.
//!
//! Last resort when no tool is installed. Every exchange is a 16 byte
//! command block on the OUT endpoint, an optional data phase, and for
//! memory accesses a `GETLASTRWSTATUS2` check.
//!
//! ```text
//! byte:  0     1     2..5          6..7         8       9..15
//!       +-----+-----+-------------+------------+-------+--------+
//!       | F2  | op  | address LE  | length LE  | apsel | zero   |
//!       +-----+-----+-------------+------------+-------+--------+
//! ```

use {
    super::{BackendProvider, FlashBackend, hex_address},
    crate::{
        device::{ProbeDevice, ProbeModel, usb::find_device},
        error::{Error, Result},
    },
    byteorder::{ByteOrder, LittleEndian},
    log::{debug, info, trace, warn},
    rusb::{Context, DeviceHandle},
    std::time::Duration,
};

const CMD_LEN: usize = 16;
const BLOCK_SIZE: usize = 1024;
const USB_TIMEOUT: Duration = Duration::from_secs(3);

mod commands {
    pub const GET_CURRENT_MODE: u8 = 0xF5;
    pub const DFU_COMMAND: u8 = 0xF3;
    pub const DFU_EXIT: u8 = 0x07;
    pub const JTAG_COMMAND: u8 = 0xF2;
    pub const JTAG_ENTER2: u8 = 0x30;
    pub const JTAG_ENTER_SWD: u8 = 0xA3;
    pub const JTAG_EXIT: u8 = 0x21;
    pub const JTAG_READMEM_32BIT: u8 = 0x07;
    pub const JTAG_WRITEMEM_32BIT: u8 = 0x08;
    pub const JTAG_GETLASTRWSTATUS2: u8 = 0x3E;
    pub const STATUS_OK: u8 = 0x80;
    pub const MODE_DFU: u8 = 0x00;
}

use commands::*;

/// Bulk endpoints `(out, in)` of a probe generation.
pub fn endpoints(model: ProbeModel) -> (u8, u8) {
    match model {
        ProbeModel::V2 => (0x02, 0x81),
        ProbeModel::V2_1 | ProbeModel::V3 => (0x01, 0x81),
    }
}

/// Memory access command block.
pub fn mem_command(op: u8, address: u32, len: u16) -> [u8; CMD_LEN] {
    let mut cmd = [0u8; CMD_LEN];
    cmd[0] = JTAG_COMMAND;
    cmd[1] = op;
    LittleEndian::write_u32(&mut cmd[2..6], address);
    LittleEndian::write_u16(&mut cmd[6..8], len);
    cmd
}

/// Pad `data` with erased bytes up to a whole number of words.
pub fn pad_to_word(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    padded.resize(data.len().next_multiple_of(4), 0xFF);
    padded
}

/// Opens raw ST-Link sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct StLinkUsbProvider;

impl StLinkUsbProvider {
    /// New provider.
    pub fn new() -> Self {
        Self
    }
}

impl BackendProvider for StLinkUsbProvider {
    fn name(&self) -> &'static str {
        "ST-Link USB"
    }

    fn probe(&self, probe: &ProbeDevice) -> Result<Box<dyn FlashBackend>> {
        let model = probe
            .model()
            .ok_or_else(|| Error::BackendUnavailable(format!("{} is not an ST-Link", probe.name())))?;
        let device = find_device(probe)?;
        let mut handle = device.open().map_err(|e| {
            Error::Transport(format!(
                "cannot open {}: {e}. STM32CubeProgrammer or another tool may be holding it",
                probe.name()
            ))
        })?;
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle.claim_interface(0)?;
        debug!("Claimed interface 0 of {}", probe.name());

        let (ep_out, ep_in) = endpoints(model);
        let mut session = StLinkUsb {
            handle: Some(handle),
            ep_out,
            ep_in,
        };
        session.enter_swd()?;
        Ok(Box::new(session))
    }
}

/// An ST-Link with interface 0 claimed and SWD entered.
pub struct StLinkUsb {
    handle: Option<DeviceHandle<Context>>,
    ep_out: u8,
    ep_in: u8,
}

impl StLinkUsb {
    fn transfer(&mut self, cmd: &[u8], data_out: &[u8], data_in: &mut [u8]) -> Result<()> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| Error::Transport("ST-Link session already closed".into()))?;

        let mut block = [0u8; CMD_LEN];
        block[..cmd.len()].copy_from_slice(cmd);
        trace!("ST-Link <- {block:02X?}");
        if handle.write_bulk(self.ep_out, &block, USB_TIMEOUT)? != CMD_LEN {
            return Err(Error::Transport("short command write to ST-Link".into()));
        }
        if !data_out.is_empty() && handle.write_bulk(self.ep_out, data_out, USB_TIMEOUT)? != data_out.len() {
            return Err(Error::Transport("short data write to ST-Link".into()));
        }
        if !data_in.is_empty() {
            let n = handle.read_bulk(self.ep_in, data_in, USB_TIMEOUT)?;
            if n != data_in.len() {
                return Err(Error::Transport(format!(
                    "short read from ST-Link: {n} of {} bytes",
                    data_in.len()
                )));
            }
        }
        Ok(())
    }

    fn enter_swd(&mut self) -> Result<()> {
        let mut mode = [0u8; 2];
        self.transfer(&[GET_CURRENT_MODE], &[], &mut mode)?;
        if mode[0] == MODE_DFU {
            self.transfer(&[DFU_COMMAND, DFU_EXIT], &[], &mut [])?;
        }

        let mut status = [0u8; 2];
        self.transfer(&[JTAG_COMMAND, JTAG_ENTER2, JTAG_ENTER_SWD], &[], &mut status)?;
        if status[0] != STATUS_OK {
            return Err(Error::Transport(format!(
                "ST-Link could not attach over SWD (status 0x{:02X}); check target power and wiring",
                status[0]
            )));
        }
        debug!("ST-Link entered SWD mode");
        Ok(())
    }

    fn check_status(&mut self) -> Result<()> {
        let mut status = [0u8; 12];
        self.transfer(&[JTAG_COMMAND, JTAG_GETLASTRWSTATUS2], &[], &mut status)?;
        if status[0] == STATUS_OK {
            Ok(())
        } else {
            Err(Error::Transport(format!(
                "ST-Link memory access failed (status 0x{:02X})",
                status[0]
            )))
        }
    }
}

fn block_len(len: usize) -> u16 {
    // blocks never exceed BLOCK_SIZE
    u16::try_from(len).unwrap_or(u16::MAX)
}

impl FlashBackend for StLinkUsb {
    fn name(&self) -> &'static str {
        "ST-Link USB"
    }

    fn write(&mut self, data: &[u8], address: u32) -> Result<()> {
        let padded = pad_to_word(data);
        info!("ST-Link USB: writing {} bytes at {}", padded.len(), hex_address(address));
        let mut block_address = address;
        for block in padded.chunks(BLOCK_SIZE) {
            let cmd = mem_command(JTAG_WRITEMEM_32BIT, block_address, block_len(block.len()));
            self.transfer(&cmd, block, &mut [])?;
            self.check_status()?;
            block_address = block_address.wrapping_add(BLOCK_SIZE as u32);
        }
        Ok(())
    }

    fn read(&mut self, size: usize, address: u32) -> Result<Vec<u8>> {
        let aligned = size.next_multiple_of(4);
        let mut data = Vec::with_capacity(aligned);
        let mut block_address = address;
        while data.len() < aligned {
            let len = (aligned - data.len()).min(BLOCK_SIZE);
            let mut block = vec![0u8; len];
            let cmd = mem_command(JTAG_READMEM_32BIT, block_address, block_len(len));
            self.transfer(&cmd, &[], &mut block)?;
            self.check_status()?;
            data.extend_from_slice(&block);
            block_address = block_address.wrapping_add(BLOCK_SIZE as u32);
        }
        data.truncate(size);
        Ok(data)
    }

    fn close(&mut self) {
        if self.handle.is_none() {
            return;
        }
        if let Err(e) = self.transfer(&[JTAG_COMMAND, JTAG_EXIT], &[], &mut []) {
            debug!("Leaving SWD mode failed: {e}");
        }
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.release_interface(0) {
                warn!("Releasing ST-Link interface failed: {e}");
            }
        }
    }
}

impl Drop for StLinkUsb {
    fn drop(&mut self) {
        self.close();
    }
}
