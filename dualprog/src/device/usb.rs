//! ST-Link enumeration over libusb.

use {
    super::{ProbeDevice, ProbeModel},
    crate::error::{Error, Result},
    log::{debug, trace},
    rusb::{Context, Device, DeviceDescriptor, UsbContext},
    std::sync::OnceLock,
};

static USB_BACKEND: OnceLock<std::result::Result<Context, String>> = OnceLock::new();

/// Create the process-wide libusb context on first use.
///
/// A missing or broken libusb is reported here, at the first USB
/// operation, as [`Error::Transport`]; later calls return the same outcome
/// without retrying.
pub fn init_usb_backend() -> Result<Context> {
    let backend = USB_BACKEND.get_or_init(|| {
        debug!("Initializing libusb context");
        Context::new().map_err(|e| e.to_string())
    });
    match backend {
        Ok(context) => Ok(context.clone()),
        Err(e) => Err(Error::Transport(format!(
            "USB backend unavailable ({e}); install libusb-1.0 and check USB permissions"
        ))),
    }
}

fn read_serial<T: UsbContext>(device: &Device<T>, descriptor: &DeviceDescriptor) -> Option<String> {
    let handle = match device.open() {
        Ok(handle) => handle,
        Err(e) => {
            debug!(
                "Cannot open probe on bus {} addr {} to read its serial: {e}",
                device.bus_number(),
                device.address()
            );
            return None;
        },
    };
    handle
        .read_serial_number_string_ascii(descriptor)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Enumerate connected ST-Link probes, ordered by bus and address.
pub fn list_stlink_probes() -> Result<Vec<ProbeDevice>> {
    let context = init_usb_backend()?;
    let mut probes = Vec::new();

    for device in context.devices()?.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        let (vid, pid) = (descriptor.vendor_id(), descriptor.product_id());
        if ProbeModel::from_vid_pid(vid, pid).is_none() {
            continue;
        }

        let probe = ProbeDevice {
            vid,
            pid,
            serial: read_serial(&device, &descriptor),
            bus: Some(device.bus_number()),
            address: Some(device.address()),
        };
        trace!("Found probe: {} (bus {}, addr {})", probe.name(), device.bus_number(), device.address());
        probes.push(probe);
    }

    probes.sort_by_key(|p| (p.bus, p.address));
    Ok(probes)
}

/// Find the libusb device behind `probe`.
///
/// Bus and address identify it during one enumeration; after a
/// re-enumeration the serial number still does.
pub fn find_device(probe: &ProbeDevice) -> Result<Device<Context>> {
    let context = init_usb_backend()?;
    let devices = context.devices()?;

    let same_location = |device: &Device<Context>| {
        Some(device.bus_number()) == probe.bus && Some(device.address()) == probe.address
    };
    let same_serial = |device: &Device<Context>| {
        let Ok(descriptor) = device.device_descriptor() else {
            return false;
        };
        descriptor.vendor_id() == probe.vid
            && descriptor.product_id() == probe.pid
            && probe.serial.is_some()
            && read_serial(device, &descriptor) == probe.serial
    };

    devices
        .iter()
        .find(same_location)
        .or_else(|| devices.iter().find(same_serial))
        .ok_or_else(|| Error::DeviceNotFound(format!("{} is no longer connected", probe.name())))
}
