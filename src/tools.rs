use std::time::Duration;

use rusb::{Device, DeviceDescriptor, UsbContext};

use crate::usb_interface::{USB_PID_EP_MAP, USB_VID};

/// Information about a connected probe, as discovered during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugProbeInfo {
    /// Human readable name, e.g. "ST-Link V2-1".
    pub identifier: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

pub(crate) fn is_stlink_device<T: UsbContext>(device: &Device<T>) -> bool {
    // Check the VID/PID.
    if let Ok(descriptor) = device.device_descriptor() {
        (descriptor.vendor_id() == USB_VID)
            && (USB_PID_EP_MAP.contains_key(&descriptor.product_id()))
    } else {
        false
    }
}

pub(crate) fn read_serial_number<T: UsbContext>(
    device: &Device<T>,
    descriptor: &DeviceDescriptor,
) -> Result<String, rusb::Error> {
    let timeout = Duration::from_millis(100);
    let handle = device.open()?;
    let language = *handle
        .read_languages(timeout)?
        .first()
        .ok_or(rusb::Error::NotFound)?;
    handle.read_serial_number_string(language, descriptor, timeout)
}

/// Lists all ST-Link probes currently plugged into the host.
pub fn list_stlink_devices() -> Vec<DebugProbeInfo> {
    if let Ok(context) = rusb::Context::new() {
        if let Ok(devices) = context.devices() {
            devices
                .iter()
                .filter(is_stlink_device)
                .filter_map(|device| {
                    let descriptor = device.device_descriptor().ok()?;
                    let serial_number = read_serial_number(&device, &descriptor).ok();
                    Some(DebugProbeInfo {
                        identifier: format!(
                            "ST-Link {}",
                            &USB_PID_EP_MAP[&descriptor.product_id()].version_name
                        ),
                        vendor_id: descriptor.vendor_id(),
                        product_id: descriptor.product_id(),
                        serial_number,
                    })
                })
                .collect::<Vec<_>>()
        } else {
            vec![]
        }
    } else {
        vec![]
    }
}
