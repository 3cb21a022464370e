use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, trace};
use rusb::{Context, DeviceHandle, UsbContext};

use crate::error::StlinkError;
use crate::tools::{is_stlink_device, read_serial_number};
use crate::transfer::{Direction, TransferContext};
use crate::DebugProbeSelector;

/// The fixed USB command packet size. Shorter commands are zero-padded.
pub(crate) const CMD_LEN: usize = 16;

/// The ST-Link USB vendor ID.
pub const USB_VID: u16 = 0x0483;

/// Wildcard accepted for both halves of a [`DebugProbeSelector`].
pub const WILDCARD_ID: u16 = 0xffff;

/// Default timeout for a single bulk transfer.
pub const TIMEOUT: Duration = Duration::from_millis(1000);

lazy_static! {
    /// Map of USB PID to probe generation and bulk endpoint layout.
    pub static ref USB_PID_EP_MAP: HashMap<u16, STLinkInfo> = {
        let mut m = HashMap::new();
        m.insert(0x3744, STLinkInfo::new("V1",   0x3744, 1, 0x02, 0x81, 0x83));
        m.insert(0x3748, STLinkInfo::new("V2",   0x3748, 2, 0x02, 0x81, 0x83));
        m.insert(0x374b, STLinkInfo::new("V2-1", 0x374b, 2, 0x01, 0x81, 0x82));
        m.insert(0x3752, STLinkInfo::new("V2-1", 0x3752, 2, 0x01, 0x81, 0x82)); // No MSD
        m.insert(0x374d, STLinkInfo::new("V3",   0x374d, 3, 0x01, 0x81, 0x82)); // USB loader
        m.insert(0x374e, STLinkInfo::new("V3",   0x374e, 3, 0x01, 0x81, 0x82));
        m.insert(0x374f, STLinkInfo::new("V3",   0x374f, 3, 0x01, 0x81, 0x82)); // Bridge
        m.insert(0x3753, STLinkInfo::new("V3",   0x3753, 3, 0x01, 0x81, 0x82)); // 2VCP
        m
    };
}

/// A helper struct to match ST-Link device info.
#[derive(Clone, Debug, Default)]
pub struct STLinkInfo {
    pub version_name: String,
    pub usb_pid: u16,
    pub generation: u8,
    ep_out: u8,
    ep_in: u8,
    ep_trace: u8,
}

impl STLinkInfo {
    pub fn new<V: Into<String>>(
        version_name: V,
        usb_pid: u16,
        generation: u8,
        ep_out: u8,
        ep_in: u8,
        ep_trace: u8,
    ) -> Self {
        Self {
            version_name: version_name.into(),
            usb_pid,
            generation,
            ep_out,
            ep_in,
            ep_trace,
        }
    }
}

/// The bulk transport under the protocol engine.
///
/// Implementations frame one command/data exchange per call and do not
/// interpret status bytes. Mocked in tests.
pub trait StLinkUsb: fmt::Debug {
    /// Sends the command packet and runs the data phase in the context's
    /// direction.
    fn exchange(
        &mut self,
        ctx: &mut TransferContext,
        timeout: Duration,
    ) -> Result<(), StlinkError>;

    /// Resets the USB device. This can be used to recover when the probe
    /// stops responding to requests.
    fn reset(&mut self) -> Result<(), StlinkError>;

    /// Reads pending SWO bytes from the trace endpoint.
    fn read_trace(&mut self, read_data: &mut [u8], timeout: Duration)
        -> Result<usize, StlinkError>;
}

pub struct STLinkUSBDevice {
    device_handle: DeviceHandle<Context>,
    info: STLinkInfo,
}

impl fmt::Debug for STLinkUSBDevice {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("STLinkUSBDevice")
            .field("device_handle", &"DeviceHandle<rusb::Context>")
            .field("info", &self.info)
            .finish()
    }
}

impl STLinkUSBDevice {
    /// Opens the USB device matching `selector` and claims its interface.
    pub fn new_from_selector(selector: &DebugProbeSelector) -> Result<Self, StlinkError> {
        let context = Context::new()?;

        debug!("acquired libusb context");

        let mut matches = Vec::new();
        for device in context.devices()?.iter().filter(is_stlink_device) {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            if selector.matches_ids(descriptor.vendor_id(), descriptor.product_id()) {
                matches.push((device, descriptor));
            }
        }

        let (device, descriptor) = match (&selector.serial_number, matches.len()) {
            (_, 0) => return Err(StlinkError::ProbeNotFound),
            (Some(serial), _) => matches
                .into_iter()
                .find(|(device, descriptor)| {
                    read_serial_number(device, descriptor).ok().as_deref() == Some(serial)
                })
                .ok_or(StlinkError::ProbeNotFound)?,
            (None, 1) => matches.remove(0),
            (None, _) => return Err(StlinkError::MultipleProbesFound),
        };

        let mut device_handle = device.open()?;
        let config = device.active_config_descriptor()?;
        let info = USB_PID_EP_MAP[&descriptor.product_id()].clone();

        device_handle.claim_interface(0)?;
        debug!("claimed interface 0 of ST-Link {}", info.version_name);

        let mut endpoint_out = false;
        let mut endpoint_in = false;

        if let Some(interface) = config.interfaces().next() {
            if let Some(descriptor) = interface.descriptors().next() {
                for endpoint in descriptor.endpoint_descriptors() {
                    if endpoint.address() == info.ep_out {
                        endpoint_out = true;
                    } else if endpoint.address() == info.ep_in {
                        endpoint_in = true;
                    }
                }
            }
        }

        // The trace endpoint is optional; V1 probes do not have one.
        if !endpoint_out || !endpoint_in {
            return Err(StlinkError::EndpointNotFound);
        }

        Ok(Self {
            device_handle,
            info,
        })
    }

    fn close(&mut self) -> Result<(), rusb::Error> {
        self.device_handle.release_interface(0)
    }
}

impl StLinkUsb for STLinkUSBDevice {
    fn exchange(
        &mut self,
        ctx: &mut TransferContext,
        timeout: Duration,
    ) -> Result<(), StlinkError> {
        trace!("sending command {:02x?} to probe", ctx.command());

        // Command phase.
        assert!(ctx.command().len() <= CMD_LEN);
        let mut padded_cmd = [0u8; CMD_LEN];
        padded_cmd[..ctx.command().len()].copy_from_slice(ctx.command());

        let ep_out = self.info.ep_out;
        let ep_in = self.info.ep_in;

        let written_bytes = self.device_handle.write_bulk(ep_out, &padded_cmd, timeout)?;
        if written_bytes != CMD_LEN {
            return Err(StlinkError::NotEnoughBytesWritten {
                is: written_bytes,
                should: CMD_LEN,
            });
        }

        match ctx.direction() {
            Direction::Out => {
                let mut write_index = 0;
                while write_index < ctx.data.len() {
                    let written_bytes =
                        self.device_handle
                            .write_bulk(ep_out, &ctx.data[write_index..], timeout)?;
                    if written_bytes == 0 {
                        return Err(StlinkError::NotEnoughBytesWritten {
                            is: write_index,
                            should: ctx.data.len(),
                        });
                    }
                    write_index += written_bytes;
                    trace!(
                        "wrote {} payload bytes, {} remaining",
                        written_bytes,
                        ctx.data.len() - write_index
                    );
                }
            }
            Direction::In => {
                let expected = ctx.data.len();
                let mut read_index = 0;
                while read_index < expected {
                    let read_bytes =
                        self.device_handle
                            .read_bulk(ep_in, &mut ctx.data[read_index..], timeout)?;
                    if read_bytes == 0 {
                        return Err(StlinkError::ShortReply {
                            expected,
                            received: read_index,
                        });
                    }
                    read_index += read_bytes;
                    trace!(
                        "read {} reply bytes, {} remaining",
                        read_bytes,
                        expected - read_index
                    );
                }
            }
            Direction::NoData => {}
        }

        Ok(())
    }

    fn reset(&mut self) -> Result<(), StlinkError> {
        debug!("resetting the probe's USB device");
        self.device_handle.reset()?;
        Ok(())
    }

    fn read_trace(
        &mut self,
        read_data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, StlinkError> {
        if read_data.is_empty() {
            return Ok(0);
        }
        let read_bytes = self
            .device_handle
            .read_bulk(self.info.ep_trace, read_data, timeout)?;
        Ok(read_bytes)
    }
}

impl Drop for STLinkUSBDevice {
    fn drop(&mut self) {
        // We ignore the error case as we can't do much about it anyways.
        let _ = self.close();
    }
}
