//! Host-side driver for the ST-Link family of USB debug probes.
//!
//! The probe bridges the host to an embedded target over SWD, JTAG or SWIM.
//! This crate implements the vendor USB command protocol: version and
//! capability probing, mode entry and leave, access-port setup, interface
//! speed and SWO trace configuration, and alignment-aware reads and writes
//! of target memory at 8/16/32-bit granularity.
//!
//! A handle is opened from a [`StLinkConfig`] and used single-threaded; it
//! leaves debug mode again when dropped.
//!
//! ```no_run
//! # fn main() -> Result<(), stlink::StlinkError> {
//! use stlink::{AccessWidth, STLink, StLinkConfig};
//!
//! let mut probe = STLink::open(StLinkConfig::default())?;
//! println!("target voltage: {:.2} V", probe.get_target_voltage()?);
//!
//! let mut word = Vec::new();
//! probe.read_mem(0x2000_0000, AccessWidth::Bit32, 1, &mut word)?;
//! # Ok(())
//! # }
//! ```

pub mod constants;
mod error;
mod memory;
mod stlink;
mod tools;
mod transfer;
mod usb_interface;
mod version;

pub use crate::constants::{StLinkMode, Status};
pub use crate::error::StlinkError;
pub use crate::memory::{AccessWidth, TargetRegisters};
pub use crate::stlink::{NrstState, STLink, StLinkConfig, TraceProtocol};
pub use crate::tools::{list_stlink_devices, DebugProbeInfo};
pub use crate::transfer::{Direction, TransferContext};
pub use crate::usb_interface::{STLinkUSBDevice, StLinkUsb, TIMEOUT, USB_VID, WILDCARD_ID};
pub use crate::version::{Capabilities, JtagApi, Version};

/// A way to select one probe among the connected ones.
///
/// Parseable from `"VID:PID"` or `"VID:PID:SERIAL"` with the IDs in hex;
/// [`WILDCARD_ID`] matches any vendor or product ID. When several probes
/// match and no serial number is given, opening fails rather than picking
/// one arbitrarily.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebugProbeSelector {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

impl DebugProbeSelector {
    pub(crate) fn matches_ids(&self, vendor_id: u16, product_id: u16) -> bool {
        (self.vendor_id == WILDCARD_ID || self.vendor_id == vendor_id)
            && (self.product_id == WILDCARD_ID || self.product_id == product_id)
    }
}

impl Default for DebugProbeSelector {
    fn default() -> Self {
        DebugProbeSelector {
            vendor_id: WILDCARD_ID,
            product_id: WILDCARD_ID,
            serial_number: None,
        }
    }
}

impl std::str::FromStr for DebugProbeSelector {
    type Err = StlinkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || StlinkError::InvalidSelector(value.to_string());

        // Up to three parts; the serial number may itself contain colons.
        let mut split = value.splitn(3, ':');
        let vendor_id = split.next().ok_or_else(invalid)?;
        let product_id = split.next().ok_or_else(invalid)?;
        let serial_number = split.next().map(|s| s.to_string());

        Ok(DebugProbeSelector {
            vendor_id: u16::from_str_radix(vendor_id, 16).map_err(|_| invalid())?,
            product_id: u16::from_str_radix(product_id, 16).map_err(|_| invalid())?,
            serial_number,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn selector_parses_ids_and_serial() {
        let selector: DebugProbeSelector = "0483:374b:0672FF485550755187121723".parse().unwrap();
        assert_eq!(selector.vendor_id, 0x0483);
        assert_eq!(selector.product_id, 0x374b);
        assert_eq!(
            selector.serial_number.as_deref(),
            Some("0672FF485550755187121723")
        );

        let selector: DebugProbeSelector = "ffff:3748".parse().unwrap();
        assert_eq!(selector.vendor_id, WILDCARD_ID);
        assert!(selector.serial_number.is_none());
    }

    #[test]
    fn selector_rejects_malformed_input() {
        assert!("0483".parse::<DebugProbeSelector>().is_err());
        assert!("xyz:3748".parse::<DebugProbeSelector>().is_err());
    }

    #[test]
    fn wildcards_match_any_id() {
        let selector = DebugProbeSelector::default();
        assert!(selector.matches_ids(0x0483, 0x3748));
        assert!(selector.matches_ids(0x0483, 0x374b));

        let selector: DebugProbeSelector = "0483:3748".parse().unwrap();
        assert!(selector.matches_ids(0x0483, 0x3748));
        assert!(!selector.matches_ids(0x0483, 0x374b));
    }
}
