//! Firmware constants: command opcodes, status codes, modes and speed maps.

pub mod commands {
    // Common commands.
    pub const GET_VERSION: u8 = 0xf1;
    pub const DEBUG_COMMAND: u8 = 0xf2;
    pub const DFU_COMMAND: u8 = 0xf3;
    pub const SWIM_COMMAND: u8 = 0xf4;
    pub const GET_CURRENT_MODE: u8 = 0xf5;
    pub const GET_TARGET_VOLTAGE: u8 = 0xf7;
    pub const GET_VERSION_APIV3: u8 = 0xfb;

    // Commands to exit other modes.
    pub const DFU_EXIT: u8 = 0x07;
    pub const SWIM_ENTER: u8 = 0x00;
    pub const SWIM_EXIT: u8 = 0x01;

    // Debug commands common to all API versions.
    pub const DEBUG_READMEM_32BIT: u8 = 0x07;
    pub const DEBUG_WRITEMEM_32BIT: u8 = 0x08;
    pub const DEBUG_READMEM_8BIT: u8 = 0x0c;
    pub const DEBUG_WRITEMEM_8BIT: u8 = 0x0d;
    pub const DEBUG_APIV1_ENTER: u8 = 0x20;
    pub const DEBUG_EXIT: u8 = 0x21;
    pub const DEBUG_READ_CORE_ID: u8 = 0x22;

    // Debug commands from version 2 of the API.
    pub const DEBUG_APIV2_ENTER: u8 = 0x30;
    pub const DEBUG_APIV2_READ_IDCODES: u8 = 0x31;
    pub const DEBUG_APIV2_READ_REG: u8 = 0x33;
    pub const DEBUG_APIV2_READ_ALL_REGS: u8 = 0x3a;
    pub const DEBUG_APIV2_GET_RW_STATUS: u8 = 0x3b;
    pub const DEBUG_APIV2_DRIVE_NRST: u8 = 0x3c;
    pub const DEBUG_APIV2_GET_RW_STATUS_EXT: u8 = 0x3e; // From V2J15
    pub const DEBUG_APIV2_START_TRACE_RX: u8 = 0x40;
    pub const DEBUG_APIV2_STOP_TRACE_RX: u8 = 0x41;
    pub const DEBUG_APIV2_GET_TRACE_NB: u8 = 0x42;
    pub const DEBUG_APIV2_SWD_SET_FREQ: u8 = 0x43; // From V2J20
    pub const DEBUG_APIV2_JTAG_SET_FREQ: u8 = 0x44; // From V2J24
    pub const DEBUG_APIV2_READMEM_16BIT: u8 = 0x47; // From V2J26
    pub const DEBUG_APIV2_WRITEMEM_16BIT: u8 = 0x48; // From V2J26
    pub const DEBUG_APIV2_INIT_AP: u8 = 0x4b;
    pub const DEBUG_APIV2_CLOSE_AP_DBG: u8 = 0x4c;
    pub const DEBUG_APIV3_SET_COM_FREQ: u8 = 0x61; // V3 only
    pub const DEBUG_APIV3_GET_COM_FREQ: u8 = 0x62; // V3 only

    // Parameters for the enter commands.
    pub const DEBUG_ENTER_SWD_NO_RESET: u8 = 0xa3;
    pub const DEBUG_ENTER_JTAG_NO_RESET: u8 = 0xa1;

    // Parameters for DEBUG_APIV2_DRIVE_NRST.
    pub const DEBUG_DRIVE_NRST_LOW: u8 = 0x00;
    pub const DEBUG_DRIVE_NRST_HIGH: u8 = 0x01;
    pub const DEBUG_DRIVE_NRST_PULSE: u8 = 0x02;

    // Parameters for SET_COM_FREQ and GET_COM_FREQ.
    pub const DEBUG_APIV3_COM_SWD: u8 = 0x00;
    pub const DEBUG_APIV3_COM_JTAG: u8 = 0x01;
}

/// Mode bytes reported by GET_CURRENT_MODE.
pub mod device_mode {
    pub const DFU: u8 = 0x00;
    pub const MASS: u8 = 0x01;
    pub const DEBUG: u8 = 0x02;
    pub const SWIM: u8 = 0x03;
    pub const BOOTLOADER: u8 = 0x04;
}

/// Highest access port number the probe can address.
pub const ACCESS_PORT_MAX: u16 = 255;

/// Highest SWO capture frequency the firmware supports.
pub const TRACE_MAX_HZ: u32 = 2_000_000;

/// Size of the probe-internal SWO capture buffer.
pub const TRACE_BUFFER_SIZE: u16 = 4096;

/// Transport mode of the probe, as selected by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StLinkMode {
    DebugSwd,
    DebugJtag,
    DebugSwim,
    Dfu,
    Mass,
    Unknown,
}

impl StLinkMode {
    /// Maps a GET_CURRENT_MODE reply byte onto a mode. The probe reports
    /// "debug" without distinguishing SWD from JTAG.
    pub fn from_device_mode(value: u8) -> Self {
        match value {
            device_mode::DFU => StLinkMode::Dfu,
            device_mode::MASS => StLinkMode::Mass,
            device_mode::DEBUG => StLinkMode::DebugSwd,
            device_mode::SWIM => StLinkMode::DebugSwim,
            _ => StLinkMode::Unknown,
        }
    }
}

/// Status byte found in the first position of checked replies.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    JtagOk,
    TargetWait,
    TargetFault,
    SwdApWait,
    SwdApFault,
    SwdDpWait,
    SwdDpFault,
    Unknown(u8),
}

impl From<u8> for Status {
    fn from(value: u8) -> Status {
        match value {
            0x80 => Status::JtagOk,
            0x02 => Status::TargetWait,
            0x08 => Status::TargetFault,
            0x10 => Status::SwdApFault,
            0x11 => Status::SwdDpFault,
            0x12 => Status::SwdApWait,
            0x14 => Status::SwdDpWait,
            v => Status::Unknown(v),
        }
    }
}

impl Status {
    /// Transient: the target asked us to retry after a backoff.
    pub fn is_wait(self) -> bool {
        matches!(
            self,
            Status::TargetWait | Status::SwdApWait | Status::SwdDpWait
        )
    }

    /// Permanent for this transfer; retrying the same command will not help.
    pub fn is_fault(self) -> bool {
        matches!(
            self,
            Status::TargetFault | Status::SwdApFault | Status::SwdDpFault
        )
    }
}

/// Map from SWD frequency in kHz to delay loop count.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SwdFrequencyToDelayCount {
    Hz4600000 = 0,
    Hz1800000 = 1, // Default
    Hz1200000 = 2,
    Hz950000 = 3,
    Hz650000 = 5,
    Hz480000 = 7,
    Hz400000 = 9,
    Hz360000 = 10,
    Hz240000 = 15,
    Hz150000 = 25,
    Hz125000 = 31,
    Hz100000 = 40,
}

impl SwdFrequencyToDelayCount {
    /// Try to find an appropriate setting for the given frequency in kHz.
    ///
    /// If a direct match is not found, return the setting for a lower
    /// frequency if possible. If this is not possible, returns `None`.
    pub(crate) fn find_setting(frequency: u32) -> Option<SwdFrequencyToDelayCount> {
        Some(match frequency {
            _ if frequency >= 4_600 => Self::Hz4600000,
            _ if frequency >= 1_800 => Self::Hz1800000,
            _ if frequency >= 1_200 => Self::Hz1200000,
            _ if frequency >= 950 => Self::Hz950000,
            _ if frequency >= 650 => Self::Hz650000,
            _ if frequency >= 480 => Self::Hz480000,
            _ if frequency >= 400 => Self::Hz400000,
            _ if frequency >= 360 => Self::Hz360000,
            _ if frequency >= 240 => Self::Hz240000,
            _ if frequency >= 150 => Self::Hz150000,
            _ if frequency >= 125 => Self::Hz125000,
            _ if frequency >= 100 => Self::Hz100000,
            _ => return None,
        })
    }

    /// Get the SWD frequency in kHz.
    pub(crate) fn to_khz(self) -> u32 {
        match self {
            Self::Hz4600000 => 4600,
            Self::Hz1800000 => 1800,
            Self::Hz1200000 => 1200,
            Self::Hz950000 => 950,
            Self::Hz650000 => 650,
            Self::Hz480000 => 480,
            Self::Hz400000 => 400,
            Self::Hz360000 => 360,
            Self::Hz240000 => 240,
            Self::Hz150000 => 150,
            Self::Hz125000 => 125,
            Self::Hz100000 => 100,
        }
    }
}

/// Map from JTAG frequency in kHz to frequency divider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JTagFrequencyToDivider {
    Hz18000000 = 2,
    Hz9000000 = 4,
    Hz4500000 = 8,
    Hz2250000 = 16,
    Hz1120000 = 32, // Default
    Hz560000 = 64,
    Hz280000 = 128,
    Hz140000 = 256,
}

impl JTagFrequencyToDivider {
    /// Try to find an appropriate setting for the given frequency in kHz.
    pub(crate) fn find_setting(frequency: u32) -> Option<Self> {
        Some(match frequency {
            _ if frequency >= 18_000 => Self::Hz18000000,
            _ if frequency >= 9_000 => Self::Hz9000000,
            _ if frequency >= 4_500 => Self::Hz4500000,
            _ if frequency >= 2_250 => Self::Hz2250000,
            _ if frequency >= 1_120 => Self::Hz1120000,
            _ if frequency >= 560 => Self::Hz560000,
            _ if frequency >= 280 => Self::Hz280000,
            _ if frequency >= 140 => Self::Hz140000,
            _ => return None,
        })
    }

    /// Return the frequency in kHz.
    pub(crate) fn to_khz(self) -> u32 {
        match self {
            Self::Hz18000000 => 18_000,
            Self::Hz9000000 => 9_000,
            Self::Hz4500000 => 4_500,
            Self::Hz2250000 => 2_250,
            Self::Hz1120000 => 1_120,
            Self::Hz560000 => 560,
            Self::Hz280000 => 280,
            Self::Hz140000 => 140,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_wait_codes_retry() {
        for raw in [0x02u8, 0x12, 0x14] {
            let status = Status::from(raw);
            assert!(status.is_wait(), "{raw:#04x} should be a wait status");
            assert!(!status.is_fault());
        }
    }

    #[test]
    fn status_fault_codes_do_not_retry() {
        for raw in [0x08u8, 0x10, 0x11] {
            let status = Status::from(raw);
            assert!(status.is_fault(), "{raw:#04x} should be a fault status");
            assert!(!status.is_wait());
        }
    }

    #[test]
    fn status_unknown_codes() {
        assert_eq!(Status::from(0x42), Status::Unknown(0x42));
        assert!(!Status::from(0x42).is_wait());
        assert!(!Status::from(0x42).is_fault());
        assert_eq!(Status::from(0x80), Status::JtagOk);
    }

    #[test]
    fn mode_byte_mapping() {
        assert_eq!(StLinkMode::from_device_mode(0x00), StLinkMode::Dfu);
        assert_eq!(StLinkMode::from_device_mode(0x01), StLinkMode::Mass);
        assert_eq!(StLinkMode::from_device_mode(0x02), StLinkMode::DebugSwd);
        assert_eq!(StLinkMode::from_device_mode(0x03), StLinkMode::DebugSwim);
        assert_eq!(StLinkMode::from_device_mode(0x04), StLinkMode::Unknown);
        assert_eq!(StLinkMode::from_device_mode(0xff), StLinkMode::Unknown);
    }

    #[test]
    fn swd_speed_lookup_rounds_down() {
        assert!(SwdFrequencyToDelayCount::find_setting(99).is_none());
        assert_eq!(
            SwdFrequencyToDelayCount::find_setting(100).unwrap(),
            SwdFrequencyToDelayCount::Hz100000
        );
        assert_eq!(
            SwdFrequencyToDelayCount::find_setting(1_799).unwrap(),
            SwdFrequencyToDelayCount::Hz1200000
        );
        assert_eq!(
            SwdFrequencyToDelayCount::find_setting(u32::MAX).unwrap(),
            SwdFrequencyToDelayCount::Hz4600000
        );
    }

    #[test]
    fn jtag_speed_lookup_rounds_down() {
        assert!(JTagFrequencyToDivider::find_setting(139).is_none());
        assert_eq!(
            JTagFrequencyToDivider::find_setting(279).unwrap(),
            JTagFrequencyToDivider::Hz140000
        );
        assert_eq!(
            JTagFrequencyToDivider::find_setting(18_000).unwrap(),
            JTagFrequencyToDivider::Hz18000000
        );
    }
}
