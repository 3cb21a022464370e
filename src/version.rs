use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Feature bits derived from the probe generation and JTAG firmware
    /// revision. Fixed for the lifetime of a handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        /// 16-bit memory transfer commands are available.
        const MEM_16BIT = 1 << 0;
        /// Access ports must be initialized before use.
        const AP_INIT = 1 << 1;
        /// The interface frequency can be configured.
        const JTAG_SET_FREQ = 1 << 2;
        /// The target supply voltage can be measured.
        const TARGET_VOLT = 1 << 3;
        /// SWO trace capture is available.
        const TRACE = 1 << 4;
        /// The 12-byte read/write status command is available.
        const RW_STATUS_12 = 1 << 5;
    }
}

/// The JTAG command set variant the firmware speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JtagApi {
    V1,
    V2,
    V3,
}

/// Probe firmware revisions, resolved once during the version probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub generation: u8,
    pub jtag: u8,
    pub swim: u8,
    pub api: JtagApi,
    pub flags: Capabilities,
}

/// Feature introduction points for V2 firmware, by JTAG revision.
/// V1 has none of these; V3 has all of them.
const V2_FEATURES: &[(u8, Capabilities)] = &[
    (13, Capabilities::TARGET_VOLT),
    (13, Capabilities::TRACE),
    (15, Capabilities::RW_STATUS_12),
    (22, Capabilities::JTAG_SET_FREQ),
    (24, Capabilities::AP_INIT),
    (26, Capabilities::MEM_16BIT),
];

impl Version {
    pub fn new(generation: u8, jtag: u8, swim: u8) -> Self {
        let api = match generation {
            0 | 1 => JtagApi::V1,
            2 => JtagApi::V2,
            _ => JtagApi::V3,
        };

        let mut flags = Capabilities::empty();
        match generation {
            2 => {
                for (min_jtag, feature) in V2_FEATURES {
                    if jtag >= *min_jtag {
                        flags |= *feature;
                    }
                }
            }
            g if g >= 3 => flags = Capabilities::all(),
            _ => {}
        }

        Version {
            generation,
            jtag,
            swim,
            api,
            flags,
        }
    }

    /// Placeholder until the version probe has run.
    pub(crate) fn unprobed() -> Self {
        Version {
            generation: 0,
            jtag: 0,
            swim: 0,
            api: JtagApi::V1,
            flags: Capabilities::empty(),
        }
    }

    pub fn supports(&self, flags: Capabilities) -> bool {
        self.flags.contains(flags)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}J{}S{}", self.generation, self.jtag, self.swim)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn v1_has_no_features() {
        let version = Version::new(1, 11, 4);
        assert_eq!(version.api, JtagApi::V1);
        assert_eq!(version.flags, Capabilities::empty());
    }

    #[test]
    fn v2_features_accumulate_with_firmware_revision() {
        let cases = [
            (12, Capabilities::empty()),
            (13, Capabilities::TARGET_VOLT | Capabilities::TRACE),
            (
                15,
                Capabilities::TARGET_VOLT | Capabilities::TRACE | Capabilities::RW_STATUS_12,
            ),
            (
                24,
                Capabilities::TARGET_VOLT
                    | Capabilities::TRACE
                    | Capabilities::RW_STATUS_12
                    | Capabilities::JTAG_SET_FREQ
                    | Capabilities::AP_INIT,
            ),
            (26, Capabilities::all()),
        ];

        for (jtag, expected) in cases {
            let version = Version::new(2, jtag, 0);
            assert_eq!(version.api, JtagApi::V2);
            assert_eq!(version.flags, expected, "V2J{jtag}");
        }
    }

    #[test]
    fn v3_has_all_features() {
        let version = Version::new(3, 2, 1);
        assert_eq!(version.api, JtagApi::V3);
        assert_eq!(version.flags, Capabilities::all());
        assert!(version.supports(Capabilities::MEM_16BIT | Capabilities::AP_INIT));
    }

    #[test]
    fn display_matches_firmware_naming() {
        assert_eq!(Version::new(2, 27, 6).to_string(), "V2J27S6");
    }
}
