use thiserror::Error;

use crate::constants::{StLinkMode, Status};

/// Errors surfaced by the ST-Link driver.
#[derive(Debug, Error)]
pub enum StlinkError {
    /// A USB-level failure. The handle is generally unusable afterwards.
    #[error("USB transport error")]
    Transport(#[from] rusb::Error),

    #[error("short reply from probe: expected {expected} bytes, received {received}")]
    ShortReply { expected: usize, received: usize },

    #[error("not all bytes reached the probe: wrote {is} of {should}")]
    NotEnoughBytesWritten { is: usize, should: usize },

    #[error("probe returned unexpected status {0:?}")]
    UnexpectedStatus(Status),

    /// The probe reported a debug-bus fault. Retrying the same transfer will
    /// not help; the caller may retry the higher-level operation.
    #[error("target reported a debug bus fault ({0:?})")]
    TargetFault(Status),

    #[error("target still busy after {0} wait retries")]
    WaitRetriesExceeded(u32),

    #[error("{unit}-bit access requires address and length aligned to the access width")]
    DataAlignment { unit: u32 },

    #[error("16-bit memory access requires a V2J26 or newer firmware")]
    Access16BitNotSupported,

    #[error("8-bit transfer of {len} bytes exceeds the probe block size of {max}")]
    BlockSizeExceeded { len: u32, max: u32 },

    #[error("payload is shorter than the requested transfer")]
    PayloadTooShort,

    #[error("access port {0} is out of range")]
    ApOutOfRange(u16),

    #[error("command not supported by the probe firmware")]
    CommandNotSupportedByProbe,

    #[error("the probe firmware does not support the {0:?} transport")]
    ModeNotSupported(StLinkMode),

    #[error("probe is in an unknown or unsupported mode")]
    UnknownMode,

    #[error("the probe does not support running at {0} kHz")]
    UnsupportedSpeed(u32),

    #[error("the probe firmware has no trace support for the requested protocol")]
    TraceNotSupported,

    #[error("trace frequency {0} Hz is above the 2 MHz limit")]
    TraceFrequencyTooHigh(u32),

    #[error("no SWO prescaler fits the requested trace frequency")]
    TracePrescalerOutOfRange,

    #[error("no matching ST-Link probe was found")]
    ProbeNotFound,

    #[error("multiple ST-Link probes match; disambiguate with a serial number")]
    MultipleProbesFound,

    #[error("expected USB endpoint not found on the probe")]
    EndpointNotFound,

    #[error("probe selector {0:?} is not of the form VID:PID or VID:PID:SERIAL")]
    InvalidSelector(String),
}
