use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use scroll::{Pread, BE, LE};

use crate::constants::{
    commands, JTagFrequencyToDivider, StLinkMode, Status, SwdFrequencyToDelayCount,
    ACCESS_PORT_MAX, TRACE_BUFFER_SIZE, TRACE_MAX_HZ,
};
use crate::error::StlinkError;
use crate::memory::AccessWidth;
use crate::transfer::TransferContext;
use crate::usb_interface::{STLinkUSBDevice, StLinkUsb, TIMEOUT};
use crate::version::{Capabilities, JtagApi, Version};
use crate::DebugProbeSelector;

/// CPUID register; the part number decides the TAR auto-increment page size.
const CPUID: u32 = 0xe000_ed00;

/// Wait-state retries for a single checked command.
const MAX_COMMAND_RETRIES: u32 = 1;

/// How a probe should be opened.
#[derive(Debug, Clone)]
pub struct StLinkConfig {
    pub selector: DebugProbeSelector,
    pub mode: StLinkMode,
    /// Initial interface speed, applied if the firmware supports it.
    pub speed_khz: u32,
    /// Assert the target reset line around mode entry.
    pub connect_under_reset: bool,
}

impl Default for StLinkConfig {
    fn default() -> Self {
        StLinkConfig {
            selector: DebugProbeSelector::default(),
            mode: StLinkMode::DebugSwd,
            speed_khz: 1_800,
            connect_under_reset: false,
        }
    }
}

/// State of the target reset line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NrstState {
    Low,
    High,
    Pulse,
}

impl NrstState {
    fn param(self) -> u8 {
        match self {
            NrstState::Low => commands::DEBUG_DRIVE_NRST_LOW,
            NrstState::High => commands::DEBUG_DRIVE_NRST_HIGH,
            NrstState::Pulse => commands::DEBUG_DRIVE_NRST_PULSE,
        }
    }
}

/// Pin protocol of the SWO trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceProtocol {
    AsyncUart,
    Manchester,
    Sync,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TraceState {
    pub(crate) enabled: bool,
    pub(crate) source_hz: u32,
}

/// A handle to an opened ST-Link.
///
/// The handle is singly owned and not shareable; every operation completes
/// before the next begins. Generic over the transport so the protocol logic
/// can be driven by a mock in tests.
#[derive(Debug)]
pub struct STLink<D: StLinkUsb> {
    pub(crate) device: D,
    pub(crate) version: Version,
    pub(crate) mode: StLinkMode,
    pub(crate) swd_speed_khz: u32,
    pub(crate) jtag_speed_khz: u32,
    /// Largest single transaction, equal to the target's TAR auto-increment
    /// page size.
    pub(crate) mem_packet_limit: u32,
    /// Access ports already initialized on this handle.
    pub(crate) opened_aps: [u64; 4],
    pub(crate) trace: TraceState,
}

impl STLink<STLinkUSBDevice> {
    /// Opens the probe matching `config` and brings it into the requested
    /// mode.
    pub fn open(config: StLinkConfig) -> Result<Self, StlinkError> {
        let device = STLinkUSBDevice::new_from_selector(&config.selector)?;
        let mut probe = STLink::with_device(device, config.mode);

        if let Err(error) = probe.init(&config) {
            match error {
                StlinkError::Transport(_) => {
                    // The probe sometimes wedges mid-command; a USB reset
                    // recovers it.
                    probe.device.reset()?;
                    probe.init(&config)?;
                }
                other => return Err(other),
            }
        }

        Ok(probe)
    }
}

impl<D: StLinkUsb> STLink<D> {
    pub(crate) fn with_device(device: D, mode: StLinkMode) -> Self {
        STLink {
            device,
            version: Version::unprobed(),
            mode,
            swd_speed_khz: 1_800,
            jtag_speed_khz: 1_120,
            mem_packet_limit: 1 << 10,
            opened_aps: [0; 4],
            trace: TraceState::default(),
        }
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn mode(&self) -> StLinkMode {
        self.mode
    }

    /// The configured interface speed for the current transport.
    pub fn speed_khz(&self) -> u32 {
        match self.mode {
            StLinkMode::DebugJtag => self.jtag_speed_khz,
            _ => self.swd_speed_khz,
        }
    }

    /// The SWO capture frequency, if tracing is enabled.
    pub fn trace_frequency(&self) -> Option<u32> {
        self.trace.enabled.then_some(self.trace.source_hz)
    }

    fn init(&mut self, config: &StLinkConfig) -> Result<(), StlinkError> {
        debug!("initializing ST-Link in {:?} mode", config.mode);

        self.probe_version()?;
        debug!("probe firmware {}", self.version);

        self.check_mode_support()?;
        self.init_mode(config.connect_under_reset, config.speed_khz)?;

        if self.mode == StLinkMode::DebugSwim {
            return Ok(());
        }

        self.open_ap(0)?;
        self.detect_autoinc_page();
        Ok(())
    }

    fn check_mode_support(&self) -> Result<(), StlinkError> {
        match self.mode {
            StLinkMode::DebugSwd if self.version.api == JtagApi::V1 => {
                Err(StlinkError::ModeNotSupported(self.mode))
            }
            StLinkMode::DebugJtag if self.version.jtag == 0 => {
                Err(StlinkError::ModeNotSupported(self.mode))
            }
            StLinkMode::DebugSwim if self.version.swim == 0 => {
                Err(StlinkError::ModeNotSupported(self.mode))
            }
            StLinkMode::DebugSwd | StLinkMode::DebugJtag | StLinkMode::DebugSwim => Ok(()),
            _ => Err(StlinkError::UnknownMode),
        }
    }

    /// Queries the firmware revisions and derives the capability flags.
    pub(crate) fn probe_version(&mut self) -> Result<(), StlinkError> {
        let mut ctx = TransferContext::incoming(6);
        ctx.write_u8(commands::GET_VERSION);
        self.device.exchange(&mut ctx, TIMEOUT)?;

        // First word is big-endian: [15:12] generation, [11:6] JTAG,
        // [5:0] SWIM.
        let word: u16 = ctx
            .data()
            .pread_with(0, BE)
            .map_err(|_| StlinkError::ShortReply {
                expected: 6,
                received: ctx.data().len(),
            })?;
        let mut generation = ((word >> 12) & 0x0f) as u8;
        let mut jtag = ((word >> 6) & 0x3f) as u8;
        let mut swim = (word & 0x3f) as u8;

        if generation >= 3 {
            // V3 firmware reports its real revisions only through the
            // extended command. Byte layout: 0 HW, 1 SWIM, 2 JTAG/SWD.
            let mut ctx = TransferContext::incoming(12);
            ctx.write_u8(commands::GET_VERSION_APIV3);
            self.device.exchange(&mut ctx, TIMEOUT)?;
            generation = ctx.data()[0];
            swim = ctx.data()[1];
            jtag = ctx.data()[2];
        }

        self.version = Version::new(generation, jtag, swim);
        Ok(())
    }

    /// Asks the probe which mode it is currently in.
    pub fn get_current_mode(&mut self) -> Result<StLinkMode, StlinkError> {
        trace!("querying current probe mode");
        let mut ctx = TransferContext::incoming(2);
        ctx.write_u8(commands::GET_CURRENT_MODE);
        self.device.exchange(&mut ctx, TIMEOUT)?;

        let mode = StLinkMode::from_device_mode(ctx.data()[0]);
        debug!("probe reports mode {:?}", mode);
        Ok(mode)
    }

    /// Runs the mode init sequence: leave whatever mode the probe is in,
    /// check the target supply, configure the interface speed and enter the
    /// desired mode.
    fn init_mode(&mut self, connect_under_reset: bool, speed_khz: u32) -> Result<(), StlinkError> {
        let current = self.get_current_mode()?;
        if current != StLinkMode::Unknown && current != StLinkMode::Mass {
            if let Err(error) = self.leave_mode(current) {
                debug!("leaving {:?} failed: {}", current, error);
            }
        }

        let current = self.get_current_mode()?;

        // The probe needs target Vdd for reliable debugging; read it here as
        // a connection diagnostic. Not possible while in DFU.
        if current != StLinkMode::Dfu && self.version.flags.contains(Capabilities::TARGET_VOLT) {
            match self.get_target_voltage() {
                Ok(voltage) if voltage < 1.5 => {
                    warn!("target voltage may be too low for reliable debugging ({voltage:.2} V)")
                }
                Ok(_) => {}
                Err(error) => warn!("could not read target voltage: {}", error),
            }
        }

        if matches!(self.mode, StLinkMode::DebugSwd | StLinkMode::DebugJtag)
            && self.version.flags.contains(Capabilities::JTAG_SET_FREQ)
        {
            if let Err(error) = self.set_speed(speed_khz) {
                warn!("could not apply interface speed {} kHz: {}", speed_khz, error);
            }
        }

        // Assert SRST before activating the debug signals, so the target
        // comes up halted. The status is deliberately not checked here; the
        // pin mapping may not be known before mode entry and we assert again
        // right after.
        if connect_under_reset && self.mode != StLinkMode::DebugSwim {
            if let Err(error) = self.drive_nrst(NrstState::Low) {
                debug!("preliminary reset assert failed: {}", error);
            }
        }

        self.enter_mode(self.mode)?;

        if connect_under_reset {
            self.drive_nrst(NrstState::Low)?;
        }

        let current = self.get_current_mode()?;
        debug!("mode after init: {:?}", current);
        Ok(())
    }

    pub(crate) fn enter_mode(&mut self, mode: StLinkMode) -> Result<(), StlinkError> {
        match mode {
            StLinkMode::DebugSwd | StLinkMode::DebugJtag => {
                // API V1 sends no status back on mode entry.
                let checked = self.version.api != JtagApi::V1;
                let mut ctx = if checked {
                    TransferContext::incoming(2)
                } else {
                    TransferContext::no_data()
                };
                ctx.write_u8(commands::DEBUG_COMMAND);
                ctx.write_u8(if checked {
                    commands::DEBUG_APIV2_ENTER
                } else {
                    commands::DEBUG_APIV1_ENTER
                });
                ctx.write_u8(if mode == StLinkMode::DebugJtag {
                    commands::DEBUG_ENTER_JTAG_NO_RESET
                } else {
                    commands::DEBUG_ENTER_SWD_NO_RESET
                });

                if checked {
                    self.command_checked(&mut ctx)
                } else {
                    self.command_unchecked(&mut ctx)
                }
            }
            StLinkMode::DebugSwim => {
                // SWIM enter returns no response or status.
                let mut ctx = TransferContext::no_data();
                ctx.write_u8(commands::SWIM_COMMAND);
                ctx.write_u8(commands::SWIM_ENTER);
                self.command_unchecked(&mut ctx)
            }
            _ => Err(StlinkError::UnknownMode),
        }
    }

    pub(crate) fn leave_mode(&mut self, mode: StLinkMode) -> Result<(), StlinkError> {
        let mut ctx = TransferContext::no_data();
        match mode {
            StLinkMode::DebugSwd | StLinkMode::DebugJtag => {
                ctx.write_u8(commands::DEBUG_COMMAND);
                ctx.write_u8(commands::DEBUG_EXIT);
            }
            StLinkMode::DebugSwim => {
                ctx.write_u8(commands::SWIM_COMMAND);
                ctx.write_u8(commands::SWIM_EXIT);
            }
            StLinkMode::Dfu => {
                ctx.write_u8(commands::DFU_COMMAND);
                ctx.write_u8(commands::DFU_EXIT);
            }
            // Mass storage cannot be left through a command.
            StLinkMode::Mass | StLinkMode::Unknown => return Err(StlinkError::UnknownMode),
        }
        self.command_unchecked(&mut ctx)
    }

    /// Drives the target reset line.
    pub fn drive_nrst(&mut self, state: NrstState) -> Result<(), StlinkError> {
        let mut ctx = TransferContext::incoming(2);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_APIV2_DRIVE_NRST);
        ctx.write_u8(state.param());
        self.command_checked(&mut ctx)
    }

    /// Configures the interface speed, returning the kHz value actually
    /// applied (the nearest supported value at or below the request).
    pub fn set_speed(&mut self, khz: u32) -> Result<u32, StlinkError> {
        match (self.mode, self.version.api) {
            (StLinkMode::DebugSwd | StLinkMode::DebugJtag, JtagApi::V3) => self.set_speed_v3(khz),
            (StLinkMode::DebugSwd, _) => {
                let setting = SwdFrequencyToDelayCount::find_setting(khz)
                    .ok_or(StlinkError::UnsupportedSpeed(khz))?;
                let mut ctx = TransferContext::incoming(2);
                ctx.write_u8(commands::DEBUG_COMMAND);
                ctx.write_u8(commands::DEBUG_APIV2_SWD_SET_FREQ);
                ctx.write_u8(setting as u8);
                self.command_checked(&mut ctx)?;
                self.swd_speed_khz = setting.to_khz();
                Ok(self.swd_speed_khz)
            }
            (StLinkMode::DebugJtag, _) => {
                let setting = JTagFrequencyToDivider::find_setting(khz)
                    .ok_or(StlinkError::UnsupportedSpeed(khz))?;
                let mut ctx = TransferContext::incoming(2);
                ctx.write_u8(commands::DEBUG_COMMAND);
                ctx.write_u8(commands::DEBUG_APIV2_JTAG_SET_FREQ);
                ctx.write_u8(setting as u8);
                self.command_checked(&mut ctx)?;
                self.jtag_speed_khz = setting.to_khz();
                Ok(self.jtag_speed_khz)
            }
            _ => Err(StlinkError::CommandNotSupportedByProbe),
        }
    }

    fn com_protocol_param(&self) -> u8 {
        if self.mode == StLinkMode::DebugJtag {
            commands::DEBUG_APIV3_COM_JTAG
        } else {
            commands::DEBUG_APIV3_COM_SWD
        }
    }

    fn set_speed_v3(&mut self, khz: u32) -> Result<u32, StlinkError> {
        let (available, _) = self.get_com_frequencies()?;

        let actual = available
            .into_iter()
            .filter(|speed| *speed <= khz)
            .max()
            .ok_or(StlinkError::UnsupportedSpeed(khz))?;

        self.set_com_frequency(actual)?;

        match self.mode {
            StLinkMode::DebugSwd => self.swd_speed_khz = actual,
            StLinkMode::DebugJtag => self.jtag_speed_khz = actual,
            _ => {}
        }
        Ok(actual)
    }

    /// Returns the available and current communication frequencies (V3 only).
    fn get_com_frequencies(&mut self) -> Result<(Vec<u32>, u32), StlinkError> {
        let mut ctx = TransferContext::incoming(52);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_APIV3_GET_COM_FREQ);
        ctx.write_u8(self.com_protocol_param());
        self.command_checked(&mut ctx)?;

        let mut values = ctx
            .data()
            .chunks_exact(4)
            .map(|chunk| chunk.pread_with::<u32>(0, LE).unwrap())
            .collect::<Vec<u32>>();

        let current = values[1];
        let count = values[2].min(10) as usize;
        values.rotate_left(3);
        values.truncate(count);

        Ok((values, current))
    }

    fn set_com_frequency(&mut self, khz: u32) -> Result<(), StlinkError> {
        let mut ctx = TransferContext::incoming(8);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_APIV3_SET_COM_FREQ);
        ctx.write_u8(self.com_protocol_param());
        ctx.write_u8(0);
        ctx.write_u32(khz);
        self.command_checked(&mut ctx)
    }

    /// Initializes an access port on this handle. Idempotent; a no-op on
    /// firmware without AP init support.
    pub fn open_ap(&mut self, apsel: u16) -> Result<(), StlinkError> {
        if !self.version.flags.contains(Capabilities::AP_INIT) {
            return Ok(());
        }
        if apsel > ACCESS_PORT_MAX {
            return Err(StlinkError::ApOutOfRange(apsel));
        }
        if self.ap_is_open(apsel) {
            return Ok(());
        }

        trace!("JTAG_INIT_AP {}", apsel);
        let mut ctx = TransferContext::incoming(2);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_APIV2_INIT_AP);
        ctx.write_u8(apsel as u8);
        self.command_checked(&mut ctx)?;

        self.mark_ap_open(apsel);
        debug!("AP {} enabled", apsel);
        Ok(())
    }

    fn ap_is_open(&self, apsel: u16) -> bool {
        self.opened_aps[(apsel / 64) as usize] & (1 << (apsel % 64)) != 0
    }

    fn mark_ap_open(&mut self, apsel: u16) {
        self.opened_aps[(apsel / 64) as usize] |= 1 << (apsel % 64);
    }

    /// Sends a command and surfaces framing errors only.
    pub(crate) fn command_unchecked(
        &mut self,
        ctx: &mut TransferContext,
    ) -> Result<(), StlinkError> {
        self.device.exchange(ctx, TIMEOUT)
    }

    /// Sends a command, validates the status prefix of the reply and retries
    /// bounded wait states with an exponential backoff.
    pub(crate) fn command_checked(&mut self, ctx: &mut TransferContext) -> Result<(), StlinkError> {
        let mut retries = 0;
        loop {
            self.device.exchange(ctx, TIMEOUT)?;

            let first = *ctx.data().first().ok_or(StlinkError::ShortReply {
                expected: 2,
                received: 0,
            })?;
            match Status::from(first) {
                Status::JtagOk => return Ok(()),
                status if status.is_wait() && retries < MAX_COMMAND_RETRIES => {
                    trace!("probe busy ({:?}), retrying", status);
                    thread::sleep(Duration::from_millis(1u64 << retries));
                    retries += 1;
                }
                status if status.is_wait() => {
                    return Err(StlinkError::WaitRetriesExceeded(retries))
                }
                status if status.is_fault() => {
                    warn!("command failed: {:?}", status);
                    return Err(StlinkError::TargetFault(status));
                }
                status => return Err(StlinkError::UnexpectedStatus(status)),
            }
        }
    }

    /// Reads the target supply voltage through the probe's ADC pair.
    pub fn get_target_voltage(&mut self) -> Result<f32, StlinkError> {
        if !self.version.flags.contains(Capabilities::TARGET_VOLT) {
            return Err(StlinkError::CommandNotSupportedByProbe);
        }

        let mut ctx = TransferContext::incoming(8);
        ctx.write_u8(commands::GET_TARGET_VOLTAGE);
        self.command_unchecked(&mut ctx)?;

        let mut reply = ctx.reply();
        let reference = reply.read_u32()?;
        let sample = reply.read_u32()?;

        let voltage = if reference > 0 {
            2.0 * sample as f32 * 1.2 / reference as f32
        } else {
            0.0
        };
        debug!("target voltage: {:.2} V", voltage);
        Ok(voltage)
    }

    /// Reads the target's debug port ID code. Returns 0 in SWIM mode, which
    /// has no such concept.
    pub fn get_idcode(&mut self) -> Result<u32, StlinkError> {
        if self.mode == StLinkMode::DebugSwim {
            return Ok(0);
        }

        if self.version.api == JtagApi::V1 {
            let mut ctx = TransferContext::incoming(4);
            ctx.write_u8(commands::DEBUG_COMMAND);
            ctx.write_u8(commands::DEBUG_READ_CORE_ID);
            self.command_unchecked(&mut ctx)?;
            ctx.reply().read_u32()
        } else {
            let mut ctx = TransferContext::incoming(12);
            ctx.write_u8(commands::DEBUG_COMMAND);
            ctx.write_u8(commands::DEBUG_APIV2_READ_IDCODES);
            self.command_checked(&mut ctx)?;
            let mut reply = ctx.reply();
            reply.skip(4)?;
            reply.read_u32()
        }
    }

    /// Starts SWO capture at `trace_hz`, returning the TPIU prescaler the
    /// caller has to program into the target.
    pub fn enable_trace(
        &mut self,
        protocol: TraceProtocol,
        trace_hz: u32,
        clock_in_hz: u32,
    ) -> Result<u16, StlinkError> {
        if !self.version.flags.contains(Capabilities::TRACE)
            || protocol != TraceProtocol::AsyncUart
        {
            return Err(StlinkError::TraceNotSupported);
        }
        if trace_hz > TRACE_MAX_HZ {
            return Err(StlinkError::TraceFrequencyTooHigh(trace_hz));
        }
        let trace_hz = if trace_hz == 0 { TRACE_MAX_HZ } else { trace_hz };

        let mut prescaler = clock_in_hz / trace_hz;
        if clock_in_hz % trace_hz > 0 {
            prescaler += 1;
        }
        if prescaler > u16::MAX as u32 {
            return Err(StlinkError::TracePrescalerOutOfRange);
        }

        // A previous capture may still be running.
        self.disable_trace()?;

        let mut ctx = TransferContext::incoming(2);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_APIV2_START_TRACE_RX);
        ctx.write_u16(TRACE_BUFFER_SIZE);
        ctx.write_u32(trace_hz);
        self.command_checked(&mut ctx)?;

        self.trace = TraceState {
            enabled: true,
            source_hz: trace_hz,
        };
        debug!("SWO capture enabled at {} Hz", trace_hz);
        Ok(prescaler as u16)
    }

    /// Stops SWO capture.
    pub fn disable_trace(&mut self) -> Result<(), StlinkError> {
        let mut ctx = TransferContext::incoming(2);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_APIV2_STOP_TRACE_RX);
        self.command_checked(&mut ctx)?;
        self.trace.enabled = false;
        Ok(())
    }

    /// Drains pending SWO bytes into `buf`, returning how many were read.
    pub fn poll_trace(&mut self, buf: &mut [u8]) -> Result<usize, StlinkError> {
        if !self.trace.enabled {
            return Ok(0);
        }

        let mut ctx = TransferContext::incoming(2);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_APIV2_GET_TRACE_NB);
        self.command_unchecked(&mut ctx)?;

        let available = ctx.reply().read_u16()? as usize;
        let wanted = available.min(buf.len());
        if wanted == 0 {
            return Ok(0);
        }
        self.device.read_trace(&mut buf[..wanted], TIMEOUT)
    }

    /// Cortex-M3/M4 auto-increment over 4 KiB instead of the default 1 KiB;
    /// the CPUID part number tells them apart.
    fn detect_autoinc_page(&mut self) {
        let mut word = Vec::with_capacity(4);
        match self.read_mem(CPUID, AccessWidth::Bit32, 1, &mut word) {
            Ok(()) => {
                let cpuid: u32 = word.as_slice().pread_with(0, LE).unwrap_or(0);
                let part = (cpuid >> 4) & 0xf;
                if part == 3 || part == 4 {
                    self.mem_packet_limit = 1 << 12;
                }
                debug!("TAR auto-increment page: {} bytes", self.mem_packet_limit);
            }
            Err(error) => debug!("CPUID read failed, keeping 1 KiB pages: {}", error),
        }
    }
}

impl<D: StLinkUsb> Drop for STLink<D> {
    fn drop(&mut self) {
        // Leave whatever debug mode we were in; nothing to be done about
        // failures at this point.
        let _ = self.leave_mode(self.mode);
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::*;
    use crate::constants::device_mode;
    use crate::transfer::Direction;

    #[derive(Debug)]
    struct MockUsb {
        hw_version: u8,
        jtag_version: u8,
        swim_version: u8,
        target_voltage: (u32, u32),
        current_mode: u8,
        /// Scripted status bytes for checked debug commands; empty means OK.
        statuses: VecDeque<u8>,
        commands_seen: Vec<Vec<u8>>,
    }

    impl MockUsb {
        fn new(hw_version: u8, jtag_version: u8, swim_version: u8) -> Self {
            MockUsb {
                hw_version,
                jtag_version,
                swim_version,
                target_voltage: (0x1000, 0x0800),
                current_mode: device_mode::DEBUG,
                statuses: VecDeque::new(),
                commands_seen: Vec::new(),
            }
        }

        fn build(self, mode: StLinkMode) -> STLink<MockUsb> {
            let mut probe = STLink::with_device(self, mode);
            probe.probe_version().expect("version probe failed");
            probe
        }
    }

    impl StLinkUsb for MockUsb {
        fn exchange(
            &mut self,
            ctx: &mut TransferContext,
            _timeout: Duration,
        ) -> Result<(), StlinkError> {
            self.commands_seen.push(ctx.command().to_vec());

            match ctx.command()[0] {
                commands::GET_VERSION => {
                    let word: u16 = ((self.hw_version as u16) << 12)
                        | ((self.jtag_version as u16) << 6)
                        | self.swim_version as u16;
                    ctx.data[0] = (word >> 8) as u8;
                    ctx.data[1] = word as u8;
                }
                commands::GET_VERSION_APIV3 => {
                    ctx.data[0] = self.hw_version;
                    ctx.data[1] = self.swim_version;
                    ctx.data[2] = self.jtag_version;
                }
                commands::GET_CURRENT_MODE => ctx.data[0] = self.current_mode,
                commands::GET_TARGET_VOLTAGE => {
                    ctx.data[..4].copy_from_slice(&self.target_voltage.0.to_le_bytes());
                    ctx.data[4..8].copy_from_slice(&self.target_voltage.1.to_le_bytes());
                }
                commands::DEBUG_COMMAND => match ctx.command()[1] {
                    commands::DEBUG_READ_CORE_ID => {
                        ctx.data.copy_from_slice(&0x1ba0_1477u32.to_le_bytes());
                    }
                    commands::DEBUG_APIV2_READ_IDCODES => {
                        ctx.data[0] = 0x80;
                        ctx.data[4..8].copy_from_slice(&0x2ba0_1477u32.to_le_bytes());
                    }
                    commands::DEBUG_APIV2_GET_TRACE_NB => {
                        ctx.data[..2].copy_from_slice(&32u16.to_le_bytes());
                    }
                    _ => {
                        if ctx.direction() == Direction::In && !ctx.data.is_empty() {
                            ctx.data[0] = self.statuses.pop_front().unwrap_or(0x80);
                        }
                    }
                },
                _ => {}
            }
            Ok(())
        }

        fn reset(&mut self) -> Result<(), StlinkError> {
            Ok(())
        }

        fn read_trace(
            &mut self,
            read_data: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, StlinkError> {
            Ok(read_data.len())
        }
    }

    fn debug_commands(probe: &STLink<MockUsb>, subcommand: u8) -> usize {
        probe
            .device
            .commands_seen
            .iter()
            .filter(|cmd| cmd[0] == commands::DEBUG_COMMAND && cmd[1] == subcommand)
            .count()
    }

    #[test]
    fn version_word_decodes_into_fields() {
        let probe = MockUsb::new(2, 26, 7).build(StLinkMode::DebugSwd);

        assert_eq!(probe.version().generation, 2);
        assert_eq!(probe.version().jtag, 26);
        assert_eq!(probe.version().swim, 7);
        assert_eq!(probe.version().api, JtagApi::V2);
        assert!(probe
            .version()
            .supports(Capabilities::MEM_16BIT | Capabilities::AP_INIT));
    }

    #[test]
    fn v3_uses_the_extended_version_command() {
        let probe = MockUsb::new(3, 7, 1).build(StLinkMode::DebugSwd);

        assert!(probe
            .device
            .commands_seen
            .iter()
            .any(|cmd| cmd[0] == commands::GET_VERSION_APIV3));
        assert_eq!(probe.version().jtag, 7);
        assert_eq!(probe.version().api, JtagApi::V3);
    }

    #[test]
    fn ap_init_is_idempotent() {
        let mut probe = MockUsb::new(2, 28, 0).build(StLinkMode::DebugSwd);

        probe.open_ap(1).expect("first AP init failed");
        probe.open_ap(1).expect("second AP init failed");

        assert_eq!(debug_commands(&probe, commands::DEBUG_APIV2_INIT_AP), 1);
    }

    #[test]
    fn ap_init_is_a_noop_on_old_firmware() {
        let mut probe = MockUsb::new(2, 20, 0).build(StLinkMode::DebugSwd);

        probe.open_ap(1).expect("AP init should be skipped");
        assert_eq!(debug_commands(&probe, commands::DEBUG_APIV2_INIT_AP), 0);
    }

    #[test]
    fn ap_number_is_bounded() {
        let mut probe = MockUsb::new(2, 28, 0).build(StLinkMode::DebugSwd);

        match probe.open_ap(256) {
            Err(StlinkError::ApOutOfRange(256)) => {}
            other => panic!("expected out-of-range error, got {other:?}"),
        }
    }

    #[test]
    fn voltage_is_derived_from_the_adc_pair() {
        let mut probe = MockUsb::new(2, 27, 0).build(StLinkMode::DebugSwd);

        let voltage = probe.get_target_voltage().unwrap();
        assert!((voltage - 1.2).abs() < 1e-6, "got {voltage}");
    }

    #[test]
    fn voltage_requires_firmware_support() {
        let mut probe = MockUsb::new(2, 12, 0).build(StLinkMode::DebugSwd);

        match probe.get_target_voltage() {
            Err(StlinkError::CommandNotSupportedByProbe) => {}
            other => panic!("expected unsupported-command error, got {other:?}"),
        }
    }

    #[test]
    fn checked_command_retries_on_wait() {
        let mut mock = MockUsb::new(2, 27, 0);
        mock.statuses = VecDeque::from([0x02]);
        let mut probe = mock.build(StLinkMode::DebugSwd);

        probe.drive_nrst(NrstState::Pulse).expect("retry failed");
        assert_eq!(debug_commands(&probe, commands::DEBUG_APIV2_DRIVE_NRST), 2);
    }

    #[test]
    fn checked_command_does_not_retry_on_fault() {
        let mut mock = MockUsb::new(2, 27, 0);
        mock.statuses = VecDeque::from([0x08]);
        let mut probe = mock.build(StLinkMode::DebugSwd);

        match probe.drive_nrst(NrstState::Pulse) {
            Err(StlinkError::TargetFault(Status::TargetFault)) => {}
            other => panic!("expected target fault, got {other:?}"),
        }
        assert_eq!(debug_commands(&probe, commands::DEBUG_APIV2_DRIVE_NRST), 1);
    }

    #[test]
    fn checked_command_gives_up_after_bounded_waits() {
        let mut mock = MockUsb::new(2, 27, 0);
        mock.statuses = VecDeque::from([0x02, 0x14, 0x12]);
        let mut probe = mock.build(StLinkMode::DebugSwd);

        match probe.drive_nrst(NrstState::Pulse) {
            Err(StlinkError::WaitRetriesExceeded(_)) => {}
            other => panic!("expected wait exhaustion, got {other:?}"),
        }
        assert_eq!(debug_commands(&probe, commands::DEBUG_APIV2_DRIVE_NRST), 2);
    }

    #[test]
    fn mode_entry_uses_the_v2_command_set() {
        let mut probe = MockUsb::new(2, 26, 0).build(StLinkMode::DebugSwd);

        probe.init_mode(false, 1_800).expect("init failed");

        let enter = probe
            .device
            .commands_seen
            .iter()
            .find(|cmd| cmd[0] == commands::DEBUG_COMMAND && cmd[1] == commands::DEBUG_APIV2_ENTER)
            .expect("no mode entry seen");
        assert_eq!(enter[2], commands::DEBUG_ENTER_SWD_NO_RESET);

        // The probe was in debug mode, so init must have left it first.
        assert!(debug_commands(&probe, commands::DEBUG_EXIT) >= 1);
        assert_eq!(debug_commands(&probe, commands::DEBUG_APIV2_SWD_SET_FREQ), 1);
        assert_eq!(probe.speed_khz(), 1_800);
    }

    #[test]
    fn connect_under_reset_asserts_srst_around_entry() {
        let mut probe = MockUsb::new(2, 26, 0).build(StLinkMode::DebugSwd);

        probe.init_mode(true, 1_800).expect("init failed");

        let commands_seen = &probe.device.commands_seen;
        let first_nrst = commands_seen
            .iter()
            .position(|cmd| {
                cmd[0] == commands::DEBUG_COMMAND && cmd[1] == commands::DEBUG_APIV2_DRIVE_NRST
            })
            .expect("no reset assert seen");
        let entry = commands_seen
            .iter()
            .position(|cmd| {
                cmd[0] == commands::DEBUG_COMMAND && cmd[1] == commands::DEBUG_APIV2_ENTER
            })
            .expect("no mode entry seen");

        assert!(first_nrst < entry, "reset must be asserted before entry");
        assert_eq!(debug_commands(&probe, commands::DEBUG_APIV2_DRIVE_NRST), 2);
        for cmd in commands_seen
            .iter()
            .filter(|cmd| cmd[0] == commands::DEBUG_COMMAND && cmd[1] == commands::DEBUG_APIV2_DRIVE_NRST)
        {
            assert_eq!(cmd[2], commands::DEBUG_DRIVE_NRST_LOW);
        }
    }

    #[test]
    fn idcode_comes_from_offset_four_on_api_v2() {
        let mut probe = MockUsb::new(2, 26, 0).build(StLinkMode::DebugSwd);

        assert_eq!(probe.get_idcode().unwrap(), 0x2ba0_1477);
        assert_eq!(debug_commands(&probe, commands::DEBUG_APIV2_READ_IDCODES), 1);
    }

    #[test]
    fn idcode_uses_the_core_id_command_on_api_v1() {
        let mut probe = MockUsb::new(1, 11, 0).build(StLinkMode::DebugJtag);

        assert_eq!(probe.get_idcode().unwrap(), 0x1ba0_1477);
        assert_eq!(debug_commands(&probe, commands::DEBUG_READ_CORE_ID), 1);
    }

    #[test]
    fn idcode_is_zero_in_swim_mode() {
        let mut probe = MockUsb::new(2, 26, 6).build(StLinkMode::DebugSwim);

        let before = probe.device.commands_seen.len();
        assert_eq!(probe.get_idcode().unwrap(), 0);
        assert_eq!(probe.device.commands_seen.len(), before);
    }

    #[test]
    fn trace_needs_firmware_support_and_async_uart() {
        let mut probe = MockUsb::new(2, 12, 0).build(StLinkMode::DebugSwd);
        assert!(matches!(
            probe.enable_trace(TraceProtocol::AsyncUart, 2_000_000, 80_000_000),
            Err(StlinkError::TraceNotSupported)
        ));

        let mut probe = MockUsb::new(2, 27, 0).build(StLinkMode::DebugSwd);
        assert!(matches!(
            probe.enable_trace(TraceProtocol::Manchester, 2_000_000, 80_000_000),
            Err(StlinkError::TraceNotSupported)
        ));
    }

    #[test]
    fn trace_prescaler_is_rounded_up_and_bounded() {
        let mut probe = MockUsb::new(2, 27, 0).build(StLinkMode::DebugSwd);

        // 80 MHz / 2 MHz = 40, exactly.
        assert_eq!(
            probe
                .enable_trace(TraceProtocol::AsyncUart, 2_000_000, 80_000_000)
                .unwrap(),
            40
        );
        // 80 MHz / 1.75 MHz rounds up.
        assert_eq!(
            probe
                .enable_trace(TraceProtocol::AsyncUart, 1_750_000, 80_000_000)
                .unwrap(),
            46
        );

        assert!(matches!(
            probe.enable_trace(TraceProtocol::AsyncUart, 3_000_000, 80_000_000),
            Err(StlinkError::TraceFrequencyTooHigh(_))
        ));
        assert!(matches!(
            probe.enable_trace(TraceProtocol::AsyncUart, 1_000, 80_000_000),
            Err(StlinkError::TracePrescalerOutOfRange)
        ));
    }

    #[test]
    fn trace_polling_reads_the_pending_byte_count() {
        let mut probe = MockUsb::new(2, 27, 0).build(StLinkMode::DebugSwd);

        let mut buf = [0u8; 16];
        // Not enabled yet: nothing is read.
        assert_eq!(probe.poll_trace(&mut buf).unwrap(), 0);

        probe
            .enable_trace(TraceProtocol::AsyncUart, 2_000_000, 80_000_000)
            .unwrap();
        assert_eq!(probe.trace_frequency(), Some(2_000_000));
        // The mock reports 32 pending bytes; our buffer caps it at 16.
        assert_eq!(probe.poll_trace(&mut buf).unwrap(), 16);
        assert_eq!(debug_commands(&probe, commands::DEBUG_APIV2_GET_TRACE_NB), 1);
    }

    #[test]
    fn unsupported_transports_are_rejected() {
        let probe = MockUsb::new(1, 11, 0).build(StLinkMode::DebugSwd);
        assert!(matches!(
            probe.check_mode_support(),
            Err(StlinkError::ModeNotSupported(StLinkMode::DebugSwd))
        ));

        let probe = MockUsb::new(2, 26, 0).build(StLinkMode::DebugSwim);
        assert!(matches!(
            probe.check_mode_support(),
            Err(StlinkError::ModeNotSupported(StLinkMode::DebugSwim))
        ));

        let probe = MockUsb::new(2, 26, 6).build(StLinkMode::Dfu);
        assert!(matches!(
            probe.check_mode_support(),
            Err(StlinkError::UnknownMode)
        ));
    }
}
