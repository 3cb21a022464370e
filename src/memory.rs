use std::ops::{Deref, DerefMut};
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use crate::constants::{commands, StLinkMode, Status};
use crate::error::StlinkError;
use crate::stlink::STLink;
use crate::transfer::TransferContext;
use crate::usb_interface::StLinkUsb;
use crate::version::Capabilities;

/// Wait-state retries for a whole memory chunk.
const MAX_WAIT_RETRIES: u32 = 8;

/// Access width of a bulk memory transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Bit8,
    Bit16,
    Bit32,
}

impl AccessWidth {
    pub fn bytes(self) -> u32 {
        match self {
            AccessWidth::Bit8 => 1,
            AccessWidth::Bit16 => 2,
            AccessWidth::Bit32 => 4,
        }
    }
}

/// Outcome of a single wire transfer, after consulting the probe's
/// read/write status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RwOutcome {
    Complete,
    TargetWait,
}

/// Core and banked registers as returned by the all-registers readout, in
/// wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetRegisters {
    pub status: u32,
    pub r: [u32; 16],
    pub xpsr: u32,
    pub msp: u32,
    pub psp: u32,
    pub rw: u32,
    pub rw2: u32,
}

/// Keeps the probe in a debug mode for the scope of a register operation and
/// leaves it again on every exit path.
struct DebugModeGuard<'a, D: StLinkUsb> {
    probe: &'a mut STLink<D>,
    mode: StLinkMode,
}

impl<D: StLinkUsb> Deref for DebugModeGuard<'_, D> {
    type Target = STLink<D>;

    fn deref(&self) -> &STLink<D> {
        self.probe
    }
}

impl<D: StLinkUsb> DerefMut for DebugModeGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut STLink<D> {
        self.probe
    }
}

impl<D: StLinkUsb> Drop for DebugModeGuard<'_, D> {
    fn drop(&mut self) {
        let _ = self.probe.leave_mode(self.mode);
    }
}

impl<D: StLinkUsb> STLink<D> {
    /// Largest single 8-bit transfer the probe accepts.
    pub fn block_size(&self) -> u32 {
        if self.version.generation >= 3 {
            512
        } else {
            64
        }
    }

    /// Bytes left until the next TAR auto-increment page boundary. Wide
    /// transfers must not cross it.
    fn autoinc_bytes_left(&self, addr: u32) -> u32 {
        self.mem_packet_limit - (addr % self.mem_packet_limit)
    }

    fn swd_scope(&mut self) -> Result<DebugModeGuard<'_, D>, StlinkError> {
        self.enter_mode(StLinkMode::DebugSwd)?;
        Ok(DebugModeGuard {
            probe: self,
            mode: StLinkMode::DebugSwd,
        })
    }

    /// Reads `count` elements of `width` starting at `addr`, appending the
    /// raw bytes to `out`.
    ///
    /// The transfer is decomposed to respect the target's alignment rules,
    /// the auto-increment page size and the probe's packet limits: an
    /// unaligned head and a short tail go out as 8-bit transfers, everything
    /// in between at the requested width. 16-bit requests fall back to 8-bit
    /// transparently on firmware without 16-bit support.
    pub fn read_mem(
        &mut self,
        mut addr: u32,
        width: AccessWidth,
        count: u32,
        out: &mut Vec<u8>,
    ) -> Result<(), StlinkError> {
        let mut remaining = count * width.bytes();

        let mut width = width;
        if width == AccessWidth::Bit16 && !self.version.flags.contains(Capabilities::MEM_16BIT) {
            debug!("no 16-bit transfer support, falling back to 8-bit");
            width = AccessWidth::Bit8;
        }

        let mut retries = 0;
        while remaining > 0 {
            let limit = if width == AccessWidth::Bit8 {
                self.block_size()
            } else {
                self.autoinc_bytes_left(addr)
            };
            let mut chunk = remaining.min(limit);

            let outcome = if width == AccessWidth::Bit8 {
                self.read_mem8(addr, chunk as u16, out)?
            } else {
                let align = width.bytes();
                let offset = addr % align;
                if offset != 0 {
                    // Unaligned head, transferred at byte granularity.
                    chunk = align - offset;
                    self.read_mem8(addr, chunk as u16, out)?
                } else if chunk < align {
                    // Tail shorter than one element.
                    self.read_mem(addr, AccessWidth::Bit8, chunk, out)?;
                    RwOutcome::Complete
                } else {
                    chunk -= chunk % align;
                    if width == AccessWidth::Bit16 {
                        self.read_mem16(addr, chunk as u16, out)?
                    } else {
                        self.read_mem32(addr, chunk as u16, out)?
                    }
                }
            };

            match outcome {
                RwOutcome::Complete => {
                    addr += chunk;
                    remaining -= chunk;
                }
                RwOutcome::TargetWait => {
                    if retries >= MAX_WAIT_RETRIES {
                        return Err(StlinkError::WaitRetriesExceeded(retries));
                    }
                    trace!("target wait, backing off {} ms", 1u64 << retries);
                    thread::sleep(Duration::from_millis(1u64 << retries));
                    retries += 1;
                }
            }
        }

        Ok(())
    }

    /// Writes `count` elements of `width` from `data` to target memory
    /// starting at `addr`. Decomposition mirrors [`Self::read_mem`].
    pub fn write_mem(
        &mut self,
        mut addr: u32,
        width: AccessWidth,
        count: u32,
        data: &[u8],
    ) -> Result<(), StlinkError> {
        let mut remaining = count * width.bytes();
        if (data.len() as u32) < remaining {
            return Err(StlinkError::PayloadTooShort);
        }

        let mut width = width;
        if width == AccessWidth::Bit16 && !self.version.flags.contains(Capabilities::MEM_16BIT) {
            debug!("no 16-bit transfer support, falling back to 8-bit");
            width = AccessWidth::Bit8;
        }

        let mut pos = 0usize;
        let mut retries = 0;
        while remaining > 0 {
            let limit = if width == AccessWidth::Bit8 {
                self.block_size()
            } else {
                self.autoinc_bytes_left(addr)
            };
            let mut chunk = remaining.min(limit);

            let outcome = if width == AccessWidth::Bit8 {
                self.write_mem8(addr, &data[pos..pos + chunk as usize])?
            } else {
                let align = width.bytes();
                let offset = addr % align;
                if offset != 0 {
                    chunk = align - offset;
                    self.write_mem8(addr, &data[pos..pos + chunk as usize])?
                } else if chunk < align {
                    self.write_mem(addr, AccessWidth::Bit8, chunk, &data[pos..pos + chunk as usize])?;
                    RwOutcome::Complete
                } else {
                    chunk -= chunk % align;
                    if width == AccessWidth::Bit16 {
                        self.write_mem16(addr, &data[pos..pos + chunk as usize])?
                    } else {
                        self.write_mem32(addr, &data[pos..pos + chunk as usize])?
                    }
                }
            };

            match outcome {
                RwOutcome::Complete => {
                    addr += chunk;
                    pos += chunk as usize;
                    remaining -= chunk;
                }
                RwOutcome::TargetWait => {
                    if retries >= MAX_WAIT_RETRIES {
                        return Err(StlinkError::WaitRetriesExceeded(retries));
                    }
                    trace!("target wait, backing off {} ms", 1u64 << retries);
                    thread::sleep(Duration::from_millis(1u64 << retries));
                    retries += 1;
                }
            }
        }

        Ok(())
    }

    fn read_mem8(
        &mut self,
        addr: u32,
        len: u16,
        out: &mut Vec<u8>,
    ) -> Result<RwOutcome, StlinkError> {
        if len as u32 > self.block_size() {
            return Err(StlinkError::BlockSizeExceeded {
                len: len as u32,
                max: self.block_size(),
            });
        }

        // The probe replies with an even byte count; a single-byte read is
        // padded to two and the extra byte dropped below.
        let reply_len = if len == 1 { 2 } else { len as usize };

        let mut ctx = TransferContext::incoming(reply_len);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_READMEM_8BIT);
        ctx.write_u32(addr);
        ctx.write_u16(len);
        self.command_unchecked(&mut ctx)?;

        let outcome = self.get_rw_status()?;
        if outcome == RwOutcome::Complete {
            out.extend_from_slice(&ctx.data()[..len as usize]);
        }
        Ok(outcome)
    }

    fn read_mem16(
        &mut self,
        addr: u32,
        len: u16,
        out: &mut Vec<u8>,
    ) -> Result<RwOutcome, StlinkError> {
        if !self.version.flags.contains(Capabilities::MEM_16BIT) {
            return Err(StlinkError::Access16BitNotSupported);
        }
        if addr % 2 != 0 || len % 2 != 0 {
            return Err(StlinkError::DataAlignment { unit: 16 });
        }

        let mut ctx = TransferContext::incoming(len as usize);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_APIV2_READMEM_16BIT);
        ctx.write_u32(addr);
        ctx.write_u16(len);
        self.command_unchecked(&mut ctx)?;

        let outcome = self.get_rw_status()?;
        if outcome == RwOutcome::Complete {
            out.extend_from_slice(ctx.data());
        }
        Ok(outcome)
    }

    fn read_mem32(
        &mut self,
        addr: u32,
        len: u16,
        out: &mut Vec<u8>,
    ) -> Result<RwOutcome, StlinkError> {
        if addr % 4 != 0 || len % 4 != 0 {
            return Err(StlinkError::DataAlignment { unit: 32 });
        }

        let mut ctx = TransferContext::incoming(len as usize);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_READMEM_32BIT);
        ctx.write_u32(addr);
        ctx.write_u16(len);
        self.command_unchecked(&mut ctx)?;

        let outcome = self.get_rw_status()?;
        if outcome == RwOutcome::Complete {
            out.extend_from_slice(ctx.data());
        }
        Ok(outcome)
    }

    fn write_mem8(&mut self, addr: u32, payload: &[u8]) -> Result<RwOutcome, StlinkError> {
        if payload.len() as u32 > self.block_size() {
            return Err(StlinkError::BlockSizeExceeded {
                len: payload.len() as u32,
                max: self.block_size(),
            });
        }

        let mut ctx = TransferContext::outgoing(payload);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_WRITEMEM_8BIT);
        ctx.write_u32(addr);
        ctx.write_u16(payload.len() as u16);
        self.command_unchecked(&mut ctx)?;

        self.get_rw_status()
    }

    fn write_mem16(&mut self, addr: u32, payload: &[u8]) -> Result<RwOutcome, StlinkError> {
        if !self.version.flags.contains(Capabilities::MEM_16BIT) {
            return Err(StlinkError::Access16BitNotSupported);
        }
        if addr % 2 != 0 || payload.len() % 2 != 0 {
            return Err(StlinkError::DataAlignment { unit: 16 });
        }

        let mut ctx = TransferContext::outgoing(payload);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_APIV2_WRITEMEM_16BIT);
        ctx.write_u32(addr);
        ctx.write_u16(payload.len() as u16);
        self.command_unchecked(&mut ctx)?;

        self.get_rw_status()
    }

    fn write_mem32(&mut self, addr: u32, payload: &[u8]) -> Result<RwOutcome, StlinkError> {
        if addr % 4 != 0 || payload.len() % 4 != 0 {
            return Err(StlinkError::DataAlignment { unit: 32 });
        }

        let mut ctx = TransferContext::outgoing(payload);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_WRITEMEM_32BIT);
        ctx.write_u32(addr);
        ctx.write_u16(payload.len() as u16);
        self.command_unchecked(&mut ctx)?;

        self.get_rw_status()
    }

    /// Asks the probe how the last memory transfer went.
    fn get_rw_status(&mut self) -> Result<RwOutcome, StlinkError> {
        let (subcommand, reply_len) = if self.version.flags.contains(Capabilities::RW_STATUS_12) {
            (commands::DEBUG_APIV2_GET_RW_STATUS_EXT, 12)
        } else {
            (commands::DEBUG_APIV2_GET_RW_STATUS, 2)
        };

        let mut ctx = TransferContext::incoming(reply_len);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(subcommand);
        self.command_unchecked(&mut ctx)?;

        match Status::from(ctx.data()[0]) {
            Status::JtagOk => Ok(RwOutcome::Complete),
            status if status.is_wait() => Ok(RwOutcome::TargetWait),
            status if status.is_fault() => Err(StlinkError::TargetFault(status)),
            status => Err(StlinkError::UnexpectedStatus(status)),
        }
    }

    /// Reads every core register in one probe transaction.
    pub fn read_all_regs(&mut self) -> Result<TargetRegisters, StlinkError> {
        let mut scope = self.swd_scope()?;

        let mut ctx = TransferContext::incoming(84);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_APIV2_READ_ALL_REGS);
        scope.command_unchecked(&mut ctx)?;

        let mut reply = ctx.reply();
        let mut regs = TargetRegisters {
            status: reply.read_u32()?,
            ..Default::default()
        };
        for r in regs.r.iter_mut() {
            *r = reply.read_u32()?;
        }
        regs.xpsr = reply.read_u32()?;
        regs.msp = reply.read_u32()?;
        regs.psp = reply.read_u32()?;
        regs.rw = reply.read_u32()?;
        regs.rw2 = reply.read_u32()?;
        Ok(regs)
    }

    /// Reads a single core register by its numeric index.
    pub fn read_reg(&mut self, id: u8) -> Result<u32, StlinkError> {
        let mut scope = self.swd_scope()?;

        let mut ctx = TransferContext::incoming(8);
        ctx.write_u8(commands::DEBUG_COMMAND);
        ctx.write_u8(commands::DEBUG_APIV2_READ_REG);
        ctx.write_u8(id);
        scope.command_unchecked(&mut ctx)?;

        let mut reply = ctx.reply();
        reply.skip(4)?;
        reply.read_u32()
    }
}
