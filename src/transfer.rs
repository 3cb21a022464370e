use scroll::{Pread, LE};

use crate::error::StlinkError;

/// Data-phase direction of a single probe transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The probe sends a reply on the bulk IN endpoint.
    In,
    /// The host sends a payload on the bulk OUT endpoint after the command.
    Out,
    /// The command stands alone.
    NoData,
}

/// A single command/data exchange in flight.
///
/// The command buffer is built up through the little-endian writers and
/// zero-padded to the fixed command packet size by the transport. `data`
/// carries the payload in the chosen direction: pre-sized for a reply on
/// [`Direction::In`], filled with the outgoing bytes on [`Direction::Out`].
#[derive(Debug)]
pub struct TransferContext {
    pub(crate) cmd: Vec<u8>,
    pub(crate) data: Vec<u8>,
    pub(crate) direction: Direction,
}

impl TransferContext {
    /// A transaction expecting `reply_len` bytes back from the probe.
    pub fn incoming(reply_len: usize) -> Self {
        TransferContext {
            cmd: Vec::new(),
            data: vec![0; reply_len],
            direction: Direction::In,
        }
    }

    /// A transaction sending `payload` after the command packet.
    pub fn outgoing(payload: &[u8]) -> Self {
        TransferContext {
            cmd: Vec::new(),
            data: payload.to_vec(),
            direction: Direction::Out,
        }
    }

    /// A bare command with no data phase.
    pub fn no_data() -> Self {
        TransferContext {
            cmd: Vec::new(),
            data: Vec::new(),
            direction: Direction::NoData,
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.cmd.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.cmd.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.cmd.extend_from_slice(&value.to_le_bytes());
    }

    pub fn command(&self) -> &[u8] {
        &self.cmd
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Starts consuming the reply from the beginning.
    pub fn reply(&self) -> ReplyReader<'_> {
        ReplyReader {
            buf: &self.data,
            offset: 0,
        }
    }
}

/// Consumes little-endian fields from a reply buffer in declared order.
#[derive(Debug)]
pub struct ReplyReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl ReplyReader<'_> {
    fn short(&self, want: usize) -> StlinkError {
        StlinkError::ShortReply {
            expected: self.offset + want,
            received: self.buf.len(),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, StlinkError> {
        let value = self
            .buf
            .pread_with::<u8>(self.offset, LE)
            .map_err(|_| self.short(1))?;
        self.offset += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16, StlinkError> {
        let value = self
            .buf
            .pread_with::<u16>(self.offset, LE)
            .map_err(|_| self.short(2))?;
        self.offset += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32, StlinkError> {
        let value = self
            .buf
            .pread_with::<u32>(self.offset, LE)
            .map_err(|_| self.short(4))?;
        self.offset += 4;
        Ok(value)
    }

    pub fn skip(&mut self, count: usize) -> Result<(), StlinkError> {
        if self.offset + count > self.buf.len() {
            return Err(self.short(count));
        }
        self.offset += count;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_fields_are_little_endian() {
        let mut ctx = TransferContext::incoming(4);
        ctx.write_u8(0xf2);
        ctx.write_u8(0x07);
        ctx.write_u32(0x2000_0004);
        ctx.write_u16(0x0124);

        assert_eq!(
            ctx.command(),
            &[0xf2, 0x07, 0x04, 0x00, 0x00, 0x20, 0x24, 0x01]
        );
        assert_eq!(ctx.direction(), Direction::In);
        assert_eq!(ctx.data().len(), 4);
    }

    #[test]
    fn reply_fields_consumed_in_order() {
        let mut ctx = TransferContext::incoming(8);
        ctx.data.copy_from_slice(&[0x80, 0x00, 0x34, 0x12, 0xef, 0xbe, 0xad, 0xde]);

        let mut reply = ctx.reply();
        assert_eq!(reply.read_u16().unwrap(), 0x0080);
        assert_eq!(reply.read_u16().unwrap(), 0x1234);
        assert_eq!(reply.read_u32().unwrap(), 0xdead_beef);
    }

    #[test]
    fn short_reply_is_an_error() {
        let ctx = TransferContext::incoming(3);
        let mut reply = ctx.reply();
        reply.read_u16().unwrap();
        match reply.read_u32() {
            Err(StlinkError::ShortReply { expected, received }) => {
                assert_eq!(expected, 6);
                assert_eq!(received, 3);
            }
            other => panic!("expected short-reply error, got {other:?}"),
        }
    }

    #[test]
    fn outgoing_carries_the_payload() {
        let ctx = TransferContext::outgoing(&[1, 2, 3]);
        assert_eq!(ctx.direction(), Direction::Out);
        assert_eq!(ctx.data(), &[1, 2, 3]);

        let ctx = TransferContext::no_data();
        assert_eq!(ctx.direction(), Direction::NoData);
        assert!(ctx.data().is_empty());
    }
}
