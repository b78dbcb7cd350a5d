//! The 11-byte message header shared by every transport. Grounded on
//! `include/gracht/types.h`: a little-endian `message_id`/`length` pair
//! followed by the `service_id`/`action_id` routing bytes and a flags byte
//! whose low two bits carry the [`MessageClass`].

use thiserror::Error;

pub const HEADER_SIZE: usize = 11;
pub const DEFAULT_MESSAGE_SIZE: usize = 2048;

const MESSAGE_CLASS_MASK: u8 = 0x3;

/// What kind of reply (if any) a message expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Caller blocks (or polls) for a matching [`MessageClass::Response`].
    Sync = 0,
    /// Caller does not wait; a response may still arrive later.
    Async = 1,
    /// Fire-and-forget notification, never answered.
    Event = 2,
    /// Answers a prior `Sync`/`Async` invocation.
    Response = 3,
}

impl MessageClass {
    pub fn from_flags(flags: u8) -> Self {
        match flags & MESSAGE_CLASS_MASK {
            0 => MessageClass::Sync,
            1 => MessageClass::Async,
            2 => MessageClass::Event,
            _ => MessageClass::Response,
        }
    }

    pub fn to_flags(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer of {0} bytes is shorter than the {HEADER_SIZE}-byte header")]
    Truncated(usize),
}

/// The fixed-size header every message on the wire starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub message_id: u32,
    pub length: u32,
    pub service_id: u8,
    pub action_id: u8,
    pub flags: u8,
}

impl Header {
    pub fn class(&self) -> MessageClass {
        MessageClass::from_flags(self.flags)
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<(), WireError> {
        if out.len() < HEADER_SIZE {
            return Err(WireError::Truncated(out.len()));
        }
        out[0..4].copy_from_slice(&self.message_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        out[8] = self.service_id;
        out[9] = self.action_id;
        out[10] = self.flags;
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Truncated(buf.len()));
        }
        Ok(Self {
            message_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            length: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            service_id: buf[8],
            action_id: buf[9],
            flags: buf[10],
        })
    }
}

/// A growable payload buffer with a write cursor, used both when building an
/// outgoing message and when a handler serialises its arguments.
#[derive(Debug, Default)]
pub struct Buffer {
    pub data: Vec<u8>,
    pub index: usize,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { data: vec![0u8; capacity], index: 0 }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        let end = self.index + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.index..end].copy_from_slice(bytes);
        self.index = end;
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write(&[v]);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write(&v.to_le_bytes());
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.index]
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }
}

/// A cursor over a received payload, used by generated/handwritten handler
/// stubs to pull arguments back out in order.
pub struct Reader<'a> {
    data: &'a [u8],
    pub index: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    pub fn read_u8(&mut self) -> u8 {
        let v = self.data[self.index];
        self.index += 1;
        v
    }

    pub fn read_u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.data[self.index..self.index + 4].try_into().unwrap());
        self.index += 4;
        v
    }

    pub fn read_i32(&mut self) -> i32 {
        let v = i32::from_le_bytes(self.data[self.index..self.index + 4].try_into().unwrap());
        self.index += 4;
        v
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.index..]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Header { message_id: 42, length: 17, service_id: 3, action_id: 9, flags: MessageClass::Event.to_flags() };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf).unwrap();
        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(header, decoded);
        assert_eq!(decoded.class(), MessageClass::Event);
    }

    #[test]
    fn decode_truncated_buffer_errors() {
        let buf = [0u8; 4];
        assert_eq!(Header::decode(&buf), Err(WireError::Truncated(4)));
    }

    #[test]
    fn buffer_write_and_reader_roundtrip() {
        let mut buf = Buffer::with_capacity(HEADER_SIZE);
        buf.write_u32(7);
        buf.write_i32(-3);
        buf.write_u8(9);
        let mut reader = Reader::new(buf.as_slice());
        assert_eq!(reader.read_u32(), 7);
        assert_eq!(reader.read_i32(), -3);
        assert_eq!(reader.read_u8(), 9);
    }
}
