//! Fixed-capacity outgoing packet buffers and a little-endian writer.
//!
//! [`PacketBuffer`] is the payload type stored in the status packet pool.
//! [`BufferWriter`] appends primitive values in little-endian order and
//! refuses writes that would not fit instead of reallocating.

use heapless::Vec as HVec;

use crate::error::Error;

/// Maximum encoded packet size in bytes.
pub const PACKET_CAPACITY: usize = 128;

/// Encoded packet bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketBuffer {
    bytes: HVec<u8, PACKET_CAPACITY>,
}

impl PacketBuffer {
    /// Creates an empty buffer.
    pub const fn new() -> Self {
        Self { bytes: HVec::new() }
    }

    /// Encoded bytes written so far.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of encoded bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if nothing has been written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Discards the contents.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Starts appending to the end of the buffer.
    pub fn writer(&mut self) -> BufferWriter<'_> {
        BufferWriter {
            bytes: &mut self.bytes,
        }
    }
}

/// Appends little-endian values to a [`PacketBuffer`].
///
/// ```rust
/// use rs_railnode::packet::PacketBuffer;
///
/// let mut packet = PacketBuffer::new();
/// packet.writer().u8(1).unwrap().u16(0x0203).unwrap();
/// assert_eq!(packet.as_bytes(), &[1, 3, 2]);
/// ```
#[derive(Debug)]
pub struct BufferWriter<'a> {
    bytes: &'a mut HVec<u8, PACKET_CAPACITY>,
}

impl BufferWriter<'_> {
    /// Bytes still available.
    #[inline]
    pub fn remaining(&self) -> usize {
        PACKET_CAPACITY - self.bytes.len()
    }

    /// Appends raw bytes.
    pub fn bytes(&mut self, data: &[u8]) -> Result<&mut Self, Error> {
        let remaining = self.remaining();
        if data.len() > remaining {
            return Err(Error::PacketOverflow {
                needed: data.len(),
                remaining,
            });
        }
        // Length was checked above, so this cannot fail.
        let _ = self.bytes.extend_from_slice(data);
        Ok(self)
    }

    /// Appends one byte.
    pub fn u8(&mut self, value: u8) -> Result<&mut Self, Error> {
        self.bytes(&[value])
    }

    /// Appends a signed byte.
    pub fn i8(&mut self, value: i8) -> Result<&mut Self, Error> {
        self.bytes(&value.to_le_bytes())
    }

    /// Appends a `u16`.
    pub fn u16(&mut self, value: u16) -> Result<&mut Self, Error> {
        self.bytes(&value.to_le_bytes())
    }

    /// Appends an `i32`.
    pub fn i32(&mut self, value: i32) -> Result<&mut Self, Error> {
        self.bytes(&value.to_le_bytes())
    }

    /// Appends a `u32`.
    pub fn u32(&mut self, value: u32) -> Result<&mut Self, Error> {
        self.bytes(&value.to_le_bytes())
    }

    /// Appends a `u64`.
    pub fn u64(&mut self, value: u64) -> Result<&mut Self, Error> {
        self.bytes(&value.to_le_bytes())
    }

    /// Appends an `f32`.
    pub fn f32(&mut self, value: f32) -> Result<&mut Self, Error> {
        self.bytes(&value.to_le_bytes())
    }

    /// Appends a string prefixed with its `u8` length, truncated to 255 bytes.
    pub fn short_str(&mut self, value: &str) -> Result<&mut Self, Error> {
        let len = value.len().min(u8::MAX as usize);
        self.u8(len as u8)?.bytes(&value.as_bytes()[..len])
    }
}
