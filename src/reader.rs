//! Byte cursor over JPEG segment data.

use std::mem;

use bytemuck::AnyBitPattern;

use crate::error::{Error, Result};

/// A bounds-checked big-endian cursor.
///
/// Every read either succeeds completely or fails with [`Error::BufferExhausted`] without moving
/// the cursor.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, position: 0 }
    }

    /// Returns the whole underlying buffer, independent of the cursor position.
    #[inline]
    pub fn buf(&self) -> &'a [u8] {
        self.buf
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > self.buf.len() {
            return Err(Error::BufferExhausted);
        }
        self.position = position;
        Ok(())
    }

    /// Moves the cursor by `delta` bytes in either direction.
    pub fn seek(&mut self, delta: isize) -> Result<()> {
        let target = self
            .position
            .checked_add_signed(delta)
            .ok_or(Error::BufferExhausted)?;
        self.set_position(target)
    }

    #[inline]
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.position..]
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.position >= self.buf.len()
    }

    /// Peeks at the byte `offset` bytes past the cursor.
    pub fn check_byte(&self, offset: usize) -> Result<u8> {
        self.position
            .checked_add(offset)
            .and_then(|pos| self.buf.get(pos))
            .copied()
            .ok_or(Error::BufferExhausted)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = self.check_byte(0)?;
        self.position += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_array::<2>()?;
        Ok(u16::from_be_bytes(bytes))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_array::<4>()?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.read_slice(N)?;
        let mut out = [0; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_slice(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining().len() < count {
            Err(Error::BufferExhausted)
        } else {
            let slice = &self.remaining()[..count];
            self.position += count;
            Ok(slice)
        }
    }

    pub fn read_obj<T: AnyBitPattern>(&mut self) -> Result<&'a T> {
        debug_assert_eq!(mem::align_of::<T>(), 1);

        let bytes = self.read_slice(mem::size_of::<T>())?;
        Ok(bytemuck::from_bytes(bytes))
    }

    pub fn read_objs<T: AnyBitPattern>(&mut self, count: usize) -> Result<&'a [T]> {
        debug_assert_eq!(mem::align_of::<T>(), 1);

        let byte_count = count
            .checked_mul(mem::size_of::<T>())
            .ok_or(Error::BufferExhausted)?;
        let bytes = self.read_slice(byte_count)?;
        Ok(bytemuck::cast_slice(bytes))
    }

    /// Reads a segment length field and returns the number of payload bytes that follow it.
    ///
    /// The length parameter counts itself, but not the `FF xx` marker.
    pub fn read_length(&mut self) -> Result<usize> {
        let start = self.position;
        let len = self.read_u16()?;
        if len < 2 {
            self.position = start;
            return Err(Error::BadData(format!("invalid segment length {len}")));
        }
        Ok(usize::from(len - 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_reads() {
        let mut reader = Reader::new(&[0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE]);
        assert_eq!(reader.read_u8().unwrap(), 0x12);
        assert_eq!(reader.read_u16().unwrap(), 0x3456);
        assert_eq!(reader.read_u32().unwrap(), 0x789ABCDE);
        assert!(reader.is_empty());
        assert_eq!(reader.read_u8(), Err(Error::BufferExhausted));
    }

    #[test]
    fn failed_read_keeps_position() {
        let mut reader = Reader::new(&[0xFF, 0xD8, 0x00]);
        reader.read_u16().unwrap();
        assert_eq!(reader.read_u16(), Err(Error::BufferExhausted));
        assert_eq!(reader.position(), 2);
        assert_eq!(reader.read_u32(), Err(Error::BufferExhausted));
        assert_eq!(reader.position(), 2);
        assert_eq!(reader.read_u8().unwrap(), 0x00);
    }

    #[test]
    fn peek_and_seek() {
        let mut reader = Reader::new(&[1, 2, 3, 4]);
        assert_eq!(reader.check_byte(3).unwrap(), 4);
        assert_eq!(reader.check_byte(4), Err(Error::BufferExhausted));
        reader.read_u8().unwrap();
        assert_eq!(reader.check_byte(usize::MAX), Err(Error::BufferExhausted));
        reader.seek(-1).unwrap();
        reader.seek(3).unwrap();
        assert_eq!(reader.read_u8().unwrap(), 4);
        reader.seek(-2).unwrap();
        assert_eq!(reader.read_u8().unwrap(), 3);
        assert_eq!(reader.seek(-10), Err(Error::BufferExhausted));
        assert_eq!(reader.seek(5), Err(Error::BufferExhausted));
        assert_eq!(reader.position(), 3);
    }

    #[test]
    fn segment_length() {
        let mut reader = Reader::new(&[0x00, 0x04, 0xAA, 0xBB]);
        assert_eq!(reader.read_length().unwrap(), 2);

        let mut reader = Reader::new(&[0x00, 0x01]);
        assert!(matches!(reader.read_length(), Err(Error::BadData(_))));
        assert_eq!(reader.position(), 0);
    }
}
