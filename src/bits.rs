//! Bit-level reader for entropy-coded segments.

use crate::{
    error::{Error, Result},
    marker::Marker,
};

/// Reads bits MSB-first from entropy-coded data, removing `0xFF 0x00` byte stuffing.
///
/// Refilling stops in front of the first marker, so bits of the following segment are never
/// returned. The marker is only consumed by [`BitReader::read_restart_marker`].
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    /// Offset of the next byte to load into `acc`.
    position: usize,
    /// Buffered bits, left-aligned (the next bit is the MSB).
    acc: u64,
    left: u32, // 0-64 bits left in `acc`
    /// Code of the marker at `position`, once refilling has run into it.
    marker: Option<u8>,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            acc: 0,
            left: 0,
            marker: None,
        }
    }

    /// Loads bytes until at least 57 bits are buffered, the data ends or a marker is reached.
    fn refill(&mut self) {
        while self.left <= 56 && self.marker.is_none() {
            let Some(&byte) = self.data.get(self.position) else {
                return;
            };
            if byte != 0xFF {
                self.push(byte);
                self.position += 1;
                continue;
            }

            // Skip `0xFF` fill bytes to find out what this sequence is.
            let mut offset = 1;
            loop {
                match self.data.get(self.position + offset) {
                    None => return,
                    Some(0xFF) => offset += 1,
                    Some(0x00) => {
                        self.push(0xFF);
                        self.position += offset + 1;
                        break;
                    }
                    Some(&code) => {
                        self.position += offset - 1;
                        self.marker = Some(code);
                        return;
                    }
                }
            }
        }
    }

    #[inline]
    fn push(&mut self, byte: u8) {
        self.acc |= u64::from(byte) << (56 - self.left);
        self.left += 8;
    }

    /// Peeks at the next `n` bits, or returns `None` if fewer than `n` bits remain before the
    /// end of the data or the next marker.
    #[inline]
    pub fn peek(&mut self, n: u32) -> Option<u32> {
        debug_assert!(n > 0 && n <= 32);
        if self.left < n {
            self.refill();
            if self.left < n {
                return None;
            }
        }
        Some((self.acc >> (64 - n)) as u32)
    }

    #[inline]
    pub fn consume(&mut self, n: u32) {
        debug_assert!(n <= self.left);
        self.acc = self.acc.checked_shl(n).unwrap_or(0);
        self.left -= n;
    }

    pub fn read_bits(&mut self, n: u32) -> Result<u32> {
        if n == 0 {
            return Ok(0);
        }
        let bits = self.peek(n).ok_or(Error::BufferExhausted)?;
        self.consume(n);
        Ok(bits)
    }

    /// Reads an `s`-bit magnitude category value and sign-extends it (F.2.2.1 `EXTEND`).
    pub fn receive_extend(&mut self, s: u8) -> Result<i32> {
        if s == 0 {
            return Ok(0);
        }
        if s > 16 {
            return Err(Error::bad_data(format!("invalid magnitude category {s}")));
        }
        let s = u32::from(s);
        let v = self.read_bits(s)? as i32;
        if v < 1 << (s - 1) {
            Ok(v - (1 << s) + 1)
        } else {
            Ok(v)
        }
    }

    /// Discards buffered bits and consumes the next `RSTn` marker, returning `n`.
    ///
    /// Any entropy-coded bytes between the current position and the marker are skipped. Running
    /// into a different marker is an error.
    pub fn read_restart_marker(&mut self) -> Result<u8> {
        if self.left >= 8 {
            log::trace!("discarding {} buffered bits before restart marker", self.left);
        }
        self.acc = 0;
        self.left = 0;
        self.marker = None;

        let code = loop {
            let Some(found) = self.data[self.position..].iter().position(|&b| b == 0xFF) else {
                self.position = self.data.len();
                return Err(Error::BufferExhausted);
            };
            self.position += found;
            let mut offset = 1;
            while self.data.get(self.position + offset) == Some(&0xFF) {
                offset += 1;
            }
            match self.data.get(self.position + offset) {
                None => return Err(Error::BufferExhausted),
                Some(0x00) => self.position += offset + 1,
                Some(&code) => {
                    self.position += offset + 1;
                    break code;
                }
            }
        };

        match Marker::from_code(code) {
            Marker::Rst(n) => Ok(n),
            other => Err(Error::bad_data(format!(
                "expected restart marker in scan data, found {other}"
            ))),
        }
    }

    /// Returns the number of input bytes that have been loaded or skipped.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }
}
