//! Quantization tables.

use std::fmt;

use crate::error::{bail, Result};

/// Number of quantization table destinations.
pub const MAX_QUANT_TABLES: usize = 4;

/// Maps zigzag scan position to natural (row-major) coefficient index.
pub const ZIGZAG_TO_NATURAL: [u8; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, //
    17, 24, 32, 25, 18, 11, 4, 5, //
    12, 19, 26, 33, 40, 48, 41, 34, //
    27, 20, 13, 6, 7, 14, 21, 28, //
    35, 42, 49, 56, 57, 50, 43, 36, //
    29, 22, 15, 23, 30, 37, 44, 51, //
    58, 59, 52, 45, 38, 31, 39, 46, //
    53, 60, 61, 54, 47, 55, 62, 63,
];

/// Element precision of a quantization table (the DQT `Pq` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantPrecision {
    /// `Pq = 0`.
    Bits8,
    /// `Pq = 1`. Only meaningful with 12-bit sample precision.
    Bits16,
}

impl QuantPrecision {
    pub fn from_pq(pq: u8) -> Result<Self> {
        match pq {
            0 => Ok(Self::Bits8),
            1 => Ok(Self::Bits16),
            _ => bail!("invalid quantization table precision Pq={pq} (0 and 1 are allowed)"),
        }
    }

    /// Size of the table elements in bytes.
    #[inline]
    pub fn element_size(self) -> usize {
        match self {
            Self::Bits8 => 1,
            Self::Bits16 => 2,
        }
    }
}

/// The table elements exactly as transmitted (zigzag order).
#[derive(Clone, PartialEq, Eq)]
pub enum RawQuant {
    Bits8([u8; 64]),
    Bits16([u16; 64]),
}

/// A quantization table, as installed by a DQT segment.
#[derive(Clone)]
pub struct QuantTable {
    id: u8,
    raw: RawQuant,
    /// Natural-order copy used for dequantization.
    dequant: [u16; 64],
}

impl QuantTable {
    /// Builds a table from the raw big-endian elements of a DQT entry.
    ///
    /// `raw` must hold exactly `64 * precision.element_size()` bytes.
    pub fn build(id: u8, precision: QuantPrecision, raw: &[u8]) -> Result<Self> {
        if usize::from(id) >= MAX_QUANT_TABLES {
            bail!("invalid quantization table destination Tq={id} (0-3 are allowed)");
        }
        if raw.len() != 64 * precision.element_size() {
            bail!(
                "quantization table {id} has {} bytes of data, expected {}",
                raw.len(),
                64 * precision.element_size(),
            );
        }

        let raw = match precision {
            QuantPrecision::Bits8 => {
                let mut values = [0; 64];
                values.copy_from_slice(raw);
                RawQuant::Bits8(values)
            }
            QuantPrecision::Bits16 => {
                let mut values = [0; 64];
                for (dest, src) in values.iter_mut().zip(raw.chunks_exact(2)) {
                    *dest = u16::from_be_bytes([src[0], src[1]]);
                }
                RawQuant::Bits16(values)
            }
        };

        let dequant = dezigzag(&widen(&raw));
        Ok(Self { id, raw, dequant })
    }

    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    #[inline]
    pub fn precision(&self) -> QuantPrecision {
        match self.raw {
            RawQuant::Bits8(_) => QuantPrecision::Bits8,
            RawQuant::Bits16(_) => QuantPrecision::Bits16,
        }
    }

    #[inline]
    pub fn raw(&self) -> &RawQuant {
        &self.raw
    }

    /// Returns the raw table in transmission order, widened to 16 bits.
    pub fn as_u16(&self) -> [u16; 64] {
        widen(&self.raw)
    }

    /// Returns the dequantization multipliers in natural order.
    #[inline]
    pub fn dequant(&self) -> &[u16; 64] {
        &self.dequant
    }
}

fn widen(raw: &RawQuant) -> [u16; 64] {
    match raw {
        RawQuant::Bits8(values) => values.map(u16::from),
        RawQuant::Bits16(values) => *values,
    }
}

fn dezigzag(zigzag: &[u16; 64]) -> [u16; 64] {
    let mut natural = [0; 64];
    for (k, &value) in zigzag.iter().enumerate() {
        natural[usize::from(ZIGZAG_TO_NATURAL[k])] = value;
    }
    natural
}

impl fmt::Debug for QuantTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuantTable")
            .field("Tq", &self.id)
            .field("precision", &self.precision())
            .field("Qk", &self.as_u16())
            .finish()
    }
}

/// The quantization tables installed in a decoder.
#[derive(Debug, Clone, Default)]
pub struct QuantTables {
    tables: [Option<QuantTable>; MAX_QUANT_TABLES],
}

impl QuantTables {
    pub fn set(&mut self, table: QuantTable) {
        let id = usize::from(table.id);
        self.tables[id] = Some(table);
    }

    pub fn get(&self, id: u8) -> Option<&QuantTable> {
        self.tables.get(usize::from(id))?.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuantTable> {
        self.tables.iter().flatten()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
