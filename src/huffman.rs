//! Canonical Huffman tables (ITU T.81 Annex C) and symbol decoding.

use core::fmt;

use crate::{
    bits::BitReader,
    error::{bail, Error, Result},
};

/// Number of Huffman table destinations per class.
pub const MAX_HUFF_TABLES: usize = 4;
/// Maximum number of symbols in a DC table.
pub const MAX_DC_VALUES: usize = 12;
/// Maximum number of symbols in an AC table.
pub const MAX_AC_VALUES: usize = 162;

const LOOKAHEAD_BITS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableClass {
    Dc,
    Ac,
}

impl TableClass {
    /// Maps the `Tc` field of a DHT table to a class.
    pub fn from_tc(tc: u8) -> Result<Self> {
        match tc {
            0 => Ok(Self::Dc),
            1 => Ok(Self::Ac),
            err => bail!("invalid table class Tc={err} (only 0 and 1 are valid)"),
        }
    }

    /// Maximum number of values a table of this class may hold.
    #[inline]
    pub fn capacity(self) -> usize {
        match self {
            Self::Dc => MAX_DC_VALUES,
            Self::Ac => MAX_AC_VALUES,
        }
    }
}

/// A built Huffman table, ready for decoding.
///
/// Instances only exist after [`HuffmanTable::build`] has validated the code lengths and
/// symbols, so a table that is present in a decoder is always usable.
#[derive(Clone)]
pub struct HuffmanTable {
    class: TableClass,
    id: u8,
    bits: [u8; 16],
    values: Vec<u8>,
    /// Largest code of each length (index = length), `-1` if there are no codes of that length.
    maxcode: [i32; 17],
    /// Smallest code of each length.
    mincode: [i32; 17],
    /// Index into `values` of the first symbol with a code of each length.
    valptr: [i32; 17],
    /// `(length << 8) | value` for every code of at most 8 bits, indexed by the next 8 input bits.
    /// 0 means the prefix belongs to a longer code.
    lookahead: Box<[u16; 1 << LOOKAHEAD_BITS]>,
}

impl HuffmanTable {
    /// Builds a table from the `Li` code counts and the `Vij` symbols of a DHT segment.
    pub fn build(id: u8, class: TableClass, bits: &[u8; 16], values: &[u8]) -> Result<Self> {
        if usize::from(id) >= MAX_HUFF_TABLES {
            bail!("invalid Huffman table destination Th={id} (0-3 are allowed)");
        }
        let count: usize = bits.iter().map(|&l| usize::from(l)).sum();
        if count > class.capacity() {
            bail!(
                "{:?} Huffman table {id} defines {count} codes (at most {} are allowed)",
                class,
                class.capacity(),
            );
        }
        if count != values.len() {
            bail!(
                "Huffman table {id} defines {count} codes, but {} values",
                values.len()
            );
        }

        let codes = generate_codes(bits, values)?;

        let mut maxcode = [-1; 17];
        let mut mincode = [0; 17];
        let mut valptr = [0; 17];
        let mut index = 0;
        for (length, &code_count) in bits.iter().enumerate() {
            let length = length + 1;
            if code_count == 0 {
                continue;
            }
            valptr[length] = index as i32;
            mincode[length] = i32::from(codes[index].0);
            index += usize::from(code_count);
            maxcode[length] = i32::from(codes[index - 1].0);
        }

        let mut lookahead = Box::new([0u16; 1 << LOOKAHEAD_BITS]);
        for &(code, lookup) in &codes {
            let shift = match LOOKAHEAD_BITS.checked_sub(u32::from(lookup.bits)) {
                Some(shift) => shift,
                None => break,
            };
            let first = usize::from(code) << shift;
            let entry = u16::from(lookup.bits) << 8 | u16::from(lookup.value);
            lookahead[first..first + (1 << shift)].fill(entry);
        }

        Ok(Self {
            class,
            id,
            bits: *bits,
            values: values.to_vec(),
            maxcode,
            mincode,
            valptr,
            lookahead,
        })
    }

    #[inline]
    pub fn class(&self) -> TableClass {
        self.class
    }

    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Returns the number of codes of each length (1 to 16 bits).
    #[inline]
    pub fn bits(&self) -> &[u8; 16] {
        &self.bits
    }

    /// Returns the symbols, in order of increasing code length.
    #[inline]
    pub fn values(&self) -> &[u8] {
        &self.values
    }

    /// Decodes the next symbol from `reader`.
    pub(crate) fn decode(&self, reader: &mut BitReader<'_>) -> Result<u8> {
        if let Some(peek) = reader.peek(LOOKAHEAD_BITS) {
            let entry = self.lookahead[peek as usize];
            if entry != 0 {
                reader.consume(u32::from(entry >> 8));
                return Ok(entry as u8);
            }
        }

        // Bit-at-a-time decode (F.2.2.3).
        let mut code = reader.read_bits(1)? as i32;
        for length in 1..=16 {
            if code <= self.maxcode[length] {
                let index = self.valptr[length] + code - self.mincode[length];
                return Ok(self.values[index as usize]);
            }
            if length == 16 {
                break;
            }
            code = (code << 1) | reader.read_bits(1)? as i32;
        }

        Err(Error::bad_data(format!(
            "undefined code in {:?} Huffman table {}",
            self.class, self.id
        )))
    }
}

/// Generates the canonical code of every symbol.
///
/// The result is stored in the least significant bits of each `u16`.
fn generate_codes(
    num_codes_per_length: &[u8; 16],
    values: &[u8],
) -> Result<Vec<(u16, LookupResult)>> {
    let mut out = Vec::with_capacity(values.len());

    // The following is similar in function to the flowcharts in Annex C
    // (`Generate_size_table` and `Generate_code_table`)
    let mut next_code = 0u32;
    let mut value_iter = values.iter();
    for (code_length, &code_count) in num_codes_per_length.iter().enumerate() {
        let code_length = (code_length + 1) as u8; // 1-based

        for _ in 0..code_count {
            let value = *value_iter
                .next()
                .ok_or_else(|| Error::bad_data("Huffman table has fewer values than codes"))?;
            out.push((next_code as u16, LookupResult::new(code_length, value)));
            next_code += 1;
        }

        // The all-ones code of each length is reserved, so reaching it means the code space is
        // overfull.
        if next_code >= 1 << code_length && code_count != 0 {
            bail!("Huffman code lengths overflow {code_length}-bit code space");
        }
        next_code <<= 1;
    }

    Ok(out)
}

impl fmt::Debug for HuffmanTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes = generate_codes(&self.bits, &self.values).map_err(|_| fmt::Error)?;
        for (code, lookup) in codes {
            let bits = lookup.bits;
            let value = lookup.value;
            writeln!(
                f,
                "{bits} {:01$b} -> {2:02x}",
                code,
                usize::from(bits),
                value,
            )?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct LookupResult {
    /// Length of the huffman code in bits (number of bits that need to be consumed from the input).
    bits: u8,
    /// Decoded value. Meaning depends on table class (AC/DC).
    value: u8,
}

impl LookupResult {
    fn new(bits: u8, value: u8) -> Self {
        Self { bits, value }
    }
}

// Standard tables from ITU T.81 Annex K.3. Motion-JPEG streams commonly omit their DHT segments and
// expect decoders to use these.
const STD_DC_LUMA_BITS: [u8; 16] = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
const STD_DC_CHROMA_BITS: [u8; 16] = [0, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0];
const STD_DC_VALUES: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

const STD_AC_LUMA_BITS: [u8; 16] = [0, 2, 1, 3, 3, 2, 4, 3, 5, 5, 4, 4, 0, 0, 1, 0x7d];
const STD_AC_LUMA_VALUES: [u8; 162] = [
    0x01, 0x02, 0x03, 0x00, 0x04, 0x11, 0x05, 0x12, 0x21, 0x31, 0x41, 0x06, 0x13, 0x51, 0x61, 0x07,
    0x22, 0x71, 0x14, 0x32, 0x81, 0x91, 0xa1, 0x08, 0x23, 0x42, 0xb1, 0xc1, 0x15, 0x52, 0xd1, 0xf0,
    0x24, 0x33, 0x62, 0x72, 0x82, 0x09, 0x0a, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x25, 0x26, 0x27, 0x28,
    0x29, 0x2a, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49,
    0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69,
    0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89,
    0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7,
    0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3, 0xc4, 0xc5,
    0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe1, 0xe2,
    0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9, 0xea, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa,
];

const STD_AC_CHROMA_BITS: [u8; 16] = [0, 2, 1, 2, 4, 4, 3, 4, 7, 5, 4, 4, 0, 1, 2, 0x77];
const STD_AC_CHROMA_VALUES: [u8; 162] = [
    0x00, 0x01, 0x02, 0x03, 0x11, 0x04, 0x05, 0x21, 0x31, 0x06, 0x12, 0x41, 0x51, 0x07, 0x61, 0x71,
    0x13, 0x22, 0x32, 0x81, 0x08, 0x14, 0x42, 0x91, 0xa1, 0xb1, 0xc1, 0x09, 0x23, 0x33, 0x52, 0xf0,
    0x15, 0x62, 0x72, 0xd1, 0x0a, 0x16, 0x24, 0x34, 0xe1, 0x25, 0xf1, 0x17, 0x18, 0x19, 0x1a, 0x26,
    0x27, 0x28, 0x29, 0x2a, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48,
    0x49, 0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68,
    0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87,
    0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5,
    0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3,
    0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda,
    0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9, 0xea, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa,
];

impl HuffmanTable {
    /// Returns the Annex K table for destination `id` (0 = luminance, 1 = chrominance).
    pub fn standard(class: TableClass, id: u8) -> Option<Self> {
        let (bits, values): (&[u8; 16], &[u8]) = match (class, id) {
            (TableClass::Dc, 0) => (&STD_DC_LUMA_BITS, &STD_DC_VALUES),
            (TableClass::Dc, 1) => (&STD_DC_CHROMA_BITS, &STD_DC_VALUES),
            (TableClass::Ac, 0) => (&STD_AC_LUMA_BITS, &STD_AC_LUMA_VALUES),
            (TableClass::Ac, 1) => (&STD_AC_CHROMA_BITS, &STD_AC_CHROMA_VALUES),
            _ => return None,
        };
        Self::build(id, class, bits, values).ok()
    }
}

/// The DC and AC tables installed in a decoder.
#[derive(Debug, Clone, Default)]
pub struct HuffmanTables {
    dc: [Option<HuffmanTable>; MAX_HUFF_TABLES],
    ac: [Option<HuffmanTable>; MAX_HUFF_TABLES],
}

impl HuffmanTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `table`, replacing any table with the same class and destination.
    pub fn set(&mut self, table: HuffmanTable) {
        let id = usize::from(table.id);
        match table.class {
            TableClass::Dc => self.dc[id] = Some(table),
            TableClass::Ac => self.ac[id] = Some(table),
        }
    }

    pub fn get(&self, class: TableClass, id: u8) -> Option<&HuffmanTable> {
        let slot = match class {
            TableClass::Dc => self.dc.get(usize::from(id))?,
            TableClass::Ac => self.ac.get(usize::from(id))?,
        };
        slot.as_ref()
    }

    /// Iterates over the installed tables of `class`, in destination order.
    pub fn iter(&self, class: TableClass) -> impl Iterator<Item = &HuffmanTable> {
        let tables = match class {
            TableClass::Dc => &self.dc,
            TableClass::Ac => &self.ac,
        };
        tables.iter().flatten()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
impl HuffmanTable {
    /// Returns the code of `value` and its length in bits.
    pub(crate) fn encode(&self, value: u8) -> Option<(u16, u8)> {
        generate_codes(&self.bits, &self.values)
            .ok()?
            .into_iter()
            .find(|(_, lookup)| lookup.value == value)
            .map(|(code, lookup)| (code, lookup.bits))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    // Default tables from ITU T.81 Annex K.3.
    pub(crate) const LUMA_DC_BITS: [u8; 16] = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
    pub(crate) const LUMA_DC_VALUES: [u8; 12] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b,
    ];

    #[test]
    fn tablegen() {
        let tbl = HuffmanTable::build(0, TableClass::Dc, &LUMA_DC_BITS, &LUMA_DC_VALUES).unwrap();
        expect_test::expect![[r#"
            2 00 -> 00
            3 010 -> 01
            3 011 -> 02
            3 100 -> 03
            3 101 -> 04
            3 110 -> 05
            4 1110 -> 06
            5 11110 -> 07
            6 111110 -> 08
            7 1111110 -> 09
            8 11111110 -> 0a
            9 111111110 -> 0b

        "#]]
        .assert_debug_eq(&tbl);
    }

    #[test]
    fn decode_symbols() {
        let tbl = HuffmanTable::build(0, TableClass::Dc, &LUMA_DC_BITS, &LUMA_DC_VALUES).unwrap();

        // 00 | 011 | 111111110 | 1110, padded with 1s
        let data = [0b0001_1111, 0b1111_1011, 0b1011_1111];
        let mut reader = BitReader::new(&data);
        assert_eq!(tbl.decode(&mut reader).unwrap(), 0x00);
        assert_eq!(tbl.decode(&mut reader).unwrap(), 0x02);
        assert_eq!(tbl.decode(&mut reader).unwrap(), 0x0b);
        assert_eq!(tbl.decode(&mut reader).unwrap(), 0x06);
    }

    #[test]
    fn undefined_code() {
        let tbl = HuffmanTable::build(1, TableClass::Dc, &LUMA_DC_BITS, &LUMA_DC_VALUES).unwrap();
        // Sixteen 1 bits do not prefix any code in the table.
        let data = [0xFF, 0x00, 0xFF, 0x00, 0x00];
        let mut reader = BitReader::new(&data);
        assert!(matches!(tbl.decode(&mut reader), Err(Error::BadData(_))));
    }

    #[test]
    fn validation() {
        let err = HuffmanTable::build(4, TableClass::Ac, &LUMA_DC_BITS, &LUMA_DC_VALUES)
            .unwrap_err();
        expect_test::expect![[r#"invalid Huffman table destination Th=4 (0-3 are allowed)"#]]
            .assert_eq(&err.to_string());

        let err = HuffmanTable::build(0, TableClass::Dc, &LUMA_DC_BITS, &LUMA_DC_VALUES[..11])
            .unwrap_err();
        expect_test::expect![[r#"Huffman table 0 defines 12 codes, but 11 values"#]]
            .assert_eq(&err.to_string());

        let mut bits = [0; 16];
        bits[11] = 13;
        let err = HuffmanTable::build(0, TableClass::Dc, &bits, &[0; 13]).unwrap_err();
        expect_test::expect![[r#"Dc Huffman table 0 defines 13 codes (at most 12 are allowed)"#]]
            .assert_eq(&err.to_string());

        // Three 1-bit codes cannot exist.
        let mut bits = [0; 16];
        bits[0] = 3;
        let err = HuffmanTable::build(0, TableClass::Ac, &bits, &[1, 2, 3]).unwrap_err();
        expect_test::expect![[r#"Huffman code lengths overflow 1-bit code space"#]]
            .assert_eq(&err.to_string());
    }

    #[test]
    fn standard_tables() {
        for class in [TableClass::Dc, TableClass::Ac] {
            for id in 0..2 {
                let table = HuffmanTable::standard(class, id).unwrap();
                let count: usize = table.bits().iter().map(|&b| usize::from(b)).sum();
                assert_eq!(table.values().len(), count);
            }
            assert!(HuffmanTable::standard(class, 2).is_none());
        }

        // Luminance AC: EOB is `1010`, ZRL is `11111111001`.
        let table = HuffmanTable::standard(TableClass::Ac, 0).unwrap();
        let data = [0b1010_1111, 0b1111_1001];
        let mut reader = BitReader::new(&data);
        assert_eq!(table.decode(&mut reader).unwrap(), 0x00);
        assert_eq!(table.decode(&mut reader).unwrap(), 0xf0);
    }

    #[test]
    fn replace_keeps_other_tables() {
        let mut tables = HuffmanTables::new();
        let dc = HuffmanTable::build(0, TableClass::Dc, &LUMA_DC_BITS, &LUMA_DC_VALUES).unwrap();
        tables.set(dc);
        assert!(tables.get(TableClass::Dc, 0).is_some());
        assert!(tables.get(TableClass::Ac, 0).is_none());
        assert!(tables.get(TableClass::Dc, 7).is_none());
        assert_eq!(tables.iter(TableClass::Dc).count(), 1);
    }
}
