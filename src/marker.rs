//! JPEG marker codes.

use std::fmt;

/// A JPEG marker, identified by the byte following a `0xFF` prefix.
///
/// `0xFF 0x00` is not a marker (it encodes a literal `0xFF` in entropy-coded data) and `0xFF 0xFF`
/// is a fill byte, so neither `0x00` nor `0xFF` is ever passed to [`Marker::from_code`] by the
/// parsers in this crate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    /// Start Of Image.
    Soi,
    /// End Of Image.
    Eoi,
    /// Start Of Frame `SOFn`, carrying `n` (0-15, excluding 4, 8 and 12).
    Sof(u8),
    /// Define Huffman Tables.
    Dht,
    /// Define Quantization Tables.
    Dqt,
    /// Define Restart Interval.
    Dri,
    /// Start Of Scan.
    Sos,
    /// Restart marker `RSTn`, carrying `n` (0-7).
    Rst(u8),
    /// Application segment `APPn`, carrying `n` (0-15).
    App(u8),
    /// Comment.
    Com,
    /// Temporary private use marker (standalone).
    Tem,
    /// Anything else (JPG, DAC, DNL, DHP, EXP, JPGn, reserved codes).
    Other(u8),
}

impl Marker {
    pub const SOI: u8 = 0xD8;
    pub const EOI: u8 = 0xD9;
    pub const SOF0: u8 = 0xC0;
    pub const DHT: u8 = 0xC4;
    pub const DQT: u8 = 0xDB;
    pub const DRI: u8 = 0xDD;
    pub const SOS: u8 = 0xDA;
    pub const RST0: u8 = 0xD0;
    pub const APP0: u8 = 0xE0;
    pub const APP14: u8 = 0xEE;
    pub const COM: u8 = 0xFE;
    pub const TEM: u8 = 0x01;

    pub fn from_code(code: u8) -> Self {
        match code {
            Self::SOI => Self::Soi,
            Self::EOI => Self::Eoi,
            Self::DHT => Self::Dht,
            Self::DQT => Self::Dqt,
            Self::DRI => Self::Dri,
            Self::SOS => Self::Sos,
            Self::COM => Self::Com,
            Self::TEM => Self::Tem,
            // 0xC8 is JPG, 0xCC is DAC.
            0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => Self::Sof(code - 0xC0),
            0xD0..=0xD7 => Self::Rst(code - 0xD0),
            0xE0..=0xEF => Self::App(code - 0xE0),
            _ => Self::Other(code),
        }
    }

    /// Returns the marker byte that follows the `0xFF` prefix.
    pub fn code(self) -> u8 {
        match self {
            Self::Soi => Self::SOI,
            Self::Eoi => Self::EOI,
            Self::Sof(n) => 0xC0 + n,
            Self::Dht => Self::DHT,
            Self::Dqt => Self::DQT,
            Self::Dri => Self::DRI,
            Self::Sos => Self::SOS,
            Self::Rst(n) => Self::RST0 + n,
            Self::App(n) => Self::APP0 + n,
            Self::Com => Self::COM,
            Self::Tem => Self::TEM,
            Self::Other(code) => code,
        }
    }

    /// Returns whether this marker stands alone, without a length field and payload.
    ///
    /// The standalone markers are `SOI`, `EOI`, `TEM` and `RST0`-`RST7`.
    #[inline]
    pub fn is_standalone(self) -> bool {
        is_standalone_code(self.code())
    }
}

/// Same as [`Marker::is_standalone`], on a raw marker byte.
#[inline]
pub(crate) fn is_standalone_code(code: u8) -> bool {
    matches!(code, 0xD0..=0xD9 | Marker::TEM)
}

impl From<u8> for Marker {
    fn from(code: u8) -> Self {
        Self::from_code(code)
    }
}

impl fmt::Debug for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Soi => f.write_str("SOI"),
            Self::Eoi => f.write_str("EOI"),
            Self::Sof(n) => write!(f, "SOF{n}"),
            Self::Dht => f.write_str("DHT"),
            Self::Dqt => f.write_str("DQT"),
            Self::Dri => f.write_str("DRI"),
            Self::Sos => f.write_str("SOS"),
            Self::Rst(n) => write!(f, "RST{n}"),
            Self::App(n) => write!(f, "APP{n}"),
            Self::Com => f.write_str("COM"),
            Self::Tem => f.write_str("TEM"),
            Self::Other(code) => f
                .debug_tuple("Marker")
                .field(&format_args!("{:02x}", code))
                .finish(),
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
