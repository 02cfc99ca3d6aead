//! Frame metadata reported to callers.

use crate::error::{Error, Result};

/// Maximum number of components in a frame or scan.
pub const MAX_COMPS_PER_SCAN: usize = 4;

/// Chroma subsampling layout, detected by exact match of the component sampling factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChromaSampling {
    Yuv444,
    /// 4:2:2 with horizontally subsampled chroma (luma 2x1).
    Yuv422H,
    /// 4:2:2 with vertically subsampled chroma (luma 1x2).
    Yuv422V,
    Yuv420,
    Yuv411,
    Other,
}

impl ChromaSampling {
    /// Classifies the `(H, V)` factors of a frame's components.
    ///
    /// Chroma components must be 1x1. A fourth component (the K channel of CMYK/YCCK) must use
    /// the same factors as the first.
    pub fn detect(factors: &[(u8, u8)]) -> Self {
        match *factors {
            [(1, 1)] => Self::Yuv444,
            [luma, (1, 1), (1, 1)] => Self::from_luma(luma),
            [luma, (1, 1), (1, 1), k] if k == luma => Self::from_luma(luma),
            _ => Self::Other,
        }
    }

    fn from_luma(luma: (u8, u8)) -> Self {
        match luma {
            (1, 1) => Self::Yuv444,
            (2, 1) => Self::Yuv422H,
            (1, 2) => Self::Yuv422V,
            (2, 2) => Self::Yuv420,
            (4, 1) => Self::Yuv411,
            _ => Self::Other,
        }
    }
}

/// Color space of the decoded samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    Unknown,
    Gray,
    YCbCr,
    Rgb,
    Cmyk,
    Ycck,
}

/// Surface layout a hardware decoder needs to be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChromaType {
    Yuv400,
    Yuv420,
    Yuv411,
    Yuv422H,
    Yuv422V,
    Yuv444,
    Rgb,
}

/// A frame component, as declared by the SOF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Component {
    /// Component identifier (`Ci`), referenced by scan headers.
    pub id: u8,
    /// Horizontal sampling factor, 1-4.
    pub h: u8,
    /// Vertical sampling factor, 1-4.
    pub v: u8,
    /// Quantization table selector (`Tqi`).
    pub quant_selector: u8,
    /// DC Huffman table selector of the most recent scan containing this component.
    pub dc_selector: u8,
    /// AC Huffman table selector of the most recent scan containing this component.
    pub ac_selector: u8,
    /// `max_h / h`.
    pub h_factor: u8,
    /// `max_v / v`.
    pub v_factor: u8,
}

impl Component {
    /// Number of 8x8 blocks this component contributes to an interleaved MCU.
    #[inline]
    pub fn blocks_per_mcu(&self) -> usize {
        usize::from(self.h) * usize::from(self.v)
    }
}

/// Frame-level information extracted by reading the headers of a JPEG frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u16,
    pub height: u16,
    /// Sample precision in bits (8 or 12).
    pub precision: u8,
    pub components: Vec<Component>,
    pub sampling: ChromaSampling,
    pub color: ColorSpace,
    /// Restart interval in effect for the first scan, in MCUs (0 = none).
    pub restart_interval: u16,
}

impl FrameInfo {
    #[inline]
    pub fn max_h(&self) -> u8 {
        self.components.iter().map(|c| c.h).max().unwrap_or(1)
    }

    #[inline]
    pub fn max_v(&self) -> u8 {
        self.components.iter().map(|c| c.v).max().unwrap_or(1)
    }

    /// Number of interleaved MCUs per row and column of the frame.
    pub fn mcu_grid(&self) -> (usize, usize) {
        let mcu_w = 8 * usize::from(self.max_h());
        let mcu_h = 8 * usize::from(self.max_v());
        (
            usize::from(self.width).div_ceil(mcu_w),
            usize::from(self.height).div_ceil(mcu_h),
        )
    }

    /// Returns the number of 8x8 blocks per row and column that `component` occupies.
    ///
    /// This is padded to whole interleaved MCUs, so it also covers the non-interleaved grid.
    pub fn component_blocks(&self, component: usize) -> (usize, usize) {
        let (mcus_x, mcus_y) = self.mcu_grid();
        let c = &self.components[component];
        (mcus_x * usize::from(c.h), mcus_y * usize::from(c.v))
    }

    /// Maps the sampling and color space to the layout a hardware surface has to use.
    pub fn chroma_type(&self) -> Result<ChromaType> {
        if self.components.len() == 1 {
            return Ok(ChromaType::Yuv400);
        }
        if self.components.len() != 3 {
            return Err(Error::Unsupported(format!(
                "{} component frames have no surface layout",
                self.components.len()
            )));
        }
        match self.sampling {
            ChromaSampling::Yuv444 if self.color == ColorSpace::Rgb => Ok(ChromaType::Rgb),
            ChromaSampling::Yuv444 => Ok(ChromaType::Yuv444),
            ChromaSampling::Yuv422H => Ok(ChromaType::Yuv422H),
            ChromaSampling::Yuv422V => Ok(ChromaType::Yuv422V),
            ChromaSampling::Yuv420 => Ok(ChromaType::Yuv420),
            ChromaSampling::Yuv411 => Ok(ChromaType::Yuv411),
            ChromaSampling::Other => Err(Error::Unsupported(format!(
                "sampling factors {:?} have no surface layout",
                self.components
                    .iter()
                    .map(|c| (c.h, c.v))
                    .collect::<Vec<_>>()
            ))),
        }
    }

    /// Upper bound for the compressed size of one frame, used to cap stream buffering.
    pub fn max_bitstream_size(&self) -> usize {
        let pixels = usize::from(self.width) * usize::from(self.height);
        match (self.components.len(), self.sampling) {
            (1, _) => pixels,
            (3, ChromaSampling::Yuv420 | ChromaSampling::Yuv411) => pixels * 3 / 2,
            (3, ChromaSampling::Yuv422H | ChromaSampling::Yuv422V) => pixels * 2,
            (n, _) => pixels * n.max(3),
        }
    }
}
