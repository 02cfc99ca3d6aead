//! Destinations for decoded coefficient blocks.

use std::fmt;

use crate::metadata::FrameInfo;

/// Receives the blocks produced by the piece decoder.
///
/// Coefficients are dequantized and stored in natural (row-major) order. `x` and `y` are block
/// coordinates within the component.
pub trait Output {
    fn put_block(&mut self, component: usize, x: usize, y: usize, coefficients: &[i16; 64]);

    /// Marks the output as (partially) corrupted, because a piece failed to decode.
    fn set_corrupted(&mut self);
}

/// The coefficient blocks of one component.
#[derive(Clone, PartialEq, Eq)]
pub struct CoefficientPlane {
    width: usize,
    height: usize,
    data: Vec<i16>,
}

impl CoefficientPlane {
    /// Creates a plane of `width * height` zeroed blocks.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height * 64],
        }
    }

    /// Width in blocks.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in blocks.
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Distance between vertically adjacent blocks, in coefficients.
    #[inline]
    pub fn pitch(&self) -> usize {
        self.width * 64
    }

    #[inline]
    pub fn data(&self) -> &[i16] {
        &self.data
    }

    pub fn block(&self, x: usize, y: usize) -> Option<&[i16; 64]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = y * self.pitch() + x * 64;
        (&self.data[start..start + 64]).try_into().ok()
    }

    pub fn block_mut(&mut self, x: usize, y: usize) -> Option<&mut [i16; 64]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = y * self.pitch() + x * 64;
        (&mut self.data[start..start + 64]).try_into().ok()
    }
}

impl fmt::Debug for CoefficientPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoefficientPlane({}x{} blocks)", self.width, self.height)
    }
}

/// In-memory [`Output`] holding a [`CoefficientPlane`] per frame component.
///
/// Planes are sized to whole interleaved MCUs, so they also fit the blocks of non-interleaved
/// scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    planes: Vec<CoefficientPlane>,
    precision: u8,
    corrupted: bool,
}

impl Surface {
    pub fn new(info: &FrameInfo) -> Self {
        let planes = (0..info.components.len())
            .map(|i| {
                let (w, h) = info.component_blocks(i);
                CoefficientPlane::new(w, h)
            })
            .collect();
        Self {
            planes,
            precision: info.precision,
            corrupted: false,
        }
    }

    #[inline]
    pub fn planes(&self) -> &[CoefficientPlane] {
        &self.planes
    }

    #[inline]
    pub fn plane(&self, component: usize) -> Option<&CoefficientPlane> {
        self.planes.get(component)
    }

    #[inline]
    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    /// Returns the sample value a block would have if only its DC coefficient was present.
    ///
    /// This is the average of the block's samples, level-shifted to the unsigned sample range.
    pub fn dc_sample(&self, component: usize, x: usize, y: usize) -> Option<i32> {
        let block = self.plane(component)?.block(x, y)?;
        let max = (1 << self.precision) - 1;
        let level = (i32::from(block[0]) + 4).div_euclid(8) + (1 << (self.precision - 1));
        Some(level.clamp(0, max))
    }
}

impl Output for Surface {
    fn put_block(&mut self, component: usize, x: usize, y: usize, coefficients: &[i16; 64]) {
        match self
            .planes
            .get_mut(component)
            .and_then(|plane| plane.block_mut(x, y))
        {
            Some(block) => *block = *coefficients,
            None => {
                log::warn!("block {x},{y} of component {component} is outside of the surface");
                self.corrupted = true;
            }
        }
    }

    fn set_corrupted(&mut self) {
        self.corrupted = true;
    }
}
