// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware-accelerated H.264 motion-estimation pre-pass (PreENC) for Linux.
//!
//! This crate runs the statistics function of a video encode engine on raw
//! frames ahead of actual encoding: for every macroblock of a submitted
//! picture the hardware returns best inter/intra distortions, motion vectors,
//! variances and pixel averages. A look-ahead rate controller or scene-change
//! detector consumes these numbers to tune the real encode pass.
//!
//! The crate is organized around two seams:
//!
//! * [`estimator::PreEncSession`] owns the asynchronous task lifecycle: a
//!   fixed pool of task slots, per-call validation of the runtime controls,
//!   and the split of each submission into an `Execute` and a `Query` work
//!   item that an external scheduler invokes later, possibly from different
//!   threads.
//! * [`backend::DriverEncoder`] abstracts the driver interface. The VAAPI
//!   implementation (behind the `vaapi` feature) drives the statistics
//!   entrypoint of the i965/iHD drivers; a dummy implementation backs the
//!   tests of the portable core.
//!
//! Frame memory is the caller's problem: surfaces come in through the
//! [`estimator::FrameAllocator`] trait, either as native device handles or as
//! system memory that gets uploaded to an internal raw-surface slot.

pub mod backend;
pub mod estimator;

/// Size of an H.264 macroblock, in pixels.
pub const MB_SIZE: u32 = 16;

/// Unsigned size of a frame in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Frame width rounded up to a whole number of macroblocks.
    pub fn width_in_mbs(&self) -> u32 {
        self.width.div_ceil(MB_SIZE)
    }

    /// Frame height rounded up to a whole number of macroblocks.
    pub fn height_in_mbs(&self) -> u32 {
        self.height.div_ceil(MB_SIZE)
    }

    /// Number of macroblocks covering the whole frame.
    pub fn num_mbs(&self) -> u32 {
        self.width_in_mbs() * self.height_in_mbs()
    }

    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Interlacing structure of the input content, fixed at session init.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PicStruct {
    #[default]
    Progressive,
    /// Interlaced, top field coded first.
    FieldTff,
    /// Interlaced, bottom field coded first.
    FieldBff,
}

/// Field parity: `0` is the top field, `1` the bottom field. Progressive
/// frames use `0` throughout.
pub type FieldId = usize;

impl PicStruct {
    pub fn is_interlaced(&self) -> bool {
        !matches!(self, PicStruct::Progressive)
    }

    /// Number of per-call processing units: one frame or two fields.
    pub fn num_fields(&self) -> usize {
        if self.is_interlaced() {
            2
        } else {
            1
        }
    }

    /// Parity of each coded field: `fids()[i]` is the [`FieldId`] of the
    /// i-th field in coding order.
    pub fn fids(&self) -> [FieldId; 2] {
        match self {
            PicStruct::Progressive => [0, 0],
            PicStruct::FieldTff => [0, 1],
            PicStruct::FieldBff => [1, 0],
        }
    }

    /// Number of macroblocks in one processing unit (field or frame).
    pub fn num_mbs_per_unit(&self, resolution: Resolution) -> u32 {
        let frame_mbs = resolution.num_mbs();
        if self.is_interlaced() {
            frame_mbs / 2
        } else {
            frame_mbs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mb_math() {
        let res = Resolution::new(1920, 1080);
        assert_eq!(res.width_in_mbs(), 120);
        assert_eq!(res.height_in_mbs(), 68);
        assert_eq!(res.num_mbs(), 8160);
        // Not a multiple of 16 in either dimension.
        let odd = Resolution::new(176, 144);
        assert_eq!(odd.num_mbs(), 11 * 9);
    }

    #[test]
    fn mbs_per_unit_halves_for_fields() {
        let res = Resolution::new(1280, 720);
        assert_eq!(PicStruct::Progressive.num_mbs_per_unit(res), 3600);
        assert_eq!(PicStruct::FieldTff.num_mbs_per_unit(res), 1800);
        assert_eq!(PicStruct::FieldBff.num_mbs_per_unit(res), 1800);
    }

    #[test]
    fn field_parity_order() {
        assert_eq!(PicStruct::Progressive.fids(), [0, 0]);
        assert_eq!(PicStruct::FieldTff.fids(), [0, 1]);
        assert_eq!(PicStruct::FieldBff.fids(), [1, 0]);
    }
}
