// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runtime controls and per-call extension buffers.
//!
//! Every submission carries one control block per field plus optional input
//! seeds (MV predictors, per-macroblock QP) and the output buffers the
//! hardware results are copied into. For two-field content the buffers repeat
//! per field, in coding order. [`validate`] rejects a call before any shared
//! state is touched.

use std::sync::Arc;

use enumn::N;

use crate::estimator::FrameSurface;
use crate::estimator::PreEncError;
use crate::FieldId;
use crate::PicStruct;
use crate::Resolution;

/// Caller-declared structure and parity of a picture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PicType {
    #[default]
    Frame,
    TopField,
    BottomField,
}

impl PicType {
    /// Parity of the declared field, [`FieldId`] 0 for whole frames.
    pub fn field_id(&self) -> FieldId {
        match self {
            PicType::Frame | PicType::TopField => 0,
            PicType::BottomField => 1,
        }
    }
}

/// Three-valued driver toggle: leave the decision to the driver, force on,
/// or force off.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TriState {
    #[default]
    Unknown,
    On,
    Off,
}

/// Motion search precision, numeric values as the driver takes them.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SubPelMode {
    FullPel = 0,
    HalfPel = 1,
    QuarterPel = 3,
}

/// Distortion measure for the motion search, numeric values as the driver
/// takes them.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DistortionMeasure {
    Sad = 0,
    Haar = 2,
}

/// Estimation kind of one field, derived from reference presence.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameType {
    #[default]
    I,
    P,
    B,
}

/// A reference picture for the motion search of one field.
#[derive(Clone, Debug)]
pub struct RefPicture {
    pub surface: Arc<FrameSurface>,
    /// Parity of the referenced field, or [`PicType::Frame`].
    pub pic_type: PicType,
    /// Whether the driver should re-downsample this reference.
    pub downsample: TriState,
}

/// Per-field estimation control block.
#[derive(Clone, Debug, Default)]
pub struct EstCtrl {
    pub pic_type: PicType,
    /// Past (index 0) and future (index 1) reference pictures.
    pub refs: [Option<RefPicture>; 2],
    /// Whether the driver should re-downsample the input picture.
    pub downsample_input: TriState,
    /// QP for the forward-transform decision, used when `ft_enable` is set
    /// and no per-macroblock QP buffer is attached.
    pub qp: u8,
    pub len_sp: u8,
    pub search_path: u8,
    /// Bit mask of *disabled* sub-macroblock partitions.
    pub sub_mb_part_mask: u8,
    /// Raw [`SubPelMode`] value.
    pub sub_pel_mode: u8,
    /// Raw [`DistortionMeasure`] value for inter estimation.
    pub inter_sad: u8,
    /// Raw [`DistortionMeasure`] value for intra estimation.
    pub intra_sad: u8,
    pub adaptive_search: bool,
    /// Number of caller-supplied MV predictors per macroblock, `0..=3`.
    pub mv_predictor_ctrl: u8,
    /// Take QP from the attached per-macroblock QP buffer.
    pub mb_qp: bool,
    /// Enable the forward-transform decision.
    pub ft_enable: bool,
    /// Bit mask of *disabled* intra partitions.
    pub intra_part_mask: u8,
    pub ref_width: u8,
    pub ref_height: u8,
    /// Predefined search window selector, `1..=8`.
    pub search_window: u8,
    pub disable_mv_output: bool,
    pub disable_statistics_output: bool,
    pub enable_8x8_statistics: bool,
}

impl EstCtrl {
    /// Derives I/P/B from which references are present.
    pub fn frame_type(&self) -> FrameType {
        match (&self.refs[0], &self.refs[1]) {
            (None, None) => FrameType::I,
            (Some(_), None) => FrameType::P,
            _ => FrameType::B,
        }
    }
}

/// A single motion vector, quarter-pel units.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MotionVector {
    pub x: i16,
    pub y: i16,
}

/// An L0/L1 motion vector pair. Matches the device layout.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MvPair {
    pub l0: MotionVector,
    pub l1: MotionVector,
}

/// Motion vectors of one macroblock: one pair per 4x4 sub-block. Matches the
/// device layout.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MbMotionVectors {
    pub mv: [MvPair; 16],
}

/// Statistics of one macroblock. Matches the device layout.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MbStats {
    pub best_inter_distortion: u16,
    pub inter_mode: u16,
    pub best_intra_distortion: u16,
    pub intra_mode: u16,
    pub best_interlaced_intra_distortion: u16,
    pub interlaced_intra_mode: u16,
    pub num_non_zero_coef: u16,
    reserved0: u16,
    pub sum_coef: u32,
    /// Combination of the `MB_IS_*` bits.
    pub flags: u32,
    pub variance_16x16: u32,
    pub variance_8x8: [u32; 4],
    pub pixel_average_16x16: u32,
    pub pixel_average_8x8: [u32; 4],
}

impl MbStats {
    pub const MB_IS_FLAT: u32 = 1 << 0;
    pub const MB_IS_COMPLEX: u32 = 1 << 1;
    pub const MB_IS_EDGE: u32 = 1 << 2;
}

/// Caller-seeded motion vector predictors, one [`MvPair`] per macroblock.
#[derive(Clone, Debug, Default)]
pub struct MvPredictors {
    /// Number of macroblocks `mb` was allocated for.
    pub num_mb_alloc: u32,
    pub mb: Vec<MvPair>,
}

/// Caller-supplied per-macroblock QP values.
#[derive(Clone, Debug, Default)]
pub struct MbQp {
    pub num_mb_alloc: u32,
    pub qp: Vec<u8>,
}

/// Output buffer for per-macroblock motion vectors.
#[derive(Clone, Debug, Default)]
pub struct MvOut {
    pub num_mb_alloc: u32,
    pub mb: Vec<MbMotionVectors>,
}

/// Output buffer for per-macroblock statistics.
#[derive(Clone, Debug, Default)]
pub struct MbStatOut {
    pub num_mb_alloc: u32,
    pub mb: Vec<MbStats>,
}

/// Identity of an extension buffer, for support negotiation and pairing
/// checks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExtBufferKind {
    Ctrl,
    MvPredictors,
    MbQp,
    MvOut,
    MbStat,
}

/// Input-side extension buffer.
#[derive(Clone, Debug)]
pub enum InExtBuffer {
    Ctrl(EstCtrl),
    MvPredictors(MvPredictors),
    MbQp(MbQp),
}

impl InExtBuffer {
    pub fn kind(&self) -> ExtBufferKind {
        match self {
            InExtBuffer::Ctrl(_) => ExtBufferKind::Ctrl,
            InExtBuffer::MvPredictors(_) => ExtBufferKind::MvPredictors,
            InExtBuffer::MbQp(_) => ExtBufferKind::MbQp,
        }
    }
}

/// Output-side extension buffer.
#[derive(Clone, Debug)]
pub enum OutExtBuffer {
    MvOut(MvOut),
    MbStat(MbStatOut),
}

impl OutExtBuffer {
    pub fn kind(&self) -> ExtBufferKind {
        match self {
            OutExtBuffer::MvOut(_) => ExtBufferKind::MvOut,
            OutExtBuffer::MbStat(_) => ExtBufferKind::MbStat,
        }
    }
}

const SUPPORTED_IN: &[ExtBufferKind] = &[
    ExtBufferKind::Ctrl,
    ExtBufferKind::MvPredictors,
    ExtBufferKind::MbQp,
];
const SUPPORTED_OUT: &[ExtBufferKind] = &[ExtBufferKind::MvOut, ExtBufferKind::MbStat];

/// One frame submitted for estimation, with its runtime extension buffers.
#[derive(Clone, Debug)]
pub struct EstInput {
    pub surface: Arc<FrameSurface>,
    pub ext: Vec<InExtBuffer>,
}

impl EstInput {
    /// Returns the `instance`-th control block.
    pub fn ctrl(&self, instance: usize) -> Option<&EstCtrl> {
        self.ext
            .iter()
            .filter_map(|b| match b {
                InExtBuffer::Ctrl(c) => Some(c),
                _ => None,
            })
            .nth(instance)
    }

    pub fn mv_predictors(&self, instance: usize) -> Option<&MvPredictors> {
        self.ext
            .iter()
            .filter_map(|b| match b {
                InExtBuffer::MvPredictors(p) => Some(p),
                _ => None,
            })
            .nth(instance)
    }

    pub fn mb_qp(&self, instance: usize) -> Option<&MbQp> {
        self.ext
            .iter()
            .filter_map(|b| match b {
                InExtBuffer::MbQp(q) => Some(q),
                _ => None,
            })
            .nth(instance)
    }

    fn count(&self, kind: ExtBufferKind) -> usize {
        self.ext.iter().filter(|b| b.kind() == kind).count()
    }
}

/// The output buffers a submission will be harvested into.
#[derive(Clone, Debug, Default)]
pub struct EstOutput {
    pub ext: Vec<OutExtBuffer>,
}

impl EstOutput {
    pub fn mv_out(&self, instance: usize) -> Option<&MvOut> {
        self.ext
            .iter()
            .filter_map(|b| match b {
                OutExtBuffer::MvOut(m) => Some(m),
                _ => None,
            })
            .nth(instance)
    }

    pub fn mv_out_mut(&mut self, instance: usize) -> Option<&mut MvOut> {
        self.ext
            .iter_mut()
            .filter_map(|b| match b {
                OutExtBuffer::MvOut(m) => Some(m),
                _ => None,
            })
            .nth(instance)
    }

    pub fn mb_stat(&self, instance: usize) -> Option<&MbStatOut> {
        self.ext
            .iter()
            .filter_map(|b| match b {
                OutExtBuffer::MbStat(s) => Some(s),
                _ => None,
            })
            .nth(instance)
    }

    pub fn mb_stat_mut(&mut self, instance: usize) -> Option<&mut MbStatOut> {
        self.ext
            .iter_mut()
            .filter_map(|b| match b {
                OutExtBuffer::MbStat(s) => Some(s),
                _ => None,
            })
            .nth(instance)
    }

    fn count(&self, kind: ExtBufferKind) -> usize {
        self.ext.iter().filter(|b| b.kind() == kind).count()
    }
}

/// Validation verdict: the derived estimation kind of each coded field.
#[derive(Clone, Debug, Default)]
pub struct ValidatedCall {
    pub frame_type: [FrameType; 2],
}

/// Expected parity tag for coded field `field` under `pic_struct`.
fn expected_pic_type(pic_struct: PicStruct, field: usize) -> PicType {
    match (pic_struct, field) {
        (PicStruct::Progressive, _) => PicType::Frame,
        (PicStruct::FieldTff, 0) | (PicStruct::FieldBff, 1) => PicType::TopField,
        _ => PicType::BottomField,
    }
}

fn check_capacity(
    present: bool,
    num_mb_alloc: u32,
    backing_len: usize,
    num_mb: u32,
) -> Result<(), PreEncError> {
    if !present {
        return Err(PreEncError::UndefinedBehavior);
    }
    if num_mb_alloc < num_mb {
        return Err(PreEncError::IncompatibleVideoParam);
    }
    if (backing_len as u32) < num_mb_alloc {
        return Err(PreEncError::UndefinedBehavior);
    }
    Ok(())
}

/// Validates one submission against the negotiated session geometry.
///
/// `fields` lists the coded field indices this call covers: `[0]` for
/// progressive, `[0, 1]` for a two-field call, the current turn alone in
/// single-field mode. Extension buffer instances map onto `fields` by
/// position. The call mutates nothing; on success the caller may commit the
/// submission to a task slot.
pub fn validate(
    resolution: Resolution,
    pic_struct: PicStruct,
    fields: &[usize],
    input: &EstInput,
    output: &EstOutput,
) -> Result<ValidatedCall, PreEncError> {
    // 1. Every attached buffer must be of a negotiated kind.
    if input.ext.iter().any(|b| !SUPPORTED_IN.contains(&b.kind()))
        || output.ext.iter().any(|b| !SUPPORTED_OUT.contains(&b.kind()))
    {
        return Err(PreEncError::InvalidVideoParam);
    }

    // 2. Per-field buffers must come in as many instances as this call has
    // fields. A control block is always required.
    if input.count(ExtBufferKind::Ctrl) == 0 {
        return Err(PreEncError::UndefinedBehavior);
    }
    let expected = fields.len();
    for kind in SUPPORTED_IN {
        let n = input.count(*kind);
        if n != 0 && n != expected {
            return Err(PreEncError::IncompatibleVideoParam);
        }
    }
    for kind in SUPPORTED_OUT {
        let n = output.count(*kind);
        if n != 0 && n != expected {
            return Err(PreEncError::IncompatibleVideoParam);
        }
    }

    let num_mb = pic_struct.num_mbs_per_unit(resolution);
    let mut verdict = ValidatedCall::default();

    for (instance, &field) in fields.iter().enumerate() {
        let ctrl = input.ctrl(instance).ok_or(PreEncError::UndefinedBehavior)?;

        // 3. The declared parity must match the negotiated field order.
        if ctrl.pic_type != expected_pic_type(pic_struct, field) {
            return Err(PreEncError::InvalidVideoParam);
        }

        // 4. Range checks on the search controls.
        if ctrl.search_window < 1 || ctrl.search_window > 8 {
            return Err(PreEncError::InvalidVideoParam);
        }
        if SubPelMode::n(ctrl.sub_pel_mode).is_none() {
            return Err(PreEncError::InvalidVideoParam);
        }
        if DistortionMeasure::n(ctrl.inter_sad).is_none()
            || DistortionMeasure::n(ctrl.intra_sad).is_none()
        {
            return Err(PreEncError::InvalidVideoParam);
        }
        if ctrl.sub_mb_part_mask >= 0x7f || ctrl.intra_part_mask >= 0x07 {
            return Err(PreEncError::InvalidVideoParam);
        }
        if ctrl.mv_predictor_ctrl > 3 {
            return Err(PreEncError::InvalidVideoParam);
        }
        if ctrl.ft_enable && !ctrl.mb_qp && !(1..=51).contains(&ctrl.qp) {
            return Err(PreEncError::InvalidVideoParam);
        }

        // 5. Enabled outputs and switched-on inputs must be backed by
        // buffers large enough for the field.
        if !ctrl.disable_mv_output {
            let mv = output.mv_out(instance);
            check_capacity(
                mv.is_some(),
                mv.map(|b| b.num_mb_alloc).unwrap_or(0),
                mv.map(|b| b.mb.len()).unwrap_or(0),
                num_mb,
            )?;
        }
        if !ctrl.disable_statistics_output {
            let stat = output.mb_stat(instance);
            check_capacity(
                stat.is_some(),
                stat.map(|b| b.num_mb_alloc).unwrap_or(0),
                stat.map(|b| b.mb.len()).unwrap_or(0),
                num_mb,
            )?;
        }
        if ctrl.mv_predictor_ctrl > 0 {
            let pred = input.mv_predictors(instance);
            check_capacity(
                pred.is_some(),
                pred.map(|b| b.num_mb_alloc).unwrap_or(0),
                pred.map(|b| b.mb.len()).unwrap_or(0),
                num_mb,
            )?;
        }
        if ctrl.ft_enable && ctrl.mb_qp {
            let qp = input.mb_qp(instance);
            check_capacity(
                qp.is_some(),
                qp.map(|b| b.num_mb_alloc).unwrap_or(0),
                qp.map(|b| b.qp.len()).unwrap_or(0),
                num_mb,
            )?;
        }

        verdict.frame_type[field] = ctrl.frame_type();
    }

    Ok(verdict)
}
