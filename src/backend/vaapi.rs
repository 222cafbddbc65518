// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VAAPI backend driving the statistics entrypoint of the encode engine.
//!
//! The statistics function lives on `VAProfileNone` with its own entrypoint.
//! Per session the backend creates one config/context pair and pre-allocates
//! the statistics and motion-vector output buffers; per call it assembles a
//! parameter buffer carrying the references, the transient MV-predictor and
//! QP inputs and the output ids, renders it and remembers where the outputs
//! will land in a feedback cache keyed by the task's per-field status-report
//! number. Polling syncs the input surface, copies the device buffers into
//! the caller's and evicts the record.

pub mod ffi;

use std::collections::HashMap;
use std::ffi::c_int;
use std::ffi::c_uint;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use crate::backend::AccelParams;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::DdiCaps;
use crate::backend::DriverEncoder;
use crate::backend::RawSurface;
use crate::estimator::params::EstCtrl;
use crate::estimator::params::MbMotionVectors;
use crate::estimator::params::MbStats;
use crate::estimator::params::PicType;
use crate::estimator::params::TriState;
use crate::estimator::task::ResolvedRef;
use crate::estimator::SeiScratch;
use crate::estimator::Task;

/// Default render node, the usual location of the first GPU.
const RENDER_NODE: &str = "/dev/dri/renderD128";

fn check(status: ffi::VAStatus, what: &str) -> BackendResult<()> {
    if ffi::va_succeeded(status) {
        Ok(())
    } else {
        log::error!("{}: {}", what, ffi::va_error_str(status));
        Err(BackendError::DeviceFailed)
    }
}

fn align(value: u32, to: u32) -> u32 {
    (value + to - 1) & !(to - 1)
}

/// `frame_qp:8 len_sp:8 search_path:8`
fn pack_qp_and_search(ctrl: &EstCtrl) -> u32 {
    ctrl.qp as u32 | (ctrl.len_sp as u32) << 8 | (ctrl.search_path as u32) << 16
}

/// `sub_mb_part_mask:7 sub_pel_mode:2 inter_sad:2 intra_sad:2
/// adaptive_search:1 mv_predictor_ctrl:3 mb_qp:1 ft_enable:1
/// intra_part_mask:5`
fn pack_search_controls(ctrl: &EstCtrl) -> u32 {
    (ctrl.sub_mb_part_mask as u32 & 0x7f)
        | (ctrl.sub_pel_mode as u32 & 0x3) << 7
        | (ctrl.inter_sad as u32 & 0x3) << 9
        | (ctrl.intra_sad as u32 & 0x3) << 11
        | (ctrl.adaptive_search as u32) << 13
        | (ctrl.mv_predictor_ctrl as u32 & 0x7) << 14
        | (ctrl.mb_qp as u32) << 17
        | (ctrl.ft_enable as u32) << 18
        | (ctrl.intra_part_mask as u32 & 0x1f) << 19
}

/// `ref_width:8 ref_height:8 search_window:8`
fn pack_window(ctrl: &EstCtrl) -> u32 {
    ctrl.ref_width as u32 | (ctrl.ref_height as u32) << 8 | (ctrl.search_window as u32) << 16
}

/// `disable_mv_output:1 disable_statistics_output:1 enable_8x8_statistics:1`
fn pack_output_controls(disable_mv: bool, disable_stats: bool, enable_8x8: bool) -> u32 {
    disable_mv as u32 | (disable_stats as u32) << 1 | (enable_8x8 as u32) << 2
}

fn picture_flags(pic_type: PicType, downsample: TriState, first_field: bool) -> u32 {
    let mut flags = match pic_type {
        PicType::Frame => ffi::VA_PICTURE_STATS_PROGRESSIVE,
        PicType::TopField => ffi::VA_PICTURE_STATS_TOP_FIELD,
        PicType::BottomField => ffi::VA_PICTURE_STATS_BOTTOM_FIELD,
    };
    // Downsampling happens once per frame, on the first coded field.
    if first_field && downsample != TriState::Off {
        flags |= ffi::VA_PICTURE_STATS_CONTENT_UPDATED;
    }
    flags
}

fn reference_entry(r: &ResolvedRef) -> ffi::VAPictureStats {
    let mut flags = match r.pic_type {
        PicType::Frame => ffi::VA_PICTURE_STATS_PROGRESSIVE,
        PicType::TopField => ffi::VA_PICTURE_STATS_TOP_FIELD,
        PicType::BottomField => ffi::VA_PICTURE_STATS_BOTTOM_FIELD,
    };
    // References were downsampled with their own frame; only an explicit
    // request re-downsamples one here.
    if r.downsample == TriState::On {
        flags |= ffi::VA_PICTURE_STATS_CONTENT_UPDATED;
    }
    ffi::VAPictureStats {
        picture_id: r.raw.0,
        flags,
    }
}

/// Index of the pre-allocated statistics buffer holding the results of the
/// field with parity `fid`. The device routes output by parity, so the
/// bottom-field buffer holds the bottom field whatever the coding order.
fn stat_buffer_index(fid: usize, num_units: usize) -> usize {
    fid.min(num_units - 1)
}

/// Where the results of one submitted field will land.
#[derive(Copy, Clone, Debug)]
struct Feedback {
    surface: ffi::VASurfaceID,
    /// Set when MV output was enabled for the field.
    mv: Option<ffi::VABufferID>,
    stat: ffi::VABufferID,
}

/// The statistics-entrypoint implementation of [`DriverEncoder`].
pub struct VaapiPreEnc {
    display: Arc<ffi::VaDisplay>,
    par: AccelParams,
    config: ffi::VAConfigID,
    context: ffi::VAContextID,
    /// Per-session outputs: index 0 holds the frame or top field, index 1
    /// the bottom field.
    stat_out: Vec<ffi::VaBuffer>,
    mv_out: Vec<ffi::VaBuffer>,
    feedback: Mutex<HashMap<u32, Feedback>>,
    registered: Vec<RawSurface>,
}

impl VaapiPreEnc {
    /// Opens the default render node.
    pub fn new() -> anyhow::Result<Self> {
        Self::open(RENDER_NODE)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Ok(Self::with_display(Arc::new(ffi::VaDisplay::open(path)?)))
    }

    pub fn with_display(display: Arc<ffi::VaDisplay>) -> Self {
        Self {
            display,
            par: Default::default(),
            config: ffi::VA_INVALID_ID,
            context: ffi::VA_INVALID_ID,
            stat_out: Vec::new(),
            mv_out: Vec::new(),
            feedback: Mutex::new(HashMap::new()),
            registered: Vec::new(),
        }
    }

    fn ensure_stats_entrypoint(&self) -> BackendResult<()> {
        let max = unsafe { ffi::vaMaxNumEntrypoints(self.display.raw()) }.max(1) as usize;
        let mut entrypoints = vec![0 as ffi::VAEntrypoint; max];
        let mut num: c_int = 0;
        check(
            unsafe {
                ffi::vaQueryConfigEntrypoints(
                    self.display.raw(),
                    ffi::VA_PROFILE_NONE,
                    entrypoints.as_mut_ptr(),
                    &mut num,
                )
            },
            "vaQueryConfigEntrypoints",
        )?;
        entrypoints.truncate(num.max(0) as usize);
        if !entrypoints.contains(&ffi::VA_ENTRYPOINT_STATS) {
            log::error!("the driver exposes no statistics entrypoint");
            return Err(BackendError::Unsupported);
        }
        Ok(())
    }
}

impl DriverEncoder for VaapiPreEnc {
    fn query_caps(&self) -> BackendResult<DdiCaps> {
        self.ensure_stats_entrypoint()?;

        let mut attribs = [
            ffi::VAConfigAttrib {
                type_: ffi::VA_CONFIG_ATTRIB_MAX_PICTURE_WIDTH,
                value: 0,
            },
            ffi::VAConfigAttrib {
                type_: ffi::VA_CONFIG_ATTRIB_MAX_PICTURE_HEIGHT,
                value: 0,
            },
            ffi::VAConfigAttrib {
                type_: ffi::VA_CONFIG_ATTRIB_FEI_MV_PREDICTORS,
                value: 0,
            },
        ];
        check(
            unsafe {
                ffi::vaGetConfigAttributes(
                    self.display.raw(),
                    ffi::VA_PROFILE_NONE,
                    ffi::VA_ENTRYPOINT_STATS,
                    attribs.as_mut_ptr(),
                    attribs.len() as c_int,
                )
            },
            "vaGetConfigAttributes",
        )?;

        let value_or = |attrib: &ffi::VAConfigAttrib, fallback: u32| {
            if attrib.value == ffi::VA_ATTRIB_NOT_SUPPORTED {
                fallback
            } else {
                attrib.value
            }
        };
        Ok(DdiCaps {
            max_pic_width: value_or(&attribs[0], 4096),
            max_pic_height: value_or(&attribs[1], 4096),
            max_num_mv_predictors: value_or(&attribs[2], 1),
        })
    }

    fn create_accel_service(&mut self, par: &AccelParams) -> BackendResult<()> {
        self.ensure_stats_entrypoint()?;

        let mut attrib = ffi::VAConfigAttrib {
            type_: ffi::VA_CONFIG_ATTRIB_STATS,
            value: 0,
        };
        check(
            unsafe {
                ffi::vaGetConfigAttributes(
                    self.display.raw(),
                    ffi::VA_PROFILE_NONE,
                    ffi::VA_ENTRYPOINT_STATS,
                    &mut attrib,
                    1,
                )
            },
            "vaGetConfigAttributes",
        )?;

        let mut config = ffi::VA_INVALID_ID;
        check(
            unsafe {
                ffi::vaCreateConfig(
                    self.display.raw(),
                    ffi::VA_PROFILE_NONE,
                    ffi::VA_ENTRYPOINT_STATS,
                    &mut attrib,
                    1,
                    &mut config,
                )
            },
            "vaCreateConfig",
        )?;

        let width = align(par.resolution.width, 16);
        // Field estimation wants a height that splits into two aligned
        // fields.
        let height = if par.pic_struct.is_interlaced() {
            align(par.resolution.height, 32)
        } else {
            align(par.resolution.height, 16)
        };
        let mut context = ffi::VA_INVALID_ID;
        let status = unsafe {
            ffi::vaCreateContext(
                self.display.raw(),
                config,
                width as c_int,
                height as c_int,
                ffi::VA_PROGRESSIVE,
                std::ptr::null_mut(),
                0,
                &mut context,
            )
        };
        if !ffi::va_succeeded(status) {
            log::error!("vaCreateContext: {}", ffi::va_error_str(status));
            unsafe { ffi::vaDestroyConfig(self.display.raw(), config) };
            return Err(BackendError::DeviceFailed);
        }
        self.config = config;
        self.context = context;

        let num_mb = par.pic_struct.num_mbs_per_unit(par.resolution);
        for unit in 0..par.pic_struct.num_fields() {
            let stat_type = if unit == 0 {
                ffi::VA_STATS_STATISTICS_BUFFER_TYPE
            } else {
                ffi::VA_STATS_STATISTICS_BOTTOM_FIELD_BUFFER_TYPE
            };
            self.stat_out.push(
                ffi::VaBuffer::empty(
                    &self.display,
                    context,
                    stat_type,
                    std::mem::size_of::<MbStats>(),
                    num_mb,
                )
                .map_err(BackendError::Other)?,
            );
            self.mv_out.push(
                ffi::VaBuffer::empty(
                    &self.display,
                    context,
                    ffi::VA_STATS_MV_BUFFER_TYPE,
                    std::mem::size_of::<MbMotionVectors>(),
                    num_mb,
                )
                .map_err(BackendError::Other)?,
            );
        }

        self.par = *par;
        log::debug!(
            "statistics service open: context {} ({}x{}), {} output pair(s) of {} MBs",
            context,
            width,
            height,
            self.stat_out.len(),
            num_mb
        );
        Ok(())
    }

    fn register(&mut self, surfaces: &[RawSurface]) -> BackendResult<()> {
        self.registered = surfaces.to_vec();
        log::debug!("registered {} raw surfaces", surfaces.len());
        Ok(())
    }

    fn execute(
        &self,
        raw: RawSurface,
        task: &Task,
        field: usize,
        _sei: &SeiScratch,
    ) -> BackendResult<()> {
        let fid = task.fid[field];
        let data = task.fields[field].as_ref().ok_or(BackendError::NotFound)?;
        let ctrl = &data.ctrl;

        let mut past: Vec<ffi::VAPictureStats> = Vec::with_capacity(1);
        let mut future: Vec<ffi::VAPictureStats> = Vec::with_capacity(1);
        if let Some(r) = data.refs.past {
            past.push(reference_entry(&r));
        }
        if let Some(r) = data.refs.future {
            future.push(reference_entry(&r));
        }
        // The search has nothing to do without references; the driver
        // rejects MV output for intra fields.
        let disable_mv = ctrl.disable_mv_output || (past.is_empty() && future.is_empty());

        // The transient inputs travel as ids inside the parameter block;
        // the guards keep them alive until the submission is rendered.
        let mut transients: Vec<ffi::VaBuffer> = Vec::with_capacity(2);
        let mut mv_predictor = ffi::VA_INVALID_ID;
        if ctrl.mv_predictor_ctrl > 0 {
            if let Some(pred) = &data.mv_predictors {
                let n = (pred.num_mb_alloc as usize).min(pred.mb.len());
                let buf = ffi::VaBuffer::with_data(
                    &self.display,
                    self.context,
                    ffi::VA_STATS_MV_PREDICTOR_BUFFER_TYPE,
                    &pred.mb[..n],
                )
                .map_err(BackendError::Other)?;
                mv_predictor = buf.id();
                transients.push(buf);
            }
        }
        let mut qp = ffi::VA_INVALID_ID;
        if ctrl.ft_enable && ctrl.mb_qp {
            if let Some(mb_qp) = &data.mb_qp {
                let n = (mb_qp.num_mb_alloc as usize).min(mb_qp.qp.len());
                let buf = ffi::VaBuffer::with_data(
                    &self.display,
                    self.context,
                    ffi::VA_ENC_QP_BUFFER_TYPE,
                    &mb_qp.qp[..n],
                )
                .map_err(BackendError::Other)?;
                qp = buf.id();
                transients.push(buf);
            }
        }

        // Statistics output is attached regardless of the control flag; the
        // driver refuses the submission without it.
        let mut outputs: Vec<ffi::VABufferID> = Vec::with_capacity(3);
        if !disable_mv {
            outputs.push(self.mv_out[fid].id());
        }
        outputs.push(self.stat_out[0].id());
        if self.par.pic_struct.is_interlaced() {
            outputs.push(self.stat_out[1].id());
        }

        let params = ffi::VAStatsStatisticsParameterH264 {
            stats_params: ffi::VAStatsStatisticsParameter {
                input: ffi::VAPictureStats {
                    picture_id: raw.0,
                    flags: picture_flags(ctrl.pic_type, ctrl.downsample_input, field == 0),
                },
                past_references: past.as_mut_ptr(),
                num_past_references: past.len() as u32,
                past_ref_stat_buf: std::ptr::null_mut(),
                future_references: future.as_mut_ptr(),
                num_future_references: future.len() as u32,
                future_ref_stat_buf: std::ptr::null_mut(),
                outputs: outputs.as_mut_ptr(),
                num_outputs: outputs.len() as u32,
                mv_predictor,
                qp,
            },
            qp_and_search: pack_qp_and_search(ctrl),
            search_controls: pack_search_controls(ctrl),
            window: pack_window(ctrl),
            output_controls: pack_output_controls(
                disable_mv,
                ctrl.disable_statistics_output,
                ctrl.enable_8x8_statistics,
            ),
            reserved: [0; 2],
        };
        let param_buf = ffi::VaBuffer::with_data(
            &self.display,
            self.context,
            ffi::VA_STATS_STATISTICS_PARAMETER_BUFFER_TYPE,
            std::slice::from_ref(&params),
        )
        .map_err(BackendError::Other)?;
        // The render list carries the parameter block and the statistics
        // outputs; everything else rides inside the block.
        let mut render: Vec<ffi::VABufferID> = Vec::with_capacity(1 + self.stat_out.len());
        render.push(param_buf.id());
        for buf in &self.stat_out {
            render.push(buf.id());
        }

        check(
            unsafe { ffi::vaBeginPicture(self.display.raw(), self.context, raw.0) },
            "vaBeginPicture",
        )?;
        check(
            unsafe {
                ffi::vaRenderPicture(
                    self.display.raw(),
                    self.context,
                    render.as_mut_ptr(),
                    render.len() as c_int,
                )
            },
            "vaRenderPicture",
        )?;
        check(
            unsafe { ffi::vaEndPicture(self.display.raw(), self.context) },
            "vaEndPicture",
        )?;

        // Both result kinds are routed by parity; a bottom field lands in
        // the bottom buffers no matter which field was coded first.
        self.feedback.lock().unwrap().insert(
            task.status_report[field],
            Feedback {
                surface: raw.0,
                mv: (!disable_mv).then(|| self.mv_out[fid].id()),
                stat: self.stat_out[stat_buffer_index(fid, self.stat_out.len())].id(),
            },
        );

        log::trace!(
            "field {} of frame {} submitted, feedback key {}",
            field,
            task.frame_order,
            task.status_report[field]
        );
        // `transients` and the parameter buffer are destroyed here.
        Ok(())
    }

    fn query_status(&self, task: &mut Task, field: usize) -> BackendResult<()> {
        let fid = task.fid[field];
        let key = task.status_report[field];
        let record = *self
            .feedback
            .lock()
            .unwrap()
            .get(&key)
            .ok_or(BackendError::NotFound)?;

        // Wait outside the cache lock; other fields keep making progress.
        let status = unsafe { ffi::vaSyncSurface(self.display.raw(), record.surface) };
        // Some driver versions report a decoding error for a pure
        // estimation pass. Only that exact code is spurious.
        if !ffi::va_succeeded(status) && status != ffi::VA_STATUS_ERROR_DECODING_ERROR {
            log::error!("vaSyncSurface: {}", ffi::va_error_str(status));
            return Err(BackendError::DeviceFailed);
        }

        let mut surf_status: c_uint = 0;
        check(
            unsafe {
                ffi::vaQuerySurfaceStatus(self.display.raw(), record.surface, &mut surf_status)
            },
            "vaQuerySurfaceStatus",
        )?;
        match surf_status {
            ffi::VA_SURFACE_RENDERING | ffi::VA_SURFACE_DISPLAYING => {
                return Err(BackendError::DeviceBusy)
            }
            ffi::VA_SURFACE_SKIPPED => {
                log::error!("surface {} skipped by the device", record.surface);
                return Err(BackendError::DeviceFailed);
            }
            _ => (),
        }

        let disable_stats = task.fields[field]
            .as_ref()
            .map(|data| data.ctrl.disable_statistics_output)
            .unwrap_or(true);
        let instance = task.instance_of(field);
        let stat_idx = self
            .stat_out
            .iter()
            .position(|b| b.id() == record.stat)
            .ok_or(BackendError::NotFound)?;

        let map_err = |status: ffi::VAStatus| {
            if status == ffi::VA_STATUS_ERROR_ENCODING_ERROR {
                log::error!("GPU hang reported while mapping device output");
                BackendError::GpuHang
            } else {
                log::error!("vaMapBuffer: {}", ffi::va_error_str(status));
                BackendError::DeviceFailed
            }
        };

        if record.mv.is_some() {
            if let Some(out) = task
                .output
                .as_mut()
                .and_then(|output| output.mv_out_mut(instance))
            {
                let ptr = self.mv_out[fid].map().map_err(map_err)?;
                let n = (out.num_mb_alloc as usize).min(out.mb.len());
                // Safe: the device buffer holds at least `num_mb_alloc`
                // records, checked at submission.
                let src =
                    unsafe { std::slice::from_raw_parts(ptr as *const MbMotionVectors, n) };
                out.mb[..n].copy_from_slice(src);
                self.mv_out[fid].unmap();
            }
        }
        if !disable_stats {
            if let Some(out) = task
                .output
                .as_mut()
                .and_then(|output| output.mb_stat_mut(instance))
            {
                let ptr = self.stat_out[stat_idx].map().map_err(map_err)?;
                let n = (out.num_mb_alloc as usize).min(out.mb.len());
                let src = unsafe { std::slice::from_raw_parts(ptr as *const MbStats, n) };
                out.mb[..n].copy_from_slice(src);
                self.stat_out[stat_idx].unmap();
            }
        }

        self.feedback.lock().unwrap().remove(&key);
        log::trace!("field {} of frame {} done", field, task.frame_order);
        Ok(())
    }

    fn destroy(&mut self) -> BackendResult<()> {
        self.feedback.lock().unwrap().clear();
        self.stat_out.clear();
        self.mv_out.clear();
        if !self.registered.is_empty() {
            log::debug!("unbinding {} raw surfaces", self.registered.len());
            self.registered.clear();
        }

        if self.context != ffi::VA_INVALID_ID {
            check(
                unsafe { ffi::vaDestroyContext(self.display.raw(), self.context) },
                "vaDestroyContext",
            )?;
            self.context = ffi::VA_INVALID_ID;
        }
        if self.config != ffi::VA_INVALID_ID {
            check(
                unsafe { ffi::vaDestroyConfig(self.display.raw(), self.config) },
                "vaDestroyConfig",
            )?;
            self.config = ffi::VA_INVALID_ID;
        }
        Ok(())
    }
}

impl Drop for VaapiPreEnc {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            log::error!("tearing the statistics service down failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align(1920, 16), 1920);
        assert_eq!(align(1080, 16), 1088);
        assert_eq!(align(1080, 32), 1088);
        assert_eq!(align(720, 32), 736);
    }

    #[test]
    fn control_word_packing() {
        let ctrl = EstCtrl {
            qp: 26,
            len_sp: 57,
            search_path: 2,
            sub_mb_part_mask: 0x77,
            sub_pel_mode: 3,
            inter_sad: 2,
            intra_sad: 2,
            adaptive_search: true,
            mv_predictor_ctrl: 1,
            mb_qp: false,
            ft_enable: true,
            intra_part_mask: 0x3,
            ref_width: 32,
            ref_height: 32,
            search_window: 5,
            ..Default::default()
        };
        assert_eq!(pack_qp_and_search(&ctrl), 26 | 57 << 8 | 2 << 16);
        assert_eq!(
            pack_search_controls(&ctrl),
            0x77 | 3 << 7 | 2 << 9 | 2 << 11 | 1 << 13 | 1 << 14 | 1 << 18 | 0x3 << 19
        );
        assert_eq!(pack_window(&ctrl), 32 | 32 << 8 | 5 << 16);
        assert_eq!(pack_output_controls(true, false, true), 0b101);
    }

    #[test]
    fn parameter_buffer_layout() {
        // Pointer-heavy common part; the trailing num_outputs, mv_predictor
        // and qp dwords pad it to 80 bytes on 64-bit targets.
        assert_eq!(std::mem::size_of::<ffi::VAStatsStatisticsParameter>(), 80);
        // The six control dwords follow the common part directly.
        assert_eq!(
            std::mem::size_of::<ffi::VAStatsStatisticsParameterH264>(),
            std::mem::size_of::<ffi::VAStatsStatisticsParameter>() + 6 * 4
        );
    }

    #[test]
    fn reference_flags_carry_parity_and_downsampling() {
        let entry = reference_entry(&ResolvedRef {
            raw: RawSurface(7),
            pic_type: PicType::BottomField,
            downsample: TriState::On,
        });
        assert_eq!(entry.picture_id, 7);
        assert_eq!(
            entry.flags,
            ffi::VA_PICTURE_STATS_BOTTOM_FIELD | ffi::VA_PICTURE_STATS_CONTENT_UPDATED
        );
        // Unlike the input picture, a reference is only re-downsampled on
        // explicit request.
        let entry = reference_entry(&ResolvedRef {
            raw: RawSurface(8),
            pic_type: PicType::TopField,
            downsample: TriState::Unknown,
        });
        assert_eq!(entry.flags, ffi::VA_PICTURE_STATS_TOP_FIELD);
    }

    #[test]
    fn statistics_routed_by_field_parity() {
        use crate::PicStruct;

        // Bottom-field-first content still fills the bottom buffer from its
        // first coded field.
        let fids = PicStruct::FieldBff.fids();
        assert_eq!(stat_buffer_index(fids[0], 2), 1);
        assert_eq!(stat_buffer_index(fids[1], 2), 0);
        let fids = PicStruct::FieldTff.fids();
        assert_eq!(stat_buffer_index(fids[0], 2), 0);
        assert_eq!(stat_buffer_index(fids[1], 2), 1);
        assert_eq!(stat_buffer_index(PicStruct::Progressive.fids()[0], 1), 0);
    }

    #[test]
    fn picture_flags_follow_parity_and_downsampling() {
        assert_eq!(
            picture_flags(PicType::Frame, TriState::Unknown, true),
            ffi::VA_PICTURE_STATS_PROGRESSIVE | ffi::VA_PICTURE_STATS_CONTENT_UPDATED
        );
        assert_eq!(
            picture_flags(PicType::BottomField, TriState::Unknown, false),
            ffi::VA_PICTURE_STATS_BOTTOM_FIELD
        );
        assert_eq!(
            picture_flags(PicType::TopField, TriState::Off, true),
            ffi::VA_PICTURE_STATS_TOP_FIELD
        );
    }
}
