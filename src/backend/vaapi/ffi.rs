// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Minimal libva FFI surface for the statistics entrypoint.
//!
//! The statistics buffer types are not covered by the existing safe libva
//! wrappers, so the backend declares the handful of entry points it needs
//! itself and pairs every created object with a guard that releases it on
//! drop. Only the guards and the helpers below are meant to be used outside
//! this module; the raw declarations stay `unsafe`.

#![allow(non_snake_case)]

use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::c_uint;
use std::ffi::c_void;
use std::ffi::CStr;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;

pub type VADisplay = *mut c_void;
pub type VAStatus = c_int;
pub type VAProfile = c_int;
pub type VAEntrypoint = c_int;
pub type VABufferType = c_int;
pub type VAConfigID = u32;
pub type VAContextID = u32;
pub type VASurfaceID = u32;
pub type VABufferID = u32;

pub const VA_STATUS_SUCCESS: VAStatus = 0;
pub const VA_STATUS_ERROR_DECODING_ERROR: VAStatus = 0x17;
pub const VA_STATUS_ERROR_ENCODING_ERROR: VAStatus = 0x18;
pub const VA_INVALID_ID: u32 = 0xffff_ffff;

pub const VA_PROFILE_NONE: VAProfile = -1;
pub const VA_ENTRYPOINT_STATS: VAEntrypoint = 12;

pub const VA_CONFIG_ATTRIB_MAX_PICTURE_WIDTH: c_int = 18;
pub const VA_CONFIG_ATTRIB_MAX_PICTURE_HEIGHT: c_int = 19;
pub const VA_CONFIG_ATTRIB_FEI_MV_PREDICTORS: c_int = 33;
pub const VA_CONFIG_ATTRIB_STATS: c_int = 34;
pub const VA_ATTRIB_NOT_SUPPORTED: u32 = 0x8000_0000;

/// `vaCreateContext` flag.
pub const VA_PROGRESSIVE: c_int = 0x1;

pub const VA_ENC_QP_BUFFER_TYPE: VABufferType = 30;
pub const VA_STATS_STATISTICS_PARAMETER_BUFFER_TYPE: VABufferType = 48;
pub const VA_STATS_STATISTICS_BUFFER_TYPE: VABufferType = 49;
pub const VA_STATS_STATISTICS_BOTTOM_FIELD_BUFFER_TYPE: VABufferType = 50;
pub const VA_STATS_MV_BUFFER_TYPE: VABufferType = 51;
pub const VA_STATS_MV_PREDICTOR_BUFFER_TYPE: VABufferType = 52;

/// `vaQuerySurfaceStatus` results.
pub const VA_SURFACE_RENDERING: c_uint = 1;
pub const VA_SURFACE_DISPLAYING: c_uint = 2;
pub const VA_SURFACE_READY: c_uint = 4;
pub const VA_SURFACE_SKIPPED: c_uint = 8;

/// `VAPictureStats::flags` values.
pub const VA_PICTURE_STATS_PROGRESSIVE: u32 = 0x0;
pub const VA_PICTURE_STATS_TOP_FIELD: u32 = 0x1;
pub const VA_PICTURE_STATS_BOTTOM_FIELD: u32 = 0x2;
/// The picture content changed since it was last downsampled.
pub const VA_PICTURE_STATS_CONTENT_UPDATED: u32 = 0x10;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct VAConfigAttrib {
    pub type_: c_int,
    pub value: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct VAPictureStats {
    pub picture_id: VASurfaceID,
    pub flags: u32,
}

/// Common part of the statistics-function parameter buffer. The reference
/// lists carry parity and content-updated flags per entry; the MV-predictor
/// and per-MB-QP inputs ride inside the block, not on the render list.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct VAStatsStatisticsParameter {
    pub input: VAPictureStats,
    pub past_references: *mut VAPictureStats,
    pub num_past_references: u32,
    pub past_ref_stat_buf: *mut VABufferID,
    pub future_references: *mut VAPictureStats,
    pub num_future_references: u32,
    pub future_ref_stat_buf: *mut VABufferID,
    pub outputs: *mut VABufferID,
    pub num_outputs: u32,
    /// MV-predictor input buffer, `VA_INVALID_ID` when the call has none.
    pub mv_predictor: VABufferID,
    /// Per-MB QP input buffer, `VA_INVALID_ID` when the call has none.
    pub qp: VABufferID,
}

/// H.264 statistics-function parameter buffer. The driver declares the
/// control words as bit fields; they are assembled by hand on our side.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct VAStatsStatisticsParameterH264 {
    pub stats_params: VAStatsStatisticsParameter,
    /// `frame_qp:8 len_sp:8 search_path:8`
    pub qp_and_search: u32,
    /// `sub_mb_part_mask:7 sub_pel_mode:2 inter_sad:2 intra_sad:2
    /// adaptive_search:1 mv_predictor_ctrl:3 mb_qp:1 ft_enable:1
    /// intra_part_mask:5`
    pub search_controls: u32,
    /// `ref_width:8 ref_height:8 search_window:8`
    pub window: u32,
    /// `disable_mv_output:1 disable_statistics_output:1
    /// enable_8x8_statistics:1`
    pub output_controls: u32,
    pub reserved: [u32; 2],
}

#[link(name = "va")]
extern "C" {
    pub fn vaInitialize(
        dpy: VADisplay,
        major_version: *mut c_int,
        minor_version: *mut c_int,
    ) -> VAStatus;

    pub fn vaTerminate(dpy: VADisplay) -> VAStatus;

    pub fn vaErrorStr(error_status: VAStatus) -> *const c_char;

    pub fn vaMaxNumEntrypoints(dpy: VADisplay) -> c_int;

    pub fn vaQueryConfigEntrypoints(
        dpy: VADisplay,
        profile: VAProfile,
        entrypoint_list: *mut VAEntrypoint,
        num_entrypoints: *mut c_int,
    ) -> VAStatus;

    pub fn vaGetConfigAttributes(
        dpy: VADisplay,
        profile: VAProfile,
        entrypoint: VAEntrypoint,
        attrib_list: *mut VAConfigAttrib,
        num_attribs: c_int,
    ) -> VAStatus;

    pub fn vaCreateConfig(
        dpy: VADisplay,
        profile: VAProfile,
        entrypoint: VAEntrypoint,
        attrib_list: *mut VAConfigAttrib,
        num_attribs: c_int,
        config_id: *mut VAConfigID,
    ) -> VAStatus;

    pub fn vaDestroyConfig(dpy: VADisplay, config_id: VAConfigID) -> VAStatus;

    pub fn vaCreateContext(
        dpy: VADisplay,
        config_id: VAConfigID,
        picture_width: c_int,
        picture_height: c_int,
        flag: c_int,
        render_targets: *mut VASurfaceID,
        num_render_targets: c_int,
        context: *mut VAContextID,
    ) -> VAStatus;

    pub fn vaDestroyContext(dpy: VADisplay, context: VAContextID) -> VAStatus;

    pub fn vaCreateBuffer(
        dpy: VADisplay,
        context: VAContextID,
        type_: VABufferType,
        size: c_uint,
        num_elements: c_uint,
        data: *mut c_void,
        buf_id: *mut VABufferID,
    ) -> VAStatus;

    pub fn vaDestroyBuffer(dpy: VADisplay, buffer_id: VABufferID) -> VAStatus;

    pub fn vaMapBuffer(dpy: VADisplay, buf_id: VABufferID, pbuf: *mut *mut c_void) -> VAStatus;

    pub fn vaUnmapBuffer(dpy: VADisplay, buf_id: VABufferID) -> VAStatus;

    pub fn vaBeginPicture(
        dpy: VADisplay,
        context: VAContextID,
        render_target: VASurfaceID,
    ) -> VAStatus;

    pub fn vaRenderPicture(
        dpy: VADisplay,
        context: VAContextID,
        buffers: *mut VABufferID,
        num_buffers: c_int,
    ) -> VAStatus;

    pub fn vaEndPicture(dpy: VADisplay, context: VAContextID) -> VAStatus;

    pub fn vaSyncSurface(dpy: VADisplay, render_target: VASurfaceID) -> VAStatus;

    pub fn vaQuerySurfaceStatus(
        dpy: VADisplay,
        render_target: VASurfaceID,
        status: *mut c_uint,
    ) -> VAStatus;
}

#[link(name = "va-drm")]
extern "C" {
    pub fn vaGetDisplayDRM(fd: c_int) -> VADisplay;
}

pub fn va_succeeded(status: VAStatus) -> bool {
    status == VA_STATUS_SUCCESS
}

/// Human-readable form of a libva status code.
pub fn va_error_str(status: VAStatus) -> String {
    // vaErrorStr always returns a static string.
    let s = unsafe { vaErrorStr(status) };
    if s.is_null() {
        format!("unknown VA error {:#x}", status)
    } else {
        unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned()
    }
}

/// An initialized libva display on a DRM render node. Terminated on drop;
/// the render-node fd lives as long as the display does.
pub struct VaDisplay {
    raw: VADisplay,
    _drm: File,
}

// The display handle is only ever passed to libva entry points, which
// serialize access to it internally.
unsafe impl Send for VaDisplay {}
unsafe impl Sync for VaDisplay {}

impl VaDisplay {
    /// Opens `path` and initializes a VA display on it.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let drm = File::options()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .with_context(|| format!("cannot open {}", path.as_ref().display()))?;

        let raw = unsafe { vaGetDisplayDRM(drm.as_raw_fd()) };
        if raw.is_null() {
            return Err(anyhow!("no VA display on {}", path.as_ref().display()));
        }

        let mut major: c_int = 0;
        let mut minor: c_int = 0;
        let status = unsafe { vaInitialize(raw, &mut major, &mut minor) };
        if !va_succeeded(status) {
            return Err(anyhow!("vaInitialize: {}", va_error_str(status)));
        }
        log::debug!("libva {}.{} initialized", major, minor);

        Ok(Self { raw, _drm: drm })
    }

    pub fn raw(&self) -> VADisplay {
        self.raw
    }
}

impl Drop for VaDisplay {
    fn drop(&mut self) {
        let status = unsafe { vaTerminate(self.raw) };
        if !va_succeeded(status) {
            log::error!("vaTerminate: {}", va_error_str(status));
        }
    }
}

/// A device buffer destroyed on drop.
pub struct VaBuffer {
    display: Arc<VaDisplay>,
    id: VABufferID,
}

impl VaBuffer {
    /// Creates a buffer of `num_elements * element_size` bytes, initialized
    /// from `data` unless it is null.
    ///
    /// # Safety
    /// `data` must be null or point to at least that many readable bytes.
    pub unsafe fn new(
        display: &Arc<VaDisplay>,
        context: VAContextID,
        type_: VABufferType,
        element_size: usize,
        num_elements: u32,
        data: *mut c_void,
    ) -> anyhow::Result<Self> {
        let mut id: VABufferID = VA_INVALID_ID;
        let status = vaCreateBuffer(
            display.raw(),
            context,
            type_,
            element_size as c_uint,
            num_elements,
            data,
            &mut id,
        );
        if !va_succeeded(status) {
            return Err(anyhow!(
                "vaCreateBuffer(type {}): {}",
                type_,
                va_error_str(status)
            ));
        }
        Ok(Self {
            display: Arc::clone(display),
            id,
        })
    }

    /// Creates a buffer initialized from a slice of device-layout records.
    pub fn with_data<T: Copy>(
        display: &Arc<VaDisplay>,
        context: VAContextID,
        type_: VABufferType,
        data: &[T],
    ) -> anyhow::Result<Self> {
        // Safe: the slice outlives the call and vaCreateBuffer copies it.
        unsafe {
            Self::new(
                display,
                context,
                type_,
                std::mem::size_of::<T>(),
                data.len() as u32,
                data.as_ptr() as *mut c_void,
            )
        }
    }

    /// Creates an uninitialized buffer for device output.
    pub fn empty(
        display: &Arc<VaDisplay>,
        context: VAContextID,
        type_: VABufferType,
        element_size: usize,
        num_elements: u32,
    ) -> anyhow::Result<Self> {
        unsafe {
            Self::new(
                display,
                context,
                type_,
                element_size,
                num_elements,
                std::ptr::null_mut(),
            )
        }
    }

    pub fn id(&self) -> VABufferID {
        self.id
    }

    /// Maps the buffer and returns the raw status on failure so the caller
    /// can tell a GPU hang apart from other errors.
    pub fn map(&self) -> Result<*mut c_void, VAStatus> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let status = unsafe { vaMapBuffer(self.display.raw(), self.id, &mut ptr) };
        if va_succeeded(status) && !ptr.is_null() {
            Ok(ptr)
        } else {
            Err(status)
        }
    }

    pub fn unmap(&self) {
        let status = unsafe { vaUnmapBuffer(self.display.raw(), self.id) };
        if !va_succeeded(status) {
            log::error!("vaUnmapBuffer({}): {}", self.id, va_error_str(status));
        }
    }
}

impl Drop for VaBuffer {
    fn drop(&mut self) {
        let status = unsafe { vaDestroyBuffer(self.display.raw(), self.id) };
        if !va_succeeded(status) {
            log::error!("vaDestroyBuffer({}): {}", self.id, va_error_str(status));
        }
    }
}
