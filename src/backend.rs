// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Driver interface of the estimation pipeline.
//!
//! A [`DriverEncoder`] is the session's only view of the hardware: it opens
//! the acceleration service, takes one field at a time to estimate and later
//! reports per-field completion. The VAAPI implementation drives the
//! statistics entrypoint of the encode engine; the dummy implementation backs
//! the tests of the portable core.

pub mod dummy;
#[cfg(feature = "vaapi")]
pub mod vaapi;

use thiserror::Error;

use crate::estimator::SeiScratch;
use crate::estimator::Task;
use crate::PicStruct;
use crate::Resolution;

/// Error returned by [`DriverEncoder`] operations.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The device has not finished the work item yet. The only retryable
    /// error: poll again later, nothing has been lost.
    #[error("device busy")]
    DeviceBusy,
    #[error("device failure")]
    DeviceFailed,
    #[error("GPU hang detected while mapping device output")]
    GpuHang,
    #[error("operation not supported by the driver")]
    Unsupported,
    /// No feedback record for the queried field. This is likely a bug.
    #[error("no feedback record for the queried field")]
    NotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// An opaque device surface handle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RawSurface(pub u32);

/// Driver limits reported before the acceleration service is opened.
#[derive(Copy, Clone, Debug, Default)]
pub struct DdiCaps {
    pub max_pic_width: u32,
    pub max_pic_height: u32,
    /// Maximum number of caller-seeded MV predictors per macroblock.
    pub max_num_mv_predictors: u32,
}

/// Negotiated session geometry. Validation of these values against the
/// driver caps happens upstream; by the time they reach a backend they are
/// trusted.
#[derive(Copy, Clone, Debug, Default)]
pub struct AccelParams {
    pub resolution: Resolution,
    pub pic_struct: PicStruct,
    /// One field per call instead of a whole frame per call.
    pub single_field_mode: bool,
    /// Task pool depth; also the size of the internal raw-surface pool.
    pub async_depth: usize,
}

/// The hardware seam of the estimation pipeline.
///
/// `execute` and `query_status` take `&self` because the surrounding
/// scheduler may run them in parallel for different tasks; implementations
/// guard their own mutable state.
pub trait DriverEncoder {
    /// Reports the driver limits for the estimation function.
    fn query_caps(&self) -> BackendResult<DdiCaps>;

    /// Opens the acceleration service and allocates the per-session output
    /// buffers.
    fn create_accel_service(&mut self, par: &AccelParams) -> BackendResult<()>;

    /// Binds externally allocated input surfaces to the service.
    fn register(&mut self, surfaces: &[RawSurface]) -> BackendResult<()>;

    /// Submits coded field `field` of `task` to the device. `raw` is the
    /// resolved handle of the input picture.
    fn execute(
        &self,
        raw: RawSurface,
        task: &Task,
        field: usize,
        sei: &SeiScratch,
    ) -> BackendResult<()>;

    /// Polls coded field `field` of `task` and, once ready, copies the
    /// device results into the task's output buffers.
    fn query_status(&self, task: &mut Task, field: usize) -> BackendResult<()>;

    /// Tears the acceleration service down. Idempotent.
    fn destroy(&mut self) -> BackendResult<()>;
}
