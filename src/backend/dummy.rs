// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the
//! session run so we can test the task lifecycle in isolation.
//!
//! Completion is scriptable: each field answers [`BackendError::DeviceBusy`]
//! `busy_polls` times before reporting ready, and ready fields stamp their
//! feedback key into the first macroblock of the caller's output buffers so
//! tests can tell fields apart.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;

use crate::backend::AccelParams;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::DdiCaps;
use crate::backend::DriverEncoder;
use crate::backend::RawSurface;
use crate::estimator::FrameAllocator;
use crate::estimator::FrameSurface;
use crate::estimator::SeiScratch;
use crate::estimator::Task;

#[derive(Default)]
pub struct DummyEncoder {
    /// Whether the acceleration service is open.
    pub created: bool,
    /// Surfaces bound through [`DriverEncoder::register`].
    pub registered: Vec<RawSurface>,
    /// Busy answers each field serves before it completes.
    pub busy_polls: usize,
    /// Fail every device submission.
    pub fail_execute: bool,
    /// `(frame_order, coded field)` log of device submissions.
    pub executed: Mutex<Vec<(u32, usize)>>,
    /// Feedback key to remaining busy polls.
    pub feedback: Mutex<HashMap<u32, usize>>,
}

impl DriverEncoder for DummyEncoder {
    fn query_caps(&self) -> BackendResult<DdiCaps> {
        Ok(DdiCaps {
            max_pic_width: 4096,
            max_pic_height: 4096,
            max_num_mv_predictors: 3,
        })
    }

    fn create_accel_service(&mut self, _par: &AccelParams) -> BackendResult<()> {
        self.created = true;
        Ok(())
    }

    fn register(&mut self, surfaces: &[RawSurface]) -> BackendResult<()> {
        self.registered = surfaces.to_vec();
        Ok(())
    }

    fn execute(
        &self,
        _raw: RawSurface,
        task: &Task,
        field: usize,
        _sei: &SeiScratch,
    ) -> BackendResult<()> {
        if self.fail_execute {
            return Err(BackendError::DeviceFailed);
        }
        self.executed
            .lock()
            .unwrap()
            .push((task.frame_order, field));
        self.feedback
            .lock()
            .unwrap()
            .insert(task.status_report[field], self.busy_polls);
        Ok(())
    }

    fn query_status(&self, task: &mut Task, field: usize) -> BackendResult<()> {
        let key = task.status_report[field];
        let mut feedback = self.feedback.lock().unwrap();
        let polls = feedback.get_mut(&key).ok_or(BackendError::NotFound)?;
        if *polls > 0 {
            *polls -= 1;
            return Err(BackendError::DeviceBusy);
        }
        feedback.remove(&key);
        drop(feedback);

        let (disable_mv, disable_stat) = {
            let data = task.fields[field]
                .as_ref()
                .ok_or_else(|| BackendError::Other(anyhow!("no data for field {}", field)))?;
            (
                data.ctrl.disable_mv_output,
                data.ctrl.disable_statistics_output,
            )
        };
        let instance = task.instance_of(field);
        let output = task
            .output
            .as_mut()
            .ok_or_else(|| BackendError::Other(anyhow!("task has no output buffers")))?;
        if !disable_stat {
            if let Some(mb) = output
                .mb_stat_mut(instance)
                .and_then(|stat| stat.mb.first_mut())
            {
                mb.best_inter_distortion = key as u16;
            }
        }
        if !disable_mv {
            if let Some(mb) = output.mv_out_mut(instance).and_then(|mv| mv.mb.first_mut()) {
                mb.mv[0].l0.x = key as i16;
            }
        }
        Ok(())
    }

    fn destroy(&mut self) -> BackendResult<()> {
        self.created = false;
        Ok(())
    }
}

#[derive(Default)]
pub struct DummyAllocator {
    /// `(frame_order, destination)` log of uploads.
    pub uploads: Mutex<Vec<(u32, RawSurface)>>,
}

impl FrameAllocator for DummyAllocator {
    fn raw_surface(&self, index: usize) -> anyhow::Result<RawSurface> {
        Ok(RawSurface(0x1000 + index as u32))
    }

    fn upload(&self, frame: &FrameSurface, dst: RawSurface) -> anyhow::Result<()> {
        self.uploads.lock().unwrap().push((frame.frame_order, dst));
        Ok(())
    }
}
