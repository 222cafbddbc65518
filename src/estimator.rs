// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Asynchronous estimation session.
//!
//! A [`PreEncSession`] accepts one frame (or one field, in single-field
//! mode) per [`PreEncSession::submit`] call and answers with two
//! [`WorkItem`]s. The surrounding scheduler invokes them later, execute
//! before query, possibly from different threads and for several tasks at
//! once. Query returns [`BackendError::DeviceBusy`] while the device is
//! still working; the scheduler polls until the filled output buffers come
//! back.

pub mod params;
pub mod task;

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use thiserror::Error;

use crate::backend::AccelParams;
use crate::backend::BackendError;
use crate::backend::DdiCaps;
use crate::backend::DriverEncoder;
use crate::backend::RawSurface;
use crate::estimator::params::EstInput;
use crate::estimator::params::EstOutput;
use crate::estimator::params::RefPicture;
use crate::estimator::task::FieldTurn;
use crate::estimator::task::ResolvedRef;
use crate::estimator::task::TaskId;
use crate::estimator::task::TaskPool;
use crate::estimator::task::TaskState;
use crate::Resolution;

pub use crate::estimator::task::Task;

/// Error returned by session operations.
#[derive(Error, Debug)]
pub enum PreEncError {
    #[error("invalid value in the submitted control data")]
    InvalidVideoParam,
    #[error("control data incompatible with the negotiated session geometry")]
    IncompatibleVideoParam,
    /// The caller broke a contract the session cannot recover from, e.g. a
    /// missing or undersized buffer. This is likely a bug in the caller.
    #[error("caller contract violation")]
    UndefinedBehavior,
    #[error("task is not on the incoming list")]
    NotFound,
    #[error("no free task slot, async depth exceeded")]
    ResourceExhausted,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Where the pixel data of a submitted picture lives.
#[derive(Clone, Debug)]
pub enum FrameMem {
    /// Already resident in device memory.
    Device(RawSurface),
    /// System memory, uploaded into an internal raw slot at execute time.
    System(Vec<u8>),
}

/// A caller-owned input picture.
#[derive(Clone, Debug)]
pub struct FrameSurface {
    pub mem: FrameMem,
    pub resolution: Resolution,
    pub frame_order: u32,
    pub timestamp: u64,
}

/// Pre-allocated scratch for SEI payload assembly. The statistics function
/// itself emits no SEI; the carrier is threaded through execute so backends
/// sharing the submission path can append packed headers without
/// reallocating.
#[derive(Default)]
pub struct SeiScratch(pub Vec<u8>);

/// Supplier of the session's internal raw surfaces and of uploads into
/// them. Backing memory management stays with the caller.
pub trait FrameAllocator {
    /// Device handle of internal raw slot `index`, `index < async_depth`.
    fn raw_surface(&self, index: usize) -> anyhow::Result<RawSurface>;

    /// Copies a system-memory frame into the raw slot `dst`.
    fn upload(&self, frame: &FrameSurface, dst: RawSurface) -> anyhow::Result<()>;
}

/// A deferred stage of one submission. The scheduler invokes each item
/// exactly once, execute before query, re-invoking query while it reports
/// [`BackendError::DeviceBusy`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkItem {
    Execute(TaskId),
    Query(TaskId),
}

/// An open estimation session.
pub struct PreEncSession<D: DriverEncoder, A: FrameAllocator> {
    ddi: D,
    allocator: A,
    par: AccelParams,
    pool: TaskPool,
    sei: SeiScratch,
    /// Single-field mode bookkeeping; untouched in frame mode.
    turn: Mutex<FieldTurn>,
    /// Round-robin cursor over the raw-surface slots.
    raw_cursor: AtomicUsize,
    /// Source of per-field feedback keys.
    status_counter: AtomicU32,
    closed: bool,
}

fn open_service<D: DriverEncoder, A: FrameAllocator>(
    ddi: &mut D,
    allocator: &A,
    par: &AccelParams,
) -> Result<DdiCaps, PreEncError> {
    let caps = ddi.query_caps()?;
    if par.resolution.width > caps.max_pic_width || par.resolution.height > caps.max_pic_height {
        log::error!(
            "{}x{} exceeds the driver limit of {}x{}",
            par.resolution.width,
            par.resolution.height,
            caps.max_pic_width,
            caps.max_pic_height
        );
        return Err(BackendError::Unsupported.into());
    }

    ddi.create_accel_service(par)?;

    let mut raws = Vec::with_capacity(par.async_depth.max(1));
    for i in 0..par.async_depth.max(1) {
        raws.push(allocator.raw_surface(i).map_err(BackendError::from)?);
    }
    ddi.register(&raws)?;

    Ok(caps)
}

fn resolve_ref(r: &RefPicture) -> Result<ResolvedRef, PreEncError> {
    // References must already be device resident.
    match &r.surface.mem {
        FrameMem::Device(raw) => Ok(ResolvedRef {
            raw: *raw,
            pic_type: r.pic_type,
            downsample: r.downsample,
        }),
        FrameMem::System(_) => Err(PreEncError::UndefinedBehavior),
    }
}

impl<D: DriverEncoder, A: FrameAllocator> PreEncSession<D, A> {
    /// Opens the acceleration service and builds the task pool.
    pub fn init(mut ddi: D, allocator: A, par: AccelParams) -> Result<Self, PreEncError> {
        let caps = open_service(&mut ddi, &allocator, &par)?;
        log::debug!(
            "estimation session open: {}x{} {:?}, depth {}, caps {:?}",
            par.resolution.width,
            par.resolution.height,
            par.pic_struct,
            par.async_depth,
            caps
        );

        Ok(Self {
            ddi,
            allocator,
            pool: TaskPool::new(par.async_depth.max(1)),
            par,
            sei: SeiScratch::default(),
            turn: Mutex::new(FieldTurn::First),
            raw_cursor: AtomicUsize::new(0),
            status_counter: AtomicU32::new(1),
            closed: false,
        })
    }

    /// Validates one call and commits it to a task slot.
    ///
    /// Nothing is touched on a validation failure, so the caller may fix the
    /// controls and resubmit. On success the input surface stays referenced
    /// until the returned query item completes.
    pub fn submit(
        &self,
        input: EstInput,
        output: EstOutput,
    ) -> Result<(WorkItem, WorkItem), PreEncError> {
        // In single-field mode the turn is held until the call commits, so
        // pipelined submissions each claim their own field.
        let mut turn = if self.par.single_field_mode {
            Some(self.turn.lock().unwrap())
        } else {
            None
        };
        let fields: Vec<usize> = match &turn {
            Some(turn) => vec![turn.index()],
            None => (0..self.par.pic_struct.num_fields()).collect(),
        };

        let verdict = params::validate(
            self.par.resolution,
            self.par.pic_struct,
            &fields,
            &input,
            &output,
        )?;

        let id = self.pool.acquire()?;
        if let Some(turn) = turn.as_deref_mut() {
            *turn = turn.flipped();
        }
        drop(turn);
        let EstInput { surface, ext } = input;

        // Split the instance lists so each field owns its buffers.
        let mut ctrls = Vec::new();
        let mut preds = Vec::new();
        let mut qps = Vec::new();
        for buffer in ext {
            match buffer {
                params::InExtBuffer::Ctrl(c) => ctrls.push(c),
                params::InExtBuffer::MvPredictors(p) => preds.push(p),
                params::InExtBuffer::MbQp(q) => qps.push(q),
            }
        }
        let mut ctrls = ctrls.into_iter();
        let mut preds = preds.into_iter();
        let mut qps = qps.into_iter();

        let mut task = self.pool.slot(id);
        task.state = TaskState::Queued;
        task.pic_struct = self.par.pic_struct;
        task.fid = self.par.pic_struct.fids();
        task.frame_type = verdict.frame_type;
        task.frame_order = surface.frame_order;
        task.timestamp = surface.timestamp;
        for &f in &fields {
            task.status_report[f] = self.status_counter.fetch_add(1, Ordering::Relaxed);
            task.fields[f] = Some(task::FieldData {
                ctrl: ctrls.next().ok_or(PreEncError::UndefinedBehavior)?,
                mv_predictors: preds.next(),
                mb_qp: qps.next(),
                refs: Default::default(),
            });
        }
        task.surface = Some(surface);
        task.output = Some(output);

        log::trace!(
            "frame {} submitted as task {} covering fields {:?}",
            task.frame_order,
            id,
            fields
        );

        Ok((WorkItem::Execute(id), WorkItem::Query(id)))
    }

    /// Submits a queued task to the device.
    pub fn execute(&self, item: WorkItem) -> Result<(), PreEncError> {
        let WorkItem::Execute(id) = item else {
            return Err(PreEncError::UndefinedBehavior);
        };
        if !self.pool.is_incoming(id) {
            return Err(PreEncError::NotFound);
        }
        let mut task = self.pool.slot(id);

        let raw_idx = self.raw_cursor.fetch_add(1, Ordering::Relaxed) % self.pool.depth();
        task.raw_idx = raw_idx;
        let raw_slot = self
            .allocator
            .raw_surface(raw_idx)
            .map_err(BackendError::from)?;

        let surface = task.surface.clone().ok_or(PreEncError::UndefinedBehavior)?;
        let handle = match &surface.mem {
            FrameMem::Device(raw) => *raw,
            FrameMem::System(_) => {
                self.allocator
                    .upload(&surface, raw_slot)
                    .map_err(BackendError::from)?;
                raw_slot
            }
        };
        task.raw = Some(handle);

        for f in 0..2 {
            let Some(field) = task.fields[f].as_mut() else {
                continue;
            };
            field.refs.past = field.ctrl.refs[0].as_ref().map(resolve_ref).transpose()?;
            field.refs.future = field.ctrl.refs[1].as_ref().map(resolve_ref).transpose()?;
        }

        task.state = TaskState::Executing;
        let fields: Vec<usize> = task.coded_fields().collect();
        for f in fields {
            if let Err(e) = self.ddi.execute(handle, &task, f, &self.sei) {
                log::error!("device submission of task {} field {} failed: {}", id, f, e);
                task.state = TaskState::Failed;
                return Err(e.into());
            }
        }

        Ok(())
    }

    /// Polls a task and, once every covered field is done, hands the filled
    /// output buffers back and recycles the slot.
    ///
    /// [`BackendError::DeviceBusy`] leaves the task untouched; any other
    /// driver error strands it on the incoming list until [`Self::close`].
    pub fn query(&self, item: WorkItem) -> Result<EstOutput, PreEncError> {
        let WorkItem::Query(id) = item else {
            return Err(PreEncError::UndefinedBehavior);
        };
        if !self.pool.is_incoming(id) {
            return Err(PreEncError::NotFound);
        }
        let mut task = self.pool.slot(id);
        if task.state == TaskState::Failed {
            return Err(BackendError::DeviceFailed.into());
        }

        let fields: Vec<usize> = task.coded_fields().collect();
        for f in fields {
            if task.harvested[f] {
                continue;
            }
            match self.ddi.query_status(&mut task, f) {
                Ok(()) => task.harvested[f] = true,
                Err(BackendError::DeviceBusy) => return Err(BackendError::DeviceBusy.into()),
                Err(e) => {
                    log::error!("task {} field {} failed in the device: {}", id, f, e);
                    task.state = TaskState::Failed;
                    return Err(e.into());
                }
            }
        }

        let output = task.output.take().ok_or(PreEncError::UndefinedBehavior)?;
        // Unpin the input surface.
        task.surface = None;
        log::trace!("task {} complete, frame {}", id, task.frame_order);
        drop(task);

        self.pool.release(id)?;
        Ok(output)
    }

    /// Drains every outstanding task, then tears the service down.
    /// Idempotent.
    pub fn close(&mut self) -> Result<(), PreEncError> {
        if self.closed {
            return Ok(());
        }

        for id in self.pool.incoming() {
            loop {
                let mut task = self.pool.slot(id);
                if task.state == TaskState::Failed {
                    break;
                }
                let pending: Vec<usize> = task
                    .coded_fields()
                    .filter(|&f| !task.harvested[f])
                    .collect();
                let mut busy = false;
                for f in pending {
                    match self.ddi.query_status(&mut task, f) {
                        Ok(()) => task.harvested[f] = true,
                        Err(BackendError::DeviceBusy) => {
                            busy = true;
                            break;
                        }
                        Err(e) => {
                            log::warn!("dropping task {} at close: {}", id, e);
                            task.state = TaskState::Failed;
                            break;
                        }
                    }
                }
                if !busy {
                    break;
                }
                drop(task);
                std::thread::yield_now();
            }
            let _ = self.pool.release(id);
        }

        self.ddi.destroy()?;
        self.closed = true;
        Ok(())
    }

    /// Closes the current service and reopens it with new geometry. Not
    /// callable while tasks are in flight in a meaningful way: outstanding
    /// work is drained like at close.
    pub fn reset(&mut self, par: AccelParams) -> Result<(), PreEncError> {
        self.close()?;
        open_service(&mut self.ddi, &self.allocator, &par)?;
        self.pool = TaskPool::new(par.async_depth.max(1));
        self.par = par;
        *self.turn.get_mut().unwrap() = FieldTurn::First;
        self.raw_cursor.store(0, Ordering::Relaxed);
        self.closed = false;
        log::debug!("estimation session reset");
        Ok(())
    }
}

impl<D: DriverEncoder, A: FrameAllocator> Drop for PreEncSession<D, A> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("closing the estimation session failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::dummy::DummyAllocator;
    use crate::backend::dummy::DummyEncoder;
    use crate::estimator::params::EstCtrl;
    use crate::estimator::params::InExtBuffer;
    use crate::estimator::params::MbMotionVectors;
    use crate::estimator::params::MbStatOut;
    use crate::estimator::params::MbStats;
    use crate::estimator::params::MvOut;
    use crate::estimator::params::OutExtBuffer;
    use crate::estimator::params::PicType;
    use crate::PicStruct;

    const RES: Resolution = Resolution {
        width: 352,
        height: 288,
    };

    fn session(
        depth: usize,
        pic_struct: PicStruct,
        single_field_mode: bool,
        ddi: DummyEncoder,
    ) -> PreEncSession<DummyEncoder, DummyAllocator> {
        PreEncSession::init(
            ddi,
            DummyAllocator::default(),
            AccelParams {
                resolution: RES,
                pic_struct,
                single_field_mode,
                async_depth: depth,
            },
        )
        .unwrap()
    }

    fn frame(frame_order: u32) -> Arc<FrameSurface> {
        Arc::new(FrameSurface {
            mem: FrameMem::Device(RawSurface(0x80 + frame_order)),
            resolution: RES,
            frame_order,
            timestamp: frame_order as u64 * 33,
        })
    }

    fn ctrl(pic_type: PicType) -> EstCtrl {
        EstCtrl {
            pic_type,
            search_window: 5,
            ..Default::default()
        }
    }

    fn field_output(num_mb: u32) -> Vec<OutExtBuffer> {
        vec![
            OutExtBuffer::MvOut(MvOut {
                num_mb_alloc: num_mb,
                mb: vec![MbMotionVectors::default(); num_mb as usize],
            }),
            OutExtBuffer::MbStat(MbStatOut {
                num_mb_alloc: num_mb,
                mb: vec![MbStats::default(); num_mb as usize],
            }),
        ]
    }

    fn progressive_call(frame_order: u32) -> (EstInput, EstOutput) {
        (
            EstInput {
                surface: frame(frame_order),
                ext: vec![InExtBuffer::Ctrl(ctrl(PicType::Frame))],
            },
            EstOutput {
                ext: field_output(RES.num_mbs()),
            },
        )
    }

    #[test]
    fn full_progressive_cycle() {
        let s = session(2, PicStruct::Progressive, false, DummyEncoder::default());
        let (input, output) = progressive_call(0);
        let (exec, query) = s.submit(input, output).unwrap();
        s.execute(exec).unwrap();
        let out = s.query(query).unwrap();
        // The dummy device stamps the feedback key into the first MB.
        assert_eq!(out.mb_stat(0).unwrap().mb[0].best_inter_distortion, 1);
        assert_eq!(out.mv_out(0).unwrap().mb[0].mv[0].l0.x, 1);
        // The slot is reusable.
        let (input, output) = progressive_call(1);
        s.submit(input, output).unwrap();
    }

    #[test]
    fn pool_exhaustion_at_depth() {
        let s = session(4, PicStruct::Progressive, false, DummyEncoder::default());
        for i in 0..4 {
            let (input, output) = progressive_call(i);
            s.submit(input, output).unwrap();
        }
        let (input, output) = progressive_call(4);
        assert!(matches!(
            s.submit(input, output),
            Err(PreEncError::ResourceExhausted)
        ));
    }

    #[test]
    fn busy_device_leaves_task_pending() {
        let ddi = DummyEncoder {
            busy_polls: 3,
            ..Default::default()
        };
        let s = session(1, PicStruct::Progressive, false, ddi);
        let (input, output) = progressive_call(0);
        let (exec, query) = s.submit(input, output).unwrap();
        s.execute(exec).unwrap();
        for _ in 0..3 {
            assert!(matches!(
                s.query(query),
                Err(PreEncError::Backend(BackendError::DeviceBusy))
            ));
        }
        // Still pending, the pool stays full.
        let (input, output) = progressive_call(1);
        assert!(matches!(
            s.submit(input, output),
            Err(PreEncError::ResourceExhausted)
        ));
        s.query(query).unwrap();
    }

    #[test]
    fn completed_task_cannot_be_queried_again() {
        let s = session(2, PicStruct::Progressive, false, DummyEncoder::default());
        let (input, output) = progressive_call(0);
        let (exec, query) = s.submit(input, output).unwrap();
        s.execute(exec).unwrap();
        s.query(query).unwrap();
        assert!(matches!(s.query(query), Err(PreEncError::NotFound)));
    }

    #[test]
    fn interlaced_frame_covers_both_fields() {
        let s = session(2, PicStruct::FieldTff, false, DummyEncoder::default());
        let field_mb = PicStruct::FieldTff.num_mbs_per_unit(RES);
        let mut ext = field_output(field_mb);
        ext.extend(field_output(field_mb));
        let input = EstInput {
            surface: frame(0),
            ext: vec![
                InExtBuffer::Ctrl(ctrl(PicType::TopField)),
                InExtBuffer::Ctrl(ctrl(PicType::BottomField)),
            ],
        };
        let (exec, query) = s.submit(input, EstOutput { ext }).unwrap();
        s.execute(exec).unwrap();
        let out = s.query(query).unwrap();
        assert_eq!(out.mb_stat(0).unwrap().mb[0].best_inter_distortion, 1);
        assert_eq!(out.mb_stat(1).unwrap().mb[0].best_inter_distortion, 2);
    }

    #[test]
    fn interlaced_bff_frame_codes_bottom_field_first() {
        let s = session(2, PicStruct::FieldBff, false, DummyEncoder::default());
        let field_mb = PicStruct::FieldBff.num_mbs_per_unit(RES);
        let mut ext = field_output(field_mb);
        ext.extend(field_output(field_mb));
        let input = EstInput {
            surface: frame(0),
            ext: vec![
                InExtBuffer::Ctrl(ctrl(PicType::BottomField)),
                InExtBuffer::Ctrl(ctrl(PicType::TopField)),
            ],
        };
        let (exec, query) = s.submit(input, EstOutput { ext }).unwrap();
        s.execute(exec).unwrap();
        let out = s.query(query).unwrap();
        // Instance 0 is the bottom field, coded and keyed first.
        assert_eq!(out.mb_stat(0).unwrap().mb[0].best_inter_distortion, 1);
        assert_eq!(out.mb_stat(1).unwrap().mb[0].best_inter_distortion, 2);
        assert_eq!(
            s.ddi
                .executed
                .lock()
                .unwrap()
                .iter()
                .map(|&(_, f)| f)
                .collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn single_field_calls_queue_ahead_of_execution() {
        let s = session(2, PicStruct::FieldTff, true, DummyEncoder::default());
        let field_mb = PicStruct::FieldTff.num_mbs_per_unit(RES);

        // Both fields are declared before the device sees either call.
        let input = EstInput {
            surface: frame(0),
            ext: vec![InExtBuffer::Ctrl(ctrl(PicType::TopField))],
        };
        let output = EstOutput {
            ext: field_output(field_mb),
        };
        let (exec_top, query_top) = s.submit(input, output).unwrap();
        let input = EstInput {
            surface: frame(0),
            ext: vec![InExtBuffer::Ctrl(ctrl(PicType::BottomField))],
        };
        let output = EstOutput {
            ext: field_output(field_mb),
        };
        let (exec_bottom, query_bottom) = s.submit(input, output).unwrap();

        s.execute(exec_top).unwrap();
        s.execute(exec_bottom).unwrap();
        s.query(query_top).unwrap();
        s.query(query_bottom).unwrap();

        assert_eq!(
            s.ddi
                .executed
                .lock()
                .unwrap()
                .iter()
                .map(|&(_, f)| f)
                .collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn single_field_mode_alternates() {
        let ddi = DummyEncoder::default();
        let s = session(2, PicStruct::FieldTff, true, ddi);
        let field_mb = PicStruct::FieldTff.num_mbs_per_unit(RES);

        // First call: the top field.
        let input = EstInput {
            surface: frame(0),
            ext: vec![InExtBuffer::Ctrl(ctrl(PicType::TopField))],
        };
        let output = EstOutput {
            ext: field_output(field_mb),
        };
        let (exec, query) = s.submit(input, output).unwrap();
        s.execute(exec).unwrap();
        s.query(query).unwrap();

        // Second call: the bottom field of the same frame.
        let input = EstInput {
            surface: frame(0),
            ext: vec![InExtBuffer::Ctrl(ctrl(PicType::BottomField))],
        };
        let output = EstOutput {
            ext: field_output(field_mb),
        };
        let (exec, query) = s.submit(input, output).unwrap();
        s.execute(exec).unwrap();
        s.query(query).unwrap();

        assert_eq!(
            s.ddi
                .executed
                .lock()
                .unwrap()
                .iter()
                .map(|&(_, f)| f)
                .collect::<Vec<_>>(),
            vec![0, 1]
        );
        // An even number of calls puts the turn back at the first field.
        assert_eq!(*s.turn.lock().unwrap(), FieldTurn::First);
    }

    #[test]
    fn failed_execute_strands_the_task_until_close() {
        let ddi = DummyEncoder {
            fail_execute: true,
            ..Default::default()
        };
        let mut s = session(1, PicStruct::Progressive, false, ddi);
        let (input, output) = progressive_call(0);
        let (exec, query) = s.submit(input, output).unwrap();
        assert!(s.execute(exec).is_err());
        assert!(matches!(
            s.query(query),
            Err(PreEncError::Backend(BackendError::DeviceFailed))
        ));
        // The slot is not recycled while the session lives.
        let (input, output) = progressive_call(1);
        assert!(matches!(
            s.submit(input, output),
            Err(PreEncError::ResourceExhausted)
        ));
        s.close().unwrap();
    }

    #[test]
    fn init_rejects_frames_beyond_caps() {
        let result = PreEncSession::init(
            DummyEncoder::default(),
            DummyAllocator::default(),
            AccelParams {
                resolution: Resolution::new(16384, 16384),
                ..Default::default()
            },
        );
        assert!(matches!(
            result,
            Err(PreEncError::Backend(BackendError::Unsupported))
        ));
    }

    #[test]
    fn system_memory_frames_are_uploaded() {
        let s = session(2, PicStruct::Progressive, false, DummyEncoder::default());
        let input = EstInput {
            surface: Arc::new(FrameSurface {
                mem: FrameMem::System(vec![0u8; (RES.width * RES.height * 3 / 2) as usize]),
                resolution: RES,
                frame_order: 0,
                timestamp: 0,
            }),
            ext: vec![InExtBuffer::Ctrl(ctrl(PicType::Frame))],
        };
        let output = EstOutput {
            ext: field_output(RES.num_mbs()),
        };
        let (exec, query) = s.submit(input, output).unwrap();
        s.execute(exec).unwrap();
        s.query(query).unwrap();
        assert_eq!(s.allocator.uploads.lock().unwrap().len(), 1);
    }
}
