// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-size task arena.
//!
//! A session owns as many task slots as its async depth. Slots move between a
//! free list and an incoming list by index; the lists live behind one mutex
//! that is only ever held for the splice itself, never across a driver call.
//! Slot payloads have their own per-slot mutex so execute and query callbacks
//! for different tasks can run in parallel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::backend::RawSurface;
use crate::estimator::params::EstCtrl;
use crate::estimator::params::EstOutput;
use crate::estimator::params::FrameType;
use crate::estimator::params::MbQp;
use crate::estimator::params::MvPredictors;
use crate::estimator::params::PicType;
use crate::estimator::params::TriState;
use crate::estimator::FrameSurface;
use crate::estimator::PreEncError;
use crate::FieldId;
use crate::PicStruct;

/// Index of a task slot within the pool.
pub type TaskId = usize;

/// Lifecycle of a task slot.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TaskState {
    #[default]
    Free,
    /// Submitted, waiting for its execute callback.
    Queued,
    /// Submitted to the device, waiting for its query callback.
    Executing,
    /// A driver call failed; the slot stays on the incoming list until the
    /// session closes.
    Failed,
}

/// A reference picture resolved to its device handle.
#[derive(Copy, Clone, Debug)]
pub struct ResolvedRef {
    pub raw: RawSurface,
    pub pic_type: PicType,
    pub downsample: TriState,
}

/// Device handles of the references of one field, filled in at execute time.
#[derive(Copy, Clone, Debug, Default)]
pub struct FieldRefs {
    pub past: Option<ResolvedRef>,
    pub future: Option<ResolvedRef>,
}

/// Everything the driver needs about one coded field.
#[derive(Clone, Debug)]
pub struct FieldData {
    pub ctrl: EstCtrl,
    pub mv_predictors: Option<MvPredictors>,
    pub mb_qp: Option<MbQp>,
    pub refs: FieldRefs,
}

/// One in-flight estimation, pinned to a pool slot from submit to
/// completion.
#[derive(Default)]
pub struct Task {
    pub state: TaskState,
    /// The submitted picture. Holding the `Arc` keeps the caller's surface
    /// alive while the device reads it; dropped when the task completes.
    pub surface: Option<Arc<FrameSurface>>,
    pub pic_struct: PicStruct,
    /// Parity of each coded field, `PicStruct::fids()` at submit time.
    pub fid: [FieldId; 2],
    pub frame_type: [FrameType; 2],
    /// Feedback keys, one per coded field.
    pub status_report: [u32; 2],
    pub frame_order: u32,
    pub timestamp: u64,
    /// Per coded field, `fields[1]` unused for progressive content.
    pub fields: [Option<FieldData>; 2],
    /// Destination buffers, handed back to the caller on completion.
    pub output: Option<EstOutput>,
    /// Raw-pool slot picked by the round-robin counter.
    pub raw_idx: usize,
    /// Device handle the input was resolved to.
    pub raw: Option<RawSurface>,
    /// Fields whose results have already been copied out, so a busy retry
    /// does not re-query a field whose feedback record is gone.
    pub harvested: [bool; 2],
}

impl Task {
    /// Returns the slot to its pristine state before it goes back on the
    /// free list.
    pub fn clear(&mut self) {
        *self = Default::default();
    }

    /// Coded field indices this task covers: `[0]` for progressive, `[0, 1]`
    /// for a two-field call, the submitted field alone in single-field mode.
    pub fn coded_fields(&self) -> impl Iterator<Item = usize> + '_ {
        (0..2).filter(|&f| self.fields[f].is_some())
    }

    /// Position of coded field `field` among the fields of this call, i.e.
    /// the extension-buffer instance it maps to.
    pub fn instance_of(&self, field: usize) -> usize {
        self.fields[..field].iter().flatten().count()
    }
}

struct Lists {
    free: VecDeque<TaskId>,
    incoming: Vec<TaskId>,
}

/// The task slot arena.
pub struct TaskPool {
    slots: Vec<Mutex<Task>>,
    lists: Mutex<Lists>,
}

impl TaskPool {
    pub fn new(depth: usize) -> Self {
        Self {
            slots: (0..depth).map(|_| Mutex::new(Task::default())).collect(),
            lists: Mutex::new(Lists {
                free: (0..depth).collect(),
                incoming: Vec::with_capacity(depth),
            }),
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Moves the front free slot onto the incoming list.
    pub fn acquire(&self) -> Result<TaskId, PreEncError> {
        let mut lists = self.lists.lock().unwrap();
        let id = lists.free.pop_front().ok_or_else(|| {
            log::debug!("task pool exhausted, {} tasks in flight", self.slots.len());
            PreEncError::ResourceExhausted
        })?;
        lists.incoming.push(id);
        Ok(id)
    }

    /// Moves `id` from the incoming list back onto the free list and clears
    /// its payload.
    pub fn release(&self, id: TaskId) -> Result<(), PreEncError> {
        let mut lists = self.lists.lock().unwrap();
        let pos = lists
            .incoming
            .iter()
            .position(|&t| t == id)
            .ok_or(PreEncError::NotFound)?;
        lists.incoming.remove(pos);
        lists.free.push_back(id);
        drop(lists);
        self.slot(id).clear();
        Ok(())
    }

    /// Locks the payload of slot `id`.
    pub fn slot(&self, id: TaskId) -> MutexGuard<'_, Task> {
        self.slots[id].lock().unwrap()
    }

    pub fn is_incoming(&self, id: TaskId) -> bool {
        self.lists.lock().unwrap().incoming.contains(&id)
    }

    /// Snapshot of the incoming list, used to drain the session at close.
    pub fn incoming(&self) -> Vec<TaskId> {
        self.lists.lock().unwrap().incoming.clone()
    }
}

/// Which field the next single-field-mode call processes.
///
/// In single-field mode each submission carries one field and successive
/// calls alternate between the two coded fields. The turn advances once per
/// accepted submission, so after an even number of calls it is back at
/// [`FieldTurn::First`] and several calls can sit queued before any of them
/// executes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FieldTurn {
    #[default]
    First,
    Second,
}

impl FieldTurn {
    /// Coded field index this turn maps to.
    pub fn index(self) -> usize {
        match self {
            FieldTurn::First => 0,
            FieldTurn::Second => 1,
        }
    }

    /// The turn after (equally, before) this one.
    pub fn flipped(self) -> Self {
        match self {
            FieldTurn::First => FieldTurn::Second,
            FieldTurn::Second => FieldTurn::First,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_until_exhausted() {
        let pool = TaskPool::new(4);
        for _ in 0..4 {
            pool.acquire().unwrap();
        }
        assert!(matches!(
            pool.acquire(),
            Err(PreEncError::ResourceExhausted)
        ));
    }

    #[test]
    fn release_recycles_fifo() {
        let pool = TaskPool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.slot(a).frame_order = 42;
        pool.release(a).unwrap();
        assert!(!pool.is_incoming(a));
        assert!(pool.is_incoming(b));
        // The freed slot comes back cleared, after the rest of the free
        // list.
        let c = pool.acquire().unwrap();
        assert_eq!(c, a);
        assert_eq!(pool.slot(c).frame_order, 0);
        assert_eq!(pool.slot(c).state, TaskState::Free);
    }

    #[test]
    fn release_unknown_task_fails() {
        let pool = TaskPool::new(1);
        assert!(matches!(pool.release(0), Err(PreEncError::NotFound)));
        let id = pool.acquire().unwrap();
        pool.release(id).unwrap();
        // Releasing twice must fail too.
        assert!(matches!(pool.release(id), Err(PreEncError::NotFound)));
    }

    #[test]
    fn field_turn_round_trip() {
        let mut turn = FieldTurn::default();
        assert_eq!(turn.index(), 0);
        turn = turn.flipped();
        assert_eq!(turn.index(), 1);
        turn = turn.flipped();
        assert_eq!(turn, FieldTurn::First);
    }
}
