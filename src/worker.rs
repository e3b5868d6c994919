// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Worker groups and the per-level task allocator.
//!
//! A [`WorkerGroup`] is the coordination contract a process-group
//! layer must satisfy: collective split, barrier, free. The in-crate
//! implementation backs it with threads; every member of a group holds
//! its own handle carrying its rank, and split/barrier are collective
//! -- all members must call them or the group deadlocks, the same
//! discipline a process-rank backing imposes.

use std::collections::HashMap;
use std::sync::{Arc, Barrier, Condvar, Mutex};

/// Color assigned to workers that a level pass leaves idle.
pub const SPARE_COLOR: usize = usize::MAX;

pub trait WorkerGroup: Send + Sync {
    fn size(&self) -> usize;
    /// This member's rank within the group, `0..size`.
    fn rank(&self) -> usize;
    /// Collective: every member calls `split` with a color; members
    /// sharing a color form a child group. Returns this member's
    /// handle in its child group.
    fn split(&self, color: usize) -> Box<dyn WorkerGroup>;
    /// Collective: no member passes until all members arrive.
    fn barrier(&self);
    /// Collective OR of a per-member flag. The scheduler uses this to
    /// make stop decisions (abort, a peer's failure) identically on
    /// every member, which keeps later collective calls aligned.
    fn agree(&self, flag: bool) -> bool;
    /// Release the handle. Collective in a distributed backing; a
    /// no-op here beyond dropping state.
    fn free(&self) {}
}

/// The degenerate single-worker group: every operation is a no-op.
pub struct SoloGroup;

impl WorkerGroup for SoloGroup {
    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn split(&self, _color: usize) -> Box<dyn WorkerGroup> {
        Box::new(SoloGroup)
    }

    fn barrier(&self) {}

    fn agree(&self, flag: bool) -> bool {
        flag
    }
}

enum Phase {
    Gather,
    Scatter,
}

struct SplitState {
    phase: Phase,
    colors: Vec<Option<usize>>,
    arrived: usize,
    departed: usize,
    children: HashMap<usize, Arc<GroupCore>>,
}

struct AgreeState {
    phase: Phase,
    arrived: usize,
    departed: usize,
    value: bool,
    result: bool,
}

/// Shared heart of one thread-backed group; each member's
/// [`ThreadGroup`] handle points at the same core.
pub struct GroupCore {
    size: usize,
    barrier: Barrier,
    split_state: Mutex<SplitState>,
    agree_state: Mutex<AgreeState>,
    cv: Condvar,
    agree_cv: Condvar,
}

impl GroupCore {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(GroupCore {
            size,
            barrier: Barrier::new(size),
            split_state: Mutex::new(SplitState {
                phase: Phase::Gather,
                colors: vec![None; size],
                arrived: 0,
                departed: 0,
                children: HashMap::new(),
            }),
            agree_state: Mutex::new(AgreeState {
                phase: Phase::Gather,
                arrived: 0,
                departed: 0,
                value: false,
                result: false,
            }),
            cv: Condvar::new(),
            agree_cv: Condvar::new(),
        })
    }

    /// A member's handle onto this core.
    pub fn handle(self: &Arc<Self>, rank: usize) -> ThreadGroup {
        assert!(rank < self.size);
        ThreadGroup {
            core: Arc::clone(self),
            rank,
        }
    }
}

pub struct ThreadGroup {
    core: Arc<GroupCore>,
    rank: usize,
}

impl WorkerGroup for ThreadGroup {
    fn size(&self) -> usize {
        self.core.size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn split(&self, color: usize) -> Box<dyn WorkerGroup> {
        if self.core.size == 1 {
            return Box::new(SoloGroup);
        }

        let core = &self.core;
        let mut st = core.split_state.lock().unwrap();

        // a previous split may still be handing out child handles
        while !matches!(st.phase, Phase::Gather) {
            st = core.cv.wait(st).unwrap();
        }

        st.colors[self.rank] = Some(color);
        st.arrived += 1;
        if st.arrived == core.size {
            // last one in builds the child cores
            let mut sizes: HashMap<usize, usize> = HashMap::new();
            for c in st.colors.iter().flatten() {
                *sizes.entry(*c).or_insert(0) += 1;
            }
            st.children = sizes
                .into_iter()
                .map(|(color, count)| (color, GroupCore::new(count)))
                .collect();
            st.phase = Phase::Scatter;
            core.cv.notify_all();
        } else {
            while !matches!(st.phase, Phase::Scatter) {
                st = core.cv.wait(st).unwrap();
            }
        }

        // rank within the child group: position among members that
        // chose the same color, ordered by parent rank
        let sub_rank = st.colors[..self.rank]
            .iter()
            .flatten()
            .filter(|c| **c == color)
            .count();
        let child = Arc::clone(&st.children[&color]);

        st.departed += 1;
        if st.departed == core.size {
            st.arrived = 0;
            st.departed = 0;
            st.colors.fill(None);
            st.children.clear();
            st.phase = Phase::Gather;
            core.cv.notify_all();
        }

        Box::new(child.handle(sub_rank))
    }

    fn barrier(&self) {
        if self.core.size > 1 {
            self.core.barrier.wait();
        }
    }

    fn agree(&self, flag: bool) -> bool {
        let core = &self.core;
        if core.size == 1 {
            return flag;
        }

        let mut st = core.agree_state.lock().unwrap();
        while !matches!(st.phase, Phase::Gather) {
            st = core.agree_cv.wait(st).unwrap();
        }

        st.value |= flag;
        st.arrived += 1;
        if st.arrived == core.size {
            st.result = st.value;
            st.phase = Phase::Scatter;
            core.agree_cv.notify_all();
        } else {
            while !matches!(st.phase, Phase::Scatter) {
                st = core.agree_cv.wait(st).unwrap();
            }
        }

        let result = st.result;
        st.departed += 1;
        if st.departed == core.size {
            st.arrived = 0;
            st.departed = 0;
            st.value = false;
            st.phase = Phase::Gather;
            core.agree_cv.notify_all();
        }
        result
    }
}

/// A task the allocator can hand to a group: one pipeline (named after
/// its most downstream member).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSlot {
    pub name: String,
    /// Whether surplus workers may join this task.
    pub concurrency_capable: bool,
    /// Upper bound on workers this task can put to use.
    pub desired_workers: usize,
}

/// What one level pass assigns to each worker of a group.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Allocation {
    /// By rank: the split color (a task index, or [`SPARE_COLOR`]).
    pub colors: Vec<usize>,
    /// By rank: the task indices this worker drives, in execution
    /// order.
    pub assignments: Vec<Vec<usize>>,
}

/// Partition `workers` group members across `tasks` for one level
/// pass.
///
/// With workers ≤ tasks every worker runs alone and tasks are shared
/// round-robin; with surplus workers each task keeps one worker and
/// the surplus joins concurrency-capable tasks only, idling as spares
/// when no capable task has room.
pub fn allocate(tasks: &[TaskSlot], workers: usize) -> Allocation {
    let mut alloc = Allocation {
        colors: vec![SPARE_COLOR; workers],
        assignments: vec![Vec::new(); workers],
    };
    if workers == 0 || tasks.is_empty() {
        return alloc;
    }

    if workers <= tasks.len() {
        // cyclic coverage: task i belongs to worker i mod P
        for (i, _) in tasks.iter().enumerate() {
            alloc.assignments[i % workers].push(i);
        }
        for (rank, color) in alloc.colors.iter_mut().enumerate() {
            // singleton groups; color by rank keeps them disjoint
            *color = rank;
        }
        return alloc;
    }

    // one worker per task first
    let mut members: Vec<usize> = vec![1; tasks.len()];
    for (i, _) in tasks.iter().enumerate() {
        alloc.colors[i] = i;
        alloc.assignments[i].push(i);
    }

    // surplus workers go to capable tasks with room, round-robin
    let mut next = 0usize;
    for rank in tasks.len()..workers {
        let mut chosen = None;
        for probe in 0..tasks.len() {
            let i = (next + probe) % tasks.len();
            if tasks[i].concurrency_capable && members[i] < tasks[i].desired_workers.max(1) {
                chosen = Some(i);
                next = i + 1;
                break;
            }
        }
        if let Some(i) = chosen {
            members[i] += 1;
            alloc.colors[rank] = i;
            alloc.assignments[rank].push(i);
        }
        // no capable task with room: the worker sits this level out
    }

    alloc
}
