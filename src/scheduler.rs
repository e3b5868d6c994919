// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The time-level iterative update algorithm.
//!
//! `update` on an aggregate partitions its children into time-level
//! buckets and walks the levels strictly highest to lowest. Per level:
//! lazily instantiate units, discover executable components, assemble
//! pipelines by walking input references upstream, partition the
//! worker group across the pipelines, link members upstream to
//! downstream and update each pipeline's most downstream member. A
//! barrier seals every level.
//!
//! Every worker of a group executes this code with identical inputs
//! (discovery is deterministic), so collective operations line up.
//! Stop decisions (abort, a peer's failure) are made with the group's
//! collective `agree` so no member is ever left waiting at a barrier
//! a peer will not reach: a failing worker poisons the abort flag,
//! keeps its error local, and every member leaves the loop at the
//! same point.

use std::collections::{BTreeMap, HashMap, HashSet};

use crossbeam_channel::unbounded;
use smallvec::SmallVec;

use crate::common::{Error, ErrorCode, ErrorKind, Result};
use crate::component::{ComponentKind, InputRef};
use crate::controller::Controller;
use crate::logging::{Level, ProvKind};
use crate::resolver;
use crate::sched_err;
use crate::unit::{Concurrency, LinkedInput};
use crate::worker::{GroupCore, SPARE_COLOR, SoloGroup, TaskSlot, WorkerGroup, allocate};

type Pipeline = SmallVec<[String; 4]>;

/// Entry point for a run: drive `update` on the target with a pool of
/// `workers` cooperating workers (the calling thread is rank 0).
pub(crate) fn run(ctrl: &Controller, name: &str, workers: usize) -> Result<()> {
    if workers <= 1 {
        let mut ctx = Ctx::new(ctrl.share());
        return update_component(&mut ctx, name, &SoloGroup);
    }

    let core = GroupCore::new(workers);
    let (tx, rx) = unbounded();
    let mut result = std::thread::scope(|s| {
        for rank in 1..workers {
            let ctrl = ctrl.share();
            let handle = core.handle(rank);
            let tx = tx.clone();
            let target = name.to_owned();
            s.spawn(move || {
                let mut ctx = Ctx::new(ctrl);
                let result = update_component(&mut ctx, &target, &handle);
                let _ = tx.send(result);
            });
        }
        let mut ctx = Ctx::new(ctrl.share());
        update_component(&mut ctx, name, &core.handle(0))
    });

    // surface the first real failure from any worker
    for _ in 1..workers {
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if result.is_ok() {
                    result = Err(err);
                }
            }
            Err(_) => {
                if result.is_ok() {
                    result = Err(Error::new(
                        ErrorKind::Worker,
                        ErrorCode::WorkerPanic,
                        Some("worker exited without reporting".to_string()),
                    ));
                }
            }
        }
    }
    result
}

/// Per-worker state: which components this worker is inside of (the
/// re-entrancy guard) and the level pass's allocation table.
struct Ctx {
    ctrl: Controller,
    updating: HashSet<String>,
    /// component name → split color of the group responsible for it;
    /// rebuilt at each parallel section, torn down at its barrier
    alloc_table: HashMap<String, usize>,
}

impl Ctx {
    fn new(ctrl: Controller) -> Self {
        Ctx {
            ctrl,
            updating: HashSet::new(),
            alloc_table: HashMap::new(),
        }
    }
}

/// `update` on one component: iterate `componentUpdateLogic` over the
/// component's iteration range, re-evaluating the target count after
/// every pass. Collective across the group.
fn update_component(ctx: &mut Ctx, name: &str, group: &dyn WorkerGroup) -> Result<()> {
    if group.agree(ctx.ctrl.abort_requested()) {
        return Ok(());
    }
    if ctx.updating.contains(name) {
        // benign re-entrant call (provenance and table lookups do
        // this); warn and bail rather than faulting
        ctx.ctrl.log(
            Level::Warn,
            &format!("recursive update of '{name}' detected; ignoring"),
        );
        return Ok(());
    }
    if !ctx.ctrl.contains(name) {
        return sched_err!(UnregisteredComponent, name);
    }

    ctx.updating.insert(name.to_owned());
    if group.rank() == 0 {
        ctx.ctrl.push_running(name);
    }

    let result = update_iterations(ctx, name, group);

    if group.rank() == 0 {
        ctx.ctrl.pop_running(name);
    }
    ctx.updating.remove(name);

    result.map_err(|err| {
        let step = ctx
            .ctrl
            .component(name)
            .map(|c| c.lock().unwrap().current_step())
            .unwrap_or(0);
        err.with_frame(name, step)
    })
}

fn update_iterations(ctx: &mut Ctx, name: &str, group: &dyn WorkerGroup) -> Result<()> {
    let (is_aggregate, start_index) = {
        let cell = ctx.ctrl.component(name).expect("checked by caller");
        let c = cell.lock().unwrap();
        (c.is_aggregate(), c.iter_index)
    };

    if !is_aggregate {
        // a process or buffer run directly: a single-member pipeline
        if group.rank() == 0 {
            link_component(ctx, name, start_index)?;
            update_leaf(ctx, name)?;
        }
        return Ok(());
    }

    let mut failure: Option<Error> = None;
    let mut step = start_index;
    loop {
        // the target count may depend on data the previous pass
        // produced, so it is re-resolved on every pass
        let target = match resolve_iter_count(ctx, name) {
            Ok(target) => target,
            Err(err) => {
                ctx.ctrl.poison();
                failure.get_or_insert(err);
                0
            }
        };
        let stop = failure.is_some() || ctx.ctrl.abort_requested() || step > target;
        if group.agree(stop) {
            break;
        }

        if let Some(cell) = ctx.ctrl.component(name) {
            cell.lock().unwrap().set_run_index(step);
        }
        if let Err(err) = component_update_logic(ctx, name, step, group) {
            // already poisoned below; every member leaves at the next
            // collective checkpoint
            failure.get_or_insert(err);
        }
        step += 1;
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// One pass over an aggregate's subtree: buckets, levels descending,
/// pipelines, execution, barrier per level.
fn component_update_logic(
    ctx: &mut Ctx,
    host: &str,
    host_step: usize,
    group: &dyn WorkerGroup,
) -> Result<()> {
    let buckets = collect_buckets(&ctx.ctrl, host);

    let mut failure: Option<Error> = None;
    for (&level, bucket) in buckets.iter().rev() {
        let stop = failure.is_some() || ctx.ctrl.abort_requested();
        if group.agree(stop) {
            break;
        }
        if let Err(err) = run_level(ctx, host, host_step, level, bucket, group) {
            ctx.ctrl.poison();
            failure.get_or_insert(err);
        }
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Direct children of `host`, partitioned by time level (levels below
/// the host's own are impossible by invariant; the host itself is
/// never in a bucket). Insertion order inside a bucket is child-chain
/// order, which fixes execution order within a level.
fn collect_buckets(ctrl: &Controller, host: &str) -> BTreeMap<u32, Vec<String>> {
    let own_level = ctrl
        .component(host)
        .map(|c| c.lock().unwrap().time_level())
        .unwrap_or(0);

    let mut buckets: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    let mut next = ctrl.component(host).and_then(|c| {
        let c = c.lock().unwrap();
        match &c.kind {
            ComponentKind::Aggregate { first, .. } => first.clone(),
            _ => None,
        }
    });
    while let Some(child) = next {
        let (level, downstream) = {
            let Some(cell) = ctrl.component(&child) else {
                break;
            };
            let c = cell.lock().unwrap();
            (c.time_level(), c.downstream.clone())
        };
        if level >= own_level {
            buckets.entry(level).or_default().push(child);
        }
        next = downstream;
    }
    buckets
}

/// Execute one time level of one pass. Ends with a barrier on `group`
/// on every non-erroring path; error paths are deterministic across
/// members (and poisoned by the caller), so nobody strands a peer.
fn run_level(
    ctx: &mut Ctx,
    host: &str,
    host_step: usize,
    level: u32,
    bucket: &[String],
    group: &dyn WorkerGroup,
) -> Result<()> {
    ctx.ctrl.log(
        Level::Trace,
        &format!(
            "'{host}' step {host_step}: level {level} with {} components",
            bucket.len()
        ),
    );

    // lazy instantiation; zero-iteration components are skipped
    let mut active: Vec<String> = Vec::with_capacity(bucket.len());
    for name in bucket {
        if resolve_iter_count(ctx, name)? == 0 {
            continue;
        }
        instantiate_unit(ctx, name)?;
        if let Some(cell) = ctx.ctrl.component(name) {
            // children follow the host's pass; iterating aggregates
            // overwrite this with their own counter on descent
            cell.lock().unwrap().set_run_index(host_step);
        }
        active.push(name.clone());
    }

    let executables = discover_executables(ctx, host_step, &active);
    let pipelines = build_pipelines(ctx, host, host_step, &executables);
    if pipelines.is_empty() {
        group.barrier();
        return Ok(());
    }

    if group.size() == 1 {
        // degenerate case: everything sequential, discovery order
        let mut result = Ok(());
        for pipeline in &pipelines {
            if ctx.ctrl.abort_requested() {
                break;
            }
            result = execute_pipeline(ctx, host, host_step, pipeline, group);
            if result.is_err() {
                break;
            }
        }
        return result;
    }

    let tasks: Vec<TaskSlot> = pipelines.iter().map(|p| task_slot(ctx, p)).collect();
    let alloc = allocate(&tasks, group.size());
    let color = alloc.colors[group.rank()];
    let sub = group.split(color);

    let mut failure: Option<Error> = None;
    if color != SPARE_COLOR {
        for &task_index in &alloc.assignments[group.rank()] {
            let stop = failure.is_some() || ctx.ctrl.abort_requested();
            if sub.agree(stop) {
                break;
            }
            ctx.alloc_table
                .insert(tasks[task_index].name.clone(), color);
            if let Err(err) =
                execute_pipeline(ctx, host, host_step, &pipelines[task_index], sub.as_ref())
            {
                // poison before the next collective checkpoint so
                // peers unwind too
                ctx.ctrl.poison();
                failure.get_or_insert(err);
            }
        }
    }

    sub.barrier();
    group.barrier();
    if !ctx.alloc_table.is_empty() {
        ctx.ctrl.log(
            Level::Trace,
            &format!("releasing {} worker-group assignments", ctx.alloc_table.len()),
        );
        ctx.alloc_table.clear();
    }
    sub.free();

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn task_slot(ctx: &Ctx, pipeline: &Pipeline) -> TaskSlot {
    let sink = pipeline.last().expect("pipelines are non-empty");
    let (capable, desired) = ctx
        .ctrl
        .component(sink)
        .map(|cell| {
            let c = cell.lock().unwrap();
            match &c.kind {
                // nested aggregates sub-allocate whatever they get
                ComponentKind::Aggregate { .. } => (true, usize::MAX),
                ComponentKind::Process { unit_type, .. } => {
                    match ctx.ctrl.inner.units.read().unwrap().concurrency(unit_type) {
                        Concurrency::Serial => (false, 1),
                        Concurrency::Capable { desired } => (true, desired),
                    }
                }
                ComponentKind::Buffer { .. } => (false, 1),
            }
        })
        .unwrap_or((false, 1));
    TaskSlot {
        name: sink.clone(),
        concurrency_capable: capable,
        desired_workers: desired,
    }
}

fn instantiate_unit(ctx: &Ctx, name: &str) -> Result<()> {
    let Some(cell) = ctx.ctrl.component(name) else {
        return Ok(());
    };
    let mut c = cell.lock().unwrap();
    let ComponentKind::Process { unit_type, unit } = &mut c.kind else {
        return Ok(());
    };
    if unit.is_some() {
        return Ok(());
    }
    let mut fresh = ctx.ctrl.inner.units.read().unwrap().create(unit_type)?;
    fresh.instantiate().map_err(|err| err.with_frame(name, 0))?;
    *unit = Some(fresh);
    Ok(())
}

/// A component in the bucket is *not* executable if another bucket
/// member references it as an input for the step that member's index
/// policy currently selects, or if it is neither buffer, aggregate
/// nor sink-classified. An empty result falls back to the bucket's
/// buffers: a cycle through a buffer must still execute.
fn discover_executables(ctx: &Ctx, host_step: usize, bucket: &[String]) -> Vec<String> {
    let mut referenced: HashSet<String> = HashSet::new();
    for name in bucket {
        let Some(cell) = ctx.ctrl.component(name) else {
            continue;
        };
        let c = cell.lock().unwrap();
        let step = c.current_step();
        for input in c.inputs_for_step(step, host_step) {
            referenced.insert(input.component.clone());
        }
    }

    let is_executable = |name: &str| -> bool {
        let Some(cell) = ctx.ctrl.component(name) else {
            return false;
        };
        let c = cell.lock().unwrap();
        match &c.kind {
            ComponentKind::Buffer { .. } | ComponentKind::Aggregate { .. } => true,
            ComponentKind::Process { unit_type, .. } => {
                ctx.ctrl.inner.units.read().unwrap().is_sink(unit_type)
            }
        }
    };

    let executables: Vec<String> = bucket
        .iter()
        .filter(|name| !referenced.contains(*name))
        .filter(|name| is_executable(name))
        .cloned()
        .collect();
    if !executables.is_empty() {
        return executables;
    }

    // cyclic feedback: every buffer in the bucket becomes executable
    bucket
        .iter()
        .filter(|name| {
            ctx.ctrl
                .component(name)
                .map(|c| c.lock().unwrap().is_buffer())
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// For each executable, walk its input references upstream and
/// prepend every reachable member. The walk stops at components
/// hosted outside the current aggregate and never re-expands a
/// component another pipeline already claimed.
fn build_pipelines(
    ctx: &Ctx,
    host: &str,
    host_step: usize,
    executables: &[String],
) -> Vec<Pipeline> {
    let mut visited: HashSet<String> = executables.iter().cloned().collect();
    let mut pipelines = Vec::with_capacity(executables.len());
    for exe in executables {
        let mut members = Pipeline::new();
        extend_upstream(ctx, host, host_step, exe, &mut visited, &mut members);
        members.push(exe.clone());
        pipelines.push(members);
    }
    pipelines
}

fn extend_upstream(
    ctx: &Ctx,
    host: &str,
    host_step: usize,
    node: &str,
    visited: &mut HashSet<String>,
    out: &mut Pipeline,
) {
    let inputs: Vec<String> = {
        let Some(cell) = ctx.ctrl.component(node) else {
            return;
        };
        let c = cell.lock().unwrap();
        let step = c.current_step();
        c.inputs_for_step(step, host_step)
            .iter()
            .map(|i| i.component.clone())
            .collect()
    };

    for src in inputs {
        if visited.contains(&src) {
            continue;
        }
        let Some(cell) = ctx.ctrl.component(&src) else {
            continue;
        };
        let src_host = cell.lock().unwrap().host.clone();
        // stop at foreign components: hosted elsewhere and not below
        // the current aggregate
        if src_host.as_deref() != Some(host) && !is_below(&ctx.ctrl, host, &src) {
            continue;
        }
        if resolve_iter_count(ctx, &src).unwrap_or(0) == 0 {
            continue;
        }
        visited.insert(src.clone());
        extend_upstream(ctx, host, host_step, &src, visited, out);
        out.push(src);
    }
}

fn is_below(ctrl: &Controller, host: &str, name: &str) -> bool {
    let mut current = ctrl
        .component(name)
        .and_then(|c| c.lock().unwrap().host.clone());
    while let Some(h) = current {
        if h == host {
            return true;
        }
        current = ctrl
            .component(&h)
            .and_then(|c| c.lock().unwrap().host.clone());
    }
    false
}

/// Link every member upstream to downstream, then update the most
/// downstream member only; units are demand-driven, so that single
/// update brings the whole pipeline current. Collective across the
/// task's sub-group.
fn execute_pipeline(
    ctx: &mut Ctx,
    host: &str,
    host_step: usize,
    pipeline: &[String],
    group: &dyn WorkerGroup,
) -> Result<()> {
    let last = pipeline.last().expect("pipelines are non-empty");

    let link_result = if group.rank() == 0 {
        if let Some(prov) = ctx.ctrl.provenance() {
            prov.log_event(ProvKind::Activity, &[last.as_str()], &[("event", "link-start")]);
        }
        pipeline.iter().try_for_each(|member| {
            link_component(ctx, member, host_step)
                .map_err(|err| err.with_frame(member, host_step))
        })
    } else {
        Ok(())
    };
    if link_result.is_err() {
        ctx.ctrl.poison();
    }
    if group.size() > 1 {
        group.barrier();
    }
    if group.agree(link_result.is_err() || ctx.ctrl.abort_requested()) {
        // rank 0 carries the diagnosis; peers leave quietly
        return link_result;
    }

    let last_is_aggregate = ctx
        .ctrl
        .component(last)
        .map(|c| c.lock().unwrap().is_aggregate())
        .unwrap_or(false);

    if last_is_aggregate {
        // the whole sub-group descends together and sub-allocates
        update_component(ctx, last, group)
    } else if group.rank() == 0 {
        update_leaf(ctx, last).map_err(|err| {
            ctx.ctrl.poison();
            err.with_frame(last, host_step)
        })
    } else {
        Ok(())
    }
}

/// Link one pipeline member for a step: buffers snapshot their source
/// output, processes receive their resolved inputs.
fn link_component(ctx: &Ctx, name: &str, host_step: usize) -> Result<()> {
    let Some(cell) = ctx.ctrl.component(name) else {
        return sched_err!(UnregisteredComponent, name);
    };

    let (step, input_refs): (usize, Vec<InputRef>) = {
        let c = cell.lock().unwrap();
        let step = c.current_step();
        (step, c.inputs_for_step(step, host_step).to_vec())
    };

    if cell.lock().unwrap().is_buffer() {
        let Some(input) = input_refs.first() else {
            return Ok(());
        };
        let source_cell = ctx.ctrl.component(&input.component).ok_or_else(|| {
            Error::for_component(
                ErrorKind::Scheduling,
                ErrorCode::InvalidInput,
                name,
                Some(format!(
                    "buffer source '{}' is not registered",
                    input.component
                )),
            )
        })?;
        let snapshot = source_cell.lock().unwrap().output(input.output)?;
        let mut c = cell.lock().unwrap();
        if let ComponentKind::Buffer {
            source,
            linked,
            value,
        } = &mut c.kind
        {
            *source = Some((input.component.clone(), input.output));
            *linked = true;
            *value = Some(snapshot);
        }
        return Ok(());
    }

    // aggregates link through their own update; nothing to do here
    if cell.lock().unwrap().is_aggregate() {
        return Ok(());
    }

    let mut inputs: Vec<LinkedInput> = Vec::with_capacity(input_refs.len());
    for input in &input_refs {
        let source_cell = ctx.ctrl.component(&input.component).ok_or_else(|| {
            Error::for_component(
                ErrorKind::Scheduling,
                ErrorCode::InvalidInput,
                name,
                Some(format!("input '{}' is not registered", input.component)),
            )
        })?;
        let value = source_cell.lock().unwrap().output(input.output)?;
        inputs.push(LinkedInput {
            source: input.component.clone(),
            output: input.output,
            value,
        });
    }

    let mut c = cell.lock().unwrap();
    match c.unit_mut() {
        Some(unit) => unit.link_in_pipeline(step, &inputs),
        None => Err(Error::for_component(
            ErrorKind::Scheduling,
            ErrorCode::UninitialisedUnit,
            name,
            None,
        )),
    }
}

fn update_leaf(ctx: &Ctx, name: &str) -> Result<()> {
    let Some(cell) = ctx.ctrl.component(name) else {
        return Ok(());
    };

    ctx.ctrl.push_running(name);
    if let Some(prov) = ctx.ctrl.provenance() {
        prov.log_event(ProvKind::Start, &[name], &[]);
    }

    let result = {
        let mut c = cell.lock().unwrap();
        if c.is_buffer() {
            // buffers carry no unit; the snapshot at link time was
            // their whole update
            Ok(())
        } else {
            match c.unit_mut() {
                Some(unit) => {
                    let r = unit.update();
                    if r.is_ok() {
                        unit.release_buffers();
                    }
                    r
                }
                None => Err(Error::for_component(
                    ErrorKind::Scheduling,
                    ErrorCode::UninitialisedUnit,
                    name,
                    None,
                )),
            }
        }
    };

    if let Some(prov) = ctx.ctrl.provenance() {
        prov.log_event(ProvKind::End, &[name], &[]);
    }
    ctx.ctrl.pop_running(name);

    if result.is_ok() {
        ctx.ctrl
            .inner
            .update_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
    result
}

fn resolve_iter_count(ctx: &Ctx, name: &str) -> Result<usize> {
    resolver::resolve_iter_count(&ctx.ctrl, name)
}
