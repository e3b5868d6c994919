// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The Controller owns the component registry, the settings store and
//! the log sink, and brackets every run: reset, execute, catch, clean
//! up. Registry mutation is rejected outright while a run is active --
//! the `is_running` flag is the contract, not a queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::common::{Error, ErrorCode, ErrorKind, Result};
use crate::component::{ComponentKind, ModelComponent};
use crate::logging::{FacadeSink, Level, LogSink, ProvenanceSink, now_epoch_secs};
use crate::settings::{KEY_WORKERS, Settings};
use crate::unit::{Concurrency, ProcessUnit, UnitRegistry};
use crate::value::Value;
use crate::{model_err, scheduler};

pub type ComponentCell = Arc<Mutex<ModelComponent>>;

/// What a completed run reports back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub elapsed: Duration,
    /// Number of component updates performed across all workers.
    pub updates: usize,
}

pub struct Controller {
    pub(crate) inner: Arc<ControllerInner>,
}

pub(crate) struct ControllerInner {
    components: RwLock<HashMap<String, ComponentCell>>,
    user_ids: RwLock<HashMap<String, Vec<String>>>,
    /// The single parentless component, once one exists.
    root: RwLock<Option<String>>,
    pub(crate) settings: RwLock<Settings>,
    log_sink: RwLock<Arc<dyn LogSink>>,
    provenance: RwLock<Option<Arc<dyn ProvenanceSink>>>,
    pub(crate) units: RwLock<UnitRegistry>,
    is_running: AtomicBool,
    abort_requested: AtomicBool,
    pub(crate) exec_stack: Mutex<Vec<String>>,
    deferred_deletes: Mutex<Vec<String>>,
    pub(crate) update_count: AtomicUsize,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

/// Clones share the same registry, settings and run state.
impl Clone for Controller {
    fn clone(&self) -> Self {
        Controller {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Controller {
    pub fn new() -> Self {
        Controller {
            inner: Arc::new(ControllerInner {
                components: RwLock::new(HashMap::new()),
                user_ids: RwLock::new(HashMap::new()),
                root: RwLock::new(None),
                settings: RwLock::new(Settings::new()),
                log_sink: RwLock::new(Arc::new(FacadeSink)),
                provenance: RwLock::new(None),
                units: RwLock::new(UnitRegistry::new()),
                is_running: AtomicBool::new(false),
                abort_requested: AtomicBool::new(false),
                exec_stack: Mutex::new(Vec::new()),
                deferred_deletes: Mutex::new(Vec::new()),
                update_count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_log_sink(&self, sink: Arc<dyn LogSink>) {
        *self.inner.log_sink.write().unwrap() = sink;
    }

    pub fn set_provenance_sink(&self, sink: Arc<dyn ProvenanceSink>) {
        *self.inner.provenance.write().unwrap() = Some(sink);
    }

    pub fn register_unit_type<F>(
        &self,
        type_name: &str,
        is_sink: bool,
        concurrency: Concurrency,
        factory: F,
    ) where
        F: Fn() -> Box<dyn ProcessUnit> + Send + Sync + 'static,
    {
        self.inner
            .units
            .write()
            .unwrap()
            .register(type_name, is_sink, concurrency, factory);
    }

    pub fn settings(&self) -> std::sync::RwLockReadGuard<'_, Settings> {
        self.inner.settings.read().unwrap()
    }

    pub fn settings_mut(&self) -> std::sync::RwLockWriteGuard<'_, Settings> {
        self.inner.settings.write().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    pub fn abort_requested(&self) -> bool {
        self.inner.abort_requested.load(Ordering::SeqCst)
    }

    /// Raise the abort flag from inside the scheduler so every worker
    /// winds down at its next collective checkpoint. The failing
    /// worker's error still carries the diagnosis.
    pub(crate) fn poison(&self) {
        self.inner.abort_requested.store(true, Ordering::SeqCst);
    }

    /// Register `comp` under a collision-free name and attach it below
    /// `host` (or leave it parentless -- only one component may be).
    /// Returns the assigned registry name.
    pub fn add_component(&self, comp: ModelComponent, host: Option<&str>) -> Result<String> {
        if self.is_running() {
            return Err(Error::new(ErrorKind::Model, ErrorCode::RunActive, None));
        }

        let name = {
            let mut components = self.inner.components.write().unwrap();
            let base = if comp.name().is_empty() {
                "Component"
            } else {
                comp.name()
            };
            let name = unique_name(&components, base);

            let mut comp = comp;
            comp.name = name.clone();
            components.insert(name.clone(), Arc::new(Mutex::new(comp)));
            name
        };

        if let Err(err) = self.attach(&name, host) {
            // roll the registration back so a failed add leaves no trace
            self.inner.components.write().unwrap().remove(&name);
            return Err(err);
        }

        let user_id = {
            let cell = self.component(&name).unwrap();
            let c = cell.lock().unwrap();
            c.user_id().to_owned()
        };
        self.inner
            .user_ids
            .write()
            .unwrap()
            .entry(user_id)
            .or_default()
            .push(name.clone());

        self.log(
            Level::Debug,
            &format!("component '{name}' added{}", match host {
                Some(h) => format!(" under '{h}'"),
                None => String::new(),
            }),
        );
        Ok(name)
    }

    fn attach(&self, name: &str, host: Option<&str>) -> Result<()> {
        match host {
            None => {
                let mut root = self.inner.root.write().unwrap();
                if let Some(existing) = root.as_deref() {
                    return model_err!(
                        OrphanedComponent,
                        format!("'{existing}' is already the parentless root; '{name}' needs a host")
                    );
                }
                *root = Some(name.to_owned());
                Ok(())
            }
            Some(host_name) => {
                let host_cell = self.component(host_name).ok_or_else(|| {
                    Error::new(
                        ErrorKind::Model,
                        ErrorCode::UnregisteredComponent,
                        Some(host_name.to_owned()),
                    )
                })?;

                // splice onto the end of the host's child chain
                let (prev_last, host_level) = {
                    let mut h = host_cell.lock().unwrap();
                    let level = h.time_level;
                    match &mut h.kind {
                        ComponentKind::Aggregate { first, last } => {
                            let prev = last.clone();
                            if first.is_none() {
                                *first = Some(name.to_owned());
                            }
                            *last = Some(name.to_owned());
                            (prev, level)
                        }
                        _ => {
                            return model_err!(
                                InvalidInput,
                                format!("host '{host_name}' is not an aggregate")
                            );
                        }
                    }
                };

                if let Some(prev) = &prev_last {
                    let prev_cell = self.component(prev).expect("chain member registered");
                    prev_cell.lock().unwrap().downstream = Some(name.to_owned());
                }

                let cell = self.component(name).expect("just registered");
                let mut c = cell.lock().unwrap();
                c.host = Some(host_name.to_owned());
                c.upstream = prev_last;
                c.downstream = None;
                // a component never sits below its host's time level
                if c.time_level < host_level {
                    c.time_level = host_level;
                }
                Ok(())
            }
        }
    }

    /// Remove a component and (recursively) its sub-components. Fails
    /// for the root, for unknown names, and while a run is active --
    /// use [`Controller::delete_later`] from inside a run.
    pub fn remove_component(&self, name: &str) -> Result<()> {
        if self.is_running() {
            return Err(Error::new(ErrorKind::Model, ErrorCode::RunActive, None));
        }
        self.remove_now(name)
    }

    /// Queue a removal to happen when the active run finishes.
    pub fn delete_later(&self, name: &str) {
        self.inner
            .deferred_deletes
            .lock()
            .unwrap()
            .push(name.to_owned());
    }

    fn remove_now(&self, name: &str) -> Result<()> {
        if self.inner.root.read().unwrap().as_deref() == Some(name) {
            return Err(Error::for_component(
                ErrorKind::Model,
                ErrorCode::RootNotRemovable,
                name,
                None,
            ));
        }
        let cell = self.component(name).ok_or_else(|| {
            Error::new(
                ErrorKind::Model,
                ErrorCode::UnregisteredComponent,
                Some(name.to_owned()),
            )
        })?;

        // unhook from the host chain first
        let (host, upstream, downstream) = {
            let c = cell.lock().unwrap();
            (c.host.clone(), c.upstream.clone(), c.downstream.clone())
        };
        if let Some(up) = &upstream {
            if let Some(up_cell) = self.component(up) {
                up_cell.lock().unwrap().downstream = downstream.clone();
            }
        }
        if let Some(down) = &downstream {
            if let Some(down_cell) = self.component(down) {
                down_cell.lock().unwrap().upstream = upstream.clone();
            }
        }
        if let Some(host_name) = &host {
            if let Some(host_cell) = self.component(host_name) {
                let mut h = host_cell.lock().unwrap();
                if let ComponentKind::Aggregate { first, last } = &mut h.kind {
                    if first.as_deref() == Some(name) {
                        *first = downstream.clone();
                    }
                    if last.as_deref() == Some(name) {
                        *last = upstream.clone();
                    }
                }
            }
        }

        // destroy sub-components depth-first, then the component
        for doomed in self.subtree_names(name) {
            let user_id = {
                let Some(cell) = self.component(&doomed) else {
                    continue;
                };
                let c = cell.lock().unwrap();
                c.user_id().to_owned()
            };
            self.inner.components.write().unwrap().remove(&doomed);
            let mut user_ids = self.inner.user_ids.write().unwrap();
            if let Some(names) = user_ids.get_mut(&user_id) {
                names.retain(|n| n != &doomed);
                if names.is_empty() {
                    user_ids.remove(&user_id);
                }
            }
            self.log(Level::Info, &format!("component '{doomed}' removed"));
        }
        Ok(())
    }

    /// Names of `name` and every descendant, preorder.
    pub(crate) fn subtree_names(&self, name: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut stack = vec![name.to_owned()];
        while let Some(current) = stack.pop() {
            let Some(cell) = self.component(&current) else {
                continue;
            };
            let children = {
                let c = cell.lock().unwrap();
                let mut children = Vec::new();
                if let ComponentKind::Aggregate { first, .. } = &c.kind {
                    let mut next = first.clone();
                    while let Some(child_name) = next {
                        next = self
                            .component(&child_name)
                            .and_then(|cc| cc.lock().unwrap().downstream.clone());
                        children.push(child_name);
                    }
                }
                children
            };
            result.push(current);
            // preserve chain order under the LIFO stack
            stack.extend(children.into_iter().rev());
        }
        result
    }

    pub fn component(&self, name: &str) -> Option<ComponentCell> {
        self.inner.components.read().unwrap().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.components.read().unwrap().contains_key(name)
    }

    pub fn components_by_user_id(&self, user_id: &str) -> Vec<String> {
        self.inner
            .user_ids
            .read()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Raise (or lower) a component's time level. Descendants are
    /// cascaded so no child ends up below its host.
    pub fn set_time_level(&self, name: &str, level: u32) -> Result<()> {
        let cell = self.component(name).ok_or_else(|| {
            Error::new(
                ErrorKind::Model,
                ErrorCode::UnregisteredComponent,
                Some(name.to_owned()),
            )
        })?;
        cell.lock().unwrap().time_level = level;
        for descendant in self.subtree_names(name).into_iter().skip(1) {
            if let Some(cell) = self.component(&descendant) {
                let mut c = cell.lock().unwrap();
                if c.time_level < level {
                    c.time_level = level;
                }
            }
        }
        Ok(())
    }

    /// Run the subtree rooted at `name`, with the worker count taken
    /// from the `engine:workers` setting (default 1).
    pub fn execute(&self, name: &str) -> Result<RunSummary> {
        let workers = self
            .settings()
            .get_int(KEY_WORKERS)
            .filter(|n| *n >= 1)
            .unwrap_or(1) as usize;
        self.execute_with(name, workers)
    }

    /// Run the subtree rooted at `name` with `workers` cooperating
    /// workers.
    pub fn execute_with(&self, name: &str, workers: usize) -> Result<RunSummary> {
        if !self.contains(name) {
            return Err(Error::new(
                ErrorKind::Model,
                ErrorCode::UnregisteredComponent,
                Some(name.to_owned()),
            ));
        }
        if self
            .inner
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.log(
                Level::Error,
                &format!("execute('{name}') refused: a run is already active"),
            );
            return Err(Error::new(ErrorKind::Model, ErrorCode::RunActive, None));
        }

        self.inner.abort_requested.store(false, Ordering::SeqCst);
        self.inner.update_count.store(0, Ordering::SeqCst);
        self.reset_subtree(name);

        let started = Instant::now();
        self.log(Level::Info, &format!("run of '{name}' started"));

        let result = scheduler::run(self, name, workers.max(1));

        let elapsed = started.elapsed();
        if let Err(err) = &result {
            self.log(Level::Error, &format!("run of '{name}' failed: {err}"));
        }
        self.log(
            Level::Info,
            &format!("run of '{name}' finished in {:.3}s", elapsed.as_secs_f64()),
        );

        // anything left on the execution stack thought it was still
        // running; tell the log before clearing it
        {
            let mut stack = self.inner.exec_stack.lock().unwrap();
            for stale in stack.drain(..).rev() {
                self.log(
                    Level::Warn,
                    &format!("'{stale}' was still marked running at run end"),
                );
            }
        }

        self.inner.abort_requested.store(false, Ordering::SeqCst);
        self.inner.is_running.store(false, Ordering::SeqCst);

        // flush removals queued while the run was active
        let deferred: Vec<String> =
            std::mem::take(&mut *self.inner.deferred_deletes.lock().unwrap());
        for name in deferred {
            if let Err(err) = self.remove_now(&name) {
                self.log(
                    Level::Warn,
                    &format!("deferred removal of '{name}' failed: {err}"),
                );
            }
        }

        result.map(|_| RunSummary {
            elapsed,
            updates: self.inner.update_count.load(Ordering::SeqCst),
        })
    }

    /// Store a property value on a component at a 1-based step.
    pub fn set_parameter(
        &self,
        name: &str,
        prop: &str,
        step: usize,
        value: Value,
    ) -> Result<()> {
        let cell = self.component(name).ok_or_else(|| {
            Error::new(
                ErrorKind::Model,
                ErrorCode::UnregisteredComponent,
                Some(name.to_owned()),
            )
        })?;
        cell.lock().unwrap().set_property(prop, step, value);
        Ok(())
    }

    /// Read a property value, resolving any parameter expressions it
    /// contains.
    pub fn get_parameter(&self, name: &str, prop: &str) -> Result<String> {
        crate::resolver::get_parameter(self, name, prop)
    }

    /// Cooperative abort: ask the innermost running unit to stop at
    /// its next safe point and flag the scheduler to go no further.
    pub fn abort(&self) {
        let top = self.inner.exec_stack.lock().unwrap().last().cloned();
        if let Some(name) = top {
            // try_lock: the unit may be mid-update under its own cell
            // lock (possibly on this very thread); the flag below
            // reaches it either way
            if let Some(cell) = self.component(&name) {
                if let Ok(c) = cell.try_lock() {
                    if let Some(unit) = c.unit() {
                        unit.abort_execution();
                    }
                }
            }
            self.log(Level::Warn, &format!("abort requested while '{name}' runs"));
        }
        self.inner.abort_requested.store(true, Ordering::SeqCst);
    }

    /// Clear buffered outputs and per-run state for a subtree. Fails
    /// while a run is active.
    pub fn reset(&self, name: &str) -> Result<()> {
        if self.is_running() {
            return Err(Error::new(ErrorKind::Model, ErrorCode::RunActive, None));
        }
        if !self.contains(name) {
            return Err(Error::new(
                ErrorKind::Model,
                ErrorCode::UnregisteredComponent,
                Some(name.to_owned()),
            ));
        }
        self.reset_subtree(name);
        Ok(())
    }

    pub(crate) fn reset_subtree(&self, name: &str) {
        for member in self.subtree_names(name) {
            if let Some(cell) = self.component(&member) {
                cell.lock().unwrap().reset();
            }
        }
    }

    pub(crate) fn log(&self, level: Level, text: &str) {
        let sink = self.inner.log_sink.read().unwrap().clone();
        sink.log_message(now_epoch_secs(), level, text);
    }

    pub(crate) fn provenance(&self) -> Option<Arc<dyn ProvenanceSink>> {
        self.inner.provenance.read().unwrap().clone()
    }

    pub(crate) fn push_running(&self, name: &str) {
        self.inner.exec_stack.lock().unwrap().push(name.to_owned());
    }

    pub(crate) fn pop_running(&self, name: &str) {
        let mut stack = self.inner.exec_stack.lock().unwrap();
        if stack.last().map(|s| s.as_str()) == Some(name) {
            stack.pop();
        } else {
            // out-of-order unwind after a failure; drop the entry
            // wherever it is
            stack.retain(|s| s != name);
        }
    }

    /// A worker-thread view of this controller.
    pub(crate) fn share(&self) -> Controller {
        self.clone()
    }
}

fn unique_name(components: &HashMap<String, ComponentCell>, base: &str) -> String {
    if !components.contains_key(base) {
        return base.to_owned();
    }
    let mut n = 1usize;
    loop {
        let candidate = format!("{base}{n}");
        if !components.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ModelComponent;

    fn controller_with_root() -> Controller {
        let ctrl = Controller::new();
        ctrl.add_component(ModelComponent::new_aggregate("root", 0), None)
            .unwrap();
        ctrl
    }

    #[test]
    fn naming_disambiguation() {
        let ctrl = controller_with_root();
        let a = ctrl
            .add_component(ModelComponent::new_process("Reader", 0, "t"), Some("root"))
            .unwrap();
        let b = ctrl
            .add_component(ModelComponent::new_process("Reader", 0, "t"), Some("root"))
            .unwrap();
        let c = ctrl
            .add_component(ModelComponent::new_process("Reader", 0, "t"), Some("root"))
            .unwrap();
        assert_eq!((a.as_str(), b.as_str(), c.as_str()), ("Reader", "Reader1", "Reader2"));
        assert!(ctrl.contains("Reader1"));
    }

    #[test]
    fn single_parentless_root() {
        let ctrl = controller_with_root();
        let err = ctrl
            .add_component(ModelComponent::new_aggregate("other", 0), None)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::OrphanedComponent);
        // the failed add leaves no registration behind
        assert!(!ctrl.contains("other"));
    }

    #[test]
    fn child_chain_order_and_level_cascade() {
        let ctrl = controller_with_root();
        ctrl.add_component(ModelComponent::new_aggregate("loop", 1), Some("root"))
            .unwrap();
        ctrl.add_component(ModelComponent::new_process("p1", 0, "t"), Some("loop"))
            .unwrap();

        // p1 sat below its host's level and was raised
        let p1 = ctrl.component("p1").unwrap();
        assert_eq!(p1.lock().unwrap().time_level(), 1);

        ctrl.set_time_level("loop", 3).unwrap();
        assert_eq!(p1.lock().unwrap().time_level(), 3);
    }

    #[test]
    fn remove_fixes_chain_and_registry() {
        let ctrl = controller_with_root();
        for name in ["a", "b", "c"] {
            ctrl.add_component(ModelComponent::new_process(name, 0, "t"), Some("root"))
                .unwrap();
        }
        ctrl.remove_component("b").unwrap();

        assert!(!ctrl.contains("b"));
        let a = ctrl.component("a").unwrap();
        assert_eq!(a.lock().unwrap().downstream.as_deref(), Some("c"));
        let c = ctrl.component("c").unwrap();
        assert_eq!(c.lock().unwrap().upstream.as_deref(), Some("a"));
    }

    #[test]
    fn remove_is_recursive() {
        let ctrl = controller_with_root();
        ctrl.add_component(ModelComponent::new_aggregate("agg", 0), Some("root"))
            .unwrap();
        ctrl.add_component(ModelComponent::new_process("inner", 0, "t"), Some("agg"))
            .unwrap();
        ctrl.remove_component("agg").unwrap();
        assert!(!ctrl.contains("agg"));
        assert!(!ctrl.contains("inner"));
        assert!(ctrl.components_by_user_id("inner").is_empty());
    }

    #[test]
    fn root_not_removable() {
        let ctrl = controller_with_root();
        let err = ctrl.remove_component("root").unwrap_err();
        assert_eq!(err.code, ErrorCode::RootNotRemovable);
    }

    #[test]
    fn user_id_multimap() {
        let ctrl = controller_with_root();
        ctrl.add_component(
            ModelComponent::new_process("r1", 0, "t").with_user_id("reader"),
            Some("root"),
        )
        .unwrap();
        ctrl.add_component(
            ModelComponent::new_process("r2", 0, "t").with_user_id("reader"),
            Some("root"),
        )
        .unwrap();
        let names = ctrl.components_by_user_id("reader");
        assert_eq!(names, vec!["r1".to_string(), "r2".to_string()]);
    }

    #[test]
    fn removal_is_logged() {
        let ctrl = controller_with_root();
        let sink = Arc::new(crate::logging::test_support::MemorySink::default());
        ctrl.set_log_sink(sink.clone());
        ctrl.add_component(ModelComponent::new_process("tmp", 0, "t"), Some("root"))
            .unwrap();
        ctrl.remove_component("tmp").unwrap();
        assert!(sink.contains(Level::Info, "'tmp' removed"));
    }

    #[test]
    fn parameter_set_and_get() {
        let ctrl = controller_with_root();
        ctrl.set_parameter("root", "out", 1, Value::Str("a_$[math:1+1]$".into()))
            .unwrap();
        assert_eq!(ctrl.get_parameter("root", "out").unwrap(), "a_2");
        assert!(ctrl.get_parameter("root", "missing").is_err());
    }

    #[test]
    fn execute_unknown_component() {
        let ctrl = controller_with_root();
        let err = ctrl.execute("nope").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnregisteredComponent);
        assert!(!ctrl.is_running());
    }
}
