// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Process-unit doubles for engine tests: constant sources, counters,
//! recorders and failure injectors. Kept in the library so
//! integration tests can drive real graphs without real kernels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::{Error, ErrorCode, ErrorKind, Result};
use crate::unit::{LinkedInput, OutputRef, ProcessUnit};
use crate::value::Value;

/// Execution-order log shared between recorder units and assertions.
pub type SharedLog = Arc<Mutex<Vec<String>>>;

pub fn shared_log() -> SharedLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn no_such_output(port: OutputRef) -> Error {
    Error::new(
        ErrorKind::Model,
        ErrorCode::InvalidInput,
        Some(format!("no output {port}")),
    )
}

/// A source with one fixed output, available as soon as the unit is
/// instantiated.
pub struct ConstUnit {
    value: Value,
    initialised: bool,
}

impl ConstUnit {
    pub fn new(value: Value) -> Self {
        ConstUnit {
            value,
            initialised: false,
        }
    }
}

impl ProcessUnit for ConstUnit {
    fn instantiate(&mut self) -> Result<()> {
        self.initialised = true;
        Ok(())
    }

    fn link_in_pipeline(&mut self, _step: usize, _inputs: &[LinkedInput]) -> Result<()> {
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) {}

    fn output(&self, port: OutputRef) -> Result<Value> {
        match port {
            OutputRef::Index(0) | OutputRef::Name("value") => Ok(self.value.clone()),
            other => Err(no_such_output(other)),
        }
    }

    fn abort_execution(&self) {}

    fn is_initialised(&self) -> bool {
        self.initialised
    }
}

/// Counts its updates; output 0 is the count so far.
#[derive(Default)]
pub struct CounterUnit {
    count: i64,
    initialised: bool,
}

impl CounterUnit {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessUnit for CounterUnit {
    fn instantiate(&mut self) -> Result<()> {
        self.initialised = true;
        Ok(())
    }

    fn link_in_pipeline(&mut self, _step: usize, _inputs: &[LinkedInput]) -> Result<()> {
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.count += 1;
        Ok(())
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    fn output(&self, port: OutputRef) -> Result<Value> {
        match port {
            OutputRef::Index(0) | OutputRef::Name("count") => Ok(Value::Int(self.count)),
            other => Err(no_such_output(other)),
        }
    }

    fn abort_execution(&self) {}

    fn is_initialised(&self) -> bool {
        self.initialised
    }
}

/// Appends its label to a shared log on every update. Output 0 is the
/// number of updates performed.
pub struct RecorderUnit {
    label: String,
    log: SharedLog,
    updates: i64,
    initialised: bool,
}

impl RecorderUnit {
    pub fn new(label: &str, log: SharedLog) -> Self {
        RecorderUnit {
            label: label.to_owned(),
            log,
            updates: 0,
            initialised: false,
        }
    }
}

impl ProcessUnit for RecorderUnit {
    fn instantiate(&mut self) -> Result<()> {
        self.initialised = true;
        Ok(())
    }

    fn link_in_pipeline(&mut self, _step: usize, _inputs: &[LinkedInput]) -> Result<()> {
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.updates += 1;
        self.log.lock().unwrap().push(self.label.clone());
        Ok(())
    }

    fn reset(&mut self) {
        self.updates = 0;
    }

    fn output(&self, port: OutputRef) -> Result<Value> {
        match port {
            OutputRef::Index(0) => Ok(Value::Int(self.updates)),
            other => Err(no_such_output(other)),
        }
    }

    fn abort_execution(&self) {}

    fn is_initialised(&self) -> bool {
        self.initialised
    }
}

/// Sums its linked inputs on update; output 0 is the last sum.
#[derive(Default)]
pub struct AdderUnit {
    inputs: Vec<LinkedInput>,
    sum: f64,
    initialised: bool,
}

impl AdderUnit {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessUnit for AdderUnit {
    fn instantiate(&mut self) -> Result<()> {
        self.initialised = true;
        Ok(())
    }

    fn link_in_pipeline(&mut self, _step: usize, inputs: &[LinkedInput]) -> Result<()> {
        self.inputs = inputs.to_vec();
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.sum = self
            .inputs
            .iter()
            .map(|i| i.value.as_float().unwrap_or(0.0))
            .sum();
        Ok(())
    }

    fn reset(&mut self) {
        self.inputs.clear();
        self.sum = 0.0;
    }

    fn output(&self, port: OutputRef) -> Result<Value> {
        match port {
            OutputRef::Index(0) | OutputRef::Name("sum") => Ok(Value::Float(self.sum)),
            other => Err(no_such_output(other)),
        }
    }

    fn abort_execution(&self) {}

    fn is_initialised(&self) -> bool {
        self.initialised
    }
}

/// Runs a caller-supplied hook on every update; the hook's return
/// value becomes output 0. The abort flag is observable by the hook.
pub struct HookUnit {
    hook: Box<dyn FnMut(&[LinkedInput]) -> Result<Value> + Send>,
    inputs: Vec<LinkedInput>,
    last: Option<Value>,
    aborted: Arc<AtomicBool>,
    initialised: bool,
}

impl HookUnit {
    pub fn new<F>(hook: F) -> Self
    where
        F: FnMut(&[LinkedInput]) -> Result<Value> + Send + 'static,
    {
        HookUnit {
            hook: Box::new(hook),
            inputs: Vec::new(),
            last: None,
            aborted: Arc::new(AtomicBool::new(false)),
            initialised: false,
        }
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.aborted)
    }
}

impl ProcessUnit for HookUnit {
    fn instantiate(&mut self) -> Result<()> {
        self.initialised = true;
        Ok(())
    }

    fn link_in_pipeline(&mut self, _step: usize, inputs: &[LinkedInput]) -> Result<()> {
        self.inputs = inputs.to_vec();
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.last = Some((self.hook)(&self.inputs)?);
        Ok(())
    }

    fn reset(&mut self) {
        self.last = None;
        self.inputs.clear();
    }

    fn output(&self, port: OutputRef) -> Result<Value> {
        match (port, &self.last) {
            (OutputRef::Index(0), Some(v)) => Ok(v.clone()),
            (OutputRef::Index(0), None) => Err(Error::new(
                ErrorKind::Model,
                ErrorCode::UninitialisedData,
                None,
            )),
            (other, _) => Err(no_such_output(other)),
        }
    }

    fn abort_execution(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn is_initialised(&self) -> bool {
        self.initialised
    }
}

/// Fails every update with an execution error.
#[derive(Default)]
pub struct FailingUnit {
    initialised: bool,
}

impl FailingUnit {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessUnit for FailingUnit {
    fn instantiate(&mut self) -> Result<()> {
        self.initialised = true;
        Ok(())
    }

    fn link_in_pipeline(&mut self, _step: usize, _inputs: &[LinkedInput]) -> Result<()> {
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        Err(Error::new(
            ErrorKind::Scheduling,
            ErrorCode::ExecutionFailed,
            Some("injected failure".to_string()),
        ))
    }

    fn reset(&mut self) {}

    fn output(&self, port: OutputRef) -> Result<Value> {
        Err(no_such_output(port))
    }

    fn abort_execution(&self) {}

    fn is_initialised(&self) -> bool {
        self.initialised
    }
}
