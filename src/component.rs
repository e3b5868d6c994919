// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Graph nodes.
//!
//! Components are owned by a single table (the Controller's registry)
//! and refer to each other by registry name: host, sibling chain and
//! child chain links are names, never owning pointers.

use std::collections::HashMap;
use std::fmt;

use crate::common::{Error, ErrorCode, ErrorKind, Result};
use crate::unit::ProcessUnit;
use crate::value::Value;

/// A reference to another component's output: `"name"` or
/// `"name:outputIndex"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputRef {
    pub component: String,
    pub output: usize,
}

impl InputRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::new(
                ErrorKind::Model,
                ErrorCode::InvalidInput,
                Some("empty input reference".to_string()),
            ));
        }
        match raw.rsplit_once(':') {
            Some((name, idx)) => {
                let output = idx.trim().parse::<usize>().map_err(|_| {
                    Error::new(
                        ErrorKind::Model,
                        ErrorCode::InvalidInput,
                        Some(format!("bad output index in input reference '{raw}'")),
                    )
                })?;
                Ok(InputRef {
                    component: name.trim().to_string(),
                    output,
                })
            }
            None => Ok(InputRef {
                component: raw.to_string(),
                output: 0,
            }),
        }
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.output == 0 {
            write!(f, "{}", self.component)
        } else {
            write!(f, "{}:{}", self.component, self.output)
        }
    }
}

/// How a per-step index (input lists, property history) is resolved
/// when the requested step runs past what the designer supplied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IndexPolicy {
    /// Clamp to the last supplied step ("use-up").
    #[default]
    UseUp,
    /// Wrap around.
    Cyclic,
    /// Follow the host's current step (clamped).
    HostSynced,
}

/// The canonical step clamp. Steps are 1-based; `available` is how
/// many steps the designer supplied. Every call site (executable
/// discovery, the upstream pipeline walk, property indexing) goes
/// through here.
pub fn resolve_step(
    policy: IndexPolicy,
    requested: usize,
    available: usize,
    host_step: usize,
) -> usize {
    if available == 0 {
        return 0;
    }
    let requested = requested.max(1);
    match policy {
        IndexPolicy::UseUp => requested.min(available),
        IndexPolicy::Cyclic => ((requested - 1) % available) + 1,
        IndexPolicy::HostSynced => host_step.clamp(1, available),
    }
}

/// Target iteration count of an iterable component. Expressions are
/// re-evaluated after every pass: a count may depend on values the
/// previous pass produced.
#[derive(Clone, Debug, PartialEq)]
pub enum IterCount {
    Fixed(usize),
    Expr(String),
}

impl Default for IterCount {
    fn default() -> Self {
        IterCount::Fixed(1)
    }
}

pub enum ComponentKind {
    /// Owns exactly one leaf processing unit; no sub-components. The
    /// unit is lazily instantiated by the scheduler.
    Process {
        unit_type: String,
        unit: Option<Box<dyn ProcessUnit>>,
    },
    /// Owns an ordered, doubly-linked chain of children; no unit.
    Aggregate {
        first: Option<String>,
        last: Option<String>,
    },
    /// Zero-time-cost snapshot of another component's output.
    Buffer {
        source: Option<(String, usize)>,
        linked: bool,
        value: Option<Value>,
    },
}

impl fmt::Debug for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ComponentKind::Process { unit_type, unit } => f
                .debug_struct("Process")
                .field("unit_type", unit_type)
                .field("instantiated", &unit.is_some())
                .finish(),
            ComponentKind::Aggregate { first, last } => f
                .debug_struct("Aggregate")
                .field("first", first)
                .field("last", last)
                .finish(),
            ComponentKind::Buffer { source, linked, .. } => f
                .debug_struct("Buffer")
                .field("source", source)
                .field("linked", linked)
                .finish(),
        }
    }
}

pub struct ModelComponent {
    /// Registry-assigned unique name.
    pub(crate) name: String,
    /// Designer-visible identifier; may itself be an expression,
    /// re-resolved per run.
    pub(crate) user_id: String,
    pub(crate) time_level: u32,
    pub(crate) kind: ComponentKind,
    /// outer index = iteration step (0-based internally, steps are
    /// 1-based at the API surface)
    pub(crate) inputs: Vec<Vec<InputRef>>,
    pub(crate) index_policy: IndexPolicy,

    pub(crate) host: Option<String>,
    pub(crate) upstream: Option<String>,
    pub(crate) downstream: Option<String>,

    /// Designer-set iteration index, 1-based.
    pub(crate) iter_index: usize,
    /// Per-run iteration index; only valid while a run is active.
    pub(crate) run_index: Option<usize>,
    pub(crate) iter_count: IterCount,

    /// Per-step property history.
    pub(crate) properties: HashMap<String, Vec<Value>>,
}

impl ModelComponent {
    pub fn new_process(name: &str, time_level: u32, unit_type: &str) -> Self {
        Self::new(
            name,
            time_level,
            ComponentKind::Process {
                unit_type: unit_type.to_owned(),
                unit: None,
            },
        )
    }

    pub fn new_aggregate(name: &str, time_level: u32) -> Self {
        Self::new(
            name,
            time_level,
            ComponentKind::Aggregate {
                first: None,
                last: None,
            },
        )
    }

    pub fn new_buffer(name: &str, time_level: u32) -> Self {
        Self::new(
            name,
            time_level,
            ComponentKind::Buffer {
                source: None,
                linked: false,
                value: None,
            },
        )
    }

    fn new(name: &str, time_level: u32, kind: ComponentKind) -> Self {
        ModelComponent {
            name: name.to_owned(),
            user_id: name.to_owned(),
            time_level,
            kind,
            inputs: Vec::new(),
            index_policy: IndexPolicy::default(),
            host: None,
            upstream: None,
            downstream: None,
            iter_index: 1,
            run_index: None,
            iter_count: IterCount::default(),
            properties: HashMap::new(),
        }
    }

    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.user_id = user_id.to_owned();
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<Vec<InputRef>>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_iter_count(mut self, count: IterCount) -> Self {
        self.iter_count = count;
        self
    }

    pub fn with_index_policy(mut self, policy: IndexPolicy) -> Self {
        self.index_policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn time_level(&self) -> u32 {
        self.time_level
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn is_process(&self) -> bool {
        matches!(self.kind, ComponentKind::Process { .. })
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, ComponentKind::Aggregate { .. })
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self.kind, ComponentKind::Buffer { .. })
    }

    pub fn unit_type(&self) -> Option<&str> {
        match &self.kind {
            ComponentKind::Process { unit_type, .. } => Some(unit_type),
            _ => None,
        }
    }

    pub fn unit(&self) -> Option<&dyn ProcessUnit> {
        match &self.kind {
            ComponentKind::Process { unit, .. } => unit.as_deref(),
            _ => None,
        }
    }

    pub fn unit_mut(&mut self) -> Option<&mut Box<dyn ProcessUnit>> {
        match &mut self.kind {
            ComponentKind::Process { unit, .. } => unit.as_mut(),
            _ => None,
        }
    }

    /// The step used when this component resolves per-step data right
    /// now: the per-run index while a run is active, the designer
    /// index otherwise. 1-based.
    pub fn current_step(&self) -> usize {
        self.run_index.unwrap_or(self.iter_index)
    }

    pub fn set_run_index(&mut self, step: usize) {
        self.run_index = Some(step);
    }

    /// Input references for a step, resolved through the canonical
    /// clamp. `host_step` feeds the host-synchronised policy.
    pub fn inputs_for_step(&self, requested: usize, host_step: usize) -> &[InputRef] {
        let step = resolve_step(self.index_policy, requested, self.inputs.len(), host_step);
        if step == 0 {
            &[]
        } else {
            &self.inputs[step - 1]
        }
    }

    /// Record a property value for the given 1-based step, growing the
    /// history as needed.
    pub fn set_property(&mut self, name: &str, step: usize, value: Value) {
        let history = self.properties.entry(name.to_owned()).or_default();
        let step = step.max(1);
        if history.len() < step {
            // gaps repeat the nearest earlier value
            let fill = history.last().cloned().unwrap_or_else(|| value.clone());
            history.resize(step, fill);
        }
        history[step - 1] = value;
    }

    /// Fetch a property value at a step, through the canonical clamp.
    pub fn property(&self, name: &str, requested: usize, host_step: usize) -> Option<&Value> {
        let history = self.properties.get(name)?;
        let step = resolve_step(self.index_policy, requested, history.len(), host_step);
        if step == 0 { None } else { history.get(step - 1) }
    }

    /// A component's externally visible output.
    pub fn output(&self, index: usize) -> Result<Value> {
        match &self.kind {
            ComponentKind::Process { unit: Some(unit), .. } => {
                unit.output(crate::unit::OutputRef::Index(index))
            }
            ComponentKind::Process { unit: None, .. } => Err(Error::for_component(
                ErrorKind::Model,
                ErrorCode::UninitialisedUnit,
                &self.name,
                None,
            )),
            ComponentKind::Buffer { value: Some(v), .. } => Ok(v.clone()),
            ComponentKind::Buffer { value: None, .. } => Err(Error::for_component(
                ErrorKind::Model,
                ErrorCode::UninitialisedData,
                &self.name,
                None,
            )),
            ComponentKind::Aggregate { .. } => Err(Error::for_component(
                ErrorKind::Model,
                ErrorCode::InvalidInput,
                &self.name,
                Some("aggregates expose no outputs".to_string()),
            )),
        }
    }

    /// Clear run state: buffered values, unit state, iteration
    /// bookkeeping. Structure (links, inputs, properties) survives.
    pub fn reset(&mut self) {
        self.run_index = None;
        match &mut self.kind {
            ComponentKind::Process { unit, .. } => {
                if let Some(unit) = unit {
                    unit.reset();
                }
            }
            ComponentKind::Buffer { source, linked, value } => {
                *linked = false;
                *value = None;
                *source = None;
            }
            ComponentKind::Aggregate { .. } => {}
        }
    }
}

impl fmt::Debug for ModelComponent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModelComponent")
            .field("name", &self.name)
            .field("time_level", &self.time_level)
            .field("kind", &self.kind)
            .field("host", &self.host)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_ref_parsing() {
        assert_eq!(
            InputRef::parse("Reader").unwrap(),
            InputRef {
                component: "Reader".into(),
                output: 0
            }
        );
        assert_eq!(
            InputRef::parse("Reader:2").unwrap(),
            InputRef {
                component: "Reader".into(),
                output: 2
            }
        );
        assert!(InputRef::parse("").is_err());
        assert!(InputRef::parse("Reader:x").is_err());
    }

    #[test]
    fn canonical_clamp_use_up() {
        // 2 supplied steps, 5 requested iterations: steps 3..5 resolve
        // to the last defined list
        for requested in 3..=5 {
            assert_eq!(resolve_step(IndexPolicy::UseUp, requested, 2, 1), 2);
        }
        assert_eq!(resolve_step(IndexPolicy::UseUp, 1, 2, 1), 1);
        assert_eq!(resolve_step(IndexPolicy::UseUp, 2, 2, 1), 2);
        assert_eq!(resolve_step(IndexPolicy::UseUp, 1, 0, 1), 0);
    }

    #[test]
    fn canonical_clamp_cyclic_and_host() {
        assert_eq!(resolve_step(IndexPolicy::Cyclic, 4, 3, 1), 1);
        assert_eq!(resolve_step(IndexPolicy::Cyclic, 5, 3, 1), 2);
        assert_eq!(resolve_step(IndexPolicy::HostSynced, 9, 3, 2), 2);
        assert_eq!(resolve_step(IndexPolicy::HostSynced, 1, 3, 7), 3);
    }

    #[test]
    fn property_history_clamps() {
        let mut c = ModelComponent::new_buffer("b", 0);
        c.set_property("path", 1, Value::Str("a.tif".into()));
        c.set_property("path", 2, Value::Str("b.tif".into()));

        assert_eq!(
            c.property("path", 1, 1),
            Some(&Value::Str("a.tif".into()))
        );
        // steps beyond the supplied history use the last value
        assert_eq!(
            c.property("path", 7, 1),
            Some(&Value::Str("b.tif".into()))
        );
        assert_eq!(c.property("missing", 1, 1), None);
    }

    #[test]
    fn property_history_gap_fill() {
        let mut c = ModelComponent::new_buffer("b", 0);
        c.set_property("n", 3, Value::Int(3));
        // steps 1 and 2 were back-filled
        assert_eq!(c.property("n", 1, 1), Some(&Value::Int(3)));
    }

    #[test]
    fn kind_predicates() {
        let p = ModelComponent::new_process("p", 1, "reader");
        assert!(p.is_process() && !p.is_aggregate() && !p.is_buffer());
        assert_eq!(p.unit_type(), Some("reader"));

        let a = ModelComponent::new_aggregate("a", 0);
        assert!(a.is_aggregate());

        let b = ModelComponent::new_buffer("b", 0);
        assert!(b.is_buffer());
    }

    #[test]
    fn buffer_output_before_link_is_uninitialised() {
        let b = ModelComponent::new_buffer("b", 0);
        let err = b.output(0).unwrap_err();
        assert_eq!(err.code, ErrorCode::UninitialisedData);
    }
}
