// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The leaf processing unit contract.
//!
//! Concrete units (readers, writers, raster kernels) live outside the
//! engine; the scheduler drives them exclusively through [`ProcessUnit`]
//! and learns what a unit type *is* (pipeline sink? concurrency
//! capable?) from the [`UnitRegistry`] at construction time, never by
//! runtime type inspection.

use std::collections::HashMap;
use std::fmt;

use crate::common::{Error, ErrorCode, ErrorKind, Result};
use crate::value::Value;

/// Identifies one output of a unit, by position or by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputRef<'a> {
    Index(usize),
    Name(&'a str),
}

impl fmt::Display for OutputRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutputRef::Index(i) => write!(f, "#{i}"),
            OutputRef::Name(n) => write!(f, "{n}"),
        }
    }
}

/// One upstream value handed to a unit during pipeline linking: the
/// input reference it satisfies, where it came from, and the resolved
/// value.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkedInput {
    pub source: String,
    pub output: usize,
    pub value: Value,
}

/// Contract every leaf processing object implements. `update` is
/// demand-driven: a unit brings itself and anything it was linked to
/// up to date, which is why the scheduler only updates the most
/// downstream member of a pipeline.
pub trait ProcessUnit: Send {
    fn instantiate(&mut self) -> Result<()>;

    fn link_in_pipeline(&mut self, step: usize, inputs: &[LinkedInput]) -> Result<()>;

    fn update(&mut self) -> Result<()>;

    fn reset(&mut self);

    /// Release transient working buffers after a successful update.
    /// Outputs must stay readable.
    fn release_buffers(&mut self) {}

    fn output(&self, port: OutputRef) -> Result<Value>;

    /// Best-effort request to stop at the next safe point.
    fn abort_execution(&self);

    fn is_initialised(&self) -> bool;
}

impl fmt::Debug for dyn ProcessUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProcessUnit")
            .field("initialised", &self.is_initialised())
            .finish()
    }
}

/// Whether surplus workers may be assigned to a unit type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Concurrency {
    /// Strictly single-worker.
    Serial,
    /// Can put extra workers to use, up to the declared count.
    Capable { desired: usize },
}

pub type UnitFactory = Box<dyn Fn() -> Box<dyn ProcessUnit> + Send + Sync>;

pub struct UnitSpec {
    pub is_sink: bool,
    pub concurrency: Concurrency,
    factory: UnitFactory,
}

/// Process-type registry: type name → factory plus the classification
/// flags the scheduler and allocator consult.
#[derive(Default)]
pub struct UnitRegistry {
    specs: HashMap<String, UnitSpec>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, type_name: &str, is_sink: bool, concurrency: Concurrency, factory: F)
    where
        F: Fn() -> Box<dyn ProcessUnit> + Send + Sync + 'static,
    {
        self.specs.insert(
            type_name.to_owned(),
            UnitSpec {
                is_sink,
                concurrency,
                factory: Box::new(factory),
            },
        );
    }

    pub fn create(&self, type_name: &str) -> Result<Box<dyn ProcessUnit>> {
        match self.specs.get(type_name) {
            Some(spec) => Ok((spec.factory)()),
            None => Err(Error::new(
                ErrorKind::Model,
                ErrorCode::UnknownUnitType,
                Some(type_name.to_owned()),
            )),
        }
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.specs.contains_key(type_name)
    }

    pub fn is_sink(&self, type_name: &str) -> bool {
        self.specs.get(type_name).map(|s| s.is_sink).unwrap_or(false)
    }

    pub fn concurrency(&self, type_name: &str) -> Concurrency {
        self.specs
            .get(type_name)
            .map(|s| s.concurrency)
            .unwrap_or(Concurrency::Serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::ConstUnit;

    #[test]
    fn registry_creates_and_classifies() {
        let mut reg = UnitRegistry::new();
        reg.register("constant", true, Concurrency::Serial, || {
            Box::new(ConstUnit::new(Value::Int(7)))
        });

        assert!(reg.contains("constant"));
        assert!(reg.is_sink("constant"));
        assert_eq!(reg.concurrency("constant"), Concurrency::Serial);

        let mut unit = reg.create("constant").unwrap();
        unit.instantiate().unwrap();
        assert!(unit.is_initialised());
        assert_eq!(unit.output(OutputRef::Index(0)).unwrap(), Value::Int(7));
    }

    #[test]
    fn unknown_type_errors() {
        let reg = UnitRegistry::new();
        let err = reg.create("nope").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownUnitType);
        assert!(!reg.is_sink("nope"));
        assert_eq!(reg.concurrency("nope"), Concurrency::Serial);
    }
}
