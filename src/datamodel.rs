// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Serializable graph descriptions.
//!
//! A [`GraphSpec`] is the designer-facing description of a component
//! graph (what a front end or a model registry stores); `build`
//! instantiates it into a Controller. Unit types are referenced by
//! name and must be registered before the graph is built or run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::Result;
use crate::component::{IndexPolicy, InputRef, IterCount, ModelComponent};
use crate::controller::Controller;
use crate::value::Value;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    /// Root aggregate's name.
    pub name: String,
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub time_level: u32,
    #[serde(flatten)]
    pub kind: KindSpec,
    /// Outer index = iteration step; entries are `"name"` or
    /// `"name:outputIndex"` references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<IterSpec>,
    #[serde(default)]
    pub index_policy: PolicySpec,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, Vec<Value>>,
    /// Children; only meaningful on aggregates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentSpec>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum KindSpec {
    Process { unit: String },
    Aggregate,
    Buffer,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IterSpec {
    Count(usize),
    Expr(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicySpec {
    #[default]
    UseUp,
    Cyclic,
    HostSynced,
}

impl From<PolicySpec> for IndexPolicy {
    fn from(p: PolicySpec) -> Self {
        match p {
            PolicySpec::UseUp => IndexPolicy::UseUp,
            PolicySpec::Cyclic => IndexPolicy::Cyclic,
            PolicySpec::HostSynced => IndexPolicy::HostSynced,
        }
    }
}

impl GraphSpec {
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Instantiate this description into `ctrl`. Returns the root's
    /// assigned registry name.
    pub fn build(&self, ctrl: &Controller) -> Result<String> {
        let root = ctrl.add_component(ModelComponent::new_aggregate(&self.name, 0), None)?;
        for child in &self.components {
            build_component(ctrl, child, &root)?;
        }
        Ok(root)
    }
}

fn build_component(ctrl: &Controller, spec: &ComponentSpec, host: &str) -> Result<String> {
    let mut comp = match &spec.kind {
        KindSpec::Process { unit } => {
            ModelComponent::new_process(&spec.name, spec.time_level, unit)
        }
        KindSpec::Aggregate => ModelComponent::new_aggregate(&spec.name, spec.time_level),
        KindSpec::Buffer => ModelComponent::new_buffer(&spec.name, spec.time_level),
    };

    if let Some(user_id) = &spec.user_id {
        comp = comp.with_user_id(user_id);
    }
    if !spec.inputs.is_empty() {
        let mut inputs = Vec::with_capacity(spec.inputs.len());
        for step in &spec.inputs {
            let refs: Result<Vec<InputRef>> = step.iter().map(|s| InputRef::parse(s)).collect();
            inputs.push(refs?);
        }
        comp = comp.with_inputs(inputs);
    }
    if let Some(iterations) = &spec.iterations {
        comp = comp.with_iter_count(match iterations {
            IterSpec::Count(n) => IterCount::Fixed(*n),
            IterSpec::Expr(e) => IterCount::Expr(e.clone()),
        });
    }
    comp = comp.with_index_policy(spec.index_policy.into());

    let name = ctrl.add_component(comp, Some(host))?;

    if !spec.properties.is_empty() {
        let cell = ctrl.component(&name).expect("just added");
        let mut c = cell.lock().unwrap();
        for (prop, history) in &spec.properties {
            for (i, value) in history.iter().enumerate() {
                c.set_property(prop, i + 1, value.clone());
            }
        }
    }

    for child in &spec.components {
        build_component(ctrl, child, &name)?;
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
    {
        "name": "catchment",
        "components": [
            {
                "name": "Rain",
                "kind": "process",
                "unit": "constant"
            },
            {
                "name": "Loop",
                "kind": "aggregate",
                "time_level": 1,
                "iterations": 3,
                "components": [
                    {
                        "name": "Runoff",
                        "kind": "process",
                        "unit": "adder",
                        "time_level": 1,
                        "inputs": [["Rain"]]
                    }
                ]
            },
            {
                "name": "Store",
                "kind": "buffer",
                "inputs": [["Runoff:0"]]
            }
        ]
    }"#;

    #[test]
    fn json_round_trip() {
        let spec = GraphSpec::from_json(EXAMPLE).unwrap();
        assert_eq!(spec.name, "catchment");
        assert_eq!(spec.components.len(), 3);
        assert_eq!(
            spec.components[1].iterations,
            Some(IterSpec::Count(3))
        );

        let json = spec.to_json().unwrap();
        let again = GraphSpec::from_json(&json).unwrap();
        assert_eq!(spec, again);
    }

    #[test]
    fn build_registers_the_tree() {
        let ctrl = Controller::new();
        let spec = GraphSpec::from_json(EXAMPLE).unwrap();
        let root = spec.build(&ctrl).unwrap();

        assert_eq!(root, "catchment");
        assert!(ctrl.contains("Rain"));
        assert!(ctrl.contains("Loop"));
        assert!(ctrl.contains("Runoff"));
        assert!(ctrl.contains("Store"));

        let runoff = ctrl.component("Runoff").unwrap();
        let c = runoff.lock().unwrap();
        assert_eq!(c.host(), Some("Loop"));
        assert_eq!(c.time_level(), 1);
    }

    #[test]
    fn expression_iteration_counts_deserialize() {
        let json = r#"
        {
            "name": "m",
            "components": [
                {
                    "name": "L",
                    "kind": "aggregate",
                    "iterations": "$[math:1+1]$"
                }
            ]
        }"#;
        let spec = GraphSpec::from_json(json).unwrap();
        assert_eq!(
            spec.components[0].iterations,
            Some(IterSpec::Expr("$[math:1+1]$".to_string()))
        );
    }
}
