// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Parameter-expression resolution.
//!
//! Expressions of the form `$[...]$` are substituted innermost-first
//! inside arbitrary strings, and the string is re-scanned after every
//! substitution: one expansion may reveal another. A shared budget
//! bounds total substitutions so self-regenerating designer input
//! terminates with an error instead of hanging.
//!
//! Failures inside an expression travel by value as `ERROR:`-prefixed
//! strings (see [`crate::common::ERROR_PREFIX`]); they become faults
//! only at callers that cannot proceed without a real value.

use crate::common::{Error, ErrorCode, ErrorKind, Result, error_value, is_error_value};
use crate::param_err;
use crate::component::IterCount;
use crate::controller::Controller;
use crate::interpreter::{self, NoIdents};
use crate::logging::Level;
use crate::builtins;
use crate::value::format_number;

/// Total substitutions allowed per top-level `resolve` call. A safety
/// valve against pathological self-referential input, not a designed
/// nesting depth.
const SUBSTITUTION_LIMIT: usize = 15_000;

/// Bound on re-entrant resolution (user identifiers resolving user
/// identifiers); keeps pathological input from exhausting the stack
/// before the substitution budget runs out.
const DEPTH_LIMIT: usize = 64;

struct Budget {
    substitutions: usize,
    depth: usize,
}

impl Budget {
    fn new() -> Self {
        Budget {
            substitutions: 0,
            depth: 0,
        }
    }

    fn spend(&mut self) -> Result<()> {
        self.substitutions += 1;
        if self.substitutions > SUBSTITUTION_LIMIT {
            param_err!(
                RecursionLimitExceeded,
                format!("more than {SUBSTITUTION_LIMIT} substitutions")
            )
        } else {
            Ok(())
        }
    }
}

/// Resolve every `$[...]$` expression in `raw` in the context of the
/// component `owner`. An `ERROR:` value produced at any nesting level
/// short-circuits and is returned verbatim as the resolved string;
/// only the recursion ceiling is a hard error.
pub fn resolve(ctrl: &Controller, owner: &str, raw: &str) -> Result<String> {
    let mut budget = Budget::new();
    resolve_inner(ctrl, owner, raw, &mut budget)
}

/// Like [`resolve`], but an `ERROR:` value is converted into an
/// invalid-parameter fault. For callers that need a usable value
/// (iteration counts, input references).
pub fn resolve_strict(ctrl: &Controller, owner: &str, raw: &str) -> Result<String> {
    let resolved = resolve(ctrl, owner, raw)?;
    if is_error_value(&resolved) {
        Err(Error::for_component(
            ErrorKind::Parameter,
            ErrorCode::InvalidParameter,
            owner,
            Some(resolved),
        ))
    } else {
        Ok(resolved)
    }
}

fn resolve_inner(
    ctrl: &Controller,
    owner: &str,
    raw: &str,
    budget: &mut Budget,
) -> Result<String> {
    budget.depth += 1;
    if budget.depth > DEPTH_LIMIT {
        budget.depth -= 1;
        return param_err!(
            RecursionLimitExceeded,
            format!("expression nesting deeper than {DEPTH_LIMIT}")
        );
    }

    let mut text = raw.to_string();
    let result = loop {
        // innermost expression: the first closer, the last opener
        // before it
        let Some(close) = text.find("]$") else {
            break Ok(text);
        };
        let Some(open) = text[..close].rfind("$[") else {
            break Ok(text);
        };

        budget.spend()?;
        let body = text[open + 2..close].to_string();
        let replacement = eval_body(ctrl, owner, &body, budget)?;
        if is_error_value(&replacement) {
            break Ok(replacement);
        }
        text.replace_range(open..close + 2, &replacement);
    };
    budget.depth -= 1;
    result
}

fn eval_body(
    ctrl: &Controller,
    owner: &str,
    body: &str,
    budget: &mut Budget,
) -> Result<String> {
    if let Some(expr) = body.strip_prefix("math:") {
        return Ok(eval_math(expr));
    }
    if let Some(call) = body.strip_prefix("func:") {
        return Ok(eval_func(call));
    }

    // a trailing +N/-N adjusts integer-valued results
    let (body, adjustment) = split_adjustment(body);

    let mut parts = body.splitn(3, ':');
    let head = parts.next().unwrap_or("").trim();
    let prop = parts.next().map(str::trim);
    let index = parts.next().map(str::trim);

    let raw_value = match find_component(ctrl, owner, head, budget)? {
        Some(name) => component_value(ctrl, owner, &name, prop, index)?,
        None => match prop {
            // not a component: try the settings store with the full
            // namespaced key
            Some(_) => match ctrl.settings().get(body.trim()) {
                Some(v) => v.to_string(),
                None => error_value(format!("'{body}' is neither a component nor a setting")),
            },
            None => error_value(format!("unknown component or identifier '{head}'")),
        },
    };
    if is_error_value(&raw_value) {
        return Ok(raw_value);
    }

    match adjustment {
        None => Ok(raw_value),
        Some(delta) => match raw_value.trim().parse::<i64>() {
            Ok(n) => {
                let adjusted = n + delta;
                if adjusted < 0 {
                    ctrl.log(
                        Level::Warn,
                        &format!(
                            "adjustment '{body}{delta:+}' went below zero; clamping to 0"
                        ),
                    );
                    Ok("0".to_string())
                } else {
                    Ok(adjusted.to_string())
                }
            }
            Err(_) => Ok(error_value(format!(
                "cannot apply {delta:+} to non-integer value '{raw_value}'"
            ))),
        },
    }
}

fn eval_math(expr: &str) -> String {
    match interpreter::eval_str(expr, &NoIdents) {
        Ok(n) => format_number(n),
        Err(err) => error_value(format!("math '{expr}': {err}")),
    }
}

fn eval_func(call: &str) -> String {
    let call = call.trim();
    let Some(open) = call.find('(') else {
        return error_value(format!("malformed function call '{call}'"));
    };
    if !call.ends_with(')') {
        return error_value(format!("malformed function call '{call}'"));
    }
    let name = call[..open].trim();
    let args = &call[open + 1..call.len() - 1];
    builtins::call(name, args)
}

/// Split a trailing `+N` / `-N` integer adjustment off an expression
/// body. The sign must be followed by digits only.
fn split_adjustment(body: &str) -> (&str, Option<i64>) {
    let bytes = body.as_bytes();
    let mut i = bytes.len();
    while i > 0 && bytes[i - 1].is_ascii_digit() {
        i -= 1;
    }
    if i == 0 || i == bytes.len() {
        return (body, None);
    }
    let sign = bytes[i - 1];
    if sign != b'+' && sign != b'-' {
        return (body, None);
    }
    let magnitude: i64 = match body[i..].parse() {
        Ok(n) => n,
        Err(_) => return (body, None),
    };
    let delta = if sign == b'-' { -magnitude } else { magnitude };
    (&body[..i - 1], Some(delta))
}

/// Find the component an expression head refers to: registry name
/// first, then user identifier by upstream traversal (nearest sibling
/// predecessors, then outward through ancestor scopes), then the
/// registry-wide user-id map.
fn find_component(
    ctrl: &Controller,
    owner: &str,
    head: &str,
    budget: &mut Budget,
) -> Result<Option<String>> {
    if head.is_empty() {
        return Ok(None);
    }
    if ctrl.contains(head) {
        return Ok(Some(head.to_owned()));
    }

    let matches = |ctrl: &Controller, name: &str, budget: &mut Budget| -> Result<bool> {
        let Some(cell) = ctrl.component(name) else {
            return Ok(false);
        };
        let user_id = cell.lock().unwrap().user_id().to_owned();
        if user_id == head {
            return Ok(true);
        }
        if user_id.contains("$[") {
            // user identifiers may themselves be expressions
            let resolved = resolve_inner(ctrl, name, &user_id, budget)?;
            return Ok(!is_error_value(&resolved) && resolved == head);
        }
        Ok(false)
    };

    let mut scope = Some(owner.to_owned());
    while let Some(current) = scope {
        // upstream pipeline predecessors, nearest first
        let mut prev = ctrl
            .component(&current)
            .and_then(|c| c.lock().unwrap().upstream.clone());
        while let Some(candidate) = prev {
            if matches(ctrl, &candidate, budget)? {
                return Ok(Some(candidate));
            }
            prev = ctrl
                .component(&candidate)
                .and_then(|c| c.lock().unwrap().upstream.clone());
        }

        scope = ctrl
            .component(&current)
            .and_then(|c| c.lock().unwrap().host.clone());
        if let Some(host) = &scope {
            if matches(ctrl, host, budget)? {
                return Ok(Some(host.clone()));
            }
        }
    }

    Ok(ctrl.components_by_user_id(head).first().cloned())
}

/// The value of a component reference: bare references yield the
/// 1-based iteration index; `comp:prop` yields the property at the
/// owner host's current step; `comp:prop:index` picks the step
/// explicitly.
fn component_value(
    ctrl: &Controller,
    owner: &str,
    name: &str,
    prop: Option<&str>,
    index: Option<&str>,
) -> Result<String> {
    let cell = ctrl
        .component(name)
        .expect("find_component returns registered names");

    let Some(prop) = prop else {
        let step = cell.lock().unwrap().current_step();
        return Ok(step.to_string());
    };

    let step = match index {
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) => n,
            Err(_) => {
                return Ok(error_value(format!(
                    "'{raw}' is not a step index for '{name}:{prop}'"
                )));
            }
        },
        None => owner_host_step(ctrl, owner),
    };
    let host_step = owner_host_step(ctrl, owner);

    let c = cell.lock().unwrap();
    match prop {
        "name" => Ok(c.name().to_owned()),
        "userid" => Ok(c.user_id().to_owned()),
        "iteration" => Ok(c.current_step().to_string()),
        "host" => Ok(c.host().unwrap_or_default().to_owned()),
        _ => match c.property(prop, step, host_step) {
            Some(v) => Ok(v.to_string()),
            // fall back to a named unit output; initialised units only
            None => match c.unit().and_then(|u| u.output(crate::unit::OutputRef::Name(prop)).ok())
            {
                Some(v) => Ok(v.to_string()),
                None => Ok(error_value(format!(
                    "component '{name}' has no property '{prop}'"
                ))),
            },
        },
    }
}

/// The requesting component's host's current step; the owner's own
/// step when it is parentless.
fn owner_host_step(ctrl: &Controller, owner: &str) -> usize {
    let host = ctrl
        .component(owner)
        .and_then(|c| c.lock().unwrap().host.clone());
    let cell = match host {
        Some(h) => ctrl.component(&h),
        None => ctrl.component(owner),
    };
    cell.map(|c| c.lock().unwrap().current_step()).unwrap_or(1)
}

/// Current target iteration count of a component; expression-derived
/// counts are re-resolved on every call because they may depend on
/// values produced by the pass that just finished.
pub fn resolve_iter_count(ctrl: &Controller, name: &str) -> Result<usize> {
    let iter_count = {
        let cell = ctrl.component(name).ok_or_else(|| {
            Error::new(
                ErrorKind::Model,
                ErrorCode::UnregisteredComponent,
                Some(name.to_owned()),
            )
        })?;
        let c = cell.lock().unwrap();
        c.iter_count.clone()
    };

    match iter_count {
        IterCount::Fixed(n) => Ok(n),
        IterCount::Expr(expr) => {
            let resolved = resolve_strict(ctrl, name, &expr)?;
            match resolved.trim().parse::<f64>() {
                Ok(n) if n >= 0.0 => Ok(n.floor() as usize),
                Ok(_) => Ok(0),
                Err(_) => Err(Error::for_component(
                    ErrorKind::Parameter,
                    ErrorCode::BadIterationCount,
                    name,
                    Some(format!("'{expr}' resolved to '{resolved}'")),
                )),
            }
        }
    }
}

/// Resolve a component's property through the expression engine: the
/// stored value may itself contain `$[...]$` references.
pub fn get_parameter(ctrl: &Controller, name: &str, prop: &str) -> Result<String> {
    let raw = {
        let cell = ctrl.component(name).ok_or_else(|| {
            Error::new(
                ErrorKind::Model,
                ErrorCode::UnregisteredComponent,
                Some(name.to_owned()),
            )
        })?;
        let c = cell.lock().unwrap();
        let step = c.current_step();
        match c.property(prop, step, step) {
            Some(v) => v.to_string(),
            None => {
                return Err(Error::for_component(
                    ErrorKind::Parameter,
                    ErrorCode::MissingParameter,
                    name,
                    Some(prop.to_owned()),
                ));
            }
        }
    };
    resolve(ctrl, name, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ModelComponent;
    use crate::value::Value;

    fn fixture() -> Controller {
        let ctrl = Controller::new();
        ctrl.add_component(ModelComponent::new_aggregate("root", 0), None)
            .unwrap();
        ctrl.add_component(ModelComponent::new_buffer("buf", 0), Some("root"))
            .unwrap();
        ctrl
    }

    #[test]
    fn plain_strings_pass_through() {
        let ctrl = fixture();
        assert_eq!(
            resolve(&ctrl, "buf", "no expressions here").unwrap(),
            "no expressions here"
        );
        // unmatched markers are left alone
        assert_eq!(resolve(&ctrl, "buf", "half $[ open").unwrap(), "half $[ open");
    }

    #[test]
    fn math_round_trip() {
        let ctrl = fixture();
        assert_eq!(
            resolve(&ctrl, "buf", "prefix_$[math:2+3]$_suffix").unwrap(),
            "prefix_5_suffix"
        );
    }

    #[test]
    fn func_round_trip() {
        let ctrl = fixture();
        assert_eq!(
            resolve(&ctrl, "buf", "$[func:strLength(\"abcd\")]$").unwrap(),
            "4"
        );
    }

    #[test]
    fn nested_expressions_resolve_innermost_first() {
        let ctrl = fixture();
        assert_eq!(
            resolve(&ctrl, "buf", "$[math:$[math:2*3]$+1]$").unwrap(),
            "7"
        );
        assert_eq!(
            resolve(&ctrl, "buf", "$[func:cond($[math:1<2]$, yes, no)]$").unwrap(),
            "yes"
        );
    }

    #[test]
    fn bare_component_is_iteration_index() {
        let ctrl = fixture();
        assert_eq!(resolve(&ctrl, "buf", "$[buf]$").unwrap(), "1");
        assert_eq!(resolve(&ctrl, "buf", "$[buf+2]$").unwrap(), "3");
    }

    #[test]
    fn negative_adjustment_clamps_at_zero() {
        let ctrl = fixture();
        assert_eq!(resolve(&ctrl, "buf", "$[buf-5]$").unwrap(), "0");
    }

    #[test]
    fn property_lookup_with_default_index() {
        let ctrl = fixture();
        {
            let cell = ctrl.component("buf").unwrap();
            let mut c = cell.lock().unwrap();
            c.set_property("path", 1, Value::Str("out.tif".into()));
        }
        assert_eq!(
            resolve(&ctrl, "buf", "$[buf:path]$").unwrap(),
            "out.tif"
        );
        assert_eq!(
            resolve(&ctrl, "buf", "$[buf:path:1]$").unwrap(),
            "out.tif"
        );
    }

    #[test]
    fn property_values_resolve_recursively() {
        let ctrl = fixture();
        {
            let cell = ctrl.component("buf").unwrap();
            let mut c = cell.lock().unwrap();
            c.set_property("n", 1, Value::Str("$[math:6/2]$".into()));
        }
        assert_eq!(resolve(&ctrl, "buf", "x$[buf:n]$").unwrap(), "x3");
    }

    #[test]
    fn settings_namespace_lookup() {
        let ctrl = fixture();
        ctrl.settings_mut()
            .set("paths:output", Value::Str("/srv/out".into()));
        assert_eq!(
            resolve(&ctrl, "buf", "$[paths:output]$/result.tif").unwrap(),
            "/srv/out/result.tif"
        );
    }

    #[test]
    fn user_id_lookup_falls_back_to_registry_map() {
        let ctrl = fixture();
        ctrl.add_component(
            ModelComponent::new_buffer("b2", 0).with_user_id("elevation"),
            Some("root"),
        )
        .unwrap();
        // "elevation" is not a registry name, so user-id search finds b2
        assert_eq!(resolve(&ctrl, "buf", "$[elevation]$").unwrap(), "1");
    }

    #[test]
    fn error_values_short_circuit_verbatim() {
        let ctrl = fixture();
        let out = resolve(&ctrl, "buf", "before $[func:nope(1)]$ after").unwrap();
        assert!(is_error_value(&out));
        assert!(out.contains("nope"));
        // the surrounding text is gone: the error IS the result
        assert!(!out.contains("before"));
    }

    #[test]
    fn unknown_head_is_error_value() {
        let ctrl = fixture();
        let out = resolve(&ctrl, "buf", "$[doesNotExist]$").unwrap();
        assert!(is_error_value(&out));
        let strict = resolve_strict(&ctrl, "buf", "$[doesNotExist]$").unwrap_err();
        assert_eq!(strict.code, ErrorCode::InvalidParameter);
    }

    #[test]
    fn self_regenerating_expression_hits_ceiling() {
        let ctrl = fixture();
        {
            let cell = ctrl.component("buf").unwrap();
            let mut c = cell.lock().unwrap();
            // the property regenerates the expression that reads it
            c.set_property("loop", 1, Value::Str("$[buf:loop]$".into()));
        }
        let err = resolve(&ctrl, "buf", "$[buf:loop]$").unwrap_err();
        assert_eq!(err.code, ErrorCode::RecursionLimitExceeded);
    }

    #[test]
    fn get_parameter_resolves_stored_expressions() {
        let ctrl = fixture();
        {
            let cell = ctrl.component("buf").unwrap();
            let mut c = cell.lock().unwrap();
            c.set_property("path", 1, Value::Str("run_$[math:10/2]$.tif".into()));
        }
        assert_eq!(
            get_parameter(&ctrl, "buf", "path").unwrap(),
            "run_5.tif"
        );
        let err = get_parameter(&ctrl, "buf", "nope").unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingParameter);
    }

    #[test]
    fn iter_count_resolution() {
        let ctrl = fixture();
        ctrl.add_component(
            ModelComponent::new_aggregate("loop", 1)
                .with_iter_count(IterCount::Expr("$[math:2+1]$".to_string())),
            Some("root"),
        )
        .unwrap();
        assert_eq!(resolve_iter_count(&ctrl, "loop").unwrap(), 3);
    }
}
