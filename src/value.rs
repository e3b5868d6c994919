// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A component property or output value. The set of variants is closed:
/// everything a component exposes through the engine is one of these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    StrList(Vec<String>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(n) if n.fract() == 0.0 => Some(*n as i64),
            Value::Str(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            Value::Str(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Value::Str(s) => s.is_empty(),
            Value::StrList(l) => l.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{}", format_number(*n)),
            Value::Str(s) => write!(f, "{s}"),
            Value::StrList(l) => write!(f, "{}", l.join(";")),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// Render a float the way expression substitution needs it: integral
/// results print without a trailing `.0` so they can feed back into
/// index arithmetic.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(Value::Int(3).as_float(), Some(3.0));
        assert_eq!(Value::Float(4.0).as_int(), Some(4));
        assert_eq!(Value::Float(4.5).as_int(), None);
        assert_eq!(Value::Str(" 12 ".into()).as_int(), Some(12));
        assert_eq!(Value::StrList(vec![]).as_int(), None);
    }

    #[test]
    fn display_trims_integral_floats() {
        assert_eq!(Value::Float(5.0).to_string(), "5");
        assert_eq!(Value::Float(5.25).to_string(), "5.25");
        assert_eq!(Value::Str("x".into()).to_string(), "x");
        assert_eq!(
            Value::StrList(vec!["a".into(), "b".into()]).to_string(),
            "a;b"
        );
    }

    #[test]
    fn serde_untagged() {
        let v: Value = serde_json::from_str("3").unwrap();
        assert_eq!(v, Value::Int(3));
        let v: Value = serde_json::from_str("\"path\"").unwrap();
        assert_eq!(v, Value::Str("path".into()));
        let v: Value = serde_json::from_str("[\"a\",\"b\"]").unwrap();
        assert_eq!(v, Value::StrList(vec!["a".into(), "b".into()]));
    }
}
