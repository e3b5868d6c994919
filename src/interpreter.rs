// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use float_cmp::approx_eq;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::common::{EquationError, EquationResult, ErrorCode};
use crate::parser;

pub(crate) fn is_truthy(n: f64) -> bool {
    let is_false = approx_eq!(f64, n, 0.0);
    !is_false
}

/// Resolves free identifiers appearing in a math expression to numeric
/// values. Identifiers are bound to already-resolved parameter values;
/// anything unresolved is an error carried back by span.
pub trait IdentEnv {
    fn lookup(&self, ident: &str) -> Option<f64>;
}

/// The empty environment: every identifier is unknown.
pub struct NoIdents;

impl IdentEnv for NoIdents {
    fn lookup(&self, _ident: &str) -> Option<f64> {
        None
    }
}

/// Parse and evaluate a math expression in one step. Empty input
/// evaluates to 0, matching how iteration-count expressions treat a
/// blank designer field.
pub fn eval_str(input: &str, env: &dyn IdentEnv) -> EquationResult<f64> {
    match parser::parse(input)? {
        Some(expr) => eval(&expr, env),
        None => Ok(0.0),
    }
}

pub fn eval(expr: &Expr, env: &dyn IdentEnv) -> EquationResult<f64> {
    match expr {
        Expr::Const(n, _) => Ok(*n),
        Expr::Var(ident, loc) => env.lookup(ident).ok_or(EquationError {
            start: loc.start,
            end: loc.end,
            code: ErrorCode::UnknownIdentifier,
        }),
        Expr::Op1(op, l, _) => {
            let l = eval(l, env)?;
            let result = match op {
                UnaryOp::Positive => l,
                UnaryOp::Negative => -l,
                UnaryOp::Not => (!is_truthy(l)) as i8 as f64,
            };
            Ok(result)
        }
        Expr::Op2(op, l, r, _) => {
            let l = eval(l, env)?;
            let r = eval(r, env)?;
            let result = match op {
                BinaryOp::Add => l + r,
                BinaryOp::Sub => l - r,
                BinaryOp::Exp => l.powf(r),
                BinaryOp::Mul => l * r,
                BinaryOp::Div => l / r,
                BinaryOp::Mod => l.rem_euclid(r),
                BinaryOp::Gt => (l > r) as i8 as f64,
                BinaryOp::Gte => (l >= r) as i8 as f64,
                BinaryOp::Lt => (l < r) as i8 as f64,
                BinaryOp::Lte => (l <= r) as i8 as f64,
                BinaryOp::Eq => approx_eq!(f64, l, r) as i8 as f64,
                BinaryOp::Neq => !approx_eq!(f64, l, r) as i8 as f64,
                BinaryOp::And => (is_truthy(l) && is_truthy(r)) as i8 as f64,
                BinaryOp::Or => (is_truthy(l) || is_truthy(r)) as i8 as f64,
            };
            Ok(result)
        }
        Expr::If(cond, t, f, _) => {
            let cond = eval(cond, env)?;
            if is_truthy(cond) {
                eval(t, env)
            } else {
                eval(f, env)
            }
        }
    }
}
