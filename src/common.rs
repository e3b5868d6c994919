// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::fmt;
use std::{error, result};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError, // will never be produced
    DoesNotExist,
    DuplicateComponent,
    UninitialisedData,
    UninitialisedUnit,
    InvalidInput,
    InvalidParameter,
    MissingParameter,
    ExecutionFailed,
    RecursiveUpdate,
    UnregisteredComponent,
    InvalidUserIdentifier,
    RunActive,
    NoRunActive,
    RootNotRemovable,
    OrphanedComponent,
    BadTimeLevel,
    BadIterationCount,
    RecursionLimitExceeded,
    UnknownFunction,
    BadFunctionArgs,
    UnknownIdentifier,
    InvalidToken,
    UnrecognizedToken,
    UnrecognizedEof,
    ExtraToken,
    UnclosedQuotedIdent,
    ExpectedNumber,
    DivideByZero,
    UnknownUnitType,
    WorkerPanic,
    Aborted,
    Generic,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ErrorCode::*;
        let name = match self {
            NoError => "no_error",
            DoesNotExist => "does_not_exist",
            DuplicateComponent => "duplicate_component",
            UninitialisedData => "uninitialised_data",
            UninitialisedUnit => "uninitialised_unit",
            InvalidInput => "invalid_input",
            InvalidParameter => "invalid_parameter",
            MissingParameter => "missing_parameter",
            ExecutionFailed => "execution_failed",
            RecursiveUpdate => "recursive_update",
            UnregisteredComponent => "unregistered_component",
            InvalidUserIdentifier => "invalid_user_identifier",
            RunActive => "run_active",
            NoRunActive => "no_run_active",
            RootNotRemovable => "root_not_removable",
            OrphanedComponent => "orphaned_component",
            BadTimeLevel => "bad_time_level",
            BadIterationCount => "bad_iteration_count",
            RecursionLimitExceeded => "recursion_limit_exceeded",
            UnknownFunction => "unknown_function",
            BadFunctionArgs => "bad_function_args",
            UnknownIdentifier => "unknown_identifier",
            InvalidToken => "invalid_token",
            UnrecognizedToken => "unrecognized_token",
            UnrecognizedEof => "unrecognized_eof",
            ExtraToken => "extra_token",
            UnclosedQuotedIdent => "unclosed_quoted_ident",
            ExpectedNumber => "expected_number",
            DivideByZero => "divide_by_zero",
            UnknownUnitType => "unknown_unit_type",
            WorkerPanic => "worker_panic",
            Aborted => "aborted",
            Generic => "generic",
        };

        write!(f, "{name}")
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Model,
    Scheduling,
    Parameter,
    Worker,
}

/// One level of execution context, appended as an error unwinds out of
/// nested aggregates: which component was running and at which
/// iteration step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub component: String,
    pub step: usize,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[{}]", self.component, self.step)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    /// name of the offending component, when one is known
    pub source_component: Option<String>,
    pub details: Option<String>,
    /// innermost frame first
    pub frames: Vec<Frame>,
}

impl Error {
    pub fn new(kind: ErrorKind, code: ErrorCode, details: Option<String>) -> Self {
        Error {
            kind,
            code,
            source_component: None,
            details,
            frames: Vec::new(),
        }
    }

    pub fn for_component(
        kind: ErrorKind,
        code: ErrorCode,
        component: &str,
        details: Option<String>,
    ) -> Self {
        Error {
            kind,
            code,
            source_component: Some(component.to_owned()),
            details,
            frames: Vec::new(),
        }
    }

    /// Append a context frame; called by each scheduler level as the
    /// error propagates upward.
    pub fn with_frame(mut self, component: &str, step: usize) -> Self {
        self.frames.push(Frame {
            component: component.to_owned(),
            step,
        });
        self
    }

    pub fn get_details(&self) -> Option<String> {
        self.details.clone()
    }

    /// The full component path of the failure, innermost first.
    pub fn stack_info(&self) -> String {
        self.frames
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(" <- ")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Model => "ModelError",
            ErrorKind::Scheduling => "SchedulingError",
            ErrorKind::Parameter => "ParameterError",
            ErrorKind::Worker => "WorkerError",
        };
        match (&self.source_component, &self.details) {
            (Some(src), Some(details)) => {
                write!(f, "{}{{{}: {} in '{}'}}", kind, self.code, details, src)?
            }
            (Some(src), None) => write!(f, "{}{{{} in '{}'}}", kind, self.code, src)?,
            (None, Some(details)) => write!(f, "{}{{{}: {}}}", kind, self.code, details)?,
            (None, None) => write!(f, "{}{{{}}}", kind, self.code)?,
        }
        if !self.frames.is_empty() {
            write!(f, " at {}", self.stack_info())?;
        }
        Ok(())
    }
}

impl error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;

/// An error inside a single expression string, located by byte span.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EquationError {
    pub start: u16,
    pub end: u16,
    pub code: ErrorCode,
}

impl fmt::Display for EquationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.start, self.end, self.code)
    }
}

impl From<EquationError> for Error {
    fn from(err: EquationError) -> Self {
        Error::new(
            ErrorKind::Parameter,
            err.code,
            Some(format!("at {}:{}", err.start, err.end)),
        )
    }
}

pub type EquationResult<T> = result::Result<T, EquationError>;

#[macro_export]
macro_rules! model_err(
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error::new(
            ErrorKind::Model,
            ErrorCode::$code,
            Some($str.to_string()),
        ))
    }}
);

#[macro_export]
macro_rules! sched_err {
    ($code:tt, $comp:expr, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error::for_component(
            ErrorKind::Scheduling,
            ErrorCode::$code,
            $comp,
            Some($str.to_string()),
        ))
    }};
    ($code:tt, $comp:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error::for_component(
            ErrorKind::Scheduling,
            ErrorCode::$code,
            $comp,
            None,
        ))
    }};
}

#[macro_export]
macro_rules! param_err(
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error::new(
            ErrorKind::Parameter,
            ErrorCode::$code,
            Some($str.to_string()),
        ))
    }}
);

/// Prefix marking a parameter-resolution failure carried by value
/// through the interpreter instead of unwinding (spec'd propagation
/// policy: the caller decides when a bad value becomes a fault).
pub const ERROR_PREFIX: &str = "ERROR:";

pub fn is_error_value(s: &str) -> bool {
    s.starts_with(ERROR_PREFIX)
}

pub fn error_value(detail: impl fmt::Display) -> String {
    format!("{ERROR_PREFIX} {detail}")
}
