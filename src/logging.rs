// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        };
        write!(f, "{name}")
    }
}

/// Where the engine sends its log lines. The engine stamps each message
/// with wall-clock epoch seconds; rendering (including the
/// `engine:timeFormat` setting) is the sink's business.
pub trait LogSink: Send + Sync {
    fn log_message(&self, timestamp: u64, level: Level, text: &str);
}

/// Default sink: forward to the `log` crate facade so hosts pick the
/// backend (env_logger in tests, anything else in an application).
#[derive(Default)]
pub struct FacadeSink;

impl LogSink for FacadeSink {
    fn log_message(&self, _timestamp: u64, level: Level, text: &str) {
        match level {
            Level::Trace => log::trace!("{text}"),
            Level::Debug => log::debug!("{text}"),
            Level::Info => log::info!("{text}"),
            Level::Warn => log::warn!("{text}"),
            Level::Error | Level::Fatal => log::error!("{text}"),
        }
    }
}

/// PROV-style provenance event kinds. The engine raises these at
/// pipeline link-start and leaf update start/end and never looks at
/// what the sink does with them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProvKind {
    Agent,
    Entity,
    Activity,
    Association,
    Delegation,
    Start,
    End,
}

pub trait ProvenanceSink: Send + Sync {
    fn log_event(&self, kind: ProvKind, args: &[&str], attributes: &[(&str, &str)]);
}

pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Collects log lines for assertions.
    #[derive(Default)]
    pub struct MemorySink {
        pub lines: Mutex<Vec<(Level, String)>>,
    }

    impl LogSink for MemorySink {
        fn log_message(&self, _timestamp: u64, level: Level, text: &str) {
            self.lines.lock().unwrap().push((level, text.to_owned()));
        }
    }

    impl MemorySink {
        pub fn contains(&self, level: Level, needle: &str) -> bool {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .any(|(l, t)| *l == level && t.contains(needle))
        }
    }
}
