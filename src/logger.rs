//! # Process-wide logger registry and scoped, trace-bearing loggers.
//!
//! The registry maps a subsystem name to a logger with its own level
//! threshold. It is process-wide by design: the trace id is a property of the
//! [`Portal`](crate::portal::Portal) that borrows a logger, not of the thread
//! writing the line.
//!
//! - [`log_selector`] returns a logger for infra code outside any portal
//!   (trace id zero).
//! - Portals call [`LoggerRegistry::scoped`] to get copies carrying their own
//!   trace id; those copies are released when the portal closes.
//!
//! Output format: `[<level>] tid[<16-hex trace-id>] <message>`, handed to the
//! installed [`LogSink`] together with the syslog-style tag
//! `<project>/<subsystem>`. Sinks that forward to syslog should use facility
//! LOCAL6; the default sink writes to stderr.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use dashmap::DashMap;

/// Log severity. The numeric values form the per-logger threshold scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warning",
            Level::Error => "error",
        }
    }
}

/// Destination for formatted log lines.
///
/// `tag` is `<project>/<subsystem>`; `line` is already formatted as
/// `[<level>] tid[<16-hex>] <message>`. Syslog-backed sinks belong to the
/// outer shell and should open facility LOCAL6 with the given tag.
pub trait LogSink: Send + Sync {
    fn write(&self, tag: &str, level: Level, line: &str);
}

/// Default sink: one line per record on stderr.
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write(&self, tag: &str, _level: Level, line: &str) {
        eprintln!("{tag}: {line}");
    }
}

/// Capturing sink for tests and embedding.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every captured `"<tag>: <line>"` record.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("sink poisoned").clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn write(&self, tag: &str, _level: Level, line: &str) {
        self.lines
            .lock()
            .expect("sink poisoned")
            .push(format!("{tag}: {line}"));
    }
}

struct SubsystemLogger {
    name: String,
    threshold: AtomicU8,
}

/// Process-wide map from subsystem name to logger state.
pub struct LoggerRegistry {
    project: RwLock<String>,
    sink: RwLock<Arc<dyn LogSink>>,
    loggers: DashMap<String, Arc<SubsystemLogger>>,
}

static GLOBAL: OnceLock<LoggerRegistry> = OnceLock::new();

/// The process-wide registry, eagerly initialized on first use.
pub fn registry() -> &'static LoggerRegistry {
    GLOBAL.get_or_init(|| LoggerRegistry {
        project: RwLock::new("tickvisor".to_string()),
        sink: RwLock::new(Arc::new(StderrSink)),
        loggers: DashMap::new(),
    })
}

/// Returns a logger for the given subsystem with trace id zero.
pub fn log_selector(subsystem: &str) -> ScopedLogger {
    registry().scoped(subsystem, 0)
}

impl LoggerRegistry {
    /// Sets the project name used in every tag.
    pub fn set_project(&self, name: &str) {
        *self.project.write().expect("registry poisoned") = name.to_string();
    }

    /// Replaces the sink every logger writes through.
    pub fn set_sink(&self, sink: Arc<dyn LogSink>) {
        *self.sink.write().expect("registry poisoned") = sink;
    }

    /// Sets the level threshold for one subsystem.
    pub fn set_level(&self, subsystem: &str, level: Level) {
        self.shared(subsystem)
            .threshold
            .store(level as u8, Ordering::Relaxed);
    }

    /// Returns a logger for `subsystem` carrying `tid` on every line.
    pub fn scoped(&self, subsystem: &str, tid: u64) -> ScopedLogger {
        ScopedLogger {
            shared: self.shared(subsystem),
            tid,
        }
    }

    fn shared(&self, subsystem: &str) -> Arc<SubsystemLogger> {
        self.loggers
            .entry(subsystem.to_string())
            .or_insert_with(|| {
                Arc::new(SubsystemLogger {
                    name: subsystem.to_string(),
                    threshold: AtomicU8::new(Level::Debug as u8),
                })
            })
            .clone()
    }

    fn emit(&self, shared: &SubsystemLogger, tid: u64, level: Level, msg: &str) {
        if shared.threshold.load(Ordering::Relaxed) > level as u8 {
            return;
        }
        let tag = {
            let project = self.project.read().expect("registry poisoned");
            format!("{}/{}", project, shared.name)
        };
        let line = format!("[{}] tid[{:016x}] {}", level.as_str(), tid, msg);
        let sink = self.sink.read().expect("registry poisoned").clone();
        sink.write(&tag, level, &line);
    }
}

/// A logger handle bound to one subsystem and one trace id.
///
/// Cheap to clone; the subsystem state stays in the registry.
#[derive(Clone)]
pub struct ScopedLogger {
    shared: Arc<SubsystemLogger>,
    tid: u64,
}

impl ScopedLogger {
    pub fn log(&self, level: Level, msg: &str) {
        registry().emit(&self.shared, self.tid, level, msg);
    }

    pub fn debug(&self, msg: &str) {
        self.log(Level::Debug, msg);
    }

    pub fn info(&self, msg: &str) {
        self.log(Level::Info, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.log(Level::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.log(Level::Error, msg);
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format_pads_trace_id() {
        let sink = testing::capture();
        registry().scoped("fmt_check", 0xdead_beef).info("hello fmt");
        assert!(sink.contains("[info] tid[00000000deadbeef] hello fmt"));
    }

    #[test]
    fn threshold_filters_lower_levels() {
        let sink = testing::capture();
        registry().set_level("muted_subsystem", Level::Error);
        let lg = log_selector("muted_subsystem");
        lg.info("should not appear 81f2");
        lg.error("should appear 81f2");
        assert!(!sink.contains("should not appear 81f2"));
        assert!(sink.contains("[error] tid[0000000000000000] should appear 81f2"));
        registry().set_level("muted_subsystem", Level::Debug);
    }

    #[test]
    fn selector_uses_zero_tid_and_project_tag() {
        let sink = testing::capture();
        log_selector("tag_check").info("tagged line 4c1a");
        let lines = sink.lines();
        let line = lines.iter().find(|l| l.contains("tagged line 4c1a")).unwrap();
        assert!(line.contains("/tag_check: "), "line={line}");
        assert!(line.contains("tid[0000000000000000]"));
    }
}
