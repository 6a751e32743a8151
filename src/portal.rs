//! # Per-invocation execution portal.
//!
//! Every handler invocation, whether it came from an HTTP route, a schedule
//! tick or a task queue, runs inside a [`Portal`]: a context carrying a 64-bit
//! trace id, a cancellation token, the carrier value (request exchange, task
//! payload, or nothing) and a memoized map of trace-bearing loggers.
//!
//! # High-level architecture
//!
//! ```text
//!   wrap_http / wrap_schedule / wrap_task
//!                  │
//!                  ▼
//!        ┌──────────────────┐
//!        │      Portal      │  trace id, CancellationToken, carrier
//!        └────────┬─────────┘
//!             handler.call()
//!                  ▼
//!        catch_unwind ──► duration + result logging ──► Portal::close()
//! ```
//!
//! Guarantees:
//! - loggers are lazily allocated per subsystem and released at close;
//! - a panic in the payload never escapes the wrapper: it is logged with the
//!   trace id and converted into [`HandlerError::Panic`];
//! - the cancellation token fires at close (and on HTTP timeout expiry), but
//!   termination stays cooperative.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::error::HandlerError;
use crate::handler::HandlerRef;
use crate::logger::ScopedLogger;

/// Header carrying the 16-hex trace id across service hops.
pub const HEADER_TRACER: &str = "X-Vasc-Request-Tracer";
/// Header short-circuiting the wrapped handler when set to `"true"`.
pub const HEADER_NEEDBREAK: &str = "X-Vasc-Request-Needbreak";

pub(crate) const SUBSYS_HTTP: &str = "_gin";
pub(crate) const SUBSYS_SCHEDULE: &str = "_schedule";
pub(crate) const SUBSYS_TASK: &str = "_task";

/// Work item transported through a task queue.
///
/// When a task travels through the external queue it is serialized to JSON as
/// `{"project_name":"...","create_time":<ns>,"content":"<base64>"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContent {
    pub project_name: String,
    /// Creation instant in epoch nanoseconds on the pushing node.
    pub create_time: i64,
    #[serde(with = "content_b64")]
    pub content: Vec<u8>,
}

impl TaskContent {
    pub fn new(project_name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            project_name: project_name.into(),
            create_time: clock::unix_nanos(),
            content,
        }
    }
}

mod content_b64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Header view of an HTTP request/response pair.
///
/// The router out of scope builds one from the incoming request, passes it
/// through the adapter returned by [`wrap_http`], and copies mutated headers
/// back out. Header names are case-insensitive.
#[derive(Clone, Debug, Default)]
pub struct HttpExchange {
    headers: HashMap<String, String>,
}

impl HttpExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Value carried into the invocation.
pub enum Carrier {
    /// Schedule invocations carry nothing.
    None,
    /// Task invocations carry the dequeued payload.
    Task(TaskContent),
    /// HTTP invocations carry the request exchange.
    Http(Mutex<Option<HttpExchange>>),
}

/// # Per-invocation context.
///
/// Created by one of the wrapper factories, destroyed on return. Handlers
/// receive it as `Arc<Portal>`.
pub struct Portal {
    project: String,
    trace_id: AtomicU64,
    cancel: CancellationToken,
    carrier: Carrier,
    loggers: Mutex<HashMap<String, ScopedLogger>>,
}

impl Portal {
    pub fn new(project: impl Into<String>, carrier: Carrier) -> Self {
        Self {
            project: project.into(),
            trace_id: AtomicU64::new(rand::random::<u64>()),
            cancel: CancellationToken::new(),
            carrier,
            loggers: Mutex::new(HashMap::new()),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn trace_id(&self) -> u64 {
        self.trace_id.load(Ordering::Relaxed)
    }

    /// Adopts an externally supplied trace id. Loggers handed out afterwards
    /// carry the new id.
    pub fn set_trace_id(&self, tid: u64) {
        self.trace_id.store(tid, Ordering::Relaxed);
        self.loggers.lock().expect("portal poisoned").clear();
    }

    /// The invocation's cancellation token. Fires at close, and on timeout
    /// expiry for HTTP invocations.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The task payload, for task invocations.
    pub fn task_content(&self) -> Result<&TaskContent, HandlerError> {
        match &self.carrier {
            Carrier::Task(content) => Ok(content),
            _ => Err(HandlerError::Fail {
                reason: "invalid task".into(),
            }),
        }
    }

    /// Runs `f` against the HTTP exchange, for HTTP invocations.
    ///
    /// The slot lock is never held while `f` runs; a closure that panics
    /// unwinds with the exchange instead of poisoning the slot, and the
    /// wrapper then falls back to a default exchange.
    pub fn with_http<R>(&self, f: impl FnOnce(&mut HttpExchange) -> R) -> Option<R> {
        let Carrier::Http(slot) = &self.carrier else {
            return None;
        };
        let mut exchange = slot.lock().expect("portal poisoned").take()?;
        let out = f(&mut exchange);
        *slot.lock().expect("portal poisoned") = Some(exchange);
        Some(out)
    }

    /// Marks the request so downstream wrapped handlers short-circuit.
    pub fn break_request(&self) {
        let _ = self.with_http(|ex| ex.set_header(HEADER_NEEDBREAK, "true"));
    }

    fn take_http(&self) -> Option<HttpExchange> {
        match &self.carrier {
            Carrier::Http(slot) => slot.lock().expect("portal poisoned").take(),
            _ => None,
        }
    }

    /// Returns a logger for `subsystem` carrying this portal's trace id.
    /// Loggers are memoized per subsystem and released at close.
    pub fn logger(&self, subsystem: &str) -> ScopedLogger {
        let tid = self.trace_id();
        let mut map = self.loggers.lock().expect("portal poisoned");
        if let Some(existing) = map.get(subsystem) {
            if existing.tid() == tid {
                return existing.clone();
            }
        }
        let fresh = crate::logger::registry().scoped(subsystem, tid);
        map.insert(subsystem.to_string(), fresh.clone());
        fresh
    }

    /// Cancels the context and releases every logger this portal handed out.
    pub fn close(&self) {
        self.cancel.cancel();
        self.loggers.lock().expect("portal poisoned").clear();
    }

    #[cfg(test)]
    pub(crate) fn arc_for_test(project: &str) -> Arc<Self> {
        Arc::new(Self::new(project, Carrier::None))
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wrapped schedule invocation: build portal, run, log, tear down.
pub type ScheduleRoutine =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Wrapped task invocation, fed one dequeued payload.
pub type TaskRoutine =
    Arc<dyn Fn(TaskContent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Wrapped HTTP invocation; the router passes the exchange through.
pub type HttpAdapter = Arc<dyn Fn(HttpExchange) -> BoxFuture<'static, HttpExchange> + Send + Sync>;

/// Runs one handler invocation with panic containment.
async fn run_guarded(
    portal: Arc<Portal>,
    handler: HandlerRef,
    subsystem: &'static str,
) -> Result<(), HandlerError> {
    match AssertUnwindSafe(handler.call(portal.clone())).catch_unwind().await {
        Ok(res) => res,
        Err(payload) => {
            let reason = panic_reason(payload);
            portal
                .logger(subsystem)
                .error(&format!("panic: {reason}"));
            Err(HandlerError::Panic { reason })
        }
    }
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Wraps a handler as a schedule routine.
///
/// Each call creates a fresh portal with a random trace id, runs the handler
/// with panics contained, and, when `log_enabled`, emits one line under
/// `_schedule` with the key, the wall duration in ms and the result.
pub fn wrap_schedule(
    project: &str,
    log_enabled: bool,
    schedule_key: &str,
    handler: HandlerRef,
) -> ScheduleRoutine {
    let project = project.to_string();
    let key = schedule_key.to_string();
    Arc::new(move || {
        let project = project.clone();
        let key = key.clone();
        let handler = handler.clone();
        async move {
            let portal = Arc::new(Portal::new(project, Carrier::None));
            let started = Instant::now();
            let res = run_guarded(portal.clone(), handler, SUBSYS_SCHEDULE).await;
            let cost = started.elapsed().as_millis();
            if log_enabled {
                let lg = portal.logger(SUBSYS_SCHEDULE);
                match &res {
                    Ok(()) => lg.info(&format!("{key}: cost[{cost} ms], result[ok]")),
                    Err(e) => lg.error(&format!("{key}: cost[{cost} ms], result[{e}]")),
                }
            }
            portal.close();
            res
        }
        .boxed()
    })
}

/// Wraps a handler as a task routine. The payload is installed as the
/// portal's carrier and reachable via [`Portal::task_content`].
pub fn wrap_task(
    project: &str,
    log_enabled: bool,
    task_key: &str,
    handler: HandlerRef,
) -> TaskRoutine {
    let project = project.to_string();
    let key = task_key.to_string();
    Arc::new(move |content: TaskContent| {
        let project = project.clone();
        let key = key.clone();
        let handler = handler.clone();
        async move {
            let portal = Arc::new(Portal::new(project, Carrier::Task(content)));
            let started = Instant::now();
            let res = run_guarded(portal.clone(), handler, SUBSYS_TASK).await;
            let cost = started.elapsed().as_millis();
            if log_enabled {
                let lg = portal.logger(SUBSYS_TASK);
                match &res {
                    Ok(()) => lg.info(&format!("{key}: cost[{cost} ms], result[ok]")),
                    Err(e) => lg.error(&format!("{key}: cost[{cost} ms], result[{e}]")),
                }
            }
            portal.close();
            res
        }
        .boxed()
    })
}

/// Wraps a handler as an HTTP adapter.
///
/// On entry: adopt the `X-Vasc-Request-Tracer` header as the trace id when it
/// parses as 16-hex, otherwise generate one and write it back so downstream
/// peers can propagate it. A `X-Vasc-Request-Needbreak: true` header placed by
/// an upstream middleware short-circuits the payload entirely.
///
/// A positive `timeout_secs` arms a watchdog that cancels the portal's token
/// at expiry; the handler is expected to observe it. Termination stays
/// cooperative.
pub fn wrap_http(
    project: &str,
    handler_name: &str,
    handler: HandlerRef,
    timeout_secs: i64,
) -> HttpAdapter {
    let project = project.to_string();
    let name = handler_name.to_string();
    Arc::new(move |exchange: HttpExchange| {
        let project = project.clone();
        let name = name.clone();
        let handler = handler.clone();
        async move {
            let needbreak = exchange
                .header(HEADER_NEEDBREAK)
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));
            if needbreak {
                return exchange;
            }

            let adopted = exchange.header(HEADER_TRACER).and_then(parse_trace_id);
            let portal = Arc::new(Portal::new(
                project,
                Carrier::Http(Mutex::new(Some(exchange))),
            ));
            match adopted {
                Some(tid) => portal.set_trace_id(tid),
                None => {
                    let tid = portal.trace_id();
                    let _ =
                        portal.with_http(|ex| ex.set_header(HEADER_TRACER, format!("{tid:016x}")));
                }
            }

            let watchdog = if timeout_secs > 0 {
                let token = portal.cancellation();
                Some(tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(timeout_secs as u64)) => {
                            token.cancel();
                        }
                        _ = token.cancelled() => {}
                    }
                }))
            } else {
                None
            };

            let res = run_guarded(portal.clone(), handler, SUBSYS_HTTP).await;
            if let Err(e) = &res {
                if !e.is_panic() {
                    portal
                        .logger(SUBSYS_HTTP)
                        .error(&format!("{name}: result[{e}]"));
                }
            }

            let exchange = portal.take_http().unwrap_or_default();
            portal.close();
            if let Some(wd) = watchdog {
                let _ = wd.await;
            }
            exchange
        }
        .boxed()
    })
}

fn parse_trace_id(raw: &str) -> Option<u64> {
    if raw.len() != 16 {
        return None;
    }
    u64::from_str_radix(raw, 16).ok()
}
