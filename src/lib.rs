//! # tickvisor
//!
//! **Tickvisor** is a cluster-aware schedule and task-queue supervision
//! library.
//!
//! It runs periodic jobs ("schedules") and consumes asynchronous work items
//! ("tasks") reliably across N identical process instances, coordinating
//! through a shared key/value store. The crate is designed as the core of a
//! service framework: the HTTP router, the concrete Redis/SQL engines and the
//! process bootstrap stay outside, talking to it through narrow ports.
//!
//! ## Features
//!
//! | Area             | Description                                                             | Key types / traits                          |
//! |------------------|-------------------------------------------------------------------------|---------------------------------------------|
//! | **Schedules**    | Fixed (phase-aligned), Overlapped (tick-driven) and Serial disciplines. | [`ScheduleEngine`], [`ScheduleInfo`], [`Discipline`] |
//! | **Tasks**        | Bounded in-process queues and external global queues with worker pools. | [`TaskEngine`], [`TaskInfo`]                |
//! | **Coordination** | Distributed tokens: SET-NX-EX acquire, CAS release, status snapshots.   | [`TokenService`], [`Lease`], [`KvStore`]    |
//! | **Portals**      | Per-invocation context: trace id, cancellation, panic isolation.        | [`Portal`], [`TaskContent`], [`HttpExchange`] |
//! | **Supervision**  | Engine wiring, reload and shutdown signals, graceful drain.             | [`Service`]                                 |
//! | **Errors**       | Typed errors split by failure domain, stable labels for logs.           | [`LoadError`], [`HandlerError`], [`QueueError`] |
//! | **Logging**      | Process-wide subsystem registry with trace-bearing scoped loggers.      | [`log_selector`], [`ScopedLogger`], [`LogSink`] |
//!
//! ```no_run
//! use tickvisor::{
//!     Application, Discipline, HandlerError, HandlerFn, Scope, ScheduleInfo, Service,
//!     ServiceConfig,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut svc = Service::new("billing");
//!     svc.load_config(&ServiceConfig::default(), &Default::default(), &Default::default())?;
//!
//!     // Handlers are registered by name and resolved at load time.
//!     let app = Application::new().register(
//!         "collect",
//!         HandlerFn::arc("collect", |portal| async move {
//!             portal.logger("billing").info("collecting");
//!             Ok::<_, HandlerError>(())
//!         }),
//!     );
//!
//!     svc.load_schedules(
//!         vec![ScheduleInfo {
//!             key: "collect".into(),
//!             handler_name: "collect".into(),
//!             discipline: Discipline::Serial,
//!             timestamp: 0,
//!             interval: 60,
//!             scope: Scope::Native,
//!         }],
//!         app,
//!     )?;
//!
//!     svc.start().await?;
//!     svc.serve().await?;
//!     Ok(())
//! }
//! ```
//!
//! ---

mod clock;
mod config;
mod error;
mod handler;
mod kv;
mod logger;
mod portal;
mod schedule;
mod service;
mod store;
mod task;
mod token;

// ---- Public re-exports ----

pub use config::{ScheduleConfig, ServiceConfig, TaskConfig};
pub use error::{HandlerError, KvError, LoadError, QueueError, StoreError};
pub use handler::{Application, Handler, HandlerFn, HandlerRef};
pub use kv::{KvInstances, KvStore, MemoryKv};
pub use logger::{
    log_selector, registry as logger_registry, Level, LogSink, LoggerRegistry, MemorySink,
    ScopedLogger, StderrSink,
};
pub use portal::{
    wrap_http, wrap_schedule, wrap_task, Carrier, HttpAdapter, HttpExchange, Portal,
    ScheduleRoutine, TaskContent, TaskRoutine, HEADER_NEEDBREAK, HEADER_TRACER,
};
pub use schedule::{Discipline, Scope, ScheduleEngine, ScheduleInfo, ScheduleStatus};
pub use service::Service;
pub use store::{DefinitionStore, MemoryStore, ScheduleRow, StoreInstances, TaskRow};
pub use task::{TaskEngine, TaskInfo, TASK_KEY_PREFIX};
pub use token::{Lease, TokenService, MIN_TOKEN_TTL_SECS};
