//! # Error types used by the tickvisor runtime and handlers.
//!
//! This module defines one enum per failure domain:
//!
//! - [`LoadError`] errors raised while loading configuration or registries.
//!   These are returned to the supervisor for fail-fast handling.
//! - [`KvError`] transient key/value transport failures. Worker loops absorb
//!   these, log them, and back off; they never propagate upward.
//! - [`StoreError`] persistent definition-store failures.
//! - [`QueueError`] task push/depth API failures.
//! - [`HandlerError`] failures of a single handler invocation, including
//!   captured panics.
//!
//! All types provide `as_label()` returning a short stable string for
//! logs/metrics.

use std::time::Duration;

use thiserror::Error;

/// # Errors raised while loading configuration or rebuilding a registry.
///
/// These surface from `load_config` / `load_schedule` / `load_task` / `start`
/// and are meant to fail fast at the supervisor.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LoadError {
    /// Configuration is structurally invalid (empty list, unknown instance
    /// name, missing required store handle for a referenced scope).
    #[error("invalid configuration: {reason}")]
    ConfigInvalid {
        /// Human-readable cause.
        reason: String,
    },

    /// A required backing resource could not be obtained.
    #[error("resource unavailable: {reason}")]
    ResourceUnavailable { reason: String },

    /// Two registrations share the same key within one engine.
    #[error("duplicate key '{key}'")]
    DuplicateKey { key: String },

    /// A run-once fixed schedule was registered with an anchor in the past.
    #[error("invalid schedule '{key}': anchor expired with zero interval")]
    InvalidSchedule { key: String },

    /// A persisted row carries a discipline code outside {1, 2, 3}.
    #[error("unknown schedule discipline code {code}")]
    UnknownDiscipline { code: i64 },

    /// Definition-store lookup failed during load or reload.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LoadError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            LoadError::ConfigInvalid { .. } => "load_config_invalid",
            LoadError::ResourceUnavailable { .. } => "load_resource_unavailable",
            LoadError::DuplicateKey { .. } => "load_duplicate_key",
            LoadError::InvalidSchedule { .. } => "load_invalid_schedule",
            LoadError::UnknownDiscipline { .. } => "load_unknown_discipline",
            LoadError::Store(_) => "load_store_failure",
        }
    }
}

/// # Transient key/value transport failure.
///
/// Policy: swallow at the worker boundary, log, back off 100 ms to 1 s, retry.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum KvError {
    /// The backend could not be reached or refused the operation.
    #[error("kv backend unavailable: {reason}")]
    Unavailable { reason: String },
}

impl KvError {
    pub fn as_label(&self) -> &'static str {
        match self {
            KvError::Unavailable { .. } => "kv_unavailable",
        }
    }
}

/// # Persistent definition-store failure.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("definition store unavailable: {reason}")]
    Unavailable { reason: String },

    /// A query or insert was rejected.
    #[error("definition store query failed: {reason}")]
    Query { reason: String },
}

impl StoreError {
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::Unavailable { .. } => "store_unavailable",
            StoreError::Query { .. } => "store_query_failed",
        }
    }
}

/// # Errors returned by the task push/depth APIs.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum QueueError {
    /// The key is not registered with the task engine.
    #[error("task '{key}' is not registered")]
    InvalidTask { key: String },

    /// The engine is draining or stopped; the payload was not accepted.
    #[error("task queue '{key}' is closed")]
    QueueClosed { key: String },

    /// The payload could not be serialized for transport.
    #[error("payload encode failed: {reason}")]
    Encode { reason: String },

    /// The external queue backend failed.
    #[error(transparent)]
    Backend(#[from] KvError),
}

impl QueueError {
    pub fn as_label(&self) -> &'static str {
        match self {
            QueueError::InvalidTask { .. } => "queue_invalid_task",
            QueueError::QueueClosed { .. } => "queue_closed",
            QueueError::Encode { .. } => "queue_encode_failed",
            QueueError::Backend(_) => "queue_backend_failure",
        }
    }
}

/// # Errors produced by a single handler invocation.
///
/// Worker loops log these and keep going; a non-ok return never suspends the
/// schedule or task that produced it.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler returned an application-level failure.
    #[error("execution failed: {reason}")]
    Fail { reason: String },

    /// The invocation exceeded its timeout context.
    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The invocation was canceled by shutdown or parent cancellation.
    ///
    /// This is **not an error** in the traditional sense, it signals
    /// intentional termination.
    #[error("context canceled")]
    Canceled,

    /// The handler panicked; the panic was caught inside the portal.
    #[error("handler panicked: {reason}")]
    Panic { reason: String },
}

impl HandlerError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            HandlerError::Fail { .. } => "handler_failed",
            HandlerError::Timeout { .. } => "handler_timeout",
            HandlerError::Canceled => "handler_canceled",
            HandlerError::Panic { .. } => "handler_panic",
        }
    }

    /// Indicates whether the failure came from a captured panic.
    pub fn is_panic(&self) -> bool {
        matches!(self, HandlerError::Panic { .. })
    }
}

impl From<tokio::time::error::Elapsed> for HandlerError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        HandlerError::Fail {
            reason: e.to_string(),
        }
    }
}
