//! # Handler abstraction and the application function map.
//!
//! This module defines the [`Handler`] trait (async, portal-driven) and a
//! function-backed implementation [`HandlerFn`]. The common handle type is
//! [`HandlerRef`], an `Arc<dyn Handler>` suitable for sharing across worker
//! loops.
//!
//! Schedules and tasks reference handlers by string name; the application
//! supplies an [`Application`] map from name to callable, and resolution
//! happens at load time. Unresolved names skip the entry (logged by the
//! engines).

use std::{borrow::Cow, collections::HashMap, future::Future, sync::Arc, sync::Mutex};

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::portal::Portal;

/// # Shared handle to a handler object.
pub type HandlerRef = Arc<dyn Handler>;

/// # Asynchronous unit of application work.
///
/// A handler receives the invocation [`Portal`] carrying trace identity,
/// cancellation and the carrier value. Implementations should check
/// `portal.cancellation()` at their own suspension points and exit promptly
/// when it fires; cancellation is cooperative.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use tickvisor::{Handler, HandlerError, Portal};
///
/// struct Demo;
///
/// #[async_trait]
/// impl Handler for Demo {
///     async fn call(&self, portal: Arc<Portal>) -> Result<(), HandlerError> {
///         if portal.cancellation().is_cancelled() {
///             return Err(HandlerError::Canceled);
///         }
///         // do work...
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Executes one invocation.
    async fn call(&self, portal: Arc<Portal>) -> Result<(), HandlerError>;
}

/// # Function-backed handler implementation.
///
/// [`HandlerFn`] wraps a closure `Fnc: FnMut(Arc<Portal>) -> Fut`. The closure
/// is protected by a [`Mutex`] so `call(&self, ...)` works even though the
/// closure is `FnMut`; the lock is held only while the future is created, not
/// while it runs, so concurrent invocations (an Overlapped schedule, a task
/// with several workers) do not serialize.
///
/// Use [`HandlerFn::arc`] for a one-liner that returns a [`HandlerRef`].
///
/// # Example
/// ```
/// use tickvisor::{HandlerFn, HandlerRef, HandlerError};
///
/// let h: HandlerRef = HandlerFn::arc("noop", |_portal| async { Ok::<_, HandlerError>(()) });
/// ```
pub struct HandlerFn<Fnc, Fut>
where
    Fnc: FnMut(Arc<Portal>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    /// Stable handler name, mostly useful in logs.
    name: Cow<'static, str>,
    /// Underlying function (guarded by a mutex to allow `FnMut` with `&self`).
    func: Mutex<Fnc>,
}

impl<Fnc, Fut> HandlerFn<Fnc, Fut>
where
    Fnc: FnMut(Arc<Portal>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    pub fn new(name: impl Into<Cow<'static, str>>, func: Fnc) -> Self {
        Self {
            name: name.into(),
            func: Mutex::new(func),
        }
    }

    /// Creates the handler and returns it as a shared handle.
    pub fn arc(name: impl Into<Cow<'static, str>>, func: Fnc) -> HandlerRef {
        Arc::new(Self::new(name, func))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<Fnc, Fut> Handler for HandlerFn<Fnc, Fut>
where
    Fnc: FnMut(Arc<Portal>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn call(&self, portal: Arc<Portal>) -> Result<(), HandlerError> {
        let fut = {
            let mut f = self.func.lock().map_err(|_| HandlerError::Fail {
                reason: "handler mutex poisoned".into(),
            })?;
            (f)(portal)
        };
        fut.await
    }
}

/// # Application-supplied function map.
///
/// Maps symbolic handler names to callables. Engines look names up at load
/// time; entries whose name does not resolve are skipped.
#[derive(Clone, Default)]
pub struct Application {
    func_map: HashMap<String, HandlerRef>,
}

impl Application {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under a symbolic name, replacing any previous one.
    pub fn register(mut self, name: impl Into<String>, handler: HandlerRef) -> Self {
        self.func_map.insert(name.into(), handler);
        self
    }

    /// Resolves a symbolic name to its callable.
    pub fn handler(&self, name: &str) -> Option<HandlerRef> {
        self.func_map.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.func_map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn handler_fn_is_callable_repeatedly() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let h = HandlerFn::arc("bump", move |_portal| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let portal = Portal::arc_for_test("demo");
        h.call(portal.clone()).await.unwrap();
        h.call(portal).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn application_resolves_registered_names() {
        let app = Application::new()
            .register("a", HandlerFn::arc("a", |_p| async { Ok(()) }));
        assert!(app.handler("a").is_some());
        assert!(app.handler("missing").is_none());
    }
}
