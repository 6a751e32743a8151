//! # Task engine.
//!
//! Consumes asynchronous work items through per-task worker pools:
//!
//! - **Native** tasks own a bounded in-process FIFO. Workers poll with a
//!   non-blocking pop and a 100 ms idle sleep rather than a blocking receive,
//!   so every worker observes the drain flag within 100 ms without a separate
//!   wake-up channel.
//! - **Global** tasks pull from the external queue with a blocking pop
//!   (1-second server-side timeout) under `VASCTASK:<key>`, decoding each
//!   JSON payload into a [`TaskContent`].
//!
//! Delivery is at-least-once: a crashed worker loses nothing that was still
//! in the external queue, and nothing guarantees a popped item survives the
//! crash. Reload drains every worker, drops the previous generation's native
//! queues (queued items included), and rebuilds the registry from the staged
//! list.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio_util::task::TaskTracker;

use crate::config::TaskConfig;
use crate::error::{KvError, LoadError, QueueError};
use crate::handler::Application;
use crate::kv::{KvInstances, KvStore};
use crate::logger::log_selector;
use crate::portal::{wrap_task, TaskContent, TaskRoutine};
use crate::schedule::Scope;
use crate::store::{DefinitionStore, StoreInstances, TaskRow};

/// Key prefix for global task queues in the key/value store.
pub const TASK_KEY_PREFIX: &str = "VASCTASK:";

/// One task registration.
#[derive(Clone, Debug)]
pub struct TaskInfo {
    /// Unique queue identifier within the engine.
    pub key: String,
    /// Symbolic handler name, resolved through the application func map.
    pub handler_name: String,
    /// Capacity of the local channel (`Native` only).
    pub queue_size: usize,
    /// Number of concurrent workers for this task.
    pub handler_num: usize,
    pub scope: Scope,
}

enum TryPush {
    Accepted,
    Full(TaskContent),
    Closed,
}

/// Bounded in-process FIFO with idempotent close.
struct NativeQueue {
    cap: usize,
    state: Mutex<QueueState>,
}

struct QueueState {
    items: VecDeque<TaskContent>,
    closed: bool,
}

impl NativeQueue {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
        }
    }

    fn try_push(&self, item: TaskContent) -> TryPush {
        let mut state = self.state.lock().expect("queue poisoned");
        if state.closed {
            return TryPush::Closed;
        }
        if state.items.len() >= self.cap {
            return TryPush::Full(item);
        }
        state.items.push_back(item);
        TryPush::Accepted
    }

    fn try_pop(&self) -> Option<TaskContent> {
        self.state.lock().expect("queue poisoned").items.pop_front()
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("queue poisoned");
        state.closed = true;
        state.items.clear();
    }
}

struct TaskEntry {
    info: TaskInfo,
    routine: TaskRoutine,
    /// Present for `Native` scope only.
    queue: Option<Arc<NativeQueue>>,
}

struct Inner {
    project: RwLock<String>,
    enable_logger: AtomicBool,
    runnable: AtomicBool,
    need_reload: AtomicBool,
    kv: RwLock<Option<Arc<dyn KvStore>>>,
    store: RwLock<Option<Arc<dyn DefinitionStore>>>,
    staged: RwLock<(Vec<TaskInfo>, Application)>,
    registry: RwLock<HashMap<String, Arc<TaskEntry>>>,
    tracker: RwLock<TaskTracker>,
}

/// # The task engine.
///
/// Lifecycle mirrors the schedule engine: `load_config` -> `load_task` ->
/// `start`; `reload_task_list` rebuilds after a drain; `close` stops
/// everything. Producers use [`push_native`](Self::push_native) /
/// [`push_global`](Self::push_global).
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<Inner>,
}

impl Default for TaskEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskEngine {
    pub fn new() -> Self {
        let tracker = TaskTracker::new();
        tracker.close();
        Self {
            inner: Arc::new(Inner {
                project: RwLock::new(String::new()),
                enable_logger: AtomicBool::new(true),
                runnable: AtomicBool::new(true),
                need_reload: AtomicBool::new(false),
                kv: RwLock::new(None),
                store: RwLock::new(None),
                staged: RwLock::new((Vec::new(), Application::new())),
                registry: RwLock::new(HashMap::new()),
                tracker: RwLock::new(tracker),
            }),
        }
    }

    /// Records the queue and definition-store handles named by the
    /// configuration and marks the engine runnable.
    pub fn load_config(
        &self,
        cfg: &TaskConfig,
        kv_instances: &KvInstances,
        store_instances: &StoreInstances,
        project: &str,
    ) -> Result<(), LoadError> {
        *self.inner.project.write().expect("engine poisoned") = project.to_string();
        self.inner
            .enable_logger
            .store(cfg.enable_logger, Ordering::SeqCst);

        if !cfg.global_queue_kv.is_empty() {
            let kv = kv_instances.get(&cfg.global_queue_kv).ok_or_else(|| {
                LoadError::ConfigInvalid {
                    reason: format!(
                        "cannot get kv instance '{}' for global tasks",
                        cfg.global_queue_kv
                    ),
                }
            })?;
            *self.inner.kv.write().expect("engine poisoned") = Some(kv.clone());
        }
        if !cfg.load_task_db.is_empty() {
            let store = store_instances.get(&cfg.load_task_db).ok_or_else(|| {
                LoadError::ConfigInvalid {
                    reason: format!(
                        "cannot get definition store '{}' for tasks",
                        cfg.load_task_db
                    ),
                }
            })?;
            *self.inner.store.write().expect("engine poisoned") = Some(store.clone());
        }
        self.inner.runnable.store(true, Ordering::SeqCst);
        self.inner.need_reload.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stages the task list and the function map without starting workers.
    pub fn load_task(&self, list: Vec<TaskInfo>, app: Application) -> Result<(), LoadError> {
        if list.is_empty() && self.inner.store.read().expect("engine poisoned").is_none() {
            return Err(LoadError::ConfigInvalid {
                reason: "empty task list and no definition store configured".into(),
            });
        }
        if !list.is_empty() && app.is_empty() {
            return Err(LoadError::ConfigInvalid {
                reason: "task list supplied without any registered handlers".into(),
            });
        }
        *self.inner.staged.write().expect("engine poisoned") = (list, app);
        Ok(())
    }

    /// Builds the registry, spawns the worker pools, and leaves a supervisor
    /// loop behind that rebuilds after every drain.
    pub async fn start(&self) -> Result<(), LoadError> {
        let res = Inner::rebuild(self.inner.clone()).await;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while inner.runnable.load(Ordering::SeqCst) {
                let tracker = inner.tracker.read().expect("engine poisoned").clone();
                tracker.wait().await;
                if !inner.runnable.load(Ordering::SeqCst) {
                    break;
                }
                if inner.need_reload.swap(false, Ordering::SeqCst) {
                    if let Err(e) = Inner::rebuild(inner.clone()).await {
                        log_selector("_task").error(&format!("task reload failed: {e}"));
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
        res
    }

    /// Raises the drain flag; new registrations take effect once the current
    /// workers have drained. Items still queued in a native channel at that
    /// point are dropped.
    pub fn reload_task_list(&self) {
        self.inner.need_reload.store(true, Ordering::SeqCst);
    }

    /// Stops the engine and waits for every worker to drain.
    pub async fn close(&self) {
        self.inner.runnable.store(false, Ordering::SeqCst);
        let tracker = self.inner.tracker.read().expect("engine poisoned").clone();
        tracker.wait().await;
    }

    /// Enqueues a payload onto a `Native` task.
    ///
    /// Retries a non-blocking send with 100 ms backoff until the queue
    /// accepts it, or fails with [`QueueError::QueueClosed`] once the engine
    /// drains or stops.
    pub async fn push_native(&self, key: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        let entry = self
            .inner
            .registry
            .read()
            .expect("engine poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| QueueError::InvalidTask {
                key: key.to_string(),
            })?;
        let queue = entry.queue.clone().ok_or_else(|| QueueError::InvalidTask {
            key: key.to_string(),
        })?;

        let mut content = TaskContent::new(self.inner.project(), payload);
        loop {
            if !self.inner.is_running() {
                return Err(QueueError::QueueClosed {
                    key: key.to_string(),
                });
            }
            content = match queue.try_push(content) {
                TryPush::Accepted => return Ok(()),
                TryPush::Closed => {
                    return Err(QueueError::QueueClosed {
                        key: key.to_string(),
                    })
                }
                TryPush::Full(back) => back,
            };
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Enqueues a payload onto a `Global` task queue via the external store.
    pub async fn push_global(&self, key: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        let kv = self.inner.kv().ok_or(QueueError::Backend(KvError::Unavailable {
            reason: "no kv instance configured for global tasks".into(),
        }))?;
        let content = TaskContent::new(self.inner.project(), payload);
        let encoded = serde_json::to_vec(&content).map_err(|e| QueueError::Encode {
            reason: e.to_string(),
        })?;
        kv.rpush(&global_key(key), &encoded).await?;
        Ok(())
    }

    /// Depth of a `Global` task queue.
    pub async fn global_len(&self, key: &str) -> Result<usize, QueueError> {
        let kv = self.inner.kv().ok_or(QueueError::Backend(KvError::Unavailable {
            reason: "no kv instance configured for global tasks".into(),
        }))?;
        Ok(kv.llen(&global_key(key)).await?)
    }

    /// Inserts a task definition into the persistent store.
    pub async fn create_persistent_task(&self, row: &TaskRow) -> Result<(), LoadError> {
        let store = self.inner.store.read().expect("engine poisoned").clone();
        let store = store.ok_or_else(|| LoadError::ResourceUnavailable {
            reason: "no definition store configured for tasks".into(),
        })?;
        store.insert_task(row).await?;
        Ok(())
    }
}

impl Inner {
    fn is_running(&self) -> bool {
        self.runnable.load(Ordering::SeqCst) && !self.need_reload.load(Ordering::SeqCst)
    }

    fn kv(&self) -> Option<Arc<dyn KvStore>> {
        self.kv.read().expect("engine poisoned").clone()
    }

    fn project(&self) -> String {
        self.project.read().expect("engine poisoned").clone()
    }

    /// Rebuilds the registry and spawns a fresh worker generation. Must only
    /// run while the previous generation has drained.
    async fn rebuild(inner: Arc<Inner>) -> Result<(), LoadError> {
        let (list, app) = inner.staged.read().expect("engine poisoned").clone();
        let tracker = TaskTracker::new();
        *inner.tracker.write().expect("engine poisoned") = tracker.clone();

        let mut registry = HashMap::new();
        for info in list {
            inner.launch(&tracker, &mut registry, &app, info);
        }

        let store = inner.store.read().expect("engine poisoned").clone();
        let mut first_err = None;
        if let Some(store) = store {
            match store.find_tasks().await {
                Ok(rows) => {
                    for row in rows {
                        match info_from_row(&row) {
                            Ok(info) => inner.launch(&tracker, &mut registry, &app, info),
                            Err(e) => {
                                log_selector("_task").warn(&format!(
                                    "persisted task '{}' skipped: {e}",
                                    row.task_key
                                ));
                            }
                        }
                    }
                }
                Err(e) => {
                    first_err = Some(LoadError::Store(e));
                }
            }
        }

        *inner.registry.write().expect("engine poisoned") = registry;
        tracker.close();

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn launch(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        registry: &mut HashMap<String, Arc<TaskEntry>>,
        app: &Application,
        info: TaskInfo,
    ) {
        if registry.contains_key(&info.key) {
            log_selector("_task").info(&format!("task '{}' skipped: already registered", info.key));
            return;
        }
        let Some(handler) = app.handler(&info.handler_name) else {
            log_selector("_task").info(&format!(
                "task '{}' skipped: handler '{}' not resolved",
                info.key, info.handler_name
            ));
            return;
        };
        let queue = match info.scope {
            Scope::Native => Some(Arc::new(NativeQueue::new(info.queue_size))),
            Scope::Global => {
                if self.kv().is_none() {
                    log_selector("_task").info(&format!(
                        "task '{}' skipped: global scope without kv instance",
                        info.key
                    ));
                    return;
                }
                None
            }
        };

        let routine = wrap_task(
            &self.project(),
            self.enable_logger.load(Ordering::SeqCst),
            &info.key,
            handler,
        );
        let entry = Arc::new(TaskEntry {
            info,
            routine,
            queue,
        });
        registry.insert(entry.info.key.clone(), entry.clone());
        for _ in 0..entry.info.handler_num {
            let inner = self.clone();
            let entry = entry.clone();
            tracker.spawn(async move {
                Inner::worker(inner, entry).await;
            });
        }
    }

    async fn worker(inner: Arc<Inner>, entry: Arc<TaskEntry>) {
        match entry.info.scope {
            Scope::Native => {
                let Some(queue) = entry.queue.clone() else { return };
                while inner.is_running() {
                    match queue.try_pop() {
                        Some(content) => {
                            let _ = (entry.routine)(content).await;
                        }
                        None => tokio::time::sleep(Duration::from_millis(100)).await,
                    }
                }
                queue.close();
            }
            Scope::Global => {
                while inner.is_running() {
                    let Some(kv) = inner.kv() else { break };
                    match kv
                        .blpop(&global_key(&entry.info.key), Duration::from_secs(1))
                        .await
                    {
                        Ok(Some(raw)) => match serde_json::from_slice::<TaskContent>(&raw) {
                            Ok(content) => {
                                let _ = (entry.routine)(content).await;
                            }
                            Err(e) => {
                                // The malformed item is dropped; the queue
                                // itself stays healthy.
                                log_selector("_task").error(&format!(
                                    "{}: payload decode failed [{e}]",
                                    entry.info.key
                                ));
                            }
                        },
                        Ok(None) => {}
                        Err(e) => {
                            log_selector("_task")
                                .info(&format!("{}: pop failed [{e}]", entry.info.key));
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }
}

fn global_key(key: &str) -> String {
    format!("{TASK_KEY_PREFIX}{key}")
}

fn info_from_row(row: &TaskRow) -> Result<TaskInfo, LoadError> {
    let scope = Scope::from_code(row.task_scope).ok_or_else(|| LoadError::ConfigInvalid {
        reason: format!("unknown task scope code {}", row.task_scope),
    })?;
    Ok(TaskInfo {
        key: row.task_key.clone(),
        handler_name: row.task_func_name.clone(),
        queue_size: row.task_queue_size.max(0) as usize,
        handler_num: row.task_handler_num.max(0) as usize,
        scope,
    })
}
