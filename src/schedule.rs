//! # Schedule engine.
//!
//! Runs named schedules under three timing disciplines:
//!
//! - **Overlapped**: a single 1 Hz ticker; every tick spawns an independent
//!   worker per schedule that checks eligibility and fires. Invocations of the
//!   same key overlap when the handler outlives the interval.
//! - **Serial**: one long-lived worker per schedule, invoking back-to-back
//!   with `smart_sleep(interval)` between runs.
//! - **Fixed**: one long-lived worker per schedule, phase-aligned to
//!   `timestamp + k * interval`; a zero interval means run-once.
//!
//! Scope decides coordination: `Native` runs on every node independently,
//! `Global` elects one winner per window through the distributed token
//! service and persists a status snapshot for cross-node deduplication.
//!
//! Reload never drops in-flight work: `reload_schedule` raises a drain flag,
//! every worker observes it within a second and exits after finishing its
//! current invocation, then the supervisor loop rebuilds the registry and
//! spawns a fresh generation of workers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::clock;
use crate::config::ScheduleConfig;
use crate::error::LoadError;
use crate::handler::Application;
use crate::kv::KvInstances;
use crate::logger::log_selector;
use crate::portal::{wrap_schedule, ScheduleRoutine};
use crate::store::{DefinitionStore, ScheduleRow, StoreInstances};
use crate::token::TokenService;

/// Timing discipline of a schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discipline {
    /// Phase-aligned to an epoch anchor; zero interval means run-once.
    Fixed,
    /// Tick-driven, fire-and-forget; invocations may overlap.
    Overlapped,
    /// Strictly back-to-back on one worker.
    Serial,
}

impl Discipline {
    pub fn code(self) -> i64 {
        match self {
            Discipline::Fixed => 1,
            Discipline::Overlapped => 2,
            Discipline::Serial => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Discipline::Fixed),
            2 => Some(Discipline::Overlapped),
            3 => Some(Discipline::Serial),
            _ => None,
        }
    }
}

/// Execution scope of a schedule or task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Independent per-process execution, no cross-node coordination.
    Native,
    /// Cluster-wide mutual exclusion through the token service.
    Global,
}

impl Scope {
    pub fn code(self) -> i64 {
        match self {
            Scope::Native => 1,
            Scope::Global => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Scope::Native),
            3 => Some(Scope::Global),
            _ => None,
        }
    }
}

/// One schedule registration.
#[derive(Clone, Debug)]
pub struct ScheduleInfo {
    /// Unique identifier within the engine.
    pub key: String,
    /// Symbolic handler name, resolved through the application func map.
    pub handler_name: String,
    pub discipline: Discipline,
    /// Epoch anchor, used only by `Fixed`.
    pub timestamp: i64,
    /// Period in seconds; zero means run-once (`Fixed` only).
    pub interval: i64,
    pub scope: Scope,
}

/// Persisted status snapshot of a `Global` schedule.
///
/// Stored as JSON under `<prefix>info:<key>` with a TTL of one interval
/// (floored at 10 s for run-once schedules).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleStatus {
    #[serde(rename = "schedule_key")]
    pub key: String,
    #[serde(rename = "handler")]
    pub handler_name: String,
    #[serde(rename = "type")]
    pub discipline: i64,
    pub timestamp: i64,
    pub interval: i64,
    pub scope: i64,
    pub last_run_time: i64,
}

impl ScheduleStatus {
    fn from_info(info: &ScheduleInfo) -> Self {
        Self {
            key: info.key.clone(),
            handler_name: info.handler_name.clone(),
            discipline: info.discipline.code(),
            timestamp: info.timestamp,
            interval: info.interval,
            scope: info.scope.code(),
            last_run_time: 0,
        }
    }
}

struct CycleEntry {
    info: ScheduleInfo,
    routine: ScheduleRoutine,
    last_run_time: AtomicI64,
}

struct Inner {
    project: RwLock<String>,
    enable_logger: AtomicBool,
    runnable: AtomicBool,
    need_reload: AtomicBool,
    token: RwLock<Option<Arc<TokenService>>>,
    store: RwLock<Option<Arc<dyn DefinitionStore>>>,
    staged: RwLock<(Vec<ScheduleInfo>, Application)>,
    cycle: RwLock<HashMap<String, Arc<CycleEntry>>>,
    tracker: RwLock<TaskTracker>,
}

/// # The schedule engine.
///
/// Lifecycle: `load_config` -> `load_schedule` -> `start`; then
/// `reload_schedule` any number of times; `close` to drain and stop.
#[derive(Clone)]
pub struct ScheduleEngine {
    inner: Arc<Inner>,
}

impl Default for ScheduleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleEngine {
    pub fn new() -> Self {
        let tracker = TaskTracker::new();
        tracker.close();
        Self {
            inner: Arc::new(Inner {
                project: RwLock::new(String::new()),
                enable_logger: AtomicBool::new(true),
                runnable: AtomicBool::new(true),
                need_reload: AtomicBool::new(false),
                token: RwLock::new(None),
                store: RwLock::new(None),
                staged: RwLock::new((Vec::new(), Application::new())),
                cycle: RwLock::new(HashMap::new()),
                tracker: RwLock::new(tracker),
            }),
        }
    }

    /// Records the token-service and definition-store handles named by the
    /// configuration and marks the engine runnable.
    pub fn load_config(
        &self,
        cfg: &ScheduleConfig,
        kv_instances: &KvInstances,
        store_instances: &StoreInstances,
        project: &str,
    ) -> Result<(), LoadError> {
        *self.inner.project.write().expect("engine poisoned") = project.to_string();
        self.inner
            .enable_logger
            .store(cfg.enable_logger, Ordering::SeqCst);

        if !cfg.global_lock_kv.is_empty() {
            let kv = kv_instances.get(&cfg.global_lock_kv).ok_or_else(|| {
                LoadError::ConfigInvalid {
                    reason: format!(
                        "cannot get kv instance '{}' for global lock",
                        cfg.global_lock_kv
                    ),
                }
            })?;
            let prefix = format!("VASC:{project}:SCHEDULE:");
            *self.inner.token.write().expect("engine poisoned") =
                Some(Arc::new(TokenService::new(kv.clone(), prefix)));
        }
        if !cfg.load_schedule_db.is_empty() {
            let store = store_instances.get(&cfg.load_schedule_db).ok_or_else(|| {
                LoadError::ConfigInvalid {
                    reason: format!(
                        "cannot get definition store '{}' for schedules",
                        cfg.load_schedule_db
                    ),
                }
            })?;
            *self.inner.store.write().expect("engine poisoned") = Some(store.clone());
        }
        self.inner.runnable.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stages the schedule list and the function map. Workers do not start
    /// until [`start`](Self::start); a later reload picks up whatever was
    /// staged most recently.
    pub fn load_schedule(
        &self,
        list: Vec<ScheduleInfo>,
        app: Application,
    ) -> Result<(), LoadError> {
        if list.is_empty() && self.inner.store.read().expect("engine poisoned").is_none() {
            return Err(LoadError::ConfigInvalid {
                reason: "empty schedule list and no definition store configured".into(),
            });
        }
        if !list.is_empty() && app.is_empty() {
            return Err(LoadError::ConfigInvalid {
                reason: "schedule list supplied without any registered handlers".into(),
            });
        }
        *self.inner.staged.write().expect("engine poisoned") = (list, app);
        self.inner.need_reload.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Builds the registry from the staged list (plus persisted rows), spawns
    /// the workers, then leaves a supervisor loop behind that rebuilds after
    /// every drain caused by [`reload_schedule`](Self::reload_schedule).
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
                        log_selector("_schedule")
                            .error(&format!("schedule reload failed: {e}"));
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
        res
    }

    /// Raises the drain flag. Worker loops observe it within one second and
    /// exit after their in-flight invocation; the supervisor then rebuilds
    /// from the staged list. This is not a hard cancel.
    pub fn reload_schedule(&self) {
        self.inner.need_reload.store(true, Ordering::SeqCst);
    }

    /// Stops the engine and waits for every worker to drain.
    pub async fn close(&self) {
        self.inner.runnable.store(false, Ordering::SeqCst);
        let tracker = self.inner.tracker.read().expect("engine poisoned").clone();
        tracker.wait().await;
    }

    /// Inserts a schedule definition into the persistent store.
    pub async fn create_persistent_schedule(&self, row: &ScheduleRow) -> Result<(), LoadError> {
        let store = self.inner.store.read().expect("engine poisoned").clone();
        let store = store.ok_or_else(|| LoadError::ResourceUnavailable {
            reason: "no definition store configured for schedules".into(),
        })?;
        store.insert_schedule(row).await?;
        Ok(())
    }
}

impl Inner {
    fn is_running(&self) -> bool {
        self.runnable.load(Ordering::SeqCst) && !self.need_reload.load(Ordering::SeqCst)
    }

    fn token(&self) -> Option<Arc<TokenService>> {
        self.token.read().expect("engine poisoned").clone()
    }

    fn project(&self) -> String {
        self.project.read().expect("engine poisoned").clone()
    }

    /// Sleeps `secs` seconds, waking every second to poll the drain flags.
    /// Returns false when interrupted by shutdown or reload.
    async fn smart_sleep(&self, secs: i64) -> bool {
        if secs < 0 {
            return true;
        }
        let target = clock::unix_now() + secs;
        while clock::unix_now() < target {
            if !self.runnable.load(Ordering::SeqCst) || self.need_reload.load(Ordering::SeqCst) {
                return false;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        true
    }

    /// Rebuilds the registry and spawns a fresh worker generation. Must only
    /// run while the previous generation has drained.
    async fn rebuild(inner: Arc<Inner>) -> Result<(), LoadError> {
        let (list, app) = inner.staged.read().expect("engine poisoned").clone();
        let tracker = TaskTracker::new();
        *inner.tracker.write().expect("engine poisoned") = tracker.clone();

        let mut cycle = HashMap::new();
        let mut seen = HashSet::new();
        let mut first_err = None;

        for info in list {
            if let Err(e) = inner.register(&tracker, &mut cycle, &mut seen, &app, info) {
                first_err.get_or_insert(e);
            }
        }

        let store = inner.store.read().expect("engine poisoned").clone();
        if let Some(store) = store {
            match store.find_schedules().await {
                Ok(rows) => {
                    for row in rows {
                        match info_from_row(&row) {
                            Ok(info) => {
                                // Persisted rows never abort the load; a bad
                                // row is logged and skipped.
                                if let Err(e) =
                                    inner.register(&tracker, &mut cycle, &mut seen, &app, info)
                                {
                                    log_selector("_schedule").warn(&format!(
                                        "persisted schedule '{}' skipped: {e}",
                                        row.schedule_key
                                    ));
                                }
                            }
                            Err(e) => {
                                log_selector("_schedule").warn(&format!(
                                    "persisted schedule '{}' skipped: {e}",
                                    row.schedule_key
                                ));
                            }
                        }
                    }
                }
                Err(e) => {
                    first_err.get_or_insert(LoadError::Store(e));
                }
            }
        }

        *inner.cycle.write().expect("engine poisoned") = cycle;

        let cycle_inner = inner.clone();
        let cycle_tracker = tracker.clone();
        tracker.spawn(async move {
            Inner::cycle_loop(cycle_inner, cycle_tracker).await;
        });
        tracker.close();

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn register(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        cycle: &mut HashMap<String, Arc<CycleEntry>>,
        seen: &mut HashSet<String>,
        app: &Application,
        info: ScheduleInfo,
    ) -> Result<(), LoadError> {
        if info.scope == Scope::Global && self.token().is_none() {
            log_selector("_schedule").info(&format!(
                "schedule '{}' skipped: global scope without token service",
                info.key
            ));
            return Ok(());
        }
        let Some(handler) = app.handler(&info.handler_name) else {
            log_selector("_schedule").info(&format!(
                "schedule '{}' skipped: handler '{}' not resolved",
                info.key, info.handler_name
            ));
            return Ok(());
        };
        if !seen.insert(info.key.clone()) {
            return Err(LoadError::DuplicateKey {
                key: info.key.clone(),
            });
        }

        let routine = wrap_schedule(
            &self.project(),
            self.enable_logger.load(Ordering::SeqCst),
            &info.key,
            handler,
        );
        match info.discipline {
            Discipline::Overlapped => {
                cycle.insert(
                    info.key.clone(),
                    Arc::new(CycleEntry {
                        info,
                        routine,
                        last_run_time: AtomicI64::new(0),
                    }),
                );
                Ok(())
            }
            Discipline::Serial => {
                self.spawn_serial(tracker, info, routine);
                Ok(())
            }
            Discipline::Fixed => {
                if info.interval == 0 && clock::unix_now() > info.timestamp {
                    return Err(LoadError::InvalidSchedule {
                        key: info.key.clone(),
                    });
                }
                self.spawn_fixed(tracker, info, routine);
                Ok(())
            }
        }
    }

    /// 1 Hz driver for the Overlapped discipline.
    async fn cycle_loop(inner: Arc<Inner>, tracker: TaskTracker) {
        let mut driver = tokio::time::interval_at(
            Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );
        while inner.is_running() {
            driver.tick().await;
            if !inner.is_running() {
                break;
            }
            inner.traverse_cycle(&tracker);
        }
    }

    fn traverse_cycle(&self, tracker: &TaskTracker) {
        let entries: Vec<Arc<CycleEntry>> = {
            let cycle = self.cycle.read().expect("engine poisoned");
            cycle.values().cloned().collect()
        };
        let now = clock::unix_now();
        for entry in entries {
            if !self.is_running() {
                break;
            }
            match entry.info.scope {
                Scope::Native => {
                    tracker.spawn(async move {
                        if entry.last_run_time.load(Ordering::SeqCst) + entry.info.interval <= now {
                            let _ = (entry.routine)().await;
                            entry.last_run_time.store(now, Ordering::SeqCst);
                        }
                    });
                }
                Scope::Global => {
                    let Some(token) = self.token() else { continue };
                    tracker.spawn(async move {
                        Inner::run_global_cycle(token, entry, now).await;
                    });
                }
            }
        }
    }

    /// One Global Overlapped attempt: token, persisted status, invoke,
    /// status write-back, release. Status handling is best effort; once the
    /// token is held a read/write failure never vetoes the invocation, which
    /// makes Global Overlapped at-least-once across crashes.
    async fn run_global_cycle(token: Arc<TokenService>, entry: Arc<CycleEntry>, now: i64) {
        let key = &entry.info.key;
        match token.acquire(key, entry.info.interval).await {
            Ok(Some(lease)) => {
                let persisted = match token.get_status(key).await {
                    Ok(raw) => raw.and_then(|s| serde_json::from_str::<ScheduleStatus>(&s).ok()),
                    Err(e) => {
                        log_selector("_schedule")
                            .info(&format!("{key}: status read failed [{e}]"));
                        None
                    }
                };
                let mut status =
                    persisted.unwrap_or_else(|| ScheduleStatus::from_info(&entry.info));
                if status.last_run_time + status.interval <= now {
                    let _ = (entry.routine)().await;
                    status.last_run_time = now;
                    entry.last_run_time.store(now, Ordering::SeqCst);
                    match serde_json::to_string(&status) {
                        Ok(json) => {
                            if let Err(e) =
                                token.put_status(key, &json, entry.info.interval).await
                            {
                                log_selector("_schedule")
                                    .info(&format!("{key}: status write failed [{e}]"));
                            }
                        }
                        Err(e) => {
                            log_selector("_schedule")
                                .info(&format!("{key}: status encode failed [{e}]"));
                        }
                    }
                }
                let _ = token.release(key, &lease).await;
            }
            Ok(None) => {
                log_selector("_schedule").info(&format!("{key} has been locked"));
            }
            Err(e) => {
                log_selector("_schedule").info(&format!("{key}: lock error [{e}]"));
            }
        }
    }

    fn spawn_serial(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        info: ScheduleInfo,
        routine: ScheduleRoutine,
    ) {
        let inner = self.clone();
        tracker.spawn(async move {
            while inner.is_running() {
                match info.scope {
                    Scope::Native => {
                        let _ = routine().await;
                        inner.smart_sleep(info.interval).await;
                    }
                    Scope::Global => {
                        let Some(token) = inner.token() else { break };
                        match token.acquire(&info.key, info.interval).await {
                            Ok(Some(lease)) => {
                                let _ = routine().await;
                                inner.smart_sleep(info.interval).await;
                                let _ = token.release(&info.key, &lease).await;
                            }
                            Ok(None) => {
                                log_selector("_schedule")
                                    .info(&format!("{} has been locked", info.key));
                                inner.smart_sleep(info.interval).await;
                            }
                            Err(e) => {
                                log_selector("_schedule")
                                    .info(&format!("{}: lock error [{e}]", info.key));
                                inner.smart_sleep(info.interval).await;
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_fixed(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        info: ScheduleInfo,
        routine: ScheduleRoutine,
    ) {
        let inner = self.clone();
        tracker.spawn(async move {
            let mut timeline = info.timestamp;
            while inner.is_running() {
                let now = clock::unix_now();
                if now < timeline {
                    if !inner.smart_sleep(timeline - now).await {
                        break;
                    }
                    continue;
                }
                let over = if info.interval != 0 {
                    (now - timeline).rem_euclid(info.interval)
                } else {
                    0
                };
                if over != 0 {
                    // Off-phase: re-align without invoking.
                    if !inner.smart_sleep(info.interval - over).await {
                        break;
                    }
                    timeline = now + info.interval - over;
                    continue;
                }
                match info.scope {
                    Scope::Native => {
                        let _ = routine().await;
                        if info.interval == 0 {
                            break;
                        }
                        if !inner.smart_sleep(info.interval).await {
                            break;
                        }
                        timeline = now + info.interval;
                    }
                    Scope::Global => {
                        let Some(token) = inner.token() else { break };
                        match token.acquire(&info.key, info.interval).await {
                            Ok(Some(lease)) => {
                                let _ = routine().await;
                                if info.interval == 0 {
                                    let _ = token.release(&info.key, &lease).await;
                                    break;
                                }
                                // Hold the token through the sleep so the
                                // phase window stays owned by this node.
                                let slept = inner.smart_sleep(info.interval).await;
                                let _ = token.release(&info.key, &lease).await;
                                if !slept {
                                    break;
                                }
                                timeline = now + info.interval;
                            }
                            other => {
                                if let Err(e) = other {
                                    log_selector("_schedule")
                                        .info(&format!("{}: lock error [{e}]", info.key));
                                } else {
                                    log_selector("_schedule")
                                        .info(&format!("{} has been locked", info.key));
                                }
                                if info.interval == 0 {
                                    break;
                                }
                                // Lost phase windows are not re-attempted.
                                if !inner.smart_sleep(info.interval).await {
                                    break;
                                }
                                timeline = now + info.interval;
                            }
                        }
                    }
                }
            }
        });
    }
}

fn info_from_row(row: &ScheduleRow) -> Result<ScheduleInfo, LoadError> {
    let discipline =
        Discipline::from_code(row.schedule_type).ok_or(LoadError::UnknownDiscipline {
            code: row.schedule_type,
        })?;
    let scope = Scope::from_code(row.schedule_scope).ok_or_else(|| LoadError::ConfigInvalid {
        reason: format!("unknown schedule scope code {}", row.schedule_scope),
    })?;
    Ok(ScheduleInfo {
        key: row.schedule_key.clone(),
        handler_name: row.schedule_func_name.clone(),
        discipline,
        timestamp: row.schedule_timestamp,
        interval: row.schedule_interval,
        scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::StoreError;
    use crate::handler::HandlerFn;
    use crate::kv::{KvStore, MemoryKv};
    use crate::store::{MemoryStore, TaskRow};

    fn engine_with(
        kv: Option<Arc<dyn KvStore>>,
        store: Option<Arc<dyn DefinitionStore>>,
    ) -> ScheduleEngine {
        let engine = ScheduleEngine::new();
        let mut cfg = ScheduleConfig::default();
        cfg.enable_logger = false;
        let mut kvs: KvInstances = HashMap::new();
        if let Some(kv) = kv {
            kvs.insert("lock".into(), kv);
            cfg.global_lock_kv = "lock".into();
        }
        let mut stores: StoreInstances = HashMap::new();
        if let Some(st) = store {
            stores.insert("defs".into(), st);
            cfg.load_schedule_db = "defs".into();
        }
        engine.load_config(&cfg, &kvs, &stores, "demo").unwrap();
        engine
    }

    fn sched(
        key: &str,
        discipline: Discipline,
        timestamp: i64,
        interval: i64,
        scope: Scope,
    ) -> ScheduleInfo {
        ScheduleInfo {
            key: key.to_string(),
            handler_name: key.to_string(),
            discipline,
            timestamp,
            interval,
            scope,
        }
    }

    fn recording_app(name: &str, hits: Arc<Mutex<Vec<i64>>>) -> Application {
        Application::new().register(
            name,
            HandlerFn::arc(name.to_string(), move |_p| {
                let hits = hits.clone();
                async move {
                    hits.lock().unwrap().push(clock::unix_now());
                    Ok(())
                }
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_run_once_with_past_anchor_is_rejected() {
        let engine = engine_with(None, None);
        let hits = Arc::new(Mutex::new(Vec::new()));
        let app = recording_app("h", hits.clone());
        let anchor = clock::unix_now() - 1000;
        engine
            .load_schedule(vec![sched("h", Discipline::Fixed, anchor, 0, Scope::Native)], app)
            .unwrap();
        let err = engine.start().await.unwrap_err();
        assert_eq!(err.as_label(), "load_invalid_schedule");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(hits.lock().unwrap().is_empty(), "no worker may be spawned");
        engine.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_invocations_stay_phase_aligned() {
        let engine = engine_with(None, None);
        let hits = Arc::new(Mutex::new(Vec::new()));
        let anchor = clock::unix_now() + 3;
        engine
            .load_schedule(
                vec![sched("phased", Discipline::Fixed, anchor, 5, Scope::Native)],
                recording_app("phased", hits.clone()),
            )
            .unwrap();
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(14)).await;
        engine.close().await;

        let hits = hits.lock().unwrap();
        assert!(hits.len() >= 2, "hits={hits:?}");
        for t in hits.iter() {
            assert_eq!((t - anchor).rem_euclid(5), 0, "misaligned hit at {t}, anchor {anchor}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_realigns_when_started_off_phase() {
        let engine = engine_with(None, None);
        let hits = Arc::new(Mutex::new(Vec::new()));
        let anchor = clock::unix_now() - 3;
        engine
            .load_schedule(
                vec![sched("offset", Discipline::Fixed, anchor, 5, Scope::Native)],
                recording_app("offset", hits.clone()),
            )
            .unwrap();
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        engine.close().await;

        let hits = hits.lock().unwrap();
        assert_eq!(hits.len(), 1, "hits={hits:?}");
        // First invocation waits out the partial phase instead of firing late.
        assert_eq!(hits[0] - anchor, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_run_once_fires_exactly_once() {
        let engine = engine_with(None, None);
        let hits = Arc::new(Mutex::new(Vec::new()));
        let anchor = clock::unix_now() + 2;
        engine
            .load_schedule(
                vec![sched("once", Discipline::Fixed, anchor, 0, Scope::Native)],
                recording_app("once", hits.clone()),
            )
            .unwrap();
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.lock().unwrap().as_slice(), &[anchor]);
        engine.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn overlapped_native_invocations_overlap() {
        let engine = engine_with(None, None);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (cur, pk) = (current.clone(), peak.clone());
        let app = Application::new().register(
            "poll",
            HandlerFn::arc("poll", move |_p| {
                let (cur, pk) = (cur.clone(), pk.clone());
                async move {
                    let live = cur.fetch_add(1, Ordering::SeqCst) + 1;
                    pk.fetch_max(live, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    cur.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        engine
            .load_schedule(
                vec![sched("poll", Discipline::Overlapped, 0, 1, Scope::Native)],
                app,
            )
            .unwrap();
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(
            peak.load(Ordering::SeqCst) >= 3,
            "peak concurrency {} below 3",
            peak.load(Ordering::SeqCst)
        );
        engine.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn serial_runs_are_monotone_and_spaced() {
        let engine = engine_with(None, None);
        let hits = Arc::new(Mutex::new(Vec::new()));
        engine
            .load_schedule(
                vec![sched("steady", Discipline::Serial, 0, 2, Scope::Native)],
                recording_app("steady", hits.clone()),
            )
            .unwrap();
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;
        engine.close().await;

        let hits = hits.lock().unwrap();
        assert!(hits.len() >= 3, "hits={hits:?}");
        for pair in hits.windows(2) {
            assert!(pair[1] - pair[0] >= 2, "spacing violated: {hits:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reload_lets_inflight_finish_and_activates_new_list() {
        let engine = engine_with(None, None);
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        let app = Application::new().register(
            "slow",
            HandlerFn::arc("slow", move |_p| {
                let done = done.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    done.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        engine
            .load_schedule(vec![sched("slow", Discipline::Serial, 0, 1, Scope::Native)], app)
            .unwrap();
        engine.start().await.unwrap();

        // The first invocation is still sleeping when the reload lands.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let fresh_hits = Arc::new(Mutex::new(Vec::new()));
        engine
            .load_schedule(
                vec![sched("fresh", Discipline::Serial, 0, 1, Scope::Native)],
                recording_app("fresh", fresh_hits.clone()),
            )
            .unwrap();
        engine.reload_schedule();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(finished.load(Ordering::SeqCst), "in-flight handler was dropped");
        assert!(!fresh_hits.lock().unwrap().is_empty(), "new list not active");
        engine.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn global_serial_elects_single_winner_per_window() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let hits = Arc::new(Mutex::new(Vec::new()));

        let node_a = engine_with(Some(kv.clone()), None);
        let node_b = engine_with(Some(kv.clone()), None);
        for node in [&node_a, &node_b] {
            node.load_schedule(
                vec![sched("reaper", Discipline::Serial, 0, 5, Scope::Global)],
                recording_app("reaper", hits.clone()),
            )
            .unwrap();
            node.start().await.unwrap();
        }

        tokio::time::sleep(Duration::from_secs(59)).await;
        node_a.close().await;
        node_b.close().await;

        let count = hits.lock().unwrap().len();
        assert!(
            (10..=12).contains(&count),
            "expected one winner per 5 s window over 60 s, got {count}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn global_overlapped_dedups_through_status() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let hits = Arc::new(Mutex::new(Vec::new()));

        let node_a = engine_with(Some(kv.clone()), None);
        let node_b = engine_with(Some(kv.clone()), None);
        for node in [&node_a, &node_b] {
            node.load_schedule(
                vec![sched("poll", Discipline::Overlapped, 0, 3, Scope::Global)],
                recording_app("poll", hits.clone()),
            )
            .unwrap();
            node.start().await.unwrap();
        }

        tokio::time::sleep(Duration::from_secs(9)).await;
        node_a.close().await;
        node_b.close().await;

        let count = hits.lock().unwrap().len();
        assert!(
            (2..=4).contains(&count),
            "expected roughly one invocation per 3 s window, got {count}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_rows_load_with_filtering() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_schedule(&ScheduleRow {
                schedule_key: "from_db".into(),
                schedule_func_name: "from_db".into(),
                schedule_type: 3,
                schedule_interval: 1,
                schedule_scope: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .insert_schedule(&ScheduleRow {
                schedule_key: "bad_type".into(),
                schedule_func_name: "from_db".into(),
                schedule_type: 9,
                schedule_interval: 1,
                schedule_scope: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .insert_schedule(&ScheduleRow {
                schedule_key: "needs_lock".into(),
                schedule_func_name: "from_db".into(),
                schedule_type: 3,
                schedule_interval: 1,
                schedule_scope: 3,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .insert_schedule(&ScheduleRow {
                schedule_key: "unresolved".into(),
                schedule_func_name: "no_such_func".into(),
                schedule_type: 3,
                schedule_interval: 1,
                schedule_scope: 1,
                ..Default::default()
            })
            .await
            .unwrap();

        let engine = engine_with(None, Some(store));
        let hits = Arc::new(Mutex::new(Vec::new()));
        engine
            .load_schedule(Vec::new(), recording_app("from_db", hits.clone()))
            .unwrap();
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        engine.close().await;
        assert!(!hits.lock().unwrap().is_empty(), "persisted schedule never ran");
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_key_is_reported_first_registration_wins() {
        let engine = engine_with(None, None);
        let hits = Arc::new(Mutex::new(Vec::new()));
        let app = recording_app("dup", hits.clone());
        engine
            .load_schedule(
                vec![
                    sched("dup", Discipline::Serial, 0, 2, Scope::Native),
                    sched("dup", Discipline::Serial, 0, 2, Scope::Native),
                ],
                app,
            )
            .unwrap();
        let err = engine.start().await.unwrap_err();
        assert_eq!(err.as_label(), "load_duplicate_key");

        tokio::time::sleep(Duration::from_secs(3)).await;
        engine.close().await;
        assert!(!hits.lock().unwrap().is_empty(), "first registration must run");
    }

    struct FailingStore;

    #[async_trait]
    impl DefinitionStore for FailingStore {
        async fn find_schedules(&self) -> Result<Vec<ScheduleRow>, StoreError> {
            Err(StoreError::Unavailable {
                reason: "down".into(),
            })
        }
        async fn find_tasks(&self) -> Result<Vec<TaskRow>, StoreError> {
            Err(StoreError::Unavailable {
                reason: "down".into(),
            })
        }
        async fn insert_schedule(&self, _row: &ScheduleRow) -> Result<(), StoreError> {
            Err(StoreError::Unavailable {
                reason: "down".into(),
            })
        }
        async fn insert_task(&self, _row: &TaskRow) -> Result<(), StoreError> {
            Err(StoreError::Unavailable {
                reason: "down".into(),
            })
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable {
                reason: "down".into(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_is_reported_but_code_schedules_run() {
        let engine = engine_with(None, Some(Arc::new(FailingStore)));
        let hits = Arc::new(Mutex::new(Vec::new()));
        engine
            .load_schedule(
                vec![sched("local", Discipline::Serial, 0, 1, Scope::Native)],
                recording_app("local", hits.clone()),
            )
            .unwrap();
        let err = engine.start().await.unwrap_err();
        assert_eq!(err.as_label(), "load_store_failure");

        tokio::time::sleep(Duration::from_secs(3)).await;
        engine.close().await;
        assert!(!hits.lock().unwrap().is_empty(), "code-supplied schedule must run");
    }

    #[tokio::test]
    async fn schedule_list_without_handlers_fails_fast() {
        let engine = engine_with(None, None);
        let err = engine
            .load_schedule(
                vec![sched("orphan", Discipline::Serial, 0, 1, Scope::Native)],
                Application::new(),
            )
            .unwrap_err();
        assert_eq!(err.as_label(), "load_config_invalid");
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_leaves_worker_running() {
        let engine = engine_with(None, None);
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let app = Application::new().register(
            "explosive",
            HandlerFn::arc("explosive", move |_p| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    panic!("scheduled boom");
                }
            }),
        );
        engine
            .load_schedule(
                vec![sched("explosive", Discipline::Serial, 0, 1, Scope::Native)],
                app,
            )
            .unwrap();
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        engine.close().await;
        assert!(
            hits.load(Ordering::SeqCst) >= 3,
            "dispatch must continue after a panic, hits={}",
            hits.load(Ordering::SeqCst)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_drains_and_stops_dispatch() {
        let engine = engine_with(None, None);
        let hits = Arc::new(Mutex::new(Vec::new()));
        engine
            .load_schedule(
                vec![sched("stop", Discipline::Serial, 0, 1, Scope::Native)],
                recording_app("stop", hits.clone()),
            )
            .unwrap();
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        engine.close().await;
        let frozen = hits.lock().unwrap().len();
        assert!(frozen > 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.lock().unwrap().len(), frozen, "dispatch after close");
    }
}
