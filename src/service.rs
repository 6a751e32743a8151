//! # Service supervisor.
//!
//! Wires the schedule and task engines against the configured collaborators,
//! then owns their lifecycle: start, reload on signal, orderly teardown.
//!
//! ## Signals (Unix)
//!
//! - **SIGINT / SIGTERM / SIGQUIT** request an orderly shutdown: both engines
//!   drain their workers, in-flight handler invocations included.
//! - **SIGHUP / SIGUSR2** request a hot reload: both engines rebuild their
//!   registries from whatever was staged last, without dropping in-flight
//!   work.
//!
//! On non-Unix platforms only Ctrl-C is handled.

use crate::config::ServiceConfig;
use crate::error::LoadError;
use crate::handler::Application;
use crate::kv::KvInstances;
use crate::logger;
use crate::schedule::{ScheduleEngine, ScheduleInfo};
use crate::store::StoreInstances;
use crate::task::{TaskEngine, TaskInfo};

/// # Supervisor over both engines.
///
/// ```no_run
/// use tickvisor::{Application, HandlerFn, Service, ServiceConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut svc = Service::new("billing");
///     svc.load_config(&ServiceConfig::default(), &Default::default(), &Default::default())?;
///
///     let app = Application::new()
///         .register("noop", HandlerFn::arc("noop", |_p| async { Ok(()) }));
///     svc.load_schedules(Vec::new(), app.clone()).ok();
///     svc.load_tasks(Vec::new(), app).ok();
///
///     svc.start().await?;
///     svc.serve().await?;
///     Ok(())
/// }
/// ```
pub struct Service {
    project: String,
    scheduler: ScheduleEngine,
    tasks: TaskEngine,
    scheduler_enabled: bool,
    tasks_enabled: bool,
}

impl Service {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            scheduler: ScheduleEngine::new(),
            tasks: TaskEngine::new(),
            scheduler_enabled: false,
            tasks_enabled: false,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// The schedule engine, for direct access (persistent inserts, etc.).
    pub fn scheduler(&self) -> &ScheduleEngine {
        &self.scheduler
    }

    /// The task engine, for producers pushing work.
    pub fn tasks(&self) -> &TaskEngine {
        &self.tasks
    }

    /// Resolves the named collaborators and configures both engines.
    pub fn load_config(
        &mut self,
        cfg: &ServiceConfig,
        kv_instances: &KvInstances,
        store_instances: &StoreInstances,
    ) -> Result<(), LoadError> {
        logger::registry().set_project(&self.project);
        self.scheduler_enabled = cfg.scheduler.enable;
        self.tasks_enabled = cfg.task.enable;
        if self.scheduler_enabled {
            self.scheduler
                .load_config(&cfg.scheduler, kv_instances, store_instances, &self.project)?;
        }
        if self.tasks_enabled {
            self.tasks
                .load_config(&cfg.task, kv_instances, store_instances, &self.project)?;
        }
        Ok(())
    }

    /// Stages the schedule list; takes effect at start or next reload.
    pub fn load_schedules(
        &self,
        list: Vec<ScheduleInfo>,
        app: Application,
    ) -> Result<(), LoadError> {
        self.scheduler.load_schedule(list, app)
    }

    /// Stages the task list; takes effect at start or next reload.
    pub fn load_tasks(&self, list: Vec<TaskInfo>, app: Application) -> Result<(), LoadError> {
        self.tasks.load_task(list, app)
    }

    /// Starts every enabled engine; fail-fast on load errors.
    pub async fn start(&self) -> Result<(), LoadError> {
        if self.scheduler_enabled {
            self.scheduler.start().await?;
        }
        if self.tasks_enabled {
            self.tasks.start().await?;
        }
        Ok(())
    }

    /// Forwards a hot reload to both engines.
    pub fn reload(&self) {
        if self.scheduler_enabled {
            self.scheduler.reload_schedule();
        }
        if self.tasks_enabled {
            self.tasks.reload_task_list();
        }
    }

    /// Drains and stops both engines.
    pub async fn close(&self) {
        if self.scheduler_enabled {
            self.scheduler.close().await;
        }
        if self.tasks_enabled {
            self.tasks.close().await;
        }
    }

    /// Blocks on process signals: terminate-class signals shut the service
    /// down, reload-class signals rebuild the registries. Returns after the
    /// engines have drained.
    #[cfg(unix)]
    pub async fn serve(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
                _ = sigquit.recv() => break,
                _ = sighup.recv() => {
                    logger::log_selector("_service").info("reload signal received");
                    self.reload();
                }
                _ = sigusr2.recv() => {
                    logger::log_selector("_service").info("reload signal received");
                    self.reload();
                }
            }
        }
        logger::log_selector("_service").info("shutdown signal received");
        self.close().await;
        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn serve(&self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await?;
        self.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::handler::HandlerFn;
    use crate::kv::{KvStore, MemoryKv};
    use crate::schedule::{Discipline, Scope};

    #[tokio::test(start_paused = true)]
    async fn wires_both_engines_end_to_end() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let mut kvs: KvInstances = std::collections::HashMap::new();
        kvs.insert("main".into(), kv);

        let cfg: ServiceConfig = serde_json::from_str(
            r#"{
                "scheduler": {"enable_logger": false, "global_lock_redis": "main"},
                "task": {"enable_logger": false, "global_queue_redis": "main"}
            }"#,
        )
        .unwrap();

        let mut svc = Service::new("demo");
        svc.load_config(&cfg, &kvs, &StoreInstances::new()).unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        let items = Arc::new(AtomicUsize::new(0));
        let (t, i) = (ticks.clone(), items.clone());
        let app = Application::new()
            .register(
                "tick",
                HandlerFn::arc("tick", move |_p| {
                    let t = t.clone();
                    async move {
                        t.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .register(
                "drain",
                HandlerFn::arc("drain", move |_p| {
                    let i = i.clone();
                    async move {
                        i.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );

        svc.load_schedules(
            vec![ScheduleInfo {
                key: "tick".into(),
                handler_name: "tick".into(),
                discipline: Discipline::Serial,
                timestamp: 0,
                interval: 1,
                scope: Scope::Global,
            }],
            app.clone(),
        )
        .unwrap();
        svc.load_tasks(
            vec![TaskInfo {
                key: "drain".into(),
                handler_name: "drain".into(),
                queue_size: 8,
                handler_num: 2,
                scope: Scope::Native,
            }],
            app,
        )
        .unwrap();

        svc.start().await.unwrap();
        svc.tasks().push_native("drain", b"one".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert_eq!(items.load(Ordering::SeqCst), 1);

        // Hot reload keeps the service alive with the staged lists.
        svc.reload();
        tokio::time::sleep(Duration::from_secs(3)).await;
        svc.tasks().push_native("drain", b"two".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(items.load(Ordering::SeqCst), 2);

        svc.close().await;
    }

    #[tokio::test]
    async fn unknown_instance_name_fails_fast() {
        let cfg: ServiceConfig = serde_json::from_str(
            r#"{"scheduler": {"global_lock_redis": "nope"}, "task": {}}"#,
        )
        .unwrap();
        let mut svc = Service::new("demo");
        let err = svc
            .load_config(&cfg, &KvInstances::new(), &StoreInstances::new())
            .unwrap_err();
        assert_eq!(err.as_label(), "load_config_invalid");
    }
}
