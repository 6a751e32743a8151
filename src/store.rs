//! # Persistent definition-store port.
//!
//! Schedules and tasks can be defined in code or persisted in a relational
//! store. The engines consume [`DefinitionStore`]; the concrete SQL engine
//! belongs to the outer shell. Row types mirror the exact table layouts:
//!
//! `VASC_SCHEDULER`: `SCHEDULE_ID` (PK autoincrement), `SCHEDULE_KEY`
//! (unique), `SCHEDULE_FUNC_NAME`, `SCHEDULE_TYPE`, `SCHEDULE_TIMESTAMP`,
//! `SCHEDULE_INTERVAL`, `SCHEDULE_SCOPE`, `SCHEDULE_CREATED_TIME`,
//! `SCHEDULE_UPDATED_TIME`.
//!
//! `VASC_TASK`: `TASK_ID` (PK autoincrement), `TASK_KEY` (unique),
//! `TASK_FUNC_NAME`, `TASK_HANDLER_NUM`, `TASK_QUEUE_SIZE`, `TASK_SCOPE`,
//! `TASK_CREATED_TIME`, `TASK_UPDATED_TIME`.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::clock;
use crate::error::StoreError;

/// One `VASC_SCHEDULER` row.
#[derive(Clone, Debug, Default)]
pub struct ScheduleRow {
    /// `SCHEDULE_ID`, assigned by the store on insert.
    pub schedule_id: i64,
    /// `SCHEDULE_KEY`, unique within the table.
    pub schedule_key: String,
    /// `SCHEDULE_FUNC_NAME`, resolved through the application func map.
    pub schedule_func_name: String,
    /// `SCHEDULE_TYPE`: 1 = Fixed, 2 = Overlapped, 3 = Serial.
    pub schedule_type: i64,
    /// `SCHEDULE_TIMESTAMP`: epoch anchor, used only by Fixed.
    pub schedule_timestamp: i64,
    /// `SCHEDULE_INTERVAL` in seconds; zero means run-once (Fixed only).
    pub schedule_interval: i64,
    /// `SCHEDULE_SCOPE`: 1 = Native, 3 = Global.
    pub schedule_scope: i64,
    /// `SCHEDULE_CREATED_TIME`, epoch seconds.
    pub schedule_created_time: i64,
    /// `SCHEDULE_UPDATED_TIME`, epoch seconds.
    pub schedule_updated_time: i64,
}

/// One `VASC_TASK` row.
#[derive(Clone, Debug, Default)]
pub struct TaskRow {
    /// `TASK_ID`, assigned by the store on insert.
    pub task_id: i64,
    /// `TASK_KEY`, unique within the table.
    pub task_key: String,
    /// `TASK_FUNC_NAME`, resolved through the application func map.
    pub task_func_name: String,
    /// `TASK_HANDLER_NUM`: concurrent workers for this task.
    pub task_handler_num: i64,
    /// `TASK_QUEUE_SIZE`: local channel capacity (Native only).
    pub task_queue_size: i64,
    /// `TASK_SCOPE`: 1 = Native, 3 = Global.
    pub task_scope: i64,
    /// `TASK_CREATED_TIME`, epoch seconds.
    pub task_created_time: i64,
    /// `TASK_UPDATED_TIME`, epoch seconds.
    pub task_updated_time: i64,
}

/// Named definition-store instances the engines resolve configuration against.
pub type StoreInstances = std::collections::HashMap<String, std::sync::Arc<dyn DefinitionStore>>;

/// # Port over the relational store holding persisted definitions.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Returns every `VASC_SCHEDULER` row.
    async fn find_schedules(&self) -> Result<Vec<ScheduleRow>, StoreError>;

    /// Returns every `VASC_TASK` row.
    async fn find_tasks(&self) -> Result<Vec<TaskRow>, StoreError>;

    /// Inserts a schedule row; the store assigns id and timestamps.
    async fn insert_schedule(&self, row: &ScheduleRow) -> Result<(), StoreError>;

    /// Inserts a task row; the store assigns id and timestamps.
    async fn insert_task(&self, row: &TaskRow) -> Result<(), StoreError>;

    /// Liveness probe for the backend.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// In-process [`DefinitionStore`] for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    schedules: Mutex<Vec<ScheduleRow>>,
    tasks: Mutex<Vec<TaskRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn find_schedules(&self) -> Result<Vec<ScheduleRow>, StoreError> {
        Ok(self.schedules.lock().expect("store poisoned").clone())
    }

    async fn find_tasks(&self) -> Result<Vec<TaskRow>, StoreError> {
        Ok(self.tasks.lock().expect("store poisoned").clone())
    }

    async fn insert_schedule(&self, row: &ScheduleRow) -> Result<(), StoreError> {
        let mut rows = self.schedules.lock().expect("store poisoned");
        if rows.iter().any(|r| r.schedule_key == row.schedule_key) {
            return Err(StoreError::Query {
                reason: format!("SCHEDULE_KEY '{}' already exists", row.schedule_key),
            });
        }
        let now = clock::unix_now();
        let mut row = row.clone();
        row.schedule_id = rows.len() as i64 + 1;
        row.schedule_created_time = now;
        row.schedule_updated_time = now;
        rows.push(row);
        Ok(())
    }

    async fn insert_task(&self, row: &TaskRow) -> Result<(), StoreError> {
        let mut rows = self.tasks.lock().expect("store poisoned");
        if rows.iter().any(|r| r.task_key == row.task_key) {
            return Err(StoreError::Query {
                reason: format!("TASK_KEY '{}' already exists", row.task_key),
            });
        }
        let now = clock::unix_now();
        let mut row = row.clone();
        row.task_id = rows.len() as i64 + 1;
        row.task_created_time = now;
        row.task_updated_time = now;
        rows.push(row);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_assigns_ids_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let row = ScheduleRow {
            schedule_key: "reaper".into(),
            schedule_func_name: "reap".into(),
            schedule_type: 3,
            schedule_interval: 5,
            schedule_scope: 3,
            ..Default::default()
        };
        store.insert_schedule(&row).await.unwrap();
        let err = store.insert_schedule(&row).await.unwrap_err();
        assert_eq!(err.as_label(), "store_query_failed");

        let rows = store.find_schedules().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].schedule_id, 1);
        assert!(rows[0].schedule_created_time > 0);
    }
}
