//! End-to-end engine tests driven against a real disposable PostgreSQL
//! instance, with fake `AsyncSqlExecutor`/`StatisticsClient` collaborators
//! so completions can be triggered deterministically.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use geoexport_core::engine::{ProgressEvent, TaskedStep, TaskedStepEngine};
use geoexport_core::error::EngineError;
use geoexport_core::executor::{AsyncSqlExecutor, ResourceShare};
use geoexport_core::resource::ExportKind;
use geoexport_core::state::StepState;
use geoexport_core::stats::{DatasetStatistics, StatisticsClient};
use geoexport_test_utils::{create_test_db, drop_test_db};

/// Records submissions; tests drive completions by calling `on_async_update`
/// directly rather than actually running the submitted query.
#[derive(Default)]
struct RecordingExecutor {
    submitted: Mutex<Vec<(i32, String, ResourceShare)>>,
}

#[async_trait]
impl AsyncSqlExecutor for RecordingExecutor {
    async fn submit(&self, task_id: i32, query: &str, share: ResourceShare) -> Result<()> {
        self.submitted
            .lock()
            .unwrap()
            .push((task_id, query.to_owned(), share));
        Ok(())
    }
}

struct FixedStatistics {
    statistics: DatasetStatistics,
}

#[async_trait]
impl StatisticsClient for FixedStatistics {
    async fn dataset_statistics(&self, _space_id: &str) -> Result<DatasetStatistics> {
        Ok(self.statistics)
    }

    async fn resolve_tag(&self, _space_id: &str, _tag: &str) -> Result<i64> {
        Ok(self.statistics.max_version)
    }

    async fn precalc_thread_count(
        &self,
        _feature_count: i64,
        _select_query: &str,
        _source_table: &str,
    ) -> Result<usize> {
        Ok(2)
    }
}

/// A step exposing a fixed list of task items, independent of any real
/// tile-diffing logic -- the engine's dispatch/completion machinery is what
/// is under test here, not `ChangedTilesPlanner`.
struct FixedStep {
    thread_count: usize,
    items: Vec<serde_json::Value>,
}

#[async_trait]
impl TaskedStep for FixedStep {
    fn build_per_task_query(&self, task_data: &serde_json::Value) -> Result<String, EngineError> {
        Ok(format!("SELECT export({task_data})"))
    }

    fn initial_thread_count(&self) -> usize {
        self.thread_count
    }

    fn export_kind(&self) -> ExportKind {
        ExportKind::ChangedTiles
    }

    async fn create_task_items(&self) -> Result<Vec<serde_json::Value>, EngineError> {
        Ok(self.items.clone())
    }
}

fn event(task_id: i32) -> ProgressEvent {
    ProgressEvent {
        task_id,
        byte_count: 1024,
        feature_count: 10,
        file_count: 1,
    }
}

#[tokio::test]
async fn fan_out_is_bounded_by_calculated_thread_count() {
    let (pool, db_name) = create_test_db().await;

    let items: Vec<serde_json::Value> = (0..10).map(serde_json::Value::from).collect();
    let step = FixedStep {
        thread_count: 3,
        items,
    };
    let executor = Arc::new(RecordingExecutor::default());
    let statistics = Arc::new(FixedStatistics {
        statistics: DatasetStatistics {
            byte_size: 1024,
            feature_count: 10,
            max_version: 1,
        },
    });

    let mut engine = TaskedStepEngine::new(
        step,
        pool.clone(),
        "public",
        "fanout_step",
        "space-a",
        executor.clone(),
        statistics,
    );

    engine.execute(false).await.unwrap();
    assert_eq!(executor.submitted.lock().unwrap().len(), 3);
    assert_eq!(engine.state(), StepState::Running);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn completion_dispatches_a_replacement_until_queue_is_dry() {
    let (pool, db_name) = create_test_db().await;

    let items: Vec<serde_json::Value> = (0..5).map(serde_json::Value::from).collect();
    let step = FixedStep {
        thread_count: 2,
        items,
    };
    let executor = Arc::new(RecordingExecutor::default());
    let statistics = Arc::new(FixedStatistics {
        statistics: DatasetStatistics {
            byte_size: 1024,
            feature_count: 5,
            max_version: 1,
        },
    });

    let mut engine = TaskedStepEngine::new(
        step,
        pool.clone(),
        "public",
        "replace_step",
        "space-a",
        executor.clone(),
        statistics,
    );

    engine.execute(false).await.unwrap();
    assert_eq!(executor.submitted.lock().unwrap().len(), 2);

    let mut task_ids: Vec<i32> = executor
        .submitted
        .lock()
        .unwrap()
        .iter()
        .map(|(id, _, _)| *id)
        .collect();

    // Drain every outstanding task, tracking replacements as they appear.
    while let Some(task_id) = task_ids.pop() {
        let before = executor.submitted.lock().unwrap().len();
        let complete = engine.on_async_update(event(task_id)).await.unwrap();
        let after = executor.submitted.lock().unwrap().len();
        if after > before {
            let new_id = executor.submitted.lock().unwrap()[after - 1].0;
            task_ids.push(new_id);
        }
        if complete {
            break;
        }
    }

    assert_eq!(engine.state(), StepState::Completed);
    assert_eq!(executor.submitted.lock().unwrap().len(), 5);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn duplicate_completion_for_finalized_task_is_dropped() {
    let (pool, db_name) = create_test_db().await;

    let step = FixedStep {
        thread_count: 1,
        items: vec![serde_json::json!("only")],
    };
    let executor = Arc::new(RecordingExecutor::default());
    let statistics = Arc::new(FixedStatistics {
        statistics: DatasetStatistics {
            byte_size: 1024,
            feature_count: 1,
            max_version: 1,
        },
    });

    let mut engine = TaskedStepEngine::new(
        step,
        pool.clone(),
        "public",
        "dup_step",
        "space-a",
        executor,
        statistics,
    );

    engine.execute(false).await.unwrap();
    let complete = engine.on_async_update(event(1)).await.unwrap();
    assert!(complete);
    assert_eq!(engine.state(), StepState::Completed);

    // A second delivery for the same, already-finalized task is an anomaly,
    // not an error, and must not flip the step back out of Completed.
    let again = engine.on_async_update(event(1)).await.unwrap();
    assert!(!again);
    assert_eq!(engine.state(), StepState::Completed);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn empty_task_set_completes_immediately() {
    let (pool, db_name) = create_test_db().await;

    let step = FixedStep {
        thread_count: 4,
        items: vec![],
    };
    let executor = Arc::new(RecordingExecutor::default());
    let statistics = Arc::new(FixedStatistics {
        statistics: DatasetStatistics {
            byte_size: 0,
            feature_count: 0,
            max_version: 1,
        },
    });

    let mut engine = TaskedStepEngine::new(
        step,
        pool.clone(),
        "public",
        "empty_step",
        "space-a",
        executor.clone(),
        statistics,
    );

    engine.execute(false).await.unwrap();
    assert!(executor.submitted.lock().unwrap().is_empty());
    assert_eq!(engine.state(), StepState::Completed);

    pool.close().await;
    drop_test_db(&db_name).await;
}
