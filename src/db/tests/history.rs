use crate::db::*;
use crate::error::TaskError;
use crate::task::{ParentRef, Task, TaskRequest};
use crate::types::{BatchId, TaskId, TaskKind, TaskStatus};
use serde_json::json;
use tempfile::NamedTempFile;

fn finished_task(id: i64, succeed: bool) -> Task {
    let request = TaskRequest::new(TaskKind::Transcribe)
        .arg("clip.wav")
        .kwarg("language", "en");
    let mut task = Task::from_request(
        TaskId(id),
        &request,
        "ai_processing".into(),
        3,
        Some(ParentRef::Batch {
            id: BatchId(9),
            index: 2,
        }),
    );
    task.start(1).unwrap();
    if succeed {
        task.succeed(json!({"text": "hello"})).unwrap();
    } else {
        task.fail(TaskError::permanent("unsupported codec")).unwrap();
    }
    task
}

#[tokio::test]
async fn test_insert_and_get_task_history() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let task = finished_task(42, true);
    let entry = NewTaskHistory::from_task(&task).unwrap();
    let id = db.insert_task_history(&entry).await.unwrap();
    assert!(id > 0);

    let archived = db.get_task_history(42).await.unwrap().unwrap();
    assert_eq!(archived.id, id);
    assert_eq!(archived.task_id, TaskId(42));
    assert_eq!(archived.kind, Some(TaskKind::Transcribe));
    assert_eq!(archived.queue, "ai_processing");
    assert_eq!(archived.priority, 5);
    assert_eq!(archived.status, TaskStatus::Succeeded);
    assert_eq!(archived.input["args"], json!(["clip.wav"]));
    assert_eq!(archived.input["kwargs"]["language"], json!("en"));
    assert_eq!(archived.result, Some(json!({"text": "hello"})));
    assert_eq!(archived.error, None);
    assert_eq!(archived.batch_id, Some(9));
    assert_eq!(archived.workflow_id, None);
    assert_eq!(archived.created_at.timestamp(), task.created_at.timestamp());

    assert!(db.get_task_history(43).await.unwrap().is_none());

    db.close().await;
}

#[tokio::test]
async fn test_failure_detail_is_preserved() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let entry = NewTaskHistory::from_task(&finished_task(1, false)).unwrap();
    db.insert_task_history(&entry).await.unwrap();

    let archived = db.get_task_history(1).await.unwrap().unwrap();
    assert_eq!(archived.status, TaskStatus::Failed);
    assert_eq!(archived.result, None);
    assert_eq!(
        archived.error,
        Some(TaskError::permanent("unsupported codec"))
    );

    db.close().await;
}

#[tokio::test]
async fn test_query_history_filters_and_paginates() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    for id in 1..=5 {
        let entry = NewTaskHistory::from_task(&finished_task(id, id % 2 == 1)).unwrap();
        db.insert_task_history(&entry).await.unwrap();
    }

    assert_eq!(db.count_history(None).await.unwrap(), 5);
    let succeeded = TaskStatus::Succeeded.to_i32();
    assert_eq!(db.count_history(Some(succeeded)).await.unwrap(), 3);
    assert_eq!(
        db.count_history(Some(TaskStatus::Failed.to_i32()))
            .await
            .unwrap(),
        2
    );

    let page1 = db.query_history(None, 2, 0).await.unwrap();
    let page2 = db.query_history(None, 2, 2).await.unwrap();
    let page3 = db.query_history(None, 2, 4).await.unwrap();
    assert_eq!(page1.len(), 2);
    assert_eq!(page2.len(), 2);
    assert_eq!(page3.len(), 1);

    let mut seen: Vec<i64> = page1
        .iter()
        .chain(&page2)
        .chain(&page3)
        .map(|e| e.task_id.get())
        .collect();
    seen.sort();
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);

    let only_ok = db.query_history(Some(succeeded), 10, 0).await.unwrap();
    assert_eq!(only_ok.len(), 3);
    assert!(only_ok.iter().all(|e| e.status == TaskStatus::Succeeded));

    db.close().await;
}
