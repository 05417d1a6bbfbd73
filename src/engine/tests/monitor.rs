use super::*;

fn flaky_registry(fail_first: usize) -> TaskRegistry {
    let runs = Arc::new(AtomicUsize::new(0));
    TaskRegistry::new()
        .register_fn(TaskKind::Publish, move |_ctx: TaskContext| {
            let runs = runs.clone();
            async move {
                if runs.fetch_add(1, Ordering::SeqCst) < fail_first {
                    return Err(TaskError::permanent("upload rejected"));
                }
                Ok(json!("published"))
            }
        })
        .register_fn(TaskKind::Transcribe, |_ctx: TaskContext| async move {
            Ok::<_, TaskError>(json!("text"))
        })
}

#[tokio::test]
async fn manual_retry_resubmits_a_failed_task_once() {
    let engine = create_test_engine(flaky_registry(1)).await;

    let id = engine
        .submit_task(TaskRequest::new(TaskKind::Publish).kwarg("video", "v1"))
        .unwrap();
    let failed = wait_for_task(&engine, id).await;
    assert_eq!(failed.status, TaskStatus::Failed);

    let new_id = engine.retry(id).unwrap();
    assert_ne!(new_id, id);
    let fresh = wait_for_task(&engine, new_id).await;
    assert_eq!(fresh.status, TaskStatus::Succeeded);
    assert_eq!(fresh.attempt, 0);
    assert_eq!(fresh.input, failed.input);

    let old = engine.get_task(id).unwrap();
    assert_eq!(old.status, TaskStatus::Failed);
    assert_eq!(old.superseded_by, Some(new_id));

    // already retried, and a succeeded task is not retryable
    assert!(matches!(engine.retry(id), Err(Error::InvalidState { .. })));
    assert!(matches!(engine.retry(new_id), Err(Error::InvalidState { .. })));
    assert!(matches!(engine.retry(TaskId(404)), Err(Error::NotFound(_))));
}

#[tokio::test]
async fn cancel_before_start_and_cancel_after_finish() {
    // not started, so submitted tasks stay queued
    let engine = Engine::new(test_config(), flaky_registry(0)).await.unwrap();
    let mut events = engine.subscribe();

    let id = engine
        .submit_task(TaskRequest::new(TaskKind::Transcribe))
        .unwrap();
    assert_eq!(engine.cancel(id, false).unwrap(), TaskStatus::Cancelled);
    assert_eq!(engine.get_task(id).unwrap().status, TaskStatus::Cancelled);
    assert!(engine.queue_stats().iter().all(|q| q.ready == 0));

    // repeated cancel is a no-op
    assert_eq!(engine.cancel(id, true).unwrap(), TaskStatus::Cancelled);
    let cancelled = drain_events(&mut events)
        .iter()
        .filter(|e| matches!(e, Event::TaskCancelled { .. }))
        .count();
    assert_eq!(cancelled, 1);

    // the cancelled task never runs once workers start
    engine.start().unwrap();
    let done = engine
        .submit_task(TaskRequest::new(TaskKind::Transcribe))
        .unwrap();
    assert_eq!(wait_for_task(&engine, done).await.status, TaskStatus::Succeeded);
    assert_eq!(engine.cancel(done, false).unwrap(), TaskStatus::Succeeded);
    assert_eq!(engine.get_task(id).unwrap().started_at, None);

    assert!(matches!(engine.cancel(TaskId(404), false), Err(Error::NotFound(_))));
}

#[tokio::test]
async fn queue_and_pool_stats_reflect_the_backlog() {
    let engine = Engine::new(test_config(), flaky_registry(0)).await.unwrap();
    assert!(engine.pool_stats().is_empty());

    engine
        .submit_task(TaskRequest::new(TaskKind::Transcribe))
        .unwrap();
    engine
        .submit_task(TaskRequest::new(TaskKind::Transcribe).priority(Priority::MAX))
        .unwrap();
    engine
        .submit_task(TaskRequest::new(TaskKind::Transcribe).countdown(Duration::from_secs(3600)))
        .unwrap();

    let stats = engine.queue_stats();
    let names: Vec<&str> = stats.iter().map(|q| q.name.as_str()).collect();
    assert_eq!(names, ["ai_processing", "default", "publishing", "video_processing"]);
    let ai = &stats[0];
    assert_eq!((ai.ready, ai.delayed, ai.leased), (2, 1, 0));

    engine.start().unwrap();
    wait_until(|| engine.list_tasks(Some(TaskStatus::Succeeded)).len() == 2).await;

    let pools = engine.pool_stats();
    assert_eq!(pools.len(), 4);
    let ai_pool = pools.iter().find(|p| p.queue == "ai_processing").unwrap();
    assert_eq!(ai_pool.workers, 4);
    wait_until(|| {
        engine
            .pool_stats()
            .iter()
            .any(|p| p.queue == "ai_processing" && p.completed == 2)
    })
    .await;
    assert_eq!(engine.queue_stats()[0].delayed, 1);
}

#[tokio::test]
async fn list_tasks_filters_by_status() {
    let engine = create_test_engine(flaky_registry(1)).await;

    let failed = engine.submit_task(TaskRequest::new(TaskKind::Publish)).unwrap();
    wait_for_task(&engine, failed).await;
    let ok = engine.submit_task(TaskRequest::new(TaskKind::Transcribe)).unwrap();
    wait_for_task(&engine, ok).await;

    let all: Vec<TaskId> = engine.list_tasks(None).iter().map(|t| t.id).collect();
    assert_eq!(all, [failed, ok]);
    let only_failed: Vec<TaskId> = engine
        .list_tasks(Some(TaskStatus::Failed))
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(only_failed, [failed]);
}

#[tokio::test]
async fn terminal_tasks_are_archived_to_history() {
    let (engine, _dir) = create_test_engine_with_history(flaky_registry(1)).await;

    let failed = engine
        .submit_task(TaskRequest::new(TaskKind::Publish).kwarg("video", "v1"))
        .unwrap();
    wait_for_task(&engine, failed).await;
    let ok = engine.submit_task(TaskRequest::new(TaskKind::Transcribe)).unwrap();
    wait_for_task(&engine, ok).await;

    // archiving is write-behind
    let mut archived = 0;
    for _ in 0..500 {
        archived = engine.count_history(None).await.unwrap();
        if archived == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(archived, 2);
    assert_eq!(engine.count_history(Some(TaskStatus::Failed)).await.unwrap(), 1);

    let entry = engine.task_history(failed).await.unwrap().unwrap();
    assert_eq!(entry.task_id, failed);
    assert_eq!(entry.kind, Some(TaskKind::Publish));
    assert_eq!(entry.status, TaskStatus::Failed);
    assert_eq!(entry.input["kwargs"]["video"], json!("v1"));
    assert_eq!(
        entry.error.map(|e| (e.kind, e.message)),
        Some((FailureKind::Permanent, "upload rejected".to_string()))
    );

    let succeeded = engine
        .query_history(Some(TaskStatus::Succeeded), 10, 0)
        .await
        .unwrap();
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].result, Some(json!("text")));
    assert!(engine.task_history(TaskId(404)).await.unwrap().is_none());
}

#[tokio::test]
async fn history_requires_a_database() {
    let engine = create_test_engine(flaky_registry(0)).await;

    assert!(engine.database().is_none());
    assert!(matches!(
        engine.count_history(None).await,
        Err(Error::Config { key: Some(ref k), .. }) if k == "persistence.database_path"
    ));
    assert!(matches!(
        engine.query_history(None, 10, 0).await,
        Err(Error::Config { .. })
    ));
}
