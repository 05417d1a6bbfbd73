use super::*;
use std::sync::atomic::AtomicBool;

/// Transcribe handler tracking how many items run at once; items equal to
/// "bad" fail permanently
fn tracking_registry(in_flight: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> TaskRegistry {
    TaskRegistry::new().register_fn(TaskKind::Transcribe, move |ctx: TaskContext| {
        let (in_flight, peak) = (in_flight.clone(), peak.clone());
        async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);

            match ctx.arg(0) {
                Some(Value::String(s)) if s == "bad" => Err(TaskError::permanent("unreadable clip")),
                other => Ok(json!({ "clip": other.cloned() })),
            }
        }
    })
}

#[tokio::test]
async fn batch_bounds_concurrency_and_counts_outcomes() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let engine = create_test_engine(tracking_registry(in_flight, peak.clone())).await;
    let mut events = engine.subscribe();

    let id = engine
        .submit_batch(
            BatchRequest::new(
                TaskKind::Transcribe,
                [json!("a"), json!("bad"), json!("c"), json!("bad"), json!("e")],
            )
            .concurrency(2)
            .user("user-42"),
        )
        .unwrap();
    let batch = wait_for_batch(&engine, id).await;

    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.succeeded_count, 3);
    assert_eq!(batch.failed_count, 2);
    assert_eq!(batch.success_rate(), 60.0);
    assert_eq!(batch.progress_percent(), 100.0);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);

    let statuses: Vec<ItemStatus> = batch.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        [
            ItemStatus::Succeeded,
            ItemStatus::Failed,
            ItemStatus::Succeeded,
            ItemStatus::Failed,
            ItemStatus::Succeeded,
        ]
    );
    assert_eq!(batch.results[0].result, Some(json!({ "clip": "a" })));
    assert_eq!(
        batch.results[1].error.as_ref().map(|e| e.message.as_str()),
        Some("unreadable clip")
    );

    let finished: Vec<(BatchStatus, usize, usize)> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            Event::BatchFinished {
                status,
                succeeded,
                failed,
                ..
            } => Some((status, succeeded, failed)),
            _ => None,
        })
        .collect();
    assert_eq!(finished, [(BatchStatus::Completed, 3, 2)]);
}

#[tokio::test]
async fn items_receive_their_value_and_batch_position() {
    let registry = TaskRegistry::new().register_fn(TaskKind::ExtractAudio, |ctx: TaskContext| async move {
        Ok::<_, TaskError>(json!({
            "item": ctx.arg(0).cloned(),
            "batch_id": ctx.kwarg("batch_id").cloned(),
            "item_index": ctx.kwarg("item_index").cloned(),
            "format": ctx.kwarg("format").cloned(),
        }))
    });
    let engine = create_test_engine(registry).await;

    let id = engine
        .submit_batch(
            BatchRequest::new(TaskKind::ExtractAudio, [json!("x.mp4"), json!("y.mp4")])
                .kwarg("format", "wav"),
        )
        .unwrap();
    let batch = wait_for_batch(&engine, id).await;

    assert_eq!(
        batch.results[1].result,
        Some(json!({
            "item": "y.mp4",
            "batch_id": id.get(),
            "item_index": 1,
            "format": "wav",
        }))
    );
    let task = engine.get_task(batch.results[0].task_id.unwrap()).unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn cancelling_a_batch_stops_scheduling_new_items() {
    let started = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));
    let (s, r) = (started.clone(), release.clone());
    let registry = TaskRegistry::new().register_fn(TaskKind::Transcribe, move |_ctx: TaskContext| {
        let (started, release) = (s.clone(), r.clone());
        async move {
            started.fetch_add(1, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok::<_, TaskError>(Value::Null)
        }
    });
    let engine = create_test_engine(registry).await;

    let id = engine
        .submit_batch(BatchRequest::new(TaskKind::Transcribe, (0..6).map(|i| json!(i))).concurrency(1))
        .unwrap();
    wait_until(|| started.load(Ordering::SeqCst) == 1).await;

    assert_eq!(engine.cancel_batch(id).unwrap(), BatchStatus::Running);
    release.store(true, Ordering::SeqCst);
    let batch = wait_for_batch(&engine, id).await;

    assert_eq!(batch.status, BatchStatus::Cancelled);
    assert!(batch.cancel_requested);
    assert_eq!(batch.results[0].status, ItemStatus::Succeeded);
    assert!(
        batch.results[1..]
            .iter()
            .all(|r| r.status == ItemStatus::Cancelled && r.task_id.is_none())
    );
    assert_eq!(started.load(Ordering::SeqCst), 1);

    // a second cancel is a no-op on the terminal batch
    assert_eq!(engine.cancel_batch(id).unwrap(), BatchStatus::Cancelled);
}

#[tokio::test]
async fn empty_batch_completes_immediately() {
    let engine = create_test_engine(tracking_registry(Default::default(), Default::default())).await;

    let id = engine
        .submit_batch(BatchRequest::new(TaskKind::Transcribe, []))
        .unwrap();
    let batch = wait_for_batch(&engine, id).await;

    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.succeeded_count, 0);
    assert_eq!(batch.progress_percent(), 100.0);
    assert!(engine.list_tasks(None).is_empty());
}

#[tokio::test]
async fn batch_submission_is_validated() {
    let engine = create_test_engine(tracking_registry(Default::default(), Default::default())).await;
    let max = engine.config().batch.max_concurrency;

    for limit in [0, max + 1] {
        assert!(matches!(
            engine.submit_batch(BatchRequest::new(TaskKind::Transcribe, [json!(1)]).concurrency(limit)),
            Err(Error::InvalidRequest(_))
        ));
    }
    assert!(matches!(
        engine.submit_batch(BatchRequest::new(TaskKind::Publish, [json!(1)])),
        Err(Error::NoHandler(_))
    ));
    assert!(matches!(
        engine.submit_batch(BatchRequest::new(TaskKind::Publish, [])),
        Err(Error::NoHandler(_))
    ));
    assert!(matches!(
        engine.submit_batch(BatchRequest::new(TaskKind::Transcribe, [json!(1)]).queue("nowhere")),
        Err(Error::UnknownQueue(_))
    ));
    assert!(matches!(
        engine.get_batch(crate::types::BatchId(404)),
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn batches_are_listed_per_user() {
    let engine = create_test_engine(tracking_registry(Default::default(), Default::default())).await;

    let first = engine
        .submit_batch(BatchRequest::new(TaskKind::Transcribe, [json!(1)]).user("alice"))
        .unwrap();
    engine
        .submit_batch(BatchRequest::new(TaskKind::Transcribe, [json!(2)]).user("bob"))
        .unwrap();
    let second = engine
        .submit_batch(BatchRequest::new(TaskKind::Transcribe, [json!(3)]).user("alice"))
        .unwrap();

    let ids: Vec<_> = engine.batches_for_user("alice").iter().map(|b| b.id).collect();
    assert_eq!(ids, [first, second]);
    assert!(engine.batches_for_user("carol").is_empty());
}
