use super::*;

/// Generic handler that appends its `step` kwarg to the upstream array;
/// Transcribe fails permanently when `fail` is set, otherwise returns `n`
fn pipeline_registry() -> TaskRegistry {
    TaskRegistry::new()
        .register_fn(TaskKind::Generic, |ctx: TaskContext| async move {
            let mut seen = ctx
                .arg(0)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            seen.push(ctx.kwarg("step").cloned().unwrap_or(Value::Null));
            Ok::<_, TaskError>(Value::Array(seen))
        })
        .register_fn(TaskKind::Transcribe, |ctx: TaskContext| async move {
            if ctx.kwarg("fail").is_some() {
                return Err(TaskError::permanent("corrupt audio"));
            }
            Ok(ctx.kwarg("n").cloned().unwrap_or(Value::Null))
        })
}

fn step(name: &str) -> Composition {
    Composition::task(TaskRequest::new(TaskKind::Generic).kwarg("step", name))
}

fn member(n: i64) -> Composition {
    Composition::task(TaskRequest::new(TaskKind::Transcribe).kwarg("n", n))
}

fn failing_member() -> Composition {
    Composition::task(TaskRequest::new(TaskKind::Transcribe).kwarg("fail", true))
}

#[tokio::test]
async fn chain_feeds_each_result_into_the_next_step() {
    let engine = create_test_engine(pipeline_registry()).await;
    let mut events = engine.subscribe();

    let id = engine
        .submit_workflow(Composition::chain([step("ingest"), step("extract"), step("transcribe")]))
        .unwrap();
    let snapshot = wait_for_workflow(&engine, id).await;

    assert_eq!(snapshot.status, WorkflowStatus::Succeeded);
    assert_eq!(snapshot.result, Some(json!(["ingest", "extract", "transcribe"])));
    assert_eq!(snapshot.progress_percent, 100.0);
    assert_eq!(snapshot.steps.len(), 3);
    assert!(
        snapshot
            .steps
            .iter()
            .all(|s| s.status == WorkflowStatus::Succeeded && s.task_ids.len() == 1)
    );
    assert!(snapshot.finished_at.is_some());

    // steps ran strictly one after another
    let starts: Vec<TaskId> = drain_events(&mut events)
        .iter()
        .filter_map(|e| match e {
            Event::TaskStarted { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    let expected: Vec<TaskId> = snapshot.steps.iter().map(|s| s.task_ids[0]).collect();
    assert_eq!(starts, expected);
}

#[tokio::test]
async fn chain_halts_at_the_first_failure() {
    let engine = create_test_engine(pipeline_registry()).await;

    let id = engine
        .submit_workflow(Composition::chain([step("ingest"), failing_member(), step("publish")]))
        .unwrap();
    let snapshot = wait_for_workflow(&engine, id).await;

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(snapshot.steps[1].status, WorkflowStatus::Failed);
    assert_eq!(snapshot.steps[2].status, WorkflowStatus::Cancelled);
    assert!(snapshot.steps[2].task_ids.is_empty());
    assert_eq!(
        snapshot.error.map(|e| e.message),
        Some("corrupt audio".to_string())
    );
    // the third step was never enqueued
    assert_eq!(engine.list_tasks(None).len(), 2);
}

#[tokio::test]
async fn chord_callback_runs_with_results_and_failure_marker() {
    let received = Arc::new(Mutex::new(None));
    let r = received.clone();
    let registry = pipeline_registry().register_fn(TaskKind::RewriteScript, move |ctx: TaskContext| {
        let received = r.clone();
        async move {
            *received.lock().unwrap() = ctx.arg(0).cloned();
            Ok::<_, TaskError>(json!("script"))
        }
    });
    let engine = create_test_engine(registry).await;

    let id = engine
        .submit_workflow(Composition::chord(
            [member(1), failing_member(), member(3)],
            TaskRequest::new(TaskKind::RewriteScript),
        ))
        .unwrap();
    let snapshot = wait_for_workflow(&engine, id).await;

    let header = received.lock().unwrap().clone().unwrap();
    let header = header.as_array().unwrap();
    assert_eq!(header.len(), 3);
    assert_eq!(header[0], json!(1));
    assert_eq!(header[1]["status"], json!("failed"));
    assert_eq!(header[1]["error"]["message"], json!("corrupt audio"));
    assert!(header[1]["task_id"].is_number());
    assert_eq!(header[2], json!(3));

    // the callback succeeded but a header member did not
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    let callbacks = engine
        .list_tasks(None)
        .into_iter()
        .filter(|t| t.kind == TaskKind::RewriteScript)
        .count();
    assert_eq!(callbacks, 1);
}

#[tokio::test]
async fn group_cancels_siblings_when_configured() {
    let registry = pipeline_registry().register_fn(TaskKind::AnalyzeSentiment, |ctx: TaskContext| async move {
        ctx.cancel.cancelled().await;
        Err::<Value, _>(TaskError::transient("interrupted"))
    });
    let engine = create_test_engine(registry).await;

    let slow = || Composition::task(TaskRequest::new(TaskKind::AnalyzeSentiment));
    let id = engine
        .submit_workflow(Composition::group_with_policy(
            [slow(), failing_member(), slow()],
            GroupFailurePolicy::CancelSiblings,
        ))
        .unwrap();
    let snapshot = wait_for_workflow(&engine, id).await;

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    let statuses: Vec<TaskStatus> = engine.list_tasks(None).iter().map(|t| t.status).collect();
    assert_eq!(statuses.len(), 3);
    assert_eq!(
        statuses.iter().filter(|s| **s == TaskStatus::Cancelled).count(),
        2
    );
}

#[tokio::test]
async fn group_lets_siblings_finish_by_default() {
    let engine = create_test_engine(pipeline_registry()).await;

    let id = engine
        .submit_workflow(Composition::group([member(1), failing_member(), member(3)]))
        .unwrap();
    let snapshot = wait_for_workflow(&engine, id).await;

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    let succeeded = engine.list_tasks(Some(TaskStatus::Succeeded)).len();
    assert_eq!(succeeded, 2);
}

#[tokio::test]
async fn nested_pipeline_runs_to_completion() {
    let registry = pipeline_registry().register_fn(TaskKind::RewriteScript, |ctx: TaskContext| async move {
        Ok::<_, TaskError>(json!({ "parts": ctx.arg(0).cloned() }))
    });
    let engine = create_test_engine(registry).await;

    let id = engine
        .submit_workflow(Composition::chain([
            step("ingest"),
            Composition::chord(
                [member(1), member(2)],
                TaskRequest::new(TaskKind::RewriteScript),
            ),
            step("publish"),
        ]))
        .unwrap();
    let snapshot = wait_for_workflow(&engine, id).await;

    assert_eq!(snapshot.status, WorkflowStatus::Succeeded);
    assert_eq!(snapshot.steps[1].label, "chord");
    assert_eq!(snapshot.steps[1].task_ids.len(), 3);
    assert_eq!(
        snapshot.steps[1].result,
        Some(json!({ "parts": [1, 2] }))
    );
    // the chord's object result is not a list, so publish starts a fresh one
    assert_eq!(snapshot.result, Some(json!(["publish"])));
}

#[tokio::test]
async fn cancelling_a_workflow_stops_running_and_pending_steps() {
    let started = Arc::new(AtomicUsize::new(0));
    let s = started.clone();
    let registry = pipeline_registry().register_fn(TaskKind::IngestVideo, move |ctx: TaskContext| {
        let started = s.clone();
        async move {
            started.fetch_add(1, Ordering::SeqCst);
            ctx.cancel.cancelled().await;
            Err::<Value, _>(TaskError::transient("download interrupted"))
        }
    });
    let engine = create_test_engine(registry).await;
    let mut events = engine.subscribe();

    let id = engine
        .submit_workflow(Composition::chain([
            Composition::task(TaskRequest::new(TaskKind::IngestVideo)),
            step("extract"),
        ]))
        .unwrap();
    wait_until(|| started.load(Ordering::SeqCst) == 1).await;

    engine.cancel_workflow(id).unwrap();
    let snapshot = wait_for_workflow(&engine, id).await;

    assert_eq!(snapshot.status, WorkflowStatus::Cancelled);
    assert_eq!(snapshot.steps[1].status, WorkflowStatus::Cancelled);
    assert_eq!(engine.list_tasks(None).len(), 1);
    let finished: Vec<WorkflowStatus> = drain_events(&mut events)
        .iter()
        .filter_map(|e| match e {
            Event::WorkflowFinished { id: w, status } if *w == id => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(finished, [WorkflowStatus::Cancelled]);
}

#[tokio::test]
async fn cancelling_queued_members_finishes_the_workflow() {
    // not started: every member stays queued
    let engine = Engine::new(test_config(), pipeline_registry()).await.unwrap();

    let id = engine
        .submit_workflow(Composition::group([member(1), member(2)]))
        .unwrap();
    assert_eq!(engine.get_workflow(id).unwrap().status, WorkflowStatus::Running);

    assert_eq!(engine.cancel_workflow(id).unwrap(), WorkflowStatus::Cancelled);
    assert!(
        engine
            .list_tasks(None)
            .iter()
            .all(|t| t.status == TaskStatus::Cancelled)
    );
}

#[tokio::test]
async fn rejected_workflows_leave_nothing_behind() {
    let engine = create_test_engine(pipeline_registry()).await;

    assert!(matches!(
        engine.submit_workflow(Composition::chain([])),
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        engine.submit_workflow(Composition::chain([
            step("ingest"),
            Composition::task(TaskRequest::new(TaskKind::Publish)),
        ])),
        Err(Error::NoHandler(_))
    ));
    assert!(engine.list_tasks(None).is_empty());
    assert!(matches!(
        engine.get_workflow(crate::types::WorkflowId(404)),
        Err(Error::NotFound(_))
    ));
}
