//! End-to-end scenarios exercising the public `Pipeline` API: linear chains,
//! aborting stages, fan-out, fan-in, and N-to-M bridges.

use conduit_pipeline::{from_fn, Pipeline, PipelineConfig, PipelineError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn collecting_sink<T: Send + 'static>(sink: Arc<Mutex<Vec<T>>>) -> Arc<dyn conduit_pipeline::ContextFn<T>> {
    from_fn(move |record, _ctx| {
        let sink = sink.clone();
        async move {
            sink.lock().expect("sink mutex poisoned").push(record);
            Ok(())
        }
    })
}

#[tokio::test]
async fn linear_triple_delivers_every_record() {
    let pipeline: Pipeline<i64> = Pipeline::new(PipelineConfig::default());
    let sink = Arc::new(Mutex::new(Vec::new()));

    pipeline
        .chain(from_fn(|record: i64, ctx| async move {
            ctx.send(record * 2).await;
            Ok(())
        }))
        .unwrap();
    pipeline
        .chain(from_fn(|record: i64, ctx| async move {
            ctx.send(record * record).await;
            Ok(())
        }))
        .unwrap();
    pipeline.chain(collecting_sink(sink.clone())).unwrap();

    for record in 0..5 {
        pipeline.start(record).await;
    }

    assert!(pipeline.wait().await.is_ok());

    let mut seen: Vec<i64> = sink.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 4, 16, 36, 64]);
    assert_eq!(pipeline.active_task_count(), 0);
}

#[tokio::test]
async fn controlled_error_is_reported_by_wait() {
    let pipeline: Pipeline<i64> = Pipeline::new(PipelineConfig::default());
    let sink = Arc::new(Mutex::new(Vec::new()));

    pipeline
        .chain(from_fn(|record: i64, ctx| async move {
            ctx.send(record * 2).await;
            Ok(())
        }))
        .unwrap();
    pipeline
        .chain(from_fn(|record: i64, ctx| async move {
            if record == 2 {
                anyhow::bail!("test error");
            }
            ctx.send(record).await;
            Ok(())
        }))
        .unwrap();
    pipeline.chain(collecting_sink(sink.clone())).unwrap();

    for record in 0..5 {
        pipeline.start(record).await;
    }

    let err = pipeline.wait().await.expect_err("expected an aborted pipeline");
    assert!(err.to_string().contains("test error"), "unexpected error: {err}");
}

#[tokio::test]
async fn fan_out_of_four_covers_every_branch() {
    let pipeline: Pipeline<i64> = Pipeline::new(PipelineConfig::default());
    let sink = Arc::new(Mutex::new(Vec::new()));

    pipeline
        .chain(from_fn(|record: i64, ctx| async move {
            ctx.send(record * 2).await;
            Ok(())
        }))
        .unwrap();
    pipeline.fan_out(collecting_sink(sink.clone()), 4).unwrap();

    for record in 0..10 {
        pipeline.start(record).await;
    }

    assert!(pipeline.wait().await.is_ok());

    let seen: HashSet<i64> = sink.lock().unwrap().iter().copied().collect();
    let expected: HashSet<i64> = (0..10).map(|n| n * 2).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn fan_out_then_fan_in_delivers_every_record_once() {
    let pipeline: Pipeline<i64> = Pipeline::new(PipelineConfig::default());
    let sink = Arc::new(Mutex::new(Vec::new()));

    pipeline
        .chain(from_fn(|record: i64, ctx| async move {
            ctx.send(record * 2).await;
            Ok(())
        }))
        .unwrap();
    pipeline
        .fan_out(
            from_fn(|record: i64, ctx| async move {
                ctx.send(record * record).await;
                Ok(())
            }),
            4,
        )
        .unwrap();
    pipeline.fan_in(4, collecting_sink(sink.clone())).unwrap();

    for record in 0..10 {
        pipeline.start(record).await;
    }

    assert!(pipeline.wait().await.is_ok());
    assert_eq!(sink.lock().unwrap().len(), 10);
}

#[tokio::test]
async fn n_to_m_bridge_delivers_every_record_once() {
    let pipeline: Pipeline<i64> = Pipeline::new(PipelineConfig::default());
    let sink = Arc::new(Mutex::new(Vec::new()));

    pipeline
        .chain(from_fn(|record: i64, ctx| async move {
            ctx.send(record * 2).await;
            Ok(())
        }))
        .unwrap();
    pipeline
        .fan_out(
            from_fn(|record: i64, ctx| async move {
                ctx.send(record * record).await;
                Ok(())
            }),
            4,
        )
        .unwrap();
    pipeline
        .connect_n_to_m(
            4,
            7,
            from_fn(|record: i64, ctx| async move {
                ctx.send(record * record).await;
                Ok(())
            }),
        )
        .unwrap();
    pipeline.fan_in(7, collecting_sink(sink.clone())).unwrap();

    for record in 0..10 {
        pipeline.start(record).await;
    }

    assert!(pipeline.wait().await.is_ok());
    assert_eq!(sink.lock().unwrap().len(), 10);
}

#[tokio::test]
async fn wait_with_timeout_reports_timeout_on_a_stuck_stage() {
    let pipeline: Pipeline<i64> = Pipeline::new(PipelineConfig::default());

    pipeline
        .chain(from_fn(|record: i64, ctx| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ctx.send(record).await;
            Ok(())
        }))
        .unwrap();

    pipeline.start(1).await;

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        pipeline.wait_with_timeout(Duration::from_millis(50)),
    )
    .await
    .expect("wait_with_timeout itself should return well within 1s");

    assert!(matches!(result, Err(PipelineError::Timeout)));
}

#[tokio::test]
async fn concurrent_aborts_resolve_to_exactly_one_error() {
    let pipeline: Pipeline<i64> = Pipeline::new(PipelineConfig::default());

    pipeline
        .chain(from_fn(|record: i64, ctx| async move {
            ctx.send(record).await;
            Ok(())
        }))
        .unwrap();
    pipeline
        .fan_out(
            from_fn(|record: i64, ctx| async move {
                // Every branch races to abort on its very first record, so
                // `wait()` must surface exactly one of these, never a panic,
                // a deadlock, or a hang.
                ctx.abort(anyhow::anyhow!("branch error {record}"));
                Ok(())
            }),
            4,
        )
        .unwrap();

    for record in 0..4 {
        pipeline.start(record).await;
    }

    let err = tokio::time::timeout(Duration::from_secs(5), pipeline.wait())
        .await
        .expect("wait() must not hang")
        .expect_err("expected an aborted pipeline");

    let msg = err.to_string();
    assert!(
        (0..4).any(|branch| msg == format!("branch error {branch}")),
        "unexpected error: {msg}"
    );
}

#[tokio::test]
async fn topology_mutation_after_start_is_rejected() {
    let pipeline: Pipeline<i64> = Pipeline::new(PipelineConfig::default());
    let sink = Arc::new(Mutex::new(Vec::new()));
    pipeline.chain(collecting_sink(sink.clone())).unwrap();

    pipeline.start(1).await;

    let err = pipeline
        .chain(from_fn(|_: i64, _ctx| async move { Ok(()) }))
        .expect_err("chaining after start must fail");
    assert!(matches!(err, PipelineError::AlreadyStarted));

    assert!(pipeline.wait().await.is_ok());
    assert_eq!(sink.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn draining_an_empty_pipeline_is_ok() {
    let pipeline: Pipeline<i64> = Pipeline::new(PipelineConfig::default());
    assert!(pipeline.wait().await.is_ok());
}

#[tokio::test]
async fn fan_in_with_insufficient_sources_is_rejected_without_mutating_state() {
    let pipeline: Pipeline<i64> = Pipeline::new(PipelineConfig::default());
    let err = pipeline
        .fan_in(2, from_fn(|_: i64, _ctx| async move { Ok(()) }))
        .expect_err("fan_in with insufficient sources must fail");
    assert!(matches!(
        err,
        PipelineError::InsufficientSources {
            requested: 2,
            available: 1
        }
    ));

    // The rejected call must not have appended anything: a plain chain still
    // succeeds afterward, proving the stage collection was left untouched.
    pipeline
        .chain(from_fn(|_: i64, _ctx| async move { Ok(()) }))
        .expect("chain after a rejected fan_in must still succeed");
    assert!(pipeline.wait().await.is_ok());
}
