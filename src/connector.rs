//! Connector Module
//!
//! Link primitives that wire stages together: a straight one-to-one
//! connection, a fan-out (one producer, `n` competing consumers), and a
//! merge (`n` producers forwarded into one queue, consumed by one or `m`
//! competing consumers). `fan_in`/`connect_n_to_m` share the same merger —
//! the only difference is how many stages read the merge queue afterward.

use crate::pipeline::PipelineInner;
use crate::stage::{ContextFn, Stage};
use std::sync::{Arc, Weak};
use tokio::task::JoinSet;

/// Spawns `stage.run()` on the tokio runtime, tracking it against the
/// pipeline's active-task counter so tests can assert no tasks are leaked
/// past `wait()`.
pub(crate) fn spawn_stage_worker<T: Send + 'static>(
    pipeline: &Arc<PipelineInner<T>>,
    stage: Arc<Stage<T>>,
) {
    let guard = pipeline.clone().task_guard();
    tokio::spawn(async move {
        stage.run().await;
        drop(guard);
    });
}

/// Builds one new stage reading from `upstream`'s outbound queue and
/// immediately spawns its worker task — a plain one-to-one connection, used
/// by both `chain` (n=1 downstream) and as the building block of `fan_out`.
pub(crate) fn connect_one_to_one<T: Send + 'static>(
    pipeline: &Arc<PipelineInner<T>>,
    upstream: &Arc<Stage<T>>,
    name: String,
    f: Arc<dyn ContextFn<T>>,
) -> Arc<Stage<T>> {
    let stage = Stage::new_worker(
        name,
        f,
        upstream.out_receiver(),
        Arc::downgrade(pipeline),
        pipeline.config.channel_capacity,
    );
    spawn_stage_worker(pipeline, stage.clone());
    stage
}

/// Builds `n` stages all reading from the same clone of `upstream`'s
/// outbound receiver — they compete for records (work-stealing fairness).
pub(crate) fn connect_fan_out<T: Send + 'static>(
    pipeline: &Arc<PipelineInner<T>>,
    upstream: &Arc<Stage<T>>,
    name_prefix: &str,
    f: Arc<dyn ContextFn<T>>,
    n: usize,
) -> Vec<Arc<Stage<T>>> {
    (0..n)
        .map(|i| {
            let stage = Stage::new_worker(
                format!("{name_prefix}[{i}]"),
                f.clone(),
                upstream.out_receiver(),
                Arc::downgrade(pipeline),
                pipeline.config.channel_capacity,
            );
            spawn_stage_worker(pipeline, stage.clone());
            stage
        })
        .collect()
}

/// Spawns the background merger for `fan_in`/`connect_n_to_m`: one forwarder
/// task per source, racing each source read against the pipeline's abort
/// signal, all feeding a single merge channel. The merge channel's sender is
/// dropped (closing it) once every source has closed or the pipeline aborts.
fn spawn_merger<T: Send + 'static>(pipeline: &Arc<PipelineInner<T>>, sources: Vec<Arc<Stage<T>>>) -> flume::Receiver<T> {
    let (merge_tx, merge_rx) = flume::bounded(pipeline.config.channel_capacity);
    let pipeline_weak: Weak<PipelineInner<T>> = Arc::downgrade(pipeline);
    let guard = pipeline.clone().task_guard();

    tokio::spawn(async move {
        let Some(pipeline) = pipeline_weak.upgrade() else {
            return;
        };

        let mut forwarders: JoinSet<()> = JoinSet::new();
        for source in sources {
            let tx = merge_tx.clone();
            let mut alert_rx = pipeline.global_alert_receiver();
            let rx = source.out_receiver();
            forwarders.spawn(async move {
                loop {
                    if *alert_rx.borrow() {
                        break;
                    }
                    tokio::select! {
                        biased;
                        changed = alert_rx.changed() => {
                            if changed.is_err() || *alert_rx.borrow() {
                                break;
                            }
                        }
                        received = rx.recv_async() => {
                            match received {
                                Ok(record) => {
                                    if tx.send_async(record).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    }
                }
            });
        }

        while forwarders.join_next().await.is_some() {}
        drop(merge_tx);
        drop(guard);
    });

    merge_rx
}

/// Builds the single merged stage for `fan_in`: `n` sources forwarded into
/// one merge queue, consumed by one new stage running `f`.
pub(crate) fn connect_fan_in<T: Send + 'static>(
    pipeline: &Arc<PipelineInner<T>>,
    sources: Vec<Arc<Stage<T>>>,
    name: String,
    f: Arc<dyn ContextFn<T>>,
) -> Arc<Stage<T>> {
    let merge_rx = spawn_merger(pipeline, sources);
    let stage = Stage::new_worker(
        name,
        f,
        merge_rx,
        Arc::downgrade(pipeline),
        pipeline.config.channel_capacity,
    );
    spawn_stage_worker(pipeline, stage.clone());
    stage
}

/// Builds the `m` bridged stages for `connect_n_to_m`: `n` sources forwarded
/// into one merge queue, consumed competitively by `m` new stages running `f`.
pub(crate) fn connect_n_to_m<T: Send + 'static>(
    pipeline: &Arc<PipelineInner<T>>,
    sources: Vec<Arc<Stage<T>>>,
    name_prefix: &str,
    f: Arc<dyn ContextFn<T>>,
    m: usize,
) -> Vec<Arc<Stage<T>>> {
    let merge_rx = spawn_merger(pipeline, sources);
    (0..m)
        .map(|i| {
            let stage = Stage::new_worker(
                format!("{name_prefix}[{i}]"),
                f.clone(),
                merge_rx.clone(),
                Arc::downgrade(pipeline),
                pipeline.config.channel_capacity,
            );
            spawn_stage_worker(pipeline, stage.clone());
            stage
        })
        .collect()
}
