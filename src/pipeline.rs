//! Pipeline Module
//!
//! The `Pipeline` is the engine's front door: it owns the stage collection,
//! the dynamic tail set, and the abort/alert/closer machinery that gives the
//! whole graph a single first-error-wins failure semantics and a
//! deterministic wait-for-drain contract.

use crate::config::PipelineConfig;
use crate::connector::{
    connect_fan_in, connect_fan_out, connect_n_to_m as connector_connect_n_to_m, connect_one_to_one,
};
use crate::error::{PipelineError, Result};
use crate::stage::{ContextFn, Stage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, OnceCell};

/// Tracks one in-flight stage/merger task against the pipeline so tests (and
/// diagnostics) can confirm nothing is left running past `wait()`.
pub(crate) struct TaskGuard<T> {
    pipeline: Arc<PipelineInner<T>>,
}

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.pipeline.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct PipelineInner<T> {
    pub(crate) config: PipelineConfig,
    head: Arc<Stage<T>>,
    /// All stages in append order, head included at index 0 — mirrors the
    /// source's flat process list, including the (intentionally preserved)
    /// quirk that `fan_in`/`connect_n_to_m` source selection is a slice off
    /// the end of this flat list, head included, rather than tracking a
    /// separate "most recent branch set" concept.
    procs: Mutex<Vec<Arc<Stage<T>>>>,
    tail: Mutex<Vec<Arc<Stage<T>>>>,
    /// A bounded(1) channel used purely as a lock-free first-writer-wins
    /// gate: the first `try_send` ever to succeed is the one abort that
    /// counts, every later one observes `Full` and is dropped. The receiver
    /// is kept alive (never read from) so the channel reports `Full` rather
    /// than `Disconnected` once occupied.
    abort_gate_tx: flume::Sender<()>,
    _abort_gate_rx: flume::Receiver<()>,
    aborted_with: Mutex<Option<PipelineError>>,
    alert_tx: watch::Sender<bool>,
    closer_rx: Mutex<Option<flume::Receiver<()>>>,
    started: OnceCell<()>,
    active_tasks: AtomicUsize,
}

impl<T: Send + 'static> PipelineInner<T> {
    pub(crate) fn task_guard(self: Arc<Self>) -> TaskGuard<T> {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        TaskGuard { pipeline: self }
    }

    pub(crate) fn global_alert_receiver(&self) -> watch::Receiver<bool> {
        self.alert_tx.subscribe()
    }

    /// Best-effort, non-blocking, safe to call from any task including one
    /// already inside a stage worker. Only the first call across the whole
    /// pipeline has any effect — later calls see the gate already closed and
    /// are silently absorbed. The winning call records the error, fires the
    /// broadcast alert, and closes every stage synchronously, so by the time
    /// this function returns the abort is fully visible to any caller that
    /// subsequently checks `aborted_with` or drains a closer channel.
    pub(crate) fn abort(&self, err: impl Into<PipelineError>) {
        if self.abort_gate_tx.try_send(()).is_err() {
            return;
        }

        let err = err.into();
        tracing::error!(error = %err, "pipeline aborted");
        *self.aborted_with.lock().expect("aborted_with mutex poisoned") = Some(err);
        let _ = self.alert_tx.send(true);
        self.shutdown();
    }

    fn shutdown(&self) {
        let procs = self.procs.lock().expect("procs mutex poisoned").clone();
        for stage in procs {
            stage.close();
        }
    }
}

/// A directed acyclic graph of stages. Build it with [`Pipeline::chain`],
/// [`Pipeline::fan_out`], [`Pipeline::fan_in`], and [`Pipeline::connect_n_to_m`],
/// feed it with [`Pipeline::start`], and drain it with [`Pipeline::wait`].
///
/// `T` is the record type shared by every stage in this pipeline instance.
pub struct Pipeline<T> {
    inner: Arc<PipelineInner<T>>,
}

impl<T: Send + 'static> Default for Pipeline<T> {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl<T: Send + 'static> Pipeline<T> {
    /// Creates a new, empty pipeline. The synthetic head stage is already in
    /// place so `chain`/`fan_out` have something to connect from.
    pub fn new(config: PipelineConfig) -> Self {
        let (abort_gate_tx, abort_gate_rx) = flume::bounded(1);
        let (alert_tx, _alert_rx) = watch::channel(false);
        let capacity = config.channel_capacity;

        let inner = Arc::new_cyclic(|weak| {
            let head = Stage::new_head(weak.clone(), capacity);
            PipelineInner {
                config,
                procs: Mutex::new(vec![head.clone()]),
                tail: Mutex::new(vec![head.clone()]),
                head,
                abort_gate_tx,
                _abort_gate_rx: abort_gate_rx,
                aborted_with: Mutex::new(None),
                alert_tx,
                closer_rx: Mutex::new(None),
                started: OnceCell::new(),
                active_tasks: AtomicUsize::new(0),
            }
        });

        Self { inner }
    }

    fn ensure_not_started(&self) -> Result<()> {
        if self.inner.started.initialized() {
            Err(PipelineError::AlreadyStarted)
        } else {
            Ok(())
        }
    }

    /// Appends one stage, linked to the pipeline's current tail.
    pub fn chain(&self, f: Arc<dyn ContextFn<T>>) -> Result<()> {
        self.ensure_not_started()?;
        let mut procs = self.inner.procs.lock().expect("procs mutex poisoned");
        let upstream = procs.last().cloned().ok_or(PipelineError::NoPredecessor)?;

        let stage = connect_one_to_one(&self.inner, &upstream, format!("stage[{}]", procs.len()), f);
        procs.push(stage.clone());
        *self.inner.tail.lock().expect("tail mutex poisoned") = vec![stage];
        Ok(())
    }

    /// Appends `n` parallel stages, all competing for records from the
    /// current tail's outbound queue.
    pub fn fan_out(&self, f: Arc<dyn ContextFn<T>>, n: usize) -> Result<()> {
        self.ensure_not_started()?;
        let mut procs = self.inner.procs.lock().expect("procs mutex poisoned");
        let upstream = procs.last().cloned().ok_or(PipelineError::NoPredecessor)?;

        let prefix = format!("fanout[{}]", procs.len());
        let stages = connect_fan_out(&self.inner, &upstream, &prefix, f, n);
        procs.extend(stages.iter().cloned());
        *self.inner.tail.lock().expect("tail mutex poisoned") = stages;
        Ok(())
    }

    /// Appends one stage fed by a merge queue collecting records from the
    /// last `n` appended stages.
    pub fn fan_in(&self, n: usize, f: Arc<dyn ContextFn<T>>) -> Result<()> {
        self.ensure_not_started()?;
        let mut procs = self.inner.procs.lock().expect("procs mutex poisoned");
        if procs.len() < n {
            return Err(PipelineError::InsufficientSources {
                requested: n,
                available: procs.len(),
            });
        }

        let sources = procs[procs.len() - n..].to_vec();
        let name = format!("fanin[{}]", procs.len());
        let stage = connect_fan_in(&self.inner, sources, name, f);
        procs.push(stage.clone());
        *self.inner.tail.lock().expect("tail mutex poisoned") = vec![stage];
        Ok(())
    }

    /// Appends `m` stages, all competing for records from a merge queue
    /// collecting records from the last `n` appended stages.
    pub fn connect_n_to_m(&self, n: usize, m: usize, f: Arc<dyn ContextFn<T>>) -> Result<()> {
        self.ensure_not_started()?;
        let mut procs = self.inner.procs.lock().expect("procs mutex poisoned");
        if procs.len() < n {
            return Err(PipelineError::InsufficientSources {
                requested: n,
                available: procs.len(),
            });
        }

        let sources = procs[procs.len() - n..].to_vec();
        let prefix = format!("bridge[{}]", procs.len());
        let stages = connector_connect_n_to_m(&self.inner, sources, &prefix, f, m);
        procs.extend(stages.iter().cloned());
        *self.inner.tail.lock().expect("tail mutex poisoned") = stages;
        Ok(())
    }

    /// Submits one record into the head of the pipeline. On the very first
    /// call, finalizes the tail wiring (sizing and attaching the closer
    /// channel) before forwarding the record.
    pub async fn start(&self, record: T) {
        let inner = &self.inner;
        inner
            .started
            .get_or_init(|| async {
                let tail = inner.tail.lock().expect("tail mutex poisoned").clone();
                let (closer_tx, closer_rx) = flume::bounded(tail.len());
                for stage in &tail {
                    stage.set_closer(closer_tx.clone());
                }
                *inner.closer_rx.lock().expect("closer mutex poisoned") = Some(closer_rx);
            })
            .await;

        inner.head.send(record).await;
    }

    /// Signals end-of-input and waits for every tail stage to drain.
    /// Returns the first captured abort error, if any.
    pub async fn wait(&self) -> Result<()> {
        self.inner.head.close();

        if !self.inner.started.initialized() {
            return Ok(());
        }

        let closer_rx = self
            .inner
            .closer_rx
            .lock()
            .expect("closer mutex poisoned")
            .clone()
            .expect("closer channel wired by start()");
        let tail_len = self.inner.tail.lock().expect("tail mutex poisoned").len();

        for _ in 0..tail_len {
            let _ = closer_rx.recv_async().await;
        }

        self.captured_error()
    }

    /// Like [`Pipeline::wait`], but aborts with a timeout error if any tail
    /// takes longer than `dur` to signal completion. Still drains the full
    /// expected count of closer signals before returning, so teardown always
    /// completes.
    pub async fn wait_with_timeout(&self, dur: Duration) -> Result<()> {
        self.inner.head.close();

        if !self.inner.started.initialized() {
            return Ok(());
        }

        let closer_rx = self
            .inner
            .closer_rx
            .lock()
            .expect("closer mutex poisoned")
            .clone()
            .expect("closer channel wired by start()");
        let tail_len = self.inner.tail.lock().expect("tail mutex poisoned").len();

        for _ in 0..tail_len {
            if tokio::time::timeout(dur, closer_rx.recv_async()).await.is_err() {
                self.inner.abort(PipelineError::Timeout);
            }
        }

        self.captured_error()
    }

    /// Sends `err` into the abort channel. First caller across the whole
    /// pipeline wins; later calls (from any task) are silently absorbed.
    pub fn abort(&self, err: impl Into<anyhow::Error>) {
        self.inner.abort(err.into());
    }

    /// Number of stage/merger tasks still tracked as running. Zero once
    /// `wait`/`wait_with_timeout` has fully drained the pipeline — exposed
    /// mainly for tests asserting no tasks are leaked.
    pub fn active_task_count(&self) -> usize {
        self.inner.active_tasks.load(Ordering::SeqCst)
    }

    fn captured_error(&self) -> Result<()> {
        match self
            .inner
            .aborted_with
            .lock()
            .expect("aborted_with mutex poisoned")
            .take()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
