//! Stage Module
//!
//! A `Stage` is the per-node worker in a pipeline: it owns an inbound queue,
//! a lazily-created outbound queue, and a one-shot close latch. The
//! synthetic head stage (see [`crate::pipeline::Pipeline`]) is a degenerate
//! `Stage` with no inbound queue and no user function — it exists purely so
//! callers have somewhere uniform to submit records into.

use crate::pipeline::PipelineInner;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// The user-supplied processing step for one stage.
///
/// Implementations receive one record at a time along with a [`StageContext`]
/// used to forward output downstream and to abort the pipeline. Returning
/// `Err` from `call` is equivalent to calling `ctx.abort(err)` just before
/// returning — whichever happens, the pipeline is told about at most one
/// error per call (repeated aborts are absorbed, first one wins).
#[async_trait]
pub trait ContextFn<T>: Send + Sync {
    /// Processes one record. May call `ctx.send` any number of times.
    async fn call(&self, record: T, ctx: &StageContext<T>) -> anyhow::Result<()>;
}

/// Adapts a plain async closure into a [`ContextFn`].
struct FromFn<F>(F);

#[async_trait]
impl<T, F, Fut> ContextFn<T> for FromFn<F>
where
    T: Send + 'static,
    F: Fn(T, StageContext<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, record: T, ctx: &StageContext<T>) -> anyhow::Result<()> {
        (self.0)(record, ctx.clone()).await
    }
}

/// Wraps an async closure `Fn(T, StageContext<T>) -> impl Future<Output = anyhow::Result<()>>`
/// as a [`ContextFn`], for callers who would rather not name a type.
pub fn from_fn<T, F, Fut>(f: F) -> Arc<dyn ContextFn<T>>
where
    T: Send + 'static,
    F: Fn(T, StageContext<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FromFn(f))
}

/// The outbound side of a stage: a lazily-created, closeable queue.
///
/// Created on first read or first send, not at stage construction — this
/// matters for the tail stages of a fan-out, where `n` stages each clone the
/// receiver half of the *same* channel rather than each getting their own.
enum OutboundState<T> {
    Unopened,
    Open(flume::Sender<T>, flume::Receiver<T>),
    /// Closed forever: unlike `Unopened`, sending or subscribing again must
    /// not resurrect a channel — closed stages stay closed.
    Closed,
}

struct Outbound<T> {
    capacity: usize,
    state: Mutex<OutboundState<T>>,
}

impl<T> Outbound<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(OutboundState::Unopened),
        }
    }

    /// Returns a fresh clone of the receiver, creating the channel if this is
    /// the first subscriber. If the channel was already closed, returns a
    /// receiver that reports closed immediately, rather than reopening it.
    fn receiver(&self) -> flume::Receiver<T> {
        let mut guard = self.state.lock().expect("outbound mutex poisoned");
        match &*guard {
            OutboundState::Open(_, rx) => rx.clone(),
            OutboundState::Closed => {
                let (tx, rx) = flume::bounded(self.capacity);
                drop(tx);
                rx
            }
            OutboundState::Unopened => {
                let (tx, rx) = flume::bounded(self.capacity);
                let handed_out = rx.clone();
                *guard = OutboundState::Open(tx, rx);
                handed_out
            }
        }
    }

    /// Sends a record, creating the channel if needed. Returns `false` if the
    /// channel has already been closed (the record is dropped, not delivered).
    async fn send(&self, record: T) -> bool {
        let tx = {
            let mut guard = self.state.lock().expect("outbound mutex poisoned");
            match &*guard {
                OutboundState::Open(tx, _) => Some(tx.clone()),
                OutboundState::Closed => None,
                OutboundState::Unopened => {
                    let (tx, rx) = flume::bounded(self.capacity);
                    let handed_out = tx.clone();
                    *guard = OutboundState::Open(tx, rx);
                    Some(handed_out)
                }
            }
        };

        match tx {
            Some(tx) => tx.send_async(record).await.is_ok(),
            None => false,
        }
    }

    /// Closes the channel for every receiver clone handed out by
    /// [`Outbound::receiver`], and marks this outbound permanently closed so
    /// it cannot be lazily reopened by a later send or subscribe.
    fn close(&self) {
        let mut guard = self.state.lock().expect("outbound mutex poisoned");
        *guard = OutboundState::Closed;
    }
}

/// A single node in the pipeline graph.
pub struct Stage<T> {
    name: String,
    user_fn: Option<Arc<dyn ContextFn<T>>>,
    inbound: Option<flume::Receiver<T>>,
    outbound: Outbound<T>,
    closer: Mutex<Option<flume::Sender<()>>>,
    closed: AtomicBool,
    pipeline: Weak<PipelineInner<T>>,
}

impl<T: Send + 'static> Stage<T> {
    /// Creates the synthetic head stage: no inbound queue, no user function.
    /// Submitted records are forwarded straight into its outbound queue.
    pub(crate) fn new_head(pipeline: Weak<PipelineInner<T>>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name: "head".to_string(),
            user_fn: None,
            inbound: None,
            outbound: Outbound::new(capacity),
            closer: Mutex::new(None),
            closed: AtomicBool::new(false),
            pipeline,
        })
    }

    /// Creates a worker stage fed by `inbound`, running `user_fn` per record.
    pub(crate) fn new_worker(
        name: String,
        user_fn: Arc<dyn ContextFn<T>>,
        inbound: flume::Receiver<T>,
        pipeline: Weak<PipelineInner<T>>,
        capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            user_fn: Some(user_fn),
            inbound: Some(inbound),
            outbound: Outbound::new(capacity),
            closer: Mutex::new(None),
            closed: AtomicBool::new(false),
            pipeline,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clones the outbound receiver, creating the channel if this is the
    /// first downstream reader. Multiple calls (fan-out) share one channel.
    pub(crate) fn out_receiver(&self) -> flume::Receiver<T> {
        self.outbound.receiver()
    }

    /// Forwards a record downstream. Returns `false` if downstream is closed.
    pub(crate) async fn send(&self, record: T) -> bool {
        self.outbound.send(record).await
    }

    /// Installs the Pipeline's per-tail completion channel. Called once per
    /// tail stage, during `Pipeline::start`'s one-shot wiring step.
    pub(crate) fn set_closer(&self, closer: flume::Sender<()>) {
        *self.closer.lock().expect("closer mutex poisoned") = Some(closer);
    }

    /// Idempotent: closes the outbound queue and, if this is a tail, posts
    /// once to the closer channel. Safe to call from both normal drain and
    /// abort-triggered shutdown — only the first call has any effect.
    pub(crate) fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.outbound.close();
            if let Some(closer) = self.closer.lock().expect("closer mutex poisoned").take() {
                // Sized to exactly the tail count by the pipeline; a full or
                // disconnected closer means the waiter already moved on.
                let _ = closer.try_send(());
            }
            tracing::debug!(stage = %self.name, "stage closed");
        }
    }

    /// Runs the stage's worker loop: pulls records off `inbound`, invokes
    /// `user_fn`, and exits (closing itself) once `inbound` is drained and
    /// closed. Never called for the head stage, which has no `inbound`.
    pub(crate) async fn run(self: Arc<Self>) {
        let inbound = self
            .inbound
            .clone()
            .expect("run() is only spawned for stages with an inbound queue");
        let user_fn = self
            .user_fn
            .clone()
            .expect("run() is only spawned for stages with a user function");

        tracing::debug!(stage = %self.name, "stage running");

        while let Ok(record) = inbound.recv_async().await {
            let ctx = StageContext {
                stage: self.clone(),
            };
            if let Err(err) = user_fn.call(record, &ctx).await {
                if let Some(pipeline) = self.pipeline.upgrade() {
                    pipeline.abort(err);
                }
            }
        }

        self.close();
    }
}

/// The capability handle passed to a [`ContextFn`] alongside each record.
///
/// Cheap to clone (wraps an `Arc`); a `ContextFn` impl that needs to hold
/// onto it across an `.await` boundary can clone it freely.
pub struct StageContext<T> {
    stage: Arc<Stage<T>>,
}

impl<T> Clone for StageContext<T> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage.clone(),
        }
    }
}

impl<T: Send + 'static> StageContext<T> {
    /// Forwards `record` downstream. Returns `true` if delivered, `false` if
    /// downstream has already closed (the record was dropped, not an error).
    pub async fn send(&self, record: T) -> bool {
        self.stage.send(record).await
    }

    /// Aborts the owning pipeline with `err`. First caller across the whole
    /// pipeline wins; subsequent calls (from this stage or any other) are
    /// silently absorbed.
    pub fn abort(&self, err: impl Into<anyhow::Error>) {
        if let Some(pipeline) = self.stage.pipeline.upgrade() {
            pipeline.abort(err.into());
        }
    }

    /// The name of the stage currently processing this record, for logging.
    pub fn stage_name(&self) -> &str {
        self.stage.name()
    }
}
