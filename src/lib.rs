//! A concurrent data-flow pipeline engine.
//!
//! A [`Pipeline`] is built by appending stages to a running tail: [`Pipeline::chain`]
//! for a straight one-to-one link, [`Pipeline::fan_out`] to fan one stage's output
//! out to `n` competing workers, [`Pipeline::fan_in`] to merge `n` upstream stages
//! into one, and [`Pipeline::connect_n_to_m`] to bridge `n` sources into `m`
//! competing consumers. Records are submitted with [`Pipeline::start`] and the
//! whole graph is drained with [`Pipeline::wait`] or [`Pipeline::wait_with_timeout`].
//!
//! The first error returned by any stage's [`ContextFn`] (or passed to
//! [`StageContext::abort`]/[`Pipeline::abort`]) wins: it is recorded, every stage is
//! told to close, and it is the error `wait`/`wait_with_timeout` eventually return.
//! Later errors from other stages racing to the same failure are silently dropped.

mod config;
mod connector;
mod error;
mod logging;
mod pipeline;
mod stage;

pub use config::{load_config, load_config_from_str, PipelineConfig};
pub use error::{PipelineError, Result};
pub use logging::init_tracing;
pub use pipeline::Pipeline;
pub use stage::{from_fn, ContextFn, StageContext};
