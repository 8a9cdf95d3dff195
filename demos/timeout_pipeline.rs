//! Builds a two-stage pipeline where the second stage is deliberately slow,
//! then drains it with `wait_with_timeout` to show a timeout being reported
//! as the pipeline's terminal error.

use clap::Parser;
use conduit_pipeline::{from_fn, init_tracing, Pipeline, PipelineConfig};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "timeout_pipeline")]
#[command(about = "Runs a pipeline with a deliberately slow stage and a short drain timeout")]
struct Cli {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Drain timeout in milliseconds
    #[arg(short, long, default_value_t = 50)]
    timeout_ms: u64,

    /// How long the slow stage sleeps per record, in milliseconds
    #[arg(short, long, default_value_t = 500)]
    stage_delay_ms: u64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let pipeline: Pipeline<u64> = Pipeline::new(PipelineConfig::default());

    let delay = Duration::from_millis(cli.stage_delay_ms);
    pipeline
        .chain(from_fn(move |record, ctx| async move {
            tokio::time::sleep(delay).await;
            tracing::debug!(stage = ctx.stage_name(), record, "processed");
            Ok(())
        }))
        .expect("chain");

    pipeline.start(1).await;
    pipeline.start(2).await;

    match pipeline.wait_with_timeout(Duration::from_millis(cli.timeout_ms)).await {
        Ok(()) => tracing::info!("pipeline drained within the timeout"),
        Err(err) => tracing::warn!(%err, "pipeline did not drain in time"),
    }
}
