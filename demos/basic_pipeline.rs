//! Chains a linear pipeline, fans the middle stage out to three workers, and
//! merges the results back into a single sink — prints a running total of
//! records seen.

use clap::Parser;
use conduit_pipeline::{from_fn, init_tracing, Pipeline, PipelineConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "basic_pipeline")]
#[command(about = "Runs a chain -> fan-out -> fan-in pipeline over a fixed batch of integers")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// How many records to submit
    #[arg(short, long, default_value_t = 20)]
    count: u64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let pipeline: Pipeline<u64> = Pipeline::new(PipelineConfig::default());

    pipeline
        .chain(from_fn(|record, ctx| async move {
            tracing::debug!(stage = ctx.stage_name(), record, "doubling");
            ctx.send(record * 2).await;
            Ok(())
        }))
        .expect("chain");

    pipeline
        .fan_out(
            from_fn(|record, ctx| async move {
                tracing::debug!(stage = ctx.stage_name(), record, "incrementing");
                ctx.send(record + 1).await;
                Ok(())
            }),
            3,
        )
        .expect("fan_out");

    let total_seen = Arc::new(AtomicUsize::new(0));
    let sink_total = total_seen.clone();
    pipeline
        .fan_in(
            3,
            from_fn(move |record, ctx| {
                let sink_total = sink_total.clone();
                async move {
                    sink_total.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(stage = ctx.stage_name(), record, "sink");
                    Ok(())
                }
            }),
        )
        .expect("fan_in");

    for record in 0..cli.count {
        pipeline.start(record).await;
    }

    match pipeline.wait().await {
        Ok(()) => tracing::info!(records = total_seen.load(Ordering::SeqCst), "pipeline drained cleanly"),
        Err(err) => tracing::error!(%err, "pipeline aborted"),
    }
}
