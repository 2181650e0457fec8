use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use orderflow_app::ConsumerPool;
use orderflow_infra::PipelineConfig;
use orderflow_infra::event_bus::{RedisStreamsConsumer, RedisStreamsPublisher};

/// Consume orders from Redis Streams with bounded retries and dead-lettering.
#[derive(Parser, Debug)]
#[command(name = "order-consumer")]
#[command(about = "Order consumer with retries, dead-lettering and live price statistics", long_about = None)]
struct Cli {
    /// Number of dispatcher threads (default: one per partition)
    #[arg(short, long, env = "ORDERFLOW_WORKERS")]
    workers: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_observability::init();
    let cli = Cli::parse();

    let config = PipelineConfig::from_env().context("loading configuration")?;
    let workers = cli.workers.unwrap_or(config.partitions);

    info!(
        redis_url = %config.redis_url,
        orders_stream = %config.orders_stream,
        dead_letter_stream = %config.dead_letter_stream,
        consumer_group = %config.consumer_group,
        partitions = config.partitions,
        workers,
        max_retries = config.max_retries,
        "order consumer starting"
    );

    let dead_letters = Arc::new(
        RedisStreamsPublisher::new(&config.redis_url).context("creating dead-letter publisher")?,
    );

    let pool = ConsumerPool::start(&config, workers, dead_letters, |index, partitions| {
        RedisStreamsConsumer::new(
            &config.redis_url,
            &config.orders_stream,
            config.partitions,
            partitions,
            config.consumer_group.clone(),
            config.worker_consumer_name(index),
        )
        .map(|c| c.with_max_poll_records(config.max_poll_records))
    })?;

    let stopper = pool.stopper();
    let mut join = tokio::task::spawn_blocking(move || pool.join());
    let mut signals = 0u32;

    let report = loop {
        tokio::select! {
            joined = &mut join => break joined.context("consumer pool task failed")?,
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for ctrl-c")?;
                signals += 1;
                if signals == 1 {
                    info!("shutdown requested, finishing in-flight batches (ctrl-c again to interrupt)");
                    stopper.shutdown();
                } else {
                    warn!("interrupt requested, in-flight batches will be redelivered");
                    stopper.interrupt();
                }
            }
        }
    };

    let failed = report.failed_workers();
    if failed > 0 {
        anyhow::bail!("{failed} of {} workers failed", report.workers.len());
    }
    info!("order consumer stopped");
    Ok(())
}
