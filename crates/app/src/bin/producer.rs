use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use orderflow_app::run_producer;
use orderflow_infra::PipelineConfig;
use orderflow_infra::event_bus::RedisStreamsPublisher;
use orderflow_pipeline::ShutdownSignal;

/// Publish random orders to the orders stream.
#[derive(Parser, Debug)]
#[command(name = "order-producer")]
#[command(about = "Publish random orders to Redis Streams", long_about = None)]
struct Cli {
    /// Number of orders to send
    #[arg(default_value_t = 50)]
    count: u64,

    /// Delay between orders, in milliseconds
    #[arg(default_value_t = 1000)]
    delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_observability::init();
    let cli = Cli::parse();

    let config = PipelineConfig::from_env().context("loading configuration")?;
    let publisher = RedisStreamsPublisher::new(&config.redis_url)
        .context("creating publisher")?
        .with_partitions(config.orders_stream.clone(), config.partitions);

    let signal = ShutdownSignal::new();
    let stop = signal.clone();
    let topic = config.orders_stream.clone();
    let delay = Duration::from_millis(cli.delay_ms);
    let count = cli.count;
    let mut run =
        tokio::task::spawn_blocking(move || run_producer(&publisher, &topic, count, delay, &signal));

    let finished = tokio::select! {
        report = &mut run => Some(report.context("producer task failed")?),
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            info!("stop requested");
            stop.request_stop();
            None
        }
    };
    let report = match finished {
        Some(report) => report,
        None => run.await.context("producer task failed")?,
    };

    if report.failed > 0 {
        anyhow::bail!("{} of {} orders failed to send", report.failed, report.sent + report.failed);
    }
    Ok(())
}
