use anyhow::{Context, Result};
use clap::Parser;

use harness_core::HarnessConfig;
use kafka_harness::EmbeddedKafka;
use kafka_harness::cli::HarnessCli;
use kafka_harness::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = HarnessCli::parse();

    let mut config = match &cli.config {
        Some(path) => HarnessConfig::from_file(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => HarnessConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    config.validate().context("invalid configuration")?;

    if cli.validate {
        println!("configuration is valid");
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    harness_core::metrics::describe_metrics();

    let kafka = EmbeddedKafka::new(config)?;
    if let Err(e) = run(&kafka, &cli.topics).await {
        kafka.shutdown().await;
        return Err(e);
    }

    let signal = wait_for_shutdown_signal().await?;
    tracing::info!(signal, "shutdown signal received");

    let report = kafka.shutdown().await;
    for failure in report.failures() {
        tracing::error!(step = failure.step, reason = %failure.reason, "cleanup step failed");
    }
    Ok(())
}

async fn run(kafka: &EmbeddedKafka, topics: &[kafka_harness::cli::TopicArg]) -> Result<()> {
    kafka.start().await.context("failed to start embedded kafka")?;
    for topic in topics {
        kafka
            .create_topic(&topic.name, topic.partitions, topic.replication_factor)
            .await
            .with_context(|| format!("failed to create topic '{}'", topic.name))?;
    }

    println!(
        "bootstrap.servers={}",
        kafka.bootstrap_servers().unwrap_or_default()
    );
    println!(
        "zookeeper.connect={}",
        kafka.coordination_connect().unwrap_or_default()
    );
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}
