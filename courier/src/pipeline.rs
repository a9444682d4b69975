use std::sync::Arc;

use anyhow::{Context, Result};
use courier_channel::{SeverityLevel, TelemetryChannel, TelemetryItem};
use courier_config::Config;
use courier_metrics::{MetricIdentifier, MetricManager, SeriesConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::input::{InputLine, MetricLine};

/// Feeds standard input into the metric manager and the telemetry channel until the input ends
/// or the process is interrupted.
pub async fn run(config: Config) -> Result<()> {
    let channel = Arc::new(
        TelemetryChannel::start(config.channel()).context("failed to start telemetry channel")?,
    );
    let manager = MetricManager::start(config.metrics().clone(), channel.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut count = 0usize;

    loop {
        let line = tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                courier_log::info!("received interrupt, shutting down");
                break;
            }
            line = lines.next_line() => line.context("failed to read input")?,
        };

        let Some(line) = line else {
            break;
        };

        match InputLine::parse(&line) {
            Ok(InputLine::Empty) => continue,
            Ok(InputLine::Trace(message)) => {
                channel.send(TelemetryItem::trace(message, SeverityLevel::Information));
            }
            Ok(InputLine::Metric(metric)) => track(&manager, &metric),
            Err(error) => {
                courier_log::warn!(line = %line, "skipping input line: {error}");
                continue;
            }
        }

        count += 1;
    }

    courier_log::info!(lines = count, "input finished");

    manager.stop().await;
    channel.shutdown().await;

    Ok(())
}

fn track(manager: &MetricManager, line: &MetricLine<'_>) {
    let identifier = MetricIdentifier::new(line.namespace, line.name, line.dimension_names());
    let metric = manager.get_metric(identifier, SeriesConfig::default());

    if let Err(error) = metric.track_str(line.value, &line.dimension_values()) {
        courier_log::warn!(
            error = &error as &dyn std::error::Error,
            metric = line.name,
            "failed to track value"
        );
    }
}
