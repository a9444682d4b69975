use anyhow::{Context, Result, bail};
use courier_config::Config;
use courier_statsd::MetricsClientConfig;

/// Rejects configurations that would stall the pipeline.
pub fn check_config(config: &Config) -> Result<()> {
    if config.channel().buffer_capacity == 0 {
        bail!("`channel.buffer_capacity` must be greater than zero");
    }

    if config.channel().sending_interval_ms == 0 {
        bail!("`channel.sending_interval_ms` must be greater than zero");
    }

    if config.channel().send_timeout_secs == 0 {
        bail!("`channel.send_timeout_secs` must be greater than zero");
    }

    Ok(())
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        courier_log::info!("launching courier without config folder");
    } else {
        courier_log::info!(
            "launching courier from config folder {}",
            config.path().display()
        );
    }
    courier_log::info!("  endpoint: {}", config.channel().endpoint);
    courier_log::info!(
        "  aggregation interval: {}s",
        config.metrics().cycle_interval().as_secs()
    );
    courier_log::info!("  log level: {}", config.logging().level);
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let statsd = config.statsd();
    let Some(host) = statsd.host.as_deref() else {
        return Ok(());
    };

    courier_statsd::init(MetricsClientConfig {
        prefix: &statsd.prefix,
        host,
        default_tags: statsd.default_tags.clone(),
        sample_rate: statsd.sample_rate,
    })
    .with_context(|| format!("failed to initialize statsd client for {host}"))?;

    Ok(())
}
