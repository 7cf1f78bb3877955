use anyhow::Result;

/// Install the metrics exporter selected by cargo features. Without an
/// exporter feature the `metrics` macros are no-ops.
pub fn init_exporter() -> Result<()> {
    #[cfg(feature = "prometheus-exporter")]
    {
        use anyhow::Context;
        use metrics_exporter_prometheus::PrometheusBuilder;
        use std::net::SocketAddr;

        let port: u16 = std::env::var("METRICS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(9000);
        PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
            .install()
            .context("installing Prometheus exporter")?;
    }

    #[cfg(feature = "datadog-exporter")]
    {
        use anyhow::Context;
        use metrics_exporter_dogstatsd::DogStatsDBuilder;
        DogStatsDBuilder::default()
            .install()
            .context("installing DogStatsD exporter")?;
    }

    Ok(())
}
