// weather_publisher - Periodically publish weather readings to InfluxDB
//
// Copyright 2023 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use clap::Parser;
use prometheus_client::registry::Registry;
use reqwest::Client;
use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tracing::Level;
use weather_publisher::file::FileSource;
use weather_publisher::influx::{InfluxConfig, InfluxSink};
use weather_publisher::metrics::PublisherMetrics;
use weather_publisher::publisher::{CycleOutcome, Publisher};
use weather_publisher::schedule::Schedule;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_TIMEOUT_MILLIS: u64 = 5000;
const DEFAULT_FILE: &str = "weather.json";
const DEFAULT_REGION: &str = "west";

// The timer never fires when publishing once since the publisher is stopped right
// after the first cycle. It only has to be a valid interval.
const ONCE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Parser)]
#[clap(name = "sensor_publisher", version = clap::crate_version!())]
struct SensorPublisherApplication {
    /// Path to a JSON sensor report to publish
    #[clap(long, default_value = DEFAULT_FILE)]
    file: PathBuf,

    /// URL of the InfluxDB server to write points to
    #[clap(long, env = "INFLUX_URL")]
    influx_url: String,

    /// InfluxDB API token with write access to the bucket
    #[clap(long, env = "INFLUX_TOKEN", hide_env_values = true)]
    influx_token: String,

    /// InfluxDB organization that owns the bucket
    #[clap(long, env = "INFLUX_ORG")]
    influx_org: String,

    /// InfluxDB bucket to write points to
    #[clap(long, env = "INFLUX_BUCKET")]
    influx_bucket: String,

    /// Value of the "region" tag added to every point
    #[clap(long, default_value_t = DEFAULT_REGION.into())]
    region: String,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Keep publishing the sensor report at this interval, in seconds. When not set, the
    /// report is published once and the program exits.
    #[clap(long)]
    refresh_secs: Option<u64>,

    /// Only publish the sensor report if the file changed since it was last published.
    #[clap(long)]
    only_changed: bool,

    /// Timeout for requests to InfluxDB, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    dotenv::dotenv().ok();
    let opts = SensorPublisherApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let timeout = Duration::from_millis(opts.timeout_millis);
    let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    let config = InfluxConfig {
        url: opts.influx_url.clone(),
        token: opts.influx_token.clone(),
        org: opts.influx_org.clone(),
        bucket: opts.influx_bucket.clone(),
    };
    let sink = InfluxSink::new(http_client, &config)
        .unwrap_or_else(|e| {
            tracing::error!(message = "invalid InfluxDB configuration", error = %e);
            process::exit(1)
        })
        .with_default_tag("region", opts.region.as_str());

    let source = FileSource::new(opts.file.clone()).only_changed(opts.only_changed);
    let metrics = PublisherMetrics::new(&mut Registry::default());
    let publisher = Publisher::new(source, sink, metrics);

    let schedule = match opts.refresh_secs {
        Some(secs) => Schedule::every(Duration::from_secs(secs)).immediately(),
        None => Schedule::every(ONCE_INTERVAL).immediately(),
    };

    if let Err(e) = publisher.start(schedule).await {
        tracing::error!(message = "unable to start sensor publishing", error = %e);
        process::exit(1)
    }

    let res = match opts.refresh_secs {
        None => {
            publisher.stop().await;
            Ok(())
        }
        Some(secs) => {
            tracing::info!(
                message = "sensor publishing started",
                file = %opts.file.display(),
                refresh_secs = secs,
            );

            publisher
                .run_until(async {
                    // Wait for either SIGTERM or SIGINT to shutdown
                    tokio::select! {
                        _ = sigterm() => {}
                        _ = sigint() => {}
                    }

                    tracing::info!(message = "received shutdown signal, flushing points to InfluxDB");
                })
                .await
        }
    };

    if let Err(e) = res {
        tracing::error!(message = "sensor publishing failed", error = %e);
        process::exit(1)
    }

    // Points from a failed cycle may still be written when the sink is closed, so
    // count what InfluxDB accepted rather than successful cycles.
    let written = publisher.sink().written();
    if opts.refresh_secs.is_none() && written == 0 {
        tracing::error!(message = "sensor report was not published", file = %opts.file.display());
        process::exit(1)
    }

    tracing::info!(
        message = "sensor publishing finished",
        written = written,
        cycles = publisher.metrics().cycles(CycleOutcome::Published),
    );
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
