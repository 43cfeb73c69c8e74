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
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::oneshot;
use tracing::Level;
use weather_publisher::http::RequestContext;
use weather_publisher::influx::{InfluxConfig, InfluxSink};
use weather_publisher::metrics::PublisherMetrics;
use weather_publisher::publisher::Publisher;
use weather_publisher::schedule::Schedule;
use weather_publisher::tomorrow::TomorrowSource;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9783);
const DEFAULT_REFRESH_SECS: u64 = 180;
const DEFAULT_TIMEOUT_MILLIS: u64 = 5000;
const DEFAULT_API_URL: &str = "https://api.tomorrow.io/";
const DEFAULT_REGION: &str = "west";

#[derive(Debug, Parser)]
#[clap(name = "tomorrow_publisher", version = clap::crate_version!())]
struct TomorrowPublisherApplication {
    /// Location to fetch realtime weather for. May be an address, a city name, or
    /// a "latitude,longitude" pair.
    #[clap(long, env = "TOMORROW_LOCATION")]
    location: String,

    /// API key for Tomorrow.io
    #[clap(long, env = "TOMORROW_TOKEN", hide_env_values = true)]
    api_key: String,

    /// Base URL for the Tomorrow.io API
    #[clap(long, default_value_t = DEFAULT_API_URL.into())]
    api_url: String,

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
    #[clap(long, env = "TOMORROW_BUCKET")]
    influx_bucket: String,

    /// Value of the "region" tag added to every point
    #[clap(long, default_value_t = DEFAULT_REGION.into())]
    region: String,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Fetch realtime weather from the Tomorrow.io API at this interval, in seconds.
    #[clap(long, default_value_t = DEFAULT_REFRESH_SECS)]
    refresh_secs: u64,

    /// Wait for the first interval to elapse instead of fetching weather at startup.
    #[clap(long)]
    no_run_immediately: bool,

    /// Timeout for requests to the Tomorrow.io API and InfluxDB, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Address to bind to for exposing metrics about the publisher itself.
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    dotenv::dotenv().ok();
    let opts = TomorrowPublisherApplication::parse();
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

    let source = TomorrowSource::new(http_client.clone(), &opts.api_url, &opts.api_key, &opts.location)
        .unwrap_or_else(|e| {
            tracing::error!(message = "invalid Tomorrow.io configuration", error = %e);
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

    let mut registry = Registry::with_prefix("weather");
    let metrics = PublisherMetrics::new(&mut registry);
    let publisher = Publisher::new(source, sink, metrics);

    let context = Arc::new(RequestContext::new(registry));
    let handler = weather_publisher::http::text_metrics(context);
    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let server = axum::Server::try_bind(&opts.bind)
        .unwrap_or_else(|e| {
            tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
            process::exit(1)
        })
        .serve(handler.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = server_stopped.await;
        });

    tracing::info!(message = "server started", address = %opts.bind);
    let server = tokio::spawn(server);

    let schedule = Schedule {
        interval: Duration::from_secs(opts.refresh_secs),
        run_immediately: !opts.no_run_immediately,
    };

    if let Err(e) = publisher.start(schedule).await {
        tracing::error!(message = "unable to start weather collection", error = %e);
        process::exit(1)
    }

    tracing::info!(
        message = "weather collection started",
        api_url = %opts.api_url,
        location = %opts.location,
        refresh_secs = opts.refresh_secs,
    );

    let res = publisher
        .run_until(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }

            tracing::info!(message = "received shutdown signal, flushing points to InfluxDB");
        })
        .await;

    let _ = stop_server.send(());
    server.await??;

    if let Err(e) = res {
        tracing::error!(message = "weather collection failed", error = %e);
        process::exit(1)
    }

    tracing::info!("weather collection shutdown");
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
