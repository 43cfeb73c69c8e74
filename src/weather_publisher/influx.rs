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

use crate::point::Point;
use crate::schedule::ConfigurationError;
use crate::sink::{Sink, SinkError};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Connection details for an InfluxDB v2 server.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

/// `Sink` that writes points to InfluxDB using the v2 HTTP write API.
///
/// Points are converted to line protocol when accepted and buffered until the next
/// flush. A flush that fails with a transient error (network, 429 or 5xx) keeps its
/// lines buffered for the next attempt, up to `max_buffered` lines after which the
/// oldest are discarded. Lines that InfluxDB rejects outright are dropped.
#[derive(Debug)]
pub struct InfluxSink {
    client: Client,
    write_url: Url,
    token: String,
    default_tags: BTreeMap<String, String>,
    max_buffered: usize,
    buffer: Mutex<VecDeque<String>>,
    written: AtomicU64,
    closed: AtomicBool,
}

impl InfluxSink {
    pub const DEFAULT_MAX_BUFFERED: usize = 1000;

    pub fn new(client: Client, config: &InfluxConfig) -> Result<Self, ConfigurationError> {
        let invalid = || ConfigurationError::InvalidUrl(config.url.clone());
        let mut write_url = Url::parse(&config.url).map_err(|_| invalid())?;
        {
            let mut segments = write_url.path_segments_mut().map_err(|_| invalid())?;
            segments.pop_if_empty().extend(&["api", "v2", "write"]);
        }

        write_url
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "ms");

        Ok(InfluxSink {
            client,
            write_url,
            token: config.token.clone(),
            default_tags: BTreeMap::new(),
            max_buffered: Self::DEFAULT_MAX_BUFFERED,
            buffer: Mutex::new(VecDeque::new()),
            written: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Add a tag to every point written unless the point sets the same tag itself.
    pub fn with_default_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.default_tags.insert(key.into(), value.into());
        self
    }

    pub fn with_max_buffered(mut self, max_buffered: usize) -> Self {
        self.max_buffered = max_buffered.max(1);
        self
    }

    /// Number of lines waiting to be written
    pub fn buffered(&self) -> usize {
        self.lock_buffer().len()
    }

    /// Number of lines InfluxDB has accepted, including those written on close
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_line(&self, line: String) {
        let mut buffer = self.lock_buffer();
        buffer.push_back(line);
        if buffer.len() > self.max_buffered {
            buffer.pop_front();
            tracing::warn!(message = "dropped oldest unsent point", max = self.max_buffered);
        }
    }

    fn requeue(&self, lines: Vec<String>) {
        let mut buffer = self.lock_buffer();
        for line in lines.into_iter().rev() {
            buffer.push_front(line);
        }

        let mut dropped = 0;
        while buffer.len() > self.max_buffered {
            buffer.pop_front();
            dropped += 1;
        }

        if dropped > 0 {
            tracing::warn!(message = "dropped oldest unsent points", dropped = dropped, max = self.max_buffered);
        }
    }

    async fn write(&self, body: String) -> Result<(), SinkError> {
        let res = self
            .client
            .post(self.write_url.clone())
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(ACCEPT, "application/json")
            .body(body)
            .send()
            .await
            .map_err(SinkError::Http)?;

        let status = res.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = res.text().await.unwrap_or_default();
        tracing::debug!(message = "write rejected by InfluxDB", status = %status, body = %detail);

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(SinkError::Unauthorized(self.write_url.clone()))
        } else {
            Err(SinkError::Unexpected(status, self.write_url.clone()))
        }
    }
}

#[async_trait]
impl Sink<Point> for InfluxSink {
    async fn accept(&self, point: Point) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }

        match point.to_line_protocol(&self.default_tags) {
            Some(line) => {
                tracing::debug!(message = "buffering point", line = %line);
                self.push_line(line);
            }
            None => {
                tracing::warn!(message = "discarding point without fields", measurement = %point.measurement());
            }
        }

        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let lines: Vec<String> = self.lock_buffer().drain(..).collect();
        if lines.is_empty() {
            return Ok(());
        }

        let num_lines = lines.len();
        match self.write(lines.join("\n")).await {
            Ok(()) => {
                self.written.fetch_add(num_lines as u64, Ordering::AcqRel);
                tracing::debug!(message = "wrote points to InfluxDB", num_lines = num_lines);
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                self.requeue(lines);
                Err(e)
            }
            Err(e) => {
                tracing::error!(message = "dropping points rejected by InfluxDB", num_lines = num_lines, error = %e);
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<(), SinkError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let res = self.flush().await;
        let unsent = {
            let mut buffer = self.lock_buffer();
            let unsent = buffer.len();
            buffer.clear();
            unsent
        };

        if unsent > 0 {
            tracing::warn!(message = "discarding unsent points on close", unsent = unsent);
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::{InfluxConfig, InfluxSink};
    use crate::metrics::PublisherMetrics;
    use crate::point::Point;
    use crate::publisher::{CycleOutcome, Publisher};
    use crate::schedule::{ConfigurationError, Schedule};
    use crate::sink::{Sink, SinkError};
    use crate::source::{CollectionError, DataSource};
    use crate::stub;
    use async_trait::async_trait;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use prometheus_client::registry::Registry;
    use reqwest::Client;
    use std::collections::HashMap;
    use std::net::{SocketAddr, TcpListener};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct Write {
        query: HashMap<String, String>,
        authorization: Option<String>,
        body: String,
    }

    #[derive(Debug, Clone)]
    struct InfluxStub {
        status: Arc<Mutex<StatusCode>>,
        writes: Arc<Mutex<Vec<Write>>>,
    }

    impl InfluxStub {
        fn start(status: StatusCode) -> (Self, SocketAddr) {
            let stub = InfluxStub {
                status: Arc::new(Mutex::new(status)),
                writes: Arc::new(Mutex::new(Vec::new())),
            };

            let app = Router::new()
                .route("/api/v2/write", post(write))
                .with_state(stub.clone());

            (stub, stub::serve(app))
        }

        fn set_status(&self, status: StatusCode) {
            *self.status.lock().unwrap() = status;
        }

        fn writes(&self) -> Vec<Write> {
            self.writes.lock().unwrap().clone()
        }
    }

    async fn write(
        State(stub): State<InfluxStub>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
        body: String,
    ) -> StatusCode {
        let authorization = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_owned());

        stub.writes.lock().unwrap().push(Write {
            query,
            authorization,
            body,
        });

        *stub.status.lock().unwrap()
    }

    fn config(url: String) -> InfluxConfig {
        InfluxConfig {
            url,
            token: "secret".to_owned(),
            org: "home".to_owned(),
            bucket: "weather".to_owned(),
        }
    }

    fn sink(addr: SocketAddr) -> InfluxSink {
        InfluxSink::new(Client::new(), &config(format!("http://{}", addr)))
            .unwrap()
            .with_default_tag("region", "west")
    }

    fn reading(temperature: f64) -> Point {
        Point::new("sample")
            .tag("sensor_id", "porch")
            .float_field("temperature_celsius", temperature)
            .timestamp_millis(1700000000000)
    }

    #[test]
    fn test_write_url() {
        let sink = InfluxSink::new(Client::new(), &config("http://localhost:8086".to_owned())).unwrap();
        assert_eq!(
            "http://localhost:8086/api/v2/write?org=home&bucket=weather&precision=ms",
            sink.write_url.as_str()
        );

        let sink = InfluxSink::new(Client::new(), &config("https://example.com/influx/".to_owned())).unwrap();
        assert_eq!(
            "https://example.com/influx/api/v2/write?org=home&bucket=weather&precision=ms",
            sink.write_url.as_str()
        );
    }

    #[test]
    fn test_invalid_url() {
        let res = InfluxSink::new(Client::new(), &config("not a url".to_owned()));
        assert_eq!(
            ConfigurationError::InvalidUrl("not a url".to_owned()),
            res.unwrap_err()
        );
    }

    #[tokio::test]
    async fn test_flush_writes_buffered_points() {
        let (stub, addr) = InfluxStub::start(StatusCode::NO_CONTENT);
        let sink = sink(addr);

        sink.accept(reading(21.5)).await.unwrap();
        sink.accept(reading(22.0)).await.unwrap();
        assert_eq!(2, sink.buffered());

        sink.flush().await.unwrap();
        assert_eq!(0, sink.buffered());
        assert_eq!(2, sink.written());

        let writes = stub.writes();
        assert_eq!(1, writes.len());
        assert_eq!(Some("Token secret".to_owned()), writes[0].authorization);
        assert_eq!(Some("home"), writes[0].query.get("org").map(|s| s.as_str()));
        assert_eq!(Some("weather"), writes[0].query.get("bucket").map(|s| s.as_str()));
        assert_eq!(Some("ms"), writes[0].query.get("precision").map(|s| s.as_str()));
        assert_eq!(
            "sample,region=west,sensor_id=porch temperature_celsius=21.5 1700000000000\n\
             sample,region=west,sensor_id=porch temperature_celsius=22 1700000000000",
            writes[0].body
        );
    }

    #[tokio::test]
    async fn test_flush_empty_buffer() {
        let (stub, addr) = InfluxStub::start(StatusCode::NO_CONTENT);
        let sink = sink(addr);

        sink.flush().await.unwrap();
        sink.accept(Point::new("sample").tag("sensor_id", "porch")).await.unwrap();
        sink.flush().await.unwrap();

        assert!(stub.writes().is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_points() {
        let (stub, addr) = InfluxStub::start(StatusCode::SERVICE_UNAVAILABLE);
        let sink = sink(addr);

        sink.accept(reading(21.5)).await.unwrap();
        let res = sink.flush().await;
        assert!(matches!(res, Err(SinkError::Unexpected(StatusCode::SERVICE_UNAVAILABLE, _))));
        assert_eq!(1, sink.buffered());

        stub.set_status(StatusCode::NO_CONTENT);
        sink.accept(reading(19.0)).await.unwrap();
        sink.flush().await.unwrap();
        assert_eq!(0, sink.buffered());

        let writes = stub.writes();
        assert_eq!(2, writes.len());
        assert_eq!(
            "sample,region=west,sensor_id=porch temperature_celsius=21.5 1700000000000\n\
             sample,region=west,sensor_id=porch temperature_celsius=19 1700000000000",
            writes[1].body
        );
    }

    #[tokio::test]
    async fn test_rate_limited_flush_keeps_points() {
        let (stub, addr) = InfluxStub::start(StatusCode::TOO_MANY_REQUESTS);
        let sink = sink(addr);

        sink.accept(reading(21.5)).await.unwrap();
        let res = sink.flush().await;
        assert!(matches!(res, Err(SinkError::Unexpected(StatusCode::TOO_MANY_REQUESTS, _))));
        assert_eq!(1, sink.buffered());

        stub.set_status(StatusCode::NO_CONTENT);
        sink.flush().await.unwrap();
        assert_eq!(0, sink.buffered());
        assert_eq!(1, sink.written());
    }

    #[tokio::test]
    async fn test_connection_failure_keeps_points() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let sink = sink(addr);

        sink.accept(reading(21.5)).await.unwrap();
        let res = sink.flush().await;
        assert!(matches!(res, Err(SinkError::Http(_))));
        assert_eq!(1, sink.buffered());
        assert_eq!(0, sink.written());
    }

    #[tokio::test]
    async fn test_rejected_points_are_dropped() {
        let (stub, addr) = InfluxStub::start(StatusCode::BAD_REQUEST);
        let sink = sink(addr);

        sink.accept(reading(21.5)).await.unwrap();
        let res = sink.flush().await;
        assert!(matches!(res, Err(SinkError::Unexpected(StatusCode::BAD_REQUEST, _))));
        assert_eq!(0, sink.buffered());

        stub.set_status(StatusCode::NO_CONTENT);
        for temperature in [19.0, 20.0, 21.0] {
            sink.accept(reading(temperature)).await.unwrap();
            sink.flush().await.unwrap();
            assert_eq!(0, sink.buffered());
        }

        let writes = stub.writes();
        assert_eq!(4, writes.len());
        assert_eq!(
            "sample,region=west,sensor_id=porch temperature_celsius=19 1700000000000",
            writes[1].body
        );
        assert_eq!(3, sink.written());
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let (_stub, addr) = InfluxStub::start(StatusCode::UNAUTHORIZED);
        let sink = sink(addr);

        sink.accept(reading(21.5)).await.unwrap();
        let res = sink.flush().await;
        assert!(matches!(res, Err(SinkError::Unauthorized(_))));
        assert_eq!(0, sink.buffered());
    }

    #[tokio::test]
    async fn test_buffer_is_bounded() {
        let (stub, addr) = InfluxStub::start(StatusCode::INTERNAL_SERVER_ERROR);
        let sink = sink(addr).with_max_buffered(2);

        sink.accept(reading(1.0)).await.unwrap();
        sink.accept(reading(2.0)).await.unwrap();
        sink.accept(reading(3.0)).await.unwrap();
        assert_eq!(2, sink.buffered());

        assert!(sink.flush().await.is_err());
        assert_eq!(2, sink.buffered());

        stub.set_status(StatusCode::NO_CONTENT);
        sink.flush().await.unwrap();
        let writes = stub.writes();
        assert_eq!(
            "sample,region=west,sensor_id=porch temperature_celsius=2 1700000000000\n\
             sample,region=west,sensor_id=porch temperature_celsius=3 1700000000000",
            writes[1].body
        );
    }

    #[tokio::test]
    async fn test_close_flushes_then_rejects() {
        let (stub, addr) = InfluxStub::start(StatusCode::NO_CONTENT);
        let sink = sink(addr);

        sink.accept(reading(21.5)).await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(1, stub.writes().len());

        assert!(matches!(sink.accept(reading(22.5)).await, Err(SinkError::Closed)));
        sink.close().await.unwrap();
        assert_eq!(1, stub.writes().len());
    }

    #[tokio::test]
    async fn test_close_failure_discards_points() {
        let (stub, addr) = InfluxStub::start(StatusCode::BAD_GATEWAY);
        let sink = sink(addr);

        sink.accept(reading(21.5)).await.unwrap();
        assert!(sink.close().await.is_err());
        assert_eq!(0, sink.buffered());
        assert_eq!(1, stub.writes().len());
    }

    struct SensorReading;

    #[async_trait]
    impl DataSource for SensorReading {
        type Reading = Point;

        async fn collect(&self) -> Result<Option<Point>, CollectionError> {
            Ok(Some(reading(21.5)))
        }
    }

    #[tokio::test]
    async fn test_publisher_delivers_on_close_after_failed_flush() {
        let (stub, addr) = InfluxStub::start(StatusCode::SERVICE_UNAVAILABLE);
        let metrics = PublisherMetrics::new(&mut Registry::default());
        let publisher = Publisher::new(SensorReading, sink(addr), metrics);

        publisher
            .start(Schedule::every(Duration::from_secs(3600)).immediately())
            .await
            .unwrap();
        assert_eq!(1, publisher.metrics().cycles(CycleOutcome::SinkFailed));
        assert_eq!(0, publisher.sink().written());

        stub.set_status(StatusCode::NO_CONTENT);
        publisher.stop().await;

        assert_eq!(0, publisher.metrics().cycles(CycleOutcome::Published));
        assert_eq!(0, publisher.metrics().close_failures());
        assert_eq!(1, publisher.sink().written());
        assert_eq!(2, stub.writes().len());
    }
}
