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

use crate::publisher::{CycleOutcome, PublisherState};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::time::Duration;

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CycleLabels {
    outcome: String,
}

impl From<CycleOutcome> for CycleLabels {
    fn from(outcome: CycleOutcome) -> Self {
        CycleLabels {
            outcome: outcome.as_str().to_owned(),
        }
    }
}

/// Holder for metrics describing what a `Publisher` has been doing.
///
/// All metrics are created and registered upon call to `PublisherMetrics::new()`. Cloning
/// a `PublisherMetrics` shares the underlying metrics.
#[derive(Debug, Clone)]
pub struct PublisherMetrics {
    cycles: Family<CycleLabels, Counter>,
    cycle_duration: Histogram,
    close_failures: Counter,
    state: Gauge,
}

impl PublisherMetrics {
    /// Create a new `PublisherMetrics` and register each metric with the provided `Registry`.
    pub fn new(reg: &mut Registry) -> Self {
        let cycles = Family::<CycleLabels, Counter>::default();
        let cycle_duration = Histogram::new(exponential_buckets(0.01, 2.0, 12));
        let close_failures = Counter::default();
        let state = Gauge::default();

        reg.register("publisher_cycles", "Collection cycles run, by outcome", cycles.clone());
        reg.register(
            "publisher_cycle_duration_seconds",
            "Time taken to collect and deliver a reading",
            cycle_duration.clone(),
        );
        reg.register(
            "publisher_sink_close_failures",
            "Failures to flush and close the sink while stopping",
            close_failures.clone(),
        );
        reg.register(
            "publisher_state",
            "Publisher state (0=idle, 1=running, 2=draining, 3=stopped)",
            state.clone(),
        );

        Self {
            cycles,
            cycle_duration,
            close_failures,
            state,
        }
    }

    /// Record the outcome of a cycle. Skipped cycles don't do any work so they are
    /// counted but not timed.
    pub fn cycle(&self, outcome: CycleOutcome, elapsed: Duration) {
        self.cycles.get_or_create(&CycleLabels::from(outcome)).inc();
        if outcome != CycleOutcome::Skipped {
            self.cycle_duration.observe(elapsed.as_secs_f64());
        }
    }

    pub fn close_failed(&self) {
        self.close_failures.inc();
    }

    pub fn state(&self, state: PublisherState) {
        let code = match state {
            PublisherState::Idle => 0,
            PublisherState::Running => 1,
            PublisherState::Draining => 2,
            PublisherState::Stopped => 3,
        };

        self.state.set(code);
    }

    /// Number of cycles that ended with the given outcome
    pub fn cycles(&self, outcome: CycleOutcome) -> u64 {
        self.cycles.get_or_create(&CycleLabels::from(outcome)).get()
    }

    /// Number of times closing the sink failed, zero or one for a single publisher
    pub fn close_failures(&self) -> u64 {
        self.close_failures.get()
    }
}

#[cfg(test)]
mod tests {
    use super::PublisherMetrics;
    use crate::publisher::{CycleOutcome, PublisherState};
    use prometheus_client::encoding::text::encode;
    use prometheus_client::registry::Registry;
    use std::time::Duration;

    #[test]
    fn test_metrics_count_outcomes() {
        let mut reg = Registry::default();
        let metrics = PublisherMetrics::new(&mut reg);

        metrics.cycle(CycleOutcome::Published, Duration::from_millis(120));
        metrics.cycle(CycleOutcome::Published, Duration::from_millis(80));
        metrics.cycle(CycleOutcome::SinkFailed, Duration::from_millis(30));

        assert_eq!(2, metrics.cycles(CycleOutcome::Published));
        assert_eq!(1, metrics.cycles(CycleOutcome::SinkFailed));
        assert_eq!(0, metrics.cycles(CycleOutcome::CollectionFailed));
    }

    #[test]
    fn test_metrics_text_encoding() {
        let mut reg = Registry::with_prefix("weather");
        let metrics = PublisherMetrics::new(&mut reg);
        metrics.state(PublisherState::Draining);
        metrics.cycle(CycleOutcome::Empty, Duration::from_millis(5));
        metrics.close_failed();

        let mut buf = String::new();
        encode(&mut buf, &reg).unwrap();

        assert!(buf.contains("weather_publisher_cycles_total{outcome=\"empty\"} 1"));
        assert!(buf.contains("weather_publisher_state 2"));
        assert!(buf.contains("weather_publisher_sink_close_failures_total 1"));
        assert!(buf.contains("weather_publisher_cycle_duration_seconds_count 1"));
    }
}
