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

use crate::metrics::PublisherMetrics;
use crate::schedule::{ConfigurationError, Schedule};
use crate::sink::Sink;
use crate::source::DataSource;
use std::error;
use std::fmt;
use std::future::Future;
use std::panic;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{Instrument, Level};

/// Lifecycle of a `Publisher`. There is no way back from `Draining` or `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublisherState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// What happened during a single collect-then-deliver cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleOutcome {
    Published,
    Empty,
    CollectionFailed,
    SinkFailed,
    Skipped,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::Empty => "empty",
            Self::CollectionFailed => "collection_failed",
            Self::SinkFailed => "sink_failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug)]
pub enum PublisherError {
    TimerFailed(String),
}

impl fmt::Display for PublisherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimerFailed(msg) => write!(f, "publisher timer failed: {}", msg),
        }
    }
}

impl error::Error for PublisherError {}

/// Periodically collects a reading from a `DataSource` and delivers it to a `Sink`.
///
/// Cycles never overlap: a cycle that takes longer than the interval delays the next
/// one instead of running alongside it. Stopping the publisher lets an in-flight cycle
/// finish, then closes the sink exactly once.
///
/// Cloning a `Publisher` returns another handle to the same publisher.
pub struct Publisher<S, K>
where
    S: DataSource,
    K: Sink<S::Reading>,
{
    inner: Arc<Inner<S, K>>,
}

impl<S, K> Clone for Publisher<S, K>
where
    S: DataSource,
    K: Sink<S::Reading>,
{
    fn clone(&self) -> Self {
        Publisher {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, K> Publisher<S, K>
where
    S: DataSource,
    K: Sink<S::Reading>,
{
    pub fn new(source: S, sink: K, metrics: PublisherMetrics) -> Self {
        let (shutdown, _) = watch::channel(false);
        metrics.state(PublisherState::Idle);

        Publisher {
            inner: Arc::new(Inner {
                source,
                sink,
                metrics,
                state: Mutex::new(PublisherState::Idle),
                in_flight: AsyncMutex::new(()),
                shutdown,
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> PublisherState {
        *self.inner.lock_state()
    }

    pub fn metrics(&self) -> &PublisherMetrics {
        &self.inner.metrics
    }

    pub fn sink(&self) -> &K {
        &self.inner.sink
    }

    /// Start running cycles according to `schedule`.
    ///
    /// If the schedule asks to run immediately, the first cycle has completed by the
    /// time this method returns. Must be called from within a Tokio runtime.
    ///
    /// # Panics
    ///
    /// A panic from the source or sink during the immediate cycle is resumed here after
    /// the publisher has been drained via `stop()`. The same panic on a timer cycle is
    /// reported by `run_until` instead.
    pub async fn start(&self, schedule: Schedule) -> Result<(), ConfigurationError> {
        schedule.validate()?;
        self.inner.transition_from(PublisherState::Idle, PublisherState::Running)?;

        tracing::info!(
            message = "publisher started",
            interval_secs = schedule.interval.as_secs(),
            run_immediately = schedule.run_immediately,
        );

        if schedule.run_immediately {
            let inner = Arc::clone(&self.inner);
            let immediate = tokio::spawn(async move { inner.cycle().await }.in_current_span());
            if let Err(e) = immediate.await {
                tracing::error!(message = "immediate cycle failed", error = %e);
                self.stop().await;
                if e.is_panic() {
                    panic::resume_unwind(e.into_panic());
                }

                return Ok(());
            }
        }

        let shutdown = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(Arc::clone(&self.inner).run_timer(schedule.interval, shutdown));
        *self.inner.lock_timer() = Some(handle);
        Ok(())
    }

    /// Stop running cycles, wait for any in-flight cycle, and close the sink.
    ///
    /// Calling this while the publisher is already draining or stopped does nothing.
    pub async fn stop(&self) {
        let previous = {
            let mut state = self.inner.lock_state();
            let previous = *state;
            match previous {
                PublisherState::Idle | PublisherState::Running => *state = PublisherState::Draining,
                PublisherState::Draining | PublisherState::Stopped => return,
            }

            previous
        };

        self.inner.metrics.state(PublisherState::Draining);
        tracing::info!(message = "publisher draining", previous = %previous);
        self.inner.shutdown.send_replace(true);

        let timer = self.inner.lock_timer().take();
        if let Some(handle) = timer {
            if let Err(e) = handle.await {
                tracing::error!(message = "publisher timer failed while draining", error = %e);
            }
        }

        self.inner.close().await;
    }

    /// Run until `signal` completes or the timer fails, then drain via `stop()`.
    ///
    /// A timer that panics or exits on its own is fatal. The publisher is still drained
    /// but an error is returned so the caller can exit non-zero.
    pub async fn run_until<F>(&self, signal: F) -> Result<(), PublisherError>
    where
        F: Future<Output = ()>,
    {
        let timer = self.inner.lock_timer().take();
        let mut handle = match timer {
            Some(h) => h,
            None => {
                self.stop().await;
                return Ok(());
            }
        };

        let finished = tokio::select! {
            _ = signal => None,
            res = &mut handle => Some(res),
        };

        match finished {
            None => {
                *self.inner.lock_timer() = Some(handle);
                self.stop().await;
                Ok(())
            }
            Some(res) => {
                let requested = matches!(self.state(), PublisherState::Draining | PublisherState::Stopped);
                self.stop().await;

                match res {
                    Ok(()) if requested => Ok(()),
                    Ok(()) => Err(PublisherError::TimerFailed("timer exited unexpectedly".to_owned())),
                    Err(e) => Err(PublisherError::TimerFailed(e.to_string())),
                }
            }
        }
    }
}

struct Inner<S, K>
where
    S: DataSource,
    K: Sink<S::Reading>,
{
    source: S,
    sink: K,
    metrics: PublisherMetrics,
    state: Mutex<PublisherState>,
    in_flight: AsyncMutex<()>,
    shutdown: watch::Sender<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<S, K> Inner<S, K>
where
    S: DataSource,
    K: Sink<S::Reading>,
{
    // Neither lock is ever held across an await so a poisoned lock still holds a valid value.
    fn lock_state(&self) -> MutexGuard<'_, PublisherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: PublisherState) {
        *self.lock_state() = next;
        self.metrics.state(next);
    }

    fn transition_from(&self, expected: PublisherState, next: PublisherState) -> Result<(), ConfigurationError> {
        {
            let mut state = self.lock_state();
            if *state != expected {
                return Err(ConfigurationError::AlreadyStarted(*state));
            }

            *state = next;
        }

        self.metrics.state(next);
        Ok(())
    }

    async fn run_timer(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticks = time::interval_at(Instant::now() + interval, interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            tokio::select! {
                biased;
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }

                    continue;
                }
                _ = ticks.tick() => {}
            }

            self.cycle().await;
        }

        tracing::debug!(message = "publisher timer stopped");
    }

    async fn cycle(&self) -> CycleOutcome {
        let _guard = self.in_flight.lock().await;
        let state = *self.lock_state();
        if state != PublisherState::Running {
            tracing::debug!(message = "skipping cycle", state = %state);
            self.metrics.cycle(CycleOutcome::Skipped, Duration::ZERO);
            return CycleOutcome::Skipped;
        }

        let start = Instant::now();
        let outcome = self
            .deliver()
            .instrument(tracing::span!(Level::DEBUG, "publisher_cycle"))
            .await;

        self.metrics.cycle(outcome, start.elapsed());
        outcome
    }

    async fn deliver(&self) -> CycleOutcome {
        let reading = match self.source.collect().await {
            Ok(Some(r)) => r,
            Ok(None) => {
                tracing::debug!(message = "no new reading collected");
                return CycleOutcome::Empty;
            }
            Err(e) => {
                tracing::error!(message = "failed to collect reading", error = %e);
                return CycleOutcome::CollectionFailed;
            }
        };

        if let Err(e) = self.sink.accept(reading).await {
            tracing::error!(message = "failed to accept reading", error = %e);
            return CycleOutcome::SinkFailed;
        }

        if let Err(e) = self.sink.flush().await {
            tracing::error!(message = "failed to flush readings", error = %e);
            return CycleOutcome::SinkFailed;
        }

        tracing::info!(message = "published reading");
        CycleOutcome::Published
    }

    async fn close(&self) {
        let _guard = self.in_flight.lock().await;
        match self.sink.close().await {
            Ok(()) => tracing::info!(message = "sink closed"),
            Err(e) => {
                self.metrics.close_failed();
                tracing::error!(message = "failed to close sink", error = %e);
            }
        }

        self.set_state(PublisherState::Stopped);
        tracing::info!(message = "publisher stopped");
    }
}
