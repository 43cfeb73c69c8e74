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

use crate::publisher::PublisherState;
use std::error;
use std::fmt;
use std::time::Duration;

/// Error returned synchronously when a publisher or one of its collaborators is
/// configured with values that can never work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    InvalidInterval(Duration),
    AlreadyStarted(PublisherState),
    InvalidUrl(String),
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval(d) => write!(f, "invalid interval {:?}, must be greater than zero", d),
            Self::AlreadyStarted(s) => write!(f, "publisher cannot be started from state {}", s),
            Self::InvalidUrl(u) => write!(f, "invalid URL {}", u),
        }
    }
}

impl error::Error for ConfigurationError {}

/// How often a publisher runs a collection cycle.
///
/// The first timer driven cycle happens one `interval` after the publisher is started.
/// When `run_immediately` is set, an extra cycle runs as part of starting the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    pub run_immediately: bool,
}

impl Schedule {
    pub fn every(interval: Duration) -> Self {
        Schedule {
            interval,
            run_immediately: false,
        }
    }

    pub fn immediately(self) -> Self {
        Schedule {
            run_immediately: true,
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.interval.is_zero() {
            Err(ConfigurationError::InvalidInterval(self.interval))
        } else {
            Ok(())
        }
    }
}
