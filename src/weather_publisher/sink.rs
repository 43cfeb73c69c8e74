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

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::error;
use std::fmt;

/// Error raised when a `Sink` cannot deliver buffered readings.
#[derive(Debug)]
pub enum SinkError {
    Http(reqwest::Error),
    Unauthorized(Url),
    Unexpected(StatusCode, Url),
    Closed,
}

impl SinkError {
    /// Whether writing the same readings again could succeed. Transport errors, rate
    /// limiting and server errors are transient. Anything else will be rejected again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Unexpected(status, _) => *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
            Self::Unauthorized(_) | Self::Closed => false,
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "{}", e),
            Self::Unauthorized(url) => write!(f, "unauthorized for {}", url),
            Self::Unexpected(status, url) => write!(f, "unexpected status {} for {}", status, url),
            Self::Closed => write!(f, "sink is closed"),
        }
    }
}

impl error::Error for SinkError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

/// Destination for readings produced by a `DataSource`.
///
/// `accept` may only buffer a reading, `flush` delivers everything accepted so far and
/// `close` flushes one last time and releases the sink. Nothing may be accepted once a
/// sink has been closed.
#[async_trait]
pub trait Sink<R>: Send + Sync + 'static
where
    R: Send + 'static,
{
    async fn accept(&self, reading: R) -> Result<(), SinkError>;

    async fn flush(&self) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError>;
}
