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
use std::io;
use std::path::PathBuf;

/// Error raised when a `DataSource` cannot produce a reading for a cycle.
#[derive(Debug)]
pub enum CollectionError {
    Io(PathBuf, io::Error),
    Malformed(String),
    Http(reqwest::Error),
    InvalidLocation(String),
    Unauthorized(Url),
    Unexpected(StatusCode, Url),
}

impl fmt::Display for CollectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(path, e) => write!(f, "unable to read {}: {}", path.display(), e),
            Self::Malformed(msg) => write!(f, "malformed reading: {}", msg),
            Self::Http(e) => write!(f, "{}", e),
            Self::InvalidLocation(l) => write!(f, "invalid location {}", l),
            Self::Unauthorized(url) => write!(f, "unauthorized for {}", url),
            Self::Unexpected(status, url) => write!(f, "unexpected status {} for {}", status, url),
        }
    }
}

impl error::Error for CollectionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(_, e) => Some(e),
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

/// Something that produces at most one reading each time it is asked.
///
/// Returning `Ok(None)` means there is nothing new to publish this cycle. Sources are
/// asked once per cycle and are never retried by the publisher.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    type Reading: Send + 'static;

    async fn collect(&self) -> Result<Option<Self::Reading>, CollectionError>;
}
