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
use crate::source::{CollectionError, DataSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

/// `DataSource` that reads a sensor report from a JSON file on disk.
///
/// When `only_changed` is set, the file is only read if its modification time
/// differs from the last time it was read successfully; otherwise there is no
/// reading for the cycle.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    only_changed: bool,
    last_modified: Mutex<Option<SystemTime>>,
}

impl FileSource {
    const MEASUREMENT: &'static str = "sample";

    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FileSource {
            path: path.into(),
            only_changed: false,
            last_modified: Mutex::new(None),
        }
    }

    pub fn only_changed(self, only_changed: bool) -> Self {
        FileSource { only_changed, ..self }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn report(&self) -> Result<SensorReport, CollectionError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CollectionError::Io(self.path.clone(), e))?;

        serde_json::from_str::<SensorReport>(&contents).map_err(|e| CollectionError::Malformed(e.to_string()))
    }

    async fn modified(&self) -> Result<SystemTime, CollectionError> {
        tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| CollectionError::Io(self.path.clone(), e))
    }

    fn unchanged(&self, modified: SystemTime) -> bool {
        let last = self.last_modified.lock().unwrap_or_else(PoisonError::into_inner);
        self.only_changed && *last == Some(modified)
    }

    fn set_modified(&self, modified: SystemTime) {
        *self.last_modified.lock().unwrap_or_else(PoisonError::into_inner) = Some(modified);
    }
}

#[async_trait]
impl DataSource for FileSource {
    type Reading = Point;

    async fn collect(&self) -> Result<Option<Point>, CollectionError> {
        let modified = self.modified().await?;
        if self.unchanged(modified) {
            tracing::debug!(message = "sensor report unchanged", path = %self.path.display());
            return Ok(None);
        }

        let report = self.report().await?;
        self.set_modified(modified);

        tracing::debug!(message = "read sensor report", path = %self.path.display(), sensor = %report.name);
        Ok(Some(report.to_point().now()))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SensorReport {
    #[serde(alias = "name")]
    pub name: String,
    #[serde(alias = "time_stamp")]
    pub time_stamp: Option<String>,
    #[serde(alias = "distance_cm")]
    pub distance_cm: Option<f64>,
    #[serde(alias = "temperature_celsius")]
    pub temperature_celsius: Option<f64>,
    #[serde(alias = "status")]
    pub status: Option<String>,
}

impl SensorReport {
    pub fn to_point(&self) -> Point {
        let mut point = Point::new(FileSource::MEASUREMENT).tag("sensor_id", self.name.as_str());
        if let Some(ts) = &self.time_stamp {
            point = point.string_field("timestamp", ts.as_str());
        }
        if let Some(d) = self.distance_cm {
            point = point.float_field("distance_cm", d);
        }
        if let Some(t) = self.temperature_celsius {
            point = point.float_field("temperature_celsius", t);
        }
        if let Some(s) = &self.status {
            point = point.string_field("status", s.as_str());
        }

        point
    }
}
