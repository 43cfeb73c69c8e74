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

//! Periodically publish weather readings to InfluxDB
//!
//! ## Features
//!
//! `weather_publisher` collects weather readings from a data source at a fixed interval and
//! writes each one to [InfluxDB] as a timestamped point. Two sources are supported.
//!
//! * `tomorrow_publisher` - Realtime weather for a single location from the [Tomorrow.io] API,
//!   written to the `weatherData` measurement with a `location` tag.
//! * `sensor_publisher` - A sensor report read from a local JSON file, written to the `sample`
//!   measurement with a `sensor_id` tag.
//!
//! Both binaries add a `region` tag to every point. Cycles never overlap. On `SIGINT` or
//! `SIGTERM` an in-flight cycle is allowed to finish and any buffered points are written
//! before the process exits.
//!
//! [InfluxDB]: https://docs.influxdata.com/influxdb/v2/
//! [Tomorrow.io]: https://docs.tomorrow.io/reference/realtime-weather
//!
//! ## Build
//!
//! `weather_publisher` is a Rust program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Configuration
//!
//! Connection details may be given as flags or environment variables. A `.env` file in the
//! working directory is loaded first if it exists.
//!
//! ```text
//! INFLUX_URL=http://localhost:8086
//! INFLUX_TOKEN=...
//! INFLUX_ORG=home
//! INFLUX_BUCKET=sensors
//! TOMORROW_BUCKET=weather
//! TOMORROW_TOKEN=...
//! TOMORROW_LOCATION=777 Glades Rd
//! ```
//!
//! ### Run
//!
//! Poll Tomorrow.io every three minutes, starting right away.
//!
//! ```text
//! ./tomorrow_publisher --refresh-secs 180
//! ```
//!
//! Upload a sensor report once and exit, or keep uploading it whenever it changes.
//!
//! ```text
//! ./sensor_publisher --file weather.json
//! ./sensor_publisher --file weather.json --refresh-secs 60 --only-changed
//! ```
//!
//! ### Prometheus
//!
//! `tomorrow_publisher` exposes metrics about its own collection cycles on port `9783`
//! at `/metrics`.
//!

pub mod file;
pub mod http;
pub mod influx;
pub mod metrics;
pub mod point;
pub mod publisher;
pub mod schedule;
pub mod sink;
pub mod source;
pub mod tomorrow;

#[cfg(test)]
mod stub;
