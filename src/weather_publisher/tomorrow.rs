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
use crate::source::{CollectionError, DataSource};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, Level};

/// Client and `DataSource` for the Tomorrow.io realtime weather API.
///
/// The API key is only ever sent as a query parameter; URLs included in errors and
/// log messages never contain it.
#[derive(Debug)]
pub struct TomorrowSource {
    client: Client,
    realtime_url: Url,
    api_key: String,
    location: String,
}

impl TomorrowSource {
    const USER_AGENT: &'static str = concat!("weather_publisher/", env!("CARGO_PKG_VERSION"));
    const JSON_RESPONSE: &'static str = "application/json";
    const MEASUREMENT: &'static str = "weatherData";

    pub fn new(client: Client, base_url: &str, api_key: &str, location: &str) -> Result<Self, ConfigurationError> {
        let mut realtime_url = Url::parse(base_url).map_err(|_| ConfigurationError::InvalidUrl(base_url.to_owned()))?;
        {
            let mut segments = realtime_url
                .path_segments_mut()
                .map_err(|_| ConfigurationError::InvalidUrl(base_url.to_owned()))?;
            segments.pop_if_empty().extend(&["v4", "weather", "realtime"]);
        }

        Ok(TomorrowSource {
            client,
            realtime_url,
            api_key: api_key.to_owned(),
            location: location.to_owned(),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub async fn realtime(&self) -> Result<Realtime, CollectionError> {
        tracing::debug!(message = "making realtime weather request", url = %self.realtime_url, location = %self.location);

        let res = self.make_request().await?;
        let body = res.text().await.map_err(CollectionError::Http)?;
        serde_json::from_str::<Realtime>(&body).map_err(|e| CollectionError::Malformed(e.to_string()))
    }

    async fn make_request(&self) -> Result<Response, CollectionError> {
        let res = self
            .client
            .get(self.realtime_url.clone())
            .query(&[("location", self.location.as_str()), ("apikey", self.api_key.as_str())])
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .send()
            .await
            .map_err(|e| CollectionError::Http(e.without_url()))?;

        let status = res.status();
        if status == StatusCode::OK {
            Ok(res)
        } else if status == StatusCode::BAD_REQUEST {
            Err(CollectionError::InvalidLocation(self.location.clone()))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(CollectionError::Unauthorized(self.realtime_url.clone()))
        } else {
            Err(CollectionError::Unexpected(status, self.realtime_url.clone()))
        }
    }

    /// Convert a realtime response into a point, skipping any values the API didn't report.
    pub fn to_point(&self, realtime: &Realtime) -> Point {
        realtime
            .data
            .values
            .fields()
            .into_iter()
            .fold(
                Point::new(Self::MEASUREMENT).tag("location", self.location.as_str()),
                |point, (name, value)| match value {
                    Some(v) => point.float_field(name, v),
                    None => point,
                },
            )
    }
}

#[async_trait]
impl DataSource for TomorrowSource {
    type Reading = Point;

    async fn collect(&self) -> Result<Option<Point>, CollectionError> {
        let realtime = self
            .realtime()
            .instrument(tracing::span!(Level::DEBUG, "tomorrow_realtime"))
            .await?;

        tracing::debug!(message = "fetched realtime weather", time = %realtime.data.time);
        Ok(Some(self.to_point(&realtime).now()))
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Realtime {
    #[serde(alias = "data")]
    pub data: RealtimeData,
    #[serde(alias = "location")]
    pub location: Option<Location>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RealtimeData {
    #[serde(alias = "time")]
    pub time: String,
    #[serde(alias = "values")]
    pub values: WeatherValues,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Location {
    #[serde(alias = "lat")]
    pub lat: f64,
    #[serde(alias = "lon")]
    pub lon: f64,
    #[serde(alias = "name")]
    pub name: Option<String>,
    #[serde(alias = "type")]
    pub type_: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct WeatherValues {
    #[serde(alias = "cloudCover")]
    pub cloud_cover: Option<f64>,
    #[serde(alias = "dewPoint")]
    pub dew_point: Option<f64>,
    #[serde(alias = "freezingRainIntensity")]
    pub freezing_rain_intensity: Option<f64>,
    #[serde(alias = "humidity")]
    pub humidity: Option<f64>,
    #[serde(alias = "precipitationProbability")]
    pub precipitation_probability: Option<f64>,
    #[serde(alias = "pressureSurfaceLevel")]
    pub pressure_surface_level: Option<f64>,
    #[serde(alias = "rainIntensity")]
    pub rain_intensity: Option<f64>,
    #[serde(alias = "sleetIntensity")]
    pub sleet_intensity: Option<f64>,
    #[serde(alias = "snowIntensity")]
    pub snow_intensity: Option<f64>,
    #[serde(alias = "temperature")]
    pub temperature: Option<f64>,
    #[serde(alias = "temperatureApparent")]
    pub temperature_apparent: Option<f64>,
    #[serde(alias = "uvHealthConcern")]
    pub uv_health_concern: Option<f64>,
    #[serde(alias = "uvIndex")]
    pub uv_index: Option<f64>,
    #[serde(alias = "visibility")]
    pub visibility: Option<f64>,
    #[serde(alias = "weatherCode")]
    pub weather_code: Option<f64>,
    #[serde(alias = "windDirection")]
    pub wind_direction: Option<f64>,
    #[serde(alias = "windGust")]
    pub wind_gust: Option<f64>,
    #[serde(alias = "windSpeed")]
    pub wind_speed: Option<f64>,
}

impl WeatherValues {
    /// Each value paired with the field name it is stored under in InfluxDB
    pub fn fields(&self) -> [(&'static str, Option<f64>); 18] {
        [
            ("cloudCover", self.cloud_cover),
            ("dewPoint", self.dew_point),
            ("freezingRainIntensity", self.freezing_rain_intensity),
            ("humidity", self.humidity),
            ("precipitationProbability", self.precipitation_probability),
            ("pressureSurfaceLevel", self.pressure_surface_level),
            ("rainIntensity", self.rain_intensity),
            ("sleetIntensity", self.sleet_intensity),
            ("snowIntensity", self.snow_intensity),
            ("temperature", self.temperature),
            ("temperatureApparent", self.temperature_apparent),
            ("uvHealthConcern", self.uv_health_concern),
            ("uvIndex", self.uv_index),
            ("visibility", self.visibility),
            ("weatherCode", self.weather_code),
            ("windDirection", self.wind_direction),
            ("windGust", self.wind_gust),
            ("windSpeed", self.wind_speed),
        ]
    }
}
