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

use influxdb2::models::{DataPoint, WriteDataPoint};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Value of a single field of a `Point`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    String(String),
    Boolean(bool),
}

/// A single timestamped measurement bound for InfluxDB.
///
/// Tags and fields are kept sorted by key so that the line protocol generated for
/// a point is stable. Timestamps are in milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Option<i64>,
}

impl Point {
    pub fn new<S: Into<String>>(measurement: S) -> Self {
        Point {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: None,
        }
    }

    pub fn tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add a float field. InfluxDB can't store NaN or infinite values so they are dropped.
    pub fn float_field<K: Into<String>>(mut self, key: K, value: f64) -> Self {
        if value.is_finite() {
            self.fields.insert(key.into(), FieldValue::Float(value));
        }

        self
    }

    pub fn integer_field<K: Into<String>>(mut self, key: K, value: i64) -> Self {
        self.fields.insert(key.into(), FieldValue::Integer(value));
        self
    }

    pub fn string_field<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.fields.insert(key.into(), FieldValue::String(value.into()));
        self
    }

    pub fn boolean_field<K: Into<String>>(mut self, key: K, value: bool) -> Self {
        self.fields.insert(key.into(), FieldValue::Boolean(value));
        self
    }

    pub fn timestamp_millis(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    /// Stamp the point with the current wall clock time.
    pub fn now(self) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        self.timestamp_millis(millis)
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|s| s.as_str())
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// Render this point as a single line of InfluxDB line protocol.
    ///
    /// Default tags are only used when the point doesn't set a tag with the same key.
    /// Returns `None` if the point has no fields since InfluxDB rejects such lines.
    pub fn to_line_protocol(&self, default_tags: &BTreeMap<String, String>) -> Option<String> {
        if self.fields.is_empty() {
            return None;
        }

        let mut tags = default_tags.clone();
        tags.extend(self.tags.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut builder = DataPoint::builder(escape_control(&self.measurement));
        // Empty tag values aren't allowed by InfluxDB
        for (k, v) in tags.iter().filter(|(_, v)| !v.is_empty()) {
            builder = builder.tag(escape_control(k), escape_control(v));
        }

        for (k, v) in self.fields.iter() {
            let key = escape_control(k);
            builder = match v {
                FieldValue::Float(f) => builder.field(key, *f),
                FieldValue::Integer(n) => builder.field(key, *n),
                FieldValue::String(s) => builder.field(key, escape_control(s)),
                FieldValue::Boolean(b) => builder.field(key, *b),
            };
        }

        if let Some(ts) = self.timestamp {
            builder = builder.timestamp(ts);
        }

        let point = builder.build().ok()?;
        let mut buf = Vec::new();
        point.write_data_point_to(&mut buf).ok()?;
        String::from_utf8(buf)
            .ok()
            .map(|line| line.trim_end_matches('\n').to_owned())
    }
}

/// Replace newlines, carriage returns and tabs with their escaped form. Line protocol
/// has no escape for them and a raw newline would split a point into two lines.
fn escape_control(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::{FieldValue, Point};
    use std::collections::BTreeMap;

    fn no_tags() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn test_line_protocol_fields_and_tags() {
        let point = Point::new("sample")
            .tag("sensor_id", "porch")
            .string_field("status", "ok")
            .float_field("temperature_celsius", 21.5)
            .float_field("distance_cm", 12.0)
            .integer_field("count", 3)
            .timestamp_millis(1700000000000);

        assert_eq!(
            Some("sample,sensor_id=porch count=3i,distance_cm=12,status=\"ok\",temperature_celsius=21.5 1700000000000".to_owned()),
            point.to_line_protocol(&no_tags())
        );
    }

    #[test]
    fn test_line_protocol_boolean_field() {
        let point = Point::new("sample").boolean_field("online", true);
        assert_eq!(Some(&FieldValue::Boolean(true)), point.field("online"));

        let line = point.to_line_protocol(&no_tags()).unwrap();
        assert!(line.starts_with("sample online="));
        assert_eq!(1, line.lines().count());
    }

    #[test]
    fn test_line_protocol_control_characters() {
        let point = Point::new("sample")
            .tag("sensor_id", "porch\nshed")
            .tag("room\tname", "back\r\nyard")
            .string_field("status", "line one\nline two")
            .float_field("t", 1.0);

        let line = point.to_line_protocol(&no_tags()).unwrap();
        assert_eq!(1, line.lines().count());
        assert!(!line.contains('\n'));
        assert!(!line.contains('\r'));
        assert!(!line.contains('\t'));
        assert!(line.contains("sensor_id=porch\\nshed"));
        assert!(line.contains("room\\tname=back\\r\\nyard"));
    }

    #[test]
    fn test_line_protocol_escaping() {
        let point = Point::new("weather data,v2")
            .tag("location", "777 Glades Rd, Boca=Raton")
            .string_field("message", "say \"hi\" \\ bye");

        assert_eq!(
            Some(
                "weather\\ data\\,v2,location=777\\ Glades\\ Rd\\,\\ Boca\\=Raton message=\"say \\\"hi\\\" \\\\ bye\""
                    .to_owned()
            ),
            point.to_line_protocol(&no_tags())
        );
    }

    #[test]
    fn test_line_protocol_default_tags() {
        let mut defaults = BTreeMap::new();
        defaults.insert("region".to_owned(), "west".to_owned());
        defaults.insert("location".to_owned(), "unknown".to_owned());

        let point = Point::new("weatherData")
            .tag("location", "home")
            .float_field("temperature", 18.25);

        assert_eq!(
            Some("weatherData,location=home,region=west temperature=18.25".to_owned()),
            point.to_line_protocol(&defaults)
        );
    }

    #[test]
    fn test_line_protocol_no_fields() {
        let point = Point::new("empty").tag("location", "home").float_field("bad", f64::NAN);
        assert_eq!(None, point.field("bad"));
        assert_eq!(None, point.to_line_protocol(&no_tags()));
    }

    #[test]
    fn test_line_protocol_skips_empty_tag() {
        let point = Point::new("sample").tag("sensor_id", "").integer_field("n", -4);
        assert_eq!(Some("sample n=-4i".to_owned()), point.to_line_protocol(&no_tags()));
        assert_eq!(Some(&FieldValue::Integer(-4)), point.field("n"));
    }
}
