use chrono::{DateTime, NaiveDate, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A persisted meter reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub id: i64,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power_factor: Option<f64>,
    pub load_kw: Option<f64>,
    pub kwh: Option<f64>,
    pub frequency: Option<f64>,
    /// Timestamp string as reported by the device, stored verbatim.
    #[serde(rename = "datetime_str")]
    #[sqlx(rename = "datetime_str")]
    pub device_timestamp: Option<String>,
    pub retry_count: i64,
    pub source: String,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A validated reading that has not been stored yet
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewReading {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power_factor: Option<f64>,
    pub load_kw: Option<f64>,
    pub kwh: Option<f64>,
    pub frequency: Option<f64>,
    pub device_timestamp: Option<String>,
    pub retry_count: i64,
    pub source: String,
}

/// Identity assigned by the store on insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InsertedReading {
    pub id: i64,
    pub received_at: DateTime<Utc>,
}

/// Liveness and error bookkeeping for one source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceStatus {
    pub source: String,
    pub last_seen: DateTime<Utc>,
    pub status: String,
    pub boot_count: i64,
    pub error_count: i64,
}

/// Entry of the persisted system-event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SystemEvent {
    pub id: i64,
    pub level: String,
    pub message: String,
    pub module: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregates over the whole store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub total_readings: i64,
    pub sources: BTreeMap<String, i64>,
    pub last_24h_readings: i64,
    pub latest_timestamp: Option<DateTime<Utc>>,
    pub avg_readings_per_hour: f64,
    pub device_statuses: Vec<DeviceStatus>,
    pub database_size_bytes: i64,
    pub database_size_mb: f64,
}

/// Filters for the newest-first reading listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadingFilter {
    pub source: Option<String>,
    /// Unparseable values fall back to the store default.
    #[serde(default, deserialize_with = "parsed_or_none")]
    pub limit: Option<u32>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub end_date: Option<NaiveDate>,
}

impl ReadingFilter {
    /// Source to filter on, ignoring the "All" sentinel and empty strings.
    pub fn effective_source(&self) -> Option<&str> {
        effective_source(self.source.as_deref())
    }
}

pub(crate) fn effective_source(source: Option<&str>) -> Option<&str> {
    source.filter(|s| !s.is_empty() && *s != "All")
}

fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match Option::<String>::deserialize(deserializer)?.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(de::Error::custom),
    }
}

fn parsed_or_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
{
    Ok(Option::<String>::deserialize(deserializer)?.and_then(|raw| raw.trim().parse().ok()))
}

/// Result of a single submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    BootAcknowledged,
    Accepted(InsertedReading),
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub status: &'static str,
    pub count: usize,
    pub data: Vec<Reading>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_blank_values_mean_unset() {
        let filter: ReadingFilter = serde_json::from_value(serde_json::json!({
            "source": "",
            "limit": "",
            "start_date": " ",
            "end_date": ""
        }))
        .unwrap();

        assert_eq!(filter.effective_source(), None);
        assert_eq!(filter.limit, None);
        assert_eq!(filter.start_date, None);
        assert_eq!(filter.end_date, None);
    }

    #[test]
    fn test_filter_parses_values() {
        let filter: ReadingFilter = serde_json::from_value(serde_json::json!({
            "source": "All",
            "limit": "25",
            "start_date": "2025-07-01",
            "end_date": "2025-07-31"
        }))
        .unwrap();

        assert_eq!(filter.effective_source(), None);
        assert_eq!(filter.limit, Some(25));
        assert_eq!(filter.start_date, NaiveDate::from_ymd_opt(2025, 7, 1));
        assert_eq!(filter.end_date, NaiveDate::from_ymd_opt(2025, 7, 31));
    }

    #[test]
    fn test_filter_bad_limit_falls_back_but_bad_date_fails() {
        let filter: ReadingFilter =
            serde_json::from_value(serde_json::json!({ "limit": "lots" })).unwrap();
        assert_eq!(filter.limit, None);

        let result: Result<ReadingFilter, _> =
            serde_json::from_value(serde_json::json!({ "start_date": "yesterday" }));
        assert!(result.is_err());
    }
}
