use chrono::{DateTime, Utc};
use serde::Serialize;

/// One meter sample, serialized with the query keys the ingestor expects.
#[derive(Debug, Clone, Serialize)]
pub struct MeterSample {
    #[serde(rename = "v")]
    pub voltage: f64,
    #[serde(rename = "c")]
    pub current: f64,
    #[serde(rename = "pf")]
    pub power_factor: f64,
    #[serde(rename = "l")]
    pub load_kw: f64,
    #[serde(rename = "k")]
    pub kwh: f64,
    #[serde(rename = "f")]
    pub frequency: f64,
    #[serde(rename = "d")]
    pub datetime_str: String,
    #[serde(rename = "r")]
    pub retry_count: u32,
    #[serde(rename = "s")]
    pub source: String,
}

/// Device clock format: day first, as the meters report it.
pub fn device_datetime(at: DateTime<Utc>) -> String {
    at.format("%d-%m-%Y %H:%M:%S").to_string()
}

/// Query for the boot notification a meter sends on power-up.
pub fn boot_query(device_id: &str) -> [(&'static str, String); 1] {
    [("s", format!("{}_boot", device_id))]
}
