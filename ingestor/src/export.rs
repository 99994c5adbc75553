use crate::errors::{Error, Result};
use crate::model::Reading;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const CSV_COLUMNS: [&str; 11] = [
    "id",
    "voltage",
    "current",
    "power_factor",
    "load_kw",
    "kwh",
    "frequency",
    "datetime_str",
    "retry_count",
    "source",
    "received_at",
];

#[derive(Serialize)]
struct CsvRow<'a> {
    id: i64,
    voltage: Option<f64>,
    current: Option<f64>,
    power_factor: Option<f64>,
    load_kw: Option<f64>,
    kwh: Option<f64>,
    frequency: Option<f64>,
    datetime_str: Option<&'a str>,
    retry_count: i64,
    source: &'a str,
    received_at: DateTime<Utc>,
}

impl<'a> From<&'a Reading> for CsvRow<'a> {
    fn from(r: &'a Reading) -> Self {
        Self {
            id: r.id,
            voltage: r.voltage,
            current: r.current,
            power_factor: r.power_factor,
            load_kw: r.load_kw,
            kwh: r.kwh,
            frequency: r.frequency,
            datetime_str: r.device_timestamp.as_deref(),
            retry_count: r.retry_count,
            source: &r.source,
            received_at: r.received_at,
        }
    }
}

/// Renders readings as CSV; the header row is always present.
pub fn readings_to_csv(readings: &[Reading]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    writer.write_record(CSV_COLUMNS)?;
    for reading in readings {
        writer.serialize(CsvRow::from(reading))?;
    }

    writer.into_inner().map_err(|e| Error::Io(e.into_error()))
}

/// Download name stamped with the export time.
pub fn export_filename(now: DateTime<Utc>) -> String {
    format!("meter_data_{}.csv", now.format("%Y%m%d_%H%M%S"))
}
