use crate::model::NewReading;
use std::collections::HashMap;
use std::fmt;

const VOLTAGE_MIN: f64 = 0.0;
const VOLTAGE_MAX: f64 = 500.0;
const CURRENT_MIN: f64 = 0.0;
const CURRENT_MAX: f64 = 1000.0;
const POWER_FACTOR_MIN: f64 = 0.0;
const POWER_FACTOR_MAX: f64 = 1.0;
const LOAD_MIN: f64 = 0.0;
const KWH_MIN: f64 = 0.0;
const FREQUENCY_MIN: f64 = 45.0;
const FREQUENCY_MAX: f64 = 65.0;

/// A numeric telemetry parameter and its accepted range.
#[derive(Debug, Clone, Copy)]
struct Field {
    key: &'static str,
    name: &'static str,
    min: f64,
    max: Option<f64>,
}

const VOLTAGE: Field = Field {
    key: "v",
    name: "voltage",
    min: VOLTAGE_MIN,
    max: Some(VOLTAGE_MAX),
};
const CURRENT: Field = Field {
    key: "c",
    name: "current",
    min: CURRENT_MIN,
    max: Some(CURRENT_MAX),
};
const POWER_FACTOR: Field = Field {
    key: "pf",
    name: "power_factor",
    min: POWER_FACTOR_MIN,
    max: Some(POWER_FACTOR_MAX),
};
const LOAD_KW: Field = Field {
    key: "l",
    name: "load_kw",
    min: LOAD_MIN,
    max: None,
};
const KWH: Field = Field {
    key: "k",
    name: "kwh",
    min: KWH_MIN,
    max: None,
};
const FREQUENCY: Field = Field {
    key: "f",
    name: "frequency",
    min: FREQUENCY_MIN,
    max: Some(FREQUENCY_MAX),
};

const REQUIRED: [Field; 3] = [VOLTAGE, CURRENT, KWH];

pub const SOURCE_KEY: &str = "s";
const DEVICE_TIMESTAMP_KEY: &str = "d";
const RETRY_COUNT_KEY: &str = "r";

/// Why a submission was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Every required parameter that was absent or empty.
    MissingFields(Vec<&'static str>),
    /// Text that does not parse as the field's numeric type.
    InvalidNumber {
        key: &'static str,
        field: &'static str,
        value: String,
    },
    OutOfRange {
        key: &'static str,
        field: &'static str,
        value: f64,
        min: f64,
        max: Option<f64>,
    },
}

impl ValidationError {
    /// Parameter keys that caused the rejection.
    pub fn fields(&self) -> Vec<&'static str> {
        match self {
            ValidationError::MissingFields(keys) => keys.clone(),
            ValidationError::InvalidNumber { key, .. }
            | ValidationError::OutOfRange { key, .. } => vec![*key],
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingFields(keys) => {
                let described: Vec<String> = keys
                    .iter()
                    .map(|key| match REQUIRED.iter().find(|field| field.key == *key) {
                        Some(field) => format!("{} ({})", key, field.name),
                        None => key.to_string(),
                    })
                    .collect();
                write!(f, "Missing required fields: {}", described.join(", "))
            }
            ValidationError::InvalidNumber { key, field, value } => {
                write!(f, "Invalid value for {} ({}): '{}' is not a number", key, field, value)
            }
            ValidationError::OutOfRange { field, value, min, max: Some(max), .. } => {
                write!(f, "{} {} out of range [{}, {}]", field, value, min, max)
            }
            ValidationError::OutOfRange { field, value, min, max: None, .. } => {
                write!(f, "{} {} below minimum {}", field, value, min)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Parses raw request parameters into a typed reading.
///
/// Required fields are checked first and all missing ones are reported
/// together. After that, fields are parsed in order and the first parse
/// or range failure is returned.
pub fn parse_reading(params: &HashMap<String, String>) -> Result<NewReading, ValidationError> {
    let missing: Vec<&'static str> = REQUIRED
        .iter()
        .filter(|field| present(params, field.key).is_none())
        .map(|field| field.key)
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingFields(missing));
    }

    let voltage = parse_field(params, VOLTAGE)?;
    let current = parse_field(params, CURRENT)?;
    let power_factor = parse_field(params, POWER_FACTOR)?;
    let load_kw = parse_field(params, LOAD_KW)?;
    let kwh = parse_field(params, KWH)?;
    let frequency = parse_field(params, FREQUENCY)?;

    let retry_count = match present(params, RETRY_COUNT_KEY) {
        Some(raw) => raw.parse::<i64>().map_err(|_| ValidationError::InvalidNumber {
            key: RETRY_COUNT_KEY,
            field: "retry_count",
            value: raw.to_string(),
        })?,
        None => 0,
    };

    Ok(NewReading {
        voltage,
        current,
        power_factor,
        load_kw,
        kwh,
        frequency,
        device_timestamp: params
            .get(DEVICE_TIMESTAMP_KEY)
            .filter(|d| !d.is_empty())
            .cloned(),
        retry_count,
        source: source(params).to_string(),
    })
}

/// The reporting source, empty when not supplied.
pub fn source(params: &HashMap<String, String>) -> &str {
    params.get(SOURCE_KEY).map(String::as_str).unwrap_or("")
}

/// Boot notifications are recognised by "boot" anywhere in the source, any case.
pub fn is_boot_notification(source: &str) -> bool {
    source.to_lowercase().contains("boot")
}

fn present<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .map(|raw| raw.trim())
        .filter(|raw| !raw.is_empty())
}

fn parse_field(
    params: &HashMap<String, String>,
    field: Field,
) -> Result<Option<f64>, ValidationError> {
    let Some(raw) = present(params, field.key) else {
        return Ok(None);
    };

    let value = raw
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ValidationError::InvalidNumber {
            key: field.key,
            field: field.name,
            value: raw.to_string(),
        })?;

    let above_max = field.max.is_some_and(|max| value > max);
    if value < field.min || above_max {
        return Err(ValidationError::OutOfRange {
            key: field.key,
            field: field.name,
            value,
            min: field.min,
            max: field.max,
        });
    }

    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn valid_with(key: &str, value: &str) -> HashMap<String, String> {
        let mut p = params(&[("v", "230"), ("c", "5"), ("k", "100")]);
        p.insert(key.to_string(), value.to_string());
        p
    }

    #[test]
    fn test_valid_reading() {
        let p = params(&[
            ("v", "230.5"),
            ("c", "8.750"),
            ("pf", "0.92"),
            ("l", "2.01560"),
            ("k", "1250.75"),
            ("f", "50.2"),
            ("d", "26-07-2025 13:05:30"),
            ("r", "0"),
            ("s", "atmega328pb"),
        ]);

        let reading = parse_reading(&p).unwrap();
        assert_eq!(reading.voltage, Some(230.5));
        assert_eq!(reading.current, Some(8.75));
        assert_eq!(reading.power_factor, Some(0.92));
        assert_eq!(reading.load_kw, Some(2.0156));
        assert_eq!(reading.kwh, Some(1250.75));
        assert_eq!(reading.frequency, Some(50.2));
        assert_eq!(reading.device_timestamp.as_deref(), Some("26-07-2025 13:05:30"));
        assert_eq!(reading.retry_count, 0);
        assert_eq!(reading.source, "atmega328pb");
    }

    #[test]
    fn test_optional_fields_absent() {
        let reading = parse_reading(&params(&[("v", "230"), ("c", "1"), ("k", "5")])).unwrap();
        assert_eq!(reading.power_factor, None);
        assert_eq!(reading.load_kw, None);
        assert_eq!(reading.frequency, None);
        assert_eq!(reading.device_timestamp, None);
        assert_eq!(reading.retry_count, 0);
        assert_eq!(reading.source, "");
    }

    #[test]
    fn test_missing_fields_are_all_reported() {
        let err = parse_reading(&params(&[("pf", "0.9")])).unwrap_err();
        assert_eq!(err, ValidationError::MissingFields(vec!["v", "c", "k"]));
        assert_eq!(
            err.to_string(),
            "Missing required fields: v (voltage), c (current), k (kwh)"
        );

        let err = parse_reading(&params(&[("v", "230"), ("c", "")])).unwrap_err();
        assert_eq!(err.fields(), vec!["c", "k"]);
    }

    #[test]
    fn test_voltage_boundaries() {
        assert!(parse_reading(&valid_with("v", "0")).is_ok());
        assert!(parse_reading(&valid_with("v", "500")).is_ok());
        assert!(parse_reading(&valid_with("v", "-0.01")).is_err());
        assert!(parse_reading(&valid_with("v", "500.01")).is_err());
    }

    #[test]
    fn test_current_boundaries() {
        assert!(parse_reading(&valid_with("c", "0")).is_ok());
        assert!(parse_reading(&valid_with("c", "1000")).is_ok());
        assert!(parse_reading(&valid_with("c", "-0.01")).is_err());
        assert!(parse_reading(&valid_with("c", "1000.01")).is_err());
    }

    #[test]
    fn test_power_factor_boundaries() {
        assert!(parse_reading(&valid_with("pf", "0")).is_ok());
        assert!(parse_reading(&valid_with("pf", "1")).is_ok());
        assert!(parse_reading(&valid_with("pf", "-0.01")).is_err());
        assert!(parse_reading(&valid_with("pf", "1.01")).is_err());
    }

    #[test]
    fn test_frequency_boundaries() {
        assert!(parse_reading(&valid_with("f", "45")).is_ok());
        assert!(parse_reading(&valid_with("f", "65")).is_ok());
        assert!(parse_reading(&valid_with("f", "44.99")).is_err());
        assert!(parse_reading(&valid_with("f", "65.01")).is_err());
    }

    #[test]
    fn test_load_and_kwh_unbounded_above() {
        assert!(parse_reading(&valid_with("l", "0")).is_ok());
        assert!(parse_reading(&valid_with("l", "123456789")).is_ok());
        assert!(parse_reading(&valid_with("l", "-0.01")).is_err());
        assert!(parse_reading(&valid_with("k", "0")).is_ok());
        assert!(parse_reading(&valid_with("k", "99999999.5")).is_ok());

        let err = parse_reading(&valid_with("k", "-1")).unwrap_err();
        assert_eq!(err.to_string(), "kwh -1 below minimum 0");
    }

    #[test]
    fn test_out_of_range_names_field_and_value() {
        let err = parse_reading(&valid_with("v", "600")).unwrap_err();
        assert_eq!(err.fields(), vec!["v"]);
        assert_eq!(err.to_string(), "voltage 600 out of range [0, 500]");
    }

    #[test]
    fn test_parse_failure_distinct_from_range_failure() {
        let err = parse_reading(&valid_with("pf", "abc")).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidNumber { field: "power_factor", .. }));
        assert!(err.to_string().contains("'abc'"));

        let err = parse_reading(&valid_with("pf", "2")).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { field: "power_factor", .. }));
    }

    #[test]
    fn test_non_finite_rejected() {
        assert!(parse_reading(&valid_with("l", "inf")).is_err());
        assert!(parse_reading(&valid_with("v", "NaN")).is_err());
    }

    #[test]
    fn test_whitespace_trimmed() {
        let reading = parse_reading(&valid_with("f", " 50.0 ")).unwrap();
        assert_eq!(reading.frequency, Some(50.0));
    }

    #[test]
    fn test_retry_count() {
        assert_eq!(parse_reading(&valid_with("r", "3")).unwrap().retry_count, 3);
        assert_eq!(parse_reading(&valid_with("r", "")).unwrap().retry_count, 0);

        let err = parse_reading(&valid_with("r", "1.5")).unwrap_err();
        assert_eq!(err.fields(), vec!["r"]);
    }

    #[test]
    fn test_validation_is_deterministic() {
        let p = valid_with("pf", "0.5");
        assert_eq!(parse_reading(&p), parse_reading(&p));
    }

    #[test]
    fn test_boot_detection() {
        assert!(is_boot_notification("atmega_BOOT"));
        assert!(is_boot_notification("Reboot-1"));
        assert!(!is_boot_notification("atmega328pb"));
        assert!(!is_boot_notification(""));
    }
}
