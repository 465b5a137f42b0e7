use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single timestamped sample on one named signal.
///
/// Exactly one payload variant is meaningful per signal; a boolean point and
/// a numeric point never mix within the same buffer.
///
/// # Examples
///
/// ```
/// use siterules_common::types::{PointValue, TimedValue};
/// use chrono::Utc;
///
/// let point = TimedValue::new_bool(Utc::now(), true);
/// assert_eq!(point.numeric(), 1.0);
/// assert_eq!(point.value_bool(), Some(true));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedValue {
    pub timestamp: DateTime<Utc>,
    pub value: PointValue,
}

/// The payload of a [`TimedValue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum PointValue {
    Double(f64),
    Bool(bool),
    Text(String),
}

impl TimedValue {
    pub fn new_double(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value: PointValue::Double(value),
        }
    }

    pub fn new_bool(timestamp: DateTime<Utc>, value: bool) -> Self {
        Self {
            timestamp,
            value: PointValue::Bool(value),
        }
    }

    pub fn new_text(timestamp: DateTime<Utc>, value: impl Into<String>) -> Self {
        Self {
            timestamp,
            value: PointValue::Text(value.into()),
        }
    }

    /// The numeric projection used by compression and delta functions:
    /// doubles pass through, booleans map to 1.0/0.0, text has no numeric
    /// reading and yields NaN.
    pub fn numeric(&self) -> f64 {
        match &self.value {
            PointValue::Double(d) => *d,
            PointValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            PointValue::Text(_) => f64::NAN,
        }
    }

    pub fn value_double(&self) -> Option<f64> {
        match &self.value {
            PointValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn value_bool(&self) -> Option<bool> {
        match &self.value {
            PointValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn value_text(&self) -> Option<&str> {
        match &self.value {
            PointValue::Text(t) => Some(t.as_str()),
            _ => None,
        }
    }

    /// Payload equality ignoring the timestamp. Buffers use this to drop
    /// samples that repeat the current last value.
    pub fn is_same_value(&self, other: &TimedValue) -> bool {
        self.value == other.value
    }
}

/// How a bound parameter folds incoming values into its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CumulativeType {
    /// Store the computed value as-is.
    #[default]
    Simple,
    /// Running sum of the computed values.
    Accumulate,
    /// Running sum of value x elapsed seconds since the previous point.
    AccumulateTimeSeconds,
    /// Running sum of value x elapsed minutes since the previous point.
    AccumulateTimeMinutes,
    /// Running sum of value x elapsed hours since the previous point.
    AccumulateTimeHours,
}

/// Why an evaluation cycle could not produce a valid result.
///
/// These are first-class output states, not errors: downstream consumers
/// distinguish "rule says false" from "rule could not evaluate".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidCategory {
    InvalidValue,
    MissingValue,
    InsufficientData,
    InsufficientRange,
}

impl std::fmt::Display for InvalidCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue => write!(f, "InvalidValue"),
            Self::MissingValue => write!(f, "MissingValue"),
            Self::InsufficientData => write!(f, "InsufficientData"),
            Self::InsufficientRange => write!(f, "InsufficientRange"),
        }
    }
}

impl std::str::FromStr for InvalidCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InvalidValue" => Ok(Self::InvalidValue),
            "MissingValue" => Ok(Self::MissingValue),
            "InsufficientData" => Ok(Self::InsufficientData),
            "InsufficientRange" => Ok(Self::InsufficientRange),
            _ => Err(format!("unknown invalid category: {s}")),
        }
    }
}

/// The "never set" timestamp sentinel carried over from legacy records.
pub fn sentinel_min() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}

/// The far-future sentinel; samples stamped with it are bogus.
pub fn sentinel_max() -> DateTime<Utc> {
    DateTime::<Utc>::MAX_UTC
}

/// True when a timestamp is one of the sentinel values and therefore not a
/// real observation time.
pub fn is_sentinel(timestamp: DateTime<Utc>) -> bool {
    timestamp == sentinel_min() || timestamp == sentinel_max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn numeric_projection() {
        let now = Utc::now();
        assert_eq!(TimedValue::new_double(now, 2.5).numeric(), 2.5);
        assert_eq!(TimedValue::new_bool(now, true).numeric(), 1.0);
        assert_eq!(TimedValue::new_bool(now, false).numeric(), 0.0);
        assert!(TimedValue::new_text(now, "open").numeric().is_nan());
    }

    #[test]
    fn same_value_ignores_timestamp() {
        let a = TimedValue::new_double(Utc::now(), 1.0);
        let b = TimedValue::new_double(Utc::now() + chrono::Duration::seconds(5), 1.0);
        assert!(a.is_same_value(&b));
        let c = TimedValue::new_double(a.timestamp, 2.0);
        assert!(!a.is_same_value(&c));
    }

    #[test]
    fn invalid_category_round_trip() {
        let cat: InvalidCategory = "MissingValue".parse().unwrap();
        assert_eq!(cat, InvalidCategory::MissingValue);
        assert_eq!(cat.to_string(), "MissingValue");
        assert!("Nope".parse::<InvalidCategory>().is_err());
    }

    #[test]
    fn sentinels_are_not_real_times() {
        assert!(is_sentinel(sentinel_min()));
        assert!(is_sentinel(sentinel_max()));
        assert!(!is_sentinel(Utc::now()));
    }
}
