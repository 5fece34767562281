//! Decoded sensor records
//!
//! A [`SensorRecord`] is what the codec produces on decode and consumes on
//! encode: header values plus named sensor groups of measurements.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A physical value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    /// Numeric value, if any
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    /// Text value, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Number(_) => None,
            Self::Text(s) => Some(s),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// A value with its optional unit
///
/// `value == None` means "no reading", which is never the same as zero.
/// The unit is only present when it differs from the session default.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Measurement {
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Measurement {
    /// A reading
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
            unit: None,
        }
    }

    /// No reading
    pub fn undefined() -> Self {
        Self::default()
    }

    /// Attach a unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Whether this is "no reading"
    pub fn is_undefined(&self) -> bool {
        self.value.is_none()
    }

    /// Numeric value, if defined and numeric
    pub fn number(&self) -> Option<f64> {
        self.value.as_ref().and_then(Value::as_f64)
    }

    /// Text value, if defined and textual
    pub fn text(&self) -> Option<&str> {
        self.value.as_ref().and_then(Value::as_str)
    }
}

/// Measurements of one sensor group, by field name
pub type Group = BTreeMap<String, Measurement>;

/// Header values plus sensor groups
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorRecord {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: Group,
    pub groups: BTreeMap<String, Group>,
}

impl SensorRecord {
    /// Empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one measurement, creating the group when needed
    pub fn set(
        &mut self,
        group: impl Into<String>,
        field: impl Into<String>,
        measurement: Measurement,
    ) -> &mut Self {
        self.groups
            .entry(group.into())
            .or_default()
            .insert(field.into(), measurement);
        self
    }

    /// Set one header value
    pub fn set_header(&mut self, field: impl Into<String>, measurement: Measurement) -> &mut Self {
        self.header.insert(field.into(), measurement);
        self
    }

    /// Look up a measurement
    pub fn get(&self, group: &str, field: &str) -> Option<&Measurement> {
        self.groups.get(group).and_then(|g| g.get(field))
    }

    /// Numeric value of a measurement
    pub fn number(&self, group: &str, field: &str) -> Option<f64> {
        self.get(group, field).and_then(Measurement::number)
    }

    /// Look up a group
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// Whether there are no groups and no header values
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.header.is_empty()
    }

    /// Total number of measurements across groups
    pub fn measurement_count(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_undefined_is_not_zero() {
        let m = Measurement::undefined();
        assert!(m.is_undefined());
        assert_eq!(m.number(), None);
        assert_eq!(Measurement::new(0.0).number(), Some(0.0));
    }

    #[test]
    fn test_record_set_get() {
        let mut record = SensorRecord::new();
        record
            .set("BME280", "temp", Measurement::new(21.5))
            .set("BME280", "rv", Measurement::undefined())
            .set("NEO-6", "geohash", Measurement::new("u1hjtzwmqd"));
        assert_eq!(record.number("BME280", "temp"), Some(21.5));
        assert!(record.get("BME280", "rv").unwrap().is_undefined());
        assert_eq!(record.get("NEO-6", "geohash").unwrap().text(), Some("u1hjtzwmqd"));
        assert_eq!(record.measurement_count(), 3);
    }

    #[test]
    fn test_measurement_json_shape() {
        let m = Measurement::new(12.5).with_unit("V");
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#"{"value":12.5,"unit":"V"}"#);
        let undefined = serde_json::to_string(&Measurement::undefined()).unwrap();
        assert_eq!(undefined, r#"{"value":null}"#);
    }
}
