//! Rule-driven payload codec
//!
//! [`Codec::decode`] and [`Codec::encode`] are pure functions of the payload
//! (or record), the product key and the immutable [`RuleTable`].
//!
//! # Self-describing layout
//!
//! ```text
//! [header fields] ( [type_id: 1] [fields of that sensor group] )*
//! ```
//!
//! # Fixed layout
//!
//! ```text
//! [fields of group 1] [fields of group 2] ...
//! ```
//!
//! Errors are fatal to the payload at hand only. A truncated stream is
//! always reported, never partially returned.

use crate::error::{DecodeError, EncodeError};
use crate::geohash::{self, POSITION_PRECISION};
use crate::legacy;
use crate::record::{Group, Measurement, SensorRecord, Value};
use crate::rules::{
    ByteOrder, Field, Layout, PackedType, ProductKey, ProductRule, RawValue, RuleTable, SubRecord,
};

/// Decimal places kept for coordinates before they become a geohash
const COORDINATE_DECIMALS: u8 = 7;

/// Encoder/decoder bound to a rule table
#[derive(Debug, Clone, Default)]
pub struct Codec {
    rules: RuleTable,
}

impl Codec {
    /// Create a codec over a rule table
    pub fn new(rules: RuleTable) -> Self {
        Self { rules }
    }

    /// The rule table in use
    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Decode a payload for a product
    pub fn decode(&self, payload: &[u8], product: &ProductKey) -> Result<SensorRecord, DecodeError> {
        let rule = self
            .rules
            .resolve(product)
            .ok_or_else(|| DecodeError::UnknownProduct(self.rules.product_name(product)))?;
        if payload.is_empty() {
            return Err(DecodeError::Empty(rule.name.clone()));
        }

        let record = match &rule.layout {
            Layout::SelfDescribing { header, sensors: _ } => {
                self.decode_self_describing(rule, header.as_ref(), payload)?
            }
            Layout::Fixed { records } => self.decode_fixed(rule, records, payload)?,
            Layout::Legacy(kind) => legacy::decode(*kind, &rule.name, payload)?,
        };

        #[cfg(feature = "logging")]
        log::trace!(
            "decoded {} bytes as {}: {} groups",
            payload.len(),
            rule.name,
            record.groups.len()
        );

        Ok(record)
    }

    /// Encode a record for a product
    pub fn encode(&self, record: &SensorRecord, product: &ProductKey) -> Result<Vec<u8>, EncodeError> {
        let rule = self
            .rules
            .resolve(product)
            .ok_or_else(|| EncodeError::UnknownProduct(self.rules.product_name(product)))?;
        let mut writer = Writer::new(rule.byte_order);

        match &rule.layout {
            Layout::SelfDescribing { header, sensors } => {
                check_groups(rule, record, sensors)?;
                if let Some(header) = header {
                    self.encode_group(rule, header, Some(&record.header), &mut writer)?;
                }
                for sub in sensors {
                    let Some(group) = record.groups.get(&sub.sensor) else {
                        continue;
                    };
                    if let Some(type_id) = sub.type_id {
                        writer.write(PackedType::U8, RawValue::Int(type_id as i64));
                    }
                    self.encode_group(rule, sub, Some(group), &mut writer)?;
                }
            }
            Layout::Fixed { records } => {
                check_groups(rule, record, records)?;
                for sub in records {
                    self.encode_group(rule, sub, record.groups.get(&sub.sensor), &mut writer)?;
                }
            }
            Layout::Legacy(_) => return Err(EncodeError::Unsupported(rule.name.clone())),
        }

        Ok(writer.into_bytes())
    }

    fn decode_self_describing(
        &self,
        rule: &ProductRule,
        header: Option<&SubRecord>,
        payload: &[u8],
    ) -> Result<SensorRecord, DecodeError> {
        let mut reader = Reader::new(payload, rule.byte_order);
        let mut record = SensorRecord::new();

        if let Some(header) = header {
            record.header = self.decode_group(rule, header, &mut reader)?;
        }

        while let Some(type_id) = reader.byte() {
            let offset = reader.pos - 1;
            let sub = rule
                .sensor_by_type(type_id)
                .ok_or_else(|| DecodeError::UnknownSensor {
                    product: rule.name.clone(),
                    type_id,
                    offset,
                })?;
            let group = self.decode_group(rule, sub, &mut reader)?;
            record.groups.insert(sub.sensor.clone(), group);
        }

        Ok(record)
    }

    fn decode_fixed(
        &self,
        rule: &ProductRule,
        records: &[SubRecord],
        payload: &[u8],
    ) -> Result<SensorRecord, DecodeError> {
        let needed: usize = records.iter().map(SubRecord::width).sum();
        if payload.len() > needed {
            return Err(DecodeError::TrailingBytes {
                product: rule.name.clone(),
                extra: payload.len() - needed,
            });
        }

        let mut reader = Reader::new(payload, rule.byte_order);
        let mut record = SensorRecord::new();
        for sub in records {
            let group = self.decode_group(rule, sub, &mut reader)?;
            record.groups.insert(sub.sensor.clone(), group);
        }
        Ok(record)
    }

    fn decode_group(
        &self,
        rule: &ProductRule,
        sub: &SubRecord,
        reader: &mut Reader<'_>,
    ) -> Result<Group, DecodeError> {
        let needed = sub.width();
        if reader.remaining() < needed {
            return Err(DecodeError::Truncated {
                product: rule.name.clone(),
                sensor: sub.sensor.clone(),
                needed,
                available: reader.remaining(),
            });
        }

        let mut group = Group::new();
        let mut lat = None;
        let mut lon = None;
        let mut has_position = false;

        for field in &sub.fields {
            let raw = reader
                .read(field.packed)
                .ok_or_else(|| DecodeError::Truncated {
                    product: rule.name.clone(),
                    sensor: sub.sensor.clone(),
                    needed,
                    available: reader.remaining(),
                })?;

            if field.is_coordinate() {
                has_position = true;
                let value = raw_coordinate(field, raw);
                if field.name.starts_with("lat") {
                    lat = value;
                } else {
                    lon = value;
                }
                continue;
            }
            group.insert(field.name.clone(), self.physical(field, raw));
        }

        if has_position {
            let hash = match (lat, lon) {
                (Some(lat), Some(lon)) => geohash::encode(lat, lon, POSITION_PRECISION),
                _ => None,
            };
            group.insert(
                "geohash".to_string(),
                Measurement {
                    value: hash.map(Value::Text),
                    unit: None,
                },
            );
        }

        Ok(group)
    }

    fn physical(&self, field: &Field, raw: RawValue) -> Measurement {
        if field.sentinel.matches(raw) {
            return Measurement::undefined();
        }
        let raw = raw.as_f64();
        if !raw.is_finite() {
            return Measurement::undefined();
        }
        let value = round_to(field.calibration.inverse(raw), field.precision());
        let mut measurement = Measurement::new(value);
        if let Some(unit) = &field.unit {
            if !self.rules.is_default_unit(unit) {
                measurement.unit = Some(unit.clone());
            }
        }
        measurement
    }

    fn encode_group(
        &self,
        rule: &ProductRule,
        sub: &SubRecord,
        group: Option<&Group>,
        writer: &mut Writer,
    ) -> Result<(), EncodeError> {
        let position = group
            .and_then(|g| g.get("geohash"))
            .and_then(Measurement::text)
            .and_then(geohash::decode);

        for field in &sub.fields {
            let invalid = |reason: &str| EncodeError::InvalidValue {
                product: rule.name.clone(),
                sensor: sub.sensor.clone(),
                field: field.name.clone(),
                reason: reason.to_string(),
            };

            let measurement = group.and_then(|g| g.get(&field.name));
            let physical = match measurement {
                Some(m) => {
                    if let (Some(given), Some(declared)) = (&m.unit, &field.unit) {
                        if given != declared {
                            return Err(invalid(&format!(
                                "unit {} does not match {}",
                                given, declared
                            )));
                        }
                    }
                    match &m.value {
                        None => None,
                        Some(Value::Number(v)) => Some(*v),
                        Some(Value::Text(_)) => return Err(invalid("expected a number")),
                    }
                }
                None if field.is_coordinate() => position.map(|(lat, lon)| {
                    if field.name.starts_with("lat") {
                        lat
                    } else {
                        lon
                    }
                }),
                None => None,
            };

            let raw = match physical {
                None => field
                    .sentinel
                    .raw()
                    .ok_or_else(|| invalid("no reading, and the field has no sentinel"))?,
                Some(value) => to_raw(rule, sub, field, value)?,
            };
            writer.write(field.packed, raw);
        }
        Ok(())
    }
}

fn check_groups(
    rule: &ProductRule,
    record: &SensorRecord,
    defined: &[SubRecord],
) -> Result<(), EncodeError> {
    for name in record.groups.keys() {
        if !defined.iter().any(|sub| &sub.sensor == name) {
            return Err(EncodeError::UnknownSensor {
                product: rule.name.clone(),
                sensor: name.clone(),
            });
        }
    }
    Ok(())
}

fn raw_coordinate(field: &Field, raw: RawValue) -> Option<f64> {
    if field.sentinel.matches(raw) {
        return None;
    }
    let value = raw.as_f64();
    value
        .is_finite()
        .then(|| round_to(value, COORDINATE_DECIMALS))
}

fn to_raw(
    rule: &ProductRule,
    sub: &SubRecord,
    field: &Field,
    physical: f64,
) -> Result<RawValue, EncodeError> {
    let out_of_range = || EncodeError::OutOfRange {
        product: rule.name.clone(),
        sensor: sub.sensor.clone(),
        field: field.name.clone(),
        value: physical,
        packed: field.packed.tag(),
    };
    if !physical.is_finite() {
        return Err(EncodeError::InvalidValue {
            product: rule.name.clone(),
            sensor: sub.sensor.clone(),
            field: field.name.clone(),
            reason: "not a finite number".to_string(),
        });
    }

    let forward = if field.is_coordinate() {
        physical
    } else {
        field.calibration.forward(physical)
    };

    match field.packed.int_range() {
        Some((min, max)) => {
            // round half up
            let raw = (forward + 0.5).floor();
            if raw < min as f64 || raw > max as f64 {
                return Err(out_of_range());
            }
            let raw = RawValue::Int(raw as i64);
            if field.sentinel.matches(raw) {
                return Err(out_of_range());
            }
            Ok(raw)
        }
        None => {
            if !forward.is_finite() || forward.abs() > f32::MAX as f64 {
                return Err(out_of_range());
            }
            Ok(RawValue::Float(forward))
        }
    }
}

fn round_to(value: f64, decimals: u8) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

macro_rules! read_as {
    ($ty:ty, $order:expr, $bytes:expr) => {{
        let mut buf = [0u8; std::mem::size_of::<$ty>()];
        buf.copy_from_slice($bytes);
        match $order {
            ByteOrder::Big => <$ty>::from_be_bytes(buf),
            ByteOrder::Little => <$ty>::from_le_bytes(buf),
        }
    }};
}

macro_rules! write_as {
    ($value:expr, $order:expr, $out:expr) => {{
        match $order {
            ByteOrder::Big => $out.extend_from_slice(&$value.to_be_bytes()),
            ByteOrder::Little => $out.extend_from_slice(&$value.to_le_bytes()),
        }
    }};
}

/// Cursor over a payload
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self { buf, pos: 0, order }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(bytes)
    }

    fn byte(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn read(&mut self, packed: PackedType) -> Option<RawValue> {
        let order = self.order;
        let bytes = self.take(packed.width())?;
        Some(match packed {
            PackedType::U8 => RawValue::Int(bytes[0] as i64),
            PackedType::I8 => RawValue::Int(bytes[0] as i8 as i64),
            PackedType::U16 => RawValue::Int(read_as!(u16, order, bytes) as i64),
            PackedType::I16 => RawValue::Int(read_as!(i16, order, bytes) as i64),
            PackedType::U32 => RawValue::Int(read_as!(u32, order, bytes) as i64),
            PackedType::I32 => RawValue::Int(read_as!(i32, order, bytes) as i64),
            PackedType::F32 => RawValue::Float(read_as!(f32, order, bytes) as f64),
        })
    }
}

/// Payload builder
struct Writer {
    out: Vec<u8>,
    order: ByteOrder,
}

impl Writer {
    fn new(order: ByteOrder) -> Self {
        Self {
            out: Vec::with_capacity(51),
            order,
        }
    }

    // Range checks happen before this point, the casts only narrow.
    fn write(&mut self, packed: PackedType, raw: RawValue) {
        let order = self.order;
        match (packed, raw) {
            (PackedType::F32, raw) => write_as!(raw.as_f64() as f32, order, self.out),
            (_, RawValue::Float(v)) => self.write(packed, RawValue::Int(v as i64)),
            (PackedType::U8, RawValue::Int(v)) => self.out.push(v as u8),
            (PackedType::I8, RawValue::Int(v)) => self.out.push(v as i8 as u8),
            (PackedType::U16, RawValue::Int(v)) => write_as!(v as u16, order, self.out),
            (PackedType::I16, RawValue::Int(v)) => write_as!(v as i16, order, self.out),
            (PackedType::U32, RawValue::Int(v)) => write_as!(v as u32, order, self.out),
            (PackedType::I32, RawValue::Int(v)) => write_as!(v as i32, order, self.out),
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.out
    }
}
