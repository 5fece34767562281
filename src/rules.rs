//! Codec rule tables
//!
//! A rule table describes, per product, how payload bytes map to named,
//! calibrated, unit-tagged values. Products are addressed by name or by
//! the LoRaWAN port they arrive on:
//!
//! ```text
//! ProductKey::ByPort(12) ──ports──► "weerDIY1" ──products──► ProductRule
//!                                                            ├─ byte order
//!                                                            └─ layout
//!                                                               ├─ SelfDescribing { header, sensors[type_id] }
//!                                                               ├─ Fixed { records }
//!                                                               └─ Legacy(kind)
//! ```
//!
//! Tables are immutable once built and are shared by reference.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// Units that are implied and therefore not attached to decoded values
pub const DEFAULT_UNITS: &[&str] = &[
    "%", "C", "hPa", "mm/h", "degrees", "sec", "m", "Kohm", "ug/m3", "pcs/m3", "m/sec",
];

/// Binary width and signedness of a packed field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub enum PackedType {
    /// `B` unsigned byte
    U8,
    /// `b` signed byte
    I8,
    /// `H` unsigned short
    U16,
    /// `h` signed short
    I16,
    /// `L` unsigned long
    U32,
    /// `l` signed long
    I32,
    /// `f` IEEE single precision float
    F32,
}

impl PackedType {
    /// Parse a single-character type tag
    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'B' => Some(Self::U8),
            'b' => Some(Self::I8),
            'H' => Some(Self::U16),
            'h' => Some(Self::I16),
            'L' => Some(Self::U32),
            'l' => Some(Self::I32),
            'f' => Some(Self::F32),
            _ => None,
        }
    }

    /// The type tag of this packed type
    pub fn tag(self) -> char {
        match self {
            Self::U8 => 'B',
            Self::I8 => 'b',
            Self::U16 => 'H',
            Self::I16 => 'h',
            Self::U32 => 'L',
            Self::I32 => 'l',
            Self::F32 => 'f',
        }
    }

    /// Width in bytes
    pub fn width(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
        }
    }

    /// Whether values are IEEE floats
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32)
    }

    /// Inclusive integer range, `None` for floats
    pub fn int_range(self) -> Option<(i64, i64)> {
        match self {
            Self::U8 => Some((0, u8::MAX as i64)),
            Self::I8 => Some((i8::MIN as i64, i8::MAX as i64)),
            Self::U16 => Some((0, u16::MAX as i64)),
            Self::I16 => Some((i16::MIN as i64, i16::MAX as i64)),
            Self::U32 => Some((0, u32::MAX as i64)),
            Self::I32 => Some((i32::MIN as i64, i32::MAX as i64)),
            Self::F32 => None,
        }
    }

    /// Conventional "no reading" marker: the maximal value, or NaN
    pub fn default_sentinel(self) -> Sentinel {
        match self.int_range() {
            Some((_, max)) => Sentinel::Int(max),
            None => Sentinel::NaN,
        }
    }
}

impl TryFrom<char> for PackedType {
    type Error = RuleError;

    fn try_from(tag: char) -> Result<Self, Self::Error> {
        Self::from_tag(tag).ok_or(RuleError::UnknownPackedType(tag))
    }
}

impl From<PackedType> for char {
    fn from(packed: PackedType) -> char {
        packed.tag()
    }
}

impl fmt::Display for PackedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// A value as it sits in the payload, before calibration
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue {
    Int(i64),
    Float(f64),
}

impl RawValue {
    /// Numeric value as f64
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }
}

/// Encoded representation of "no reading"
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Sentinel {
    /// Field has no reserved marker, every bit pattern is a reading
    #[default]
    None,
    /// Reserved integer bit pattern
    Int(i64),
    /// IEEE NaN
    NaN,
}

impl Sentinel {
    /// Whether a raw value is this sentinel
    pub fn matches(&self, raw: RawValue) -> bool {
        match (self, raw) {
            (Self::Int(s), RawValue::Int(v)) => *s == v,
            (Self::NaN, RawValue::Float(v)) => v.is_nan(),
            _ => false,
        }
    }

    /// Raw value to write for an undefined reading
    pub fn raw(&self) -> Option<RawValue> {
        match self {
            Self::None => None,
            Self::Int(v) => Some(RawValue::Int(*v)),
            Self::NaN => Some(RawValue::Float(f64::NAN)),
        }
    }
}

/// Taylor-series calibration `a0 + a1*x + a2*x^2 + ...`
///
/// The polynomial maps a physical value to its raw representation; decode
/// runs the inverse. An empty coefficient list is the identity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Calibration(Vec<f64>);

impl Calibration {
    const NEWTON_STEPS: usize = 32;

    /// Identity transform
    pub fn identity() -> Self {
        Self(Vec::new())
    }

    /// `raw = physical * scale + offset`
    pub fn linear(offset: f64, scale: f64) -> Self {
        Self(vec![offset, scale])
    }

    /// Arbitrary polynomial, lowest order first
    pub fn new(coefficients: Vec<f64>) -> Self {
        Self(coefficients)
    }

    /// Coefficients, lowest order first
    pub fn coefficients(&self) -> &[f64] {
        &self.0
    }

    /// Whether this calibration leaves values untouched
    pub fn is_identity(&self) -> bool {
        match self.0.as_slice() {
            [] => true,
            [offset] => *offset == 0.0,
            [offset, scale] => *offset == 0.0 && *scale == 1.0,
            _ => false,
        }
    }

    /// First order coefficient
    pub fn scale(&self) -> f64 {
        self.0.get(1).copied().unwrap_or(1.0)
    }

    fn offset(&self) -> f64 {
        self.0.first().copied().unwrap_or(0.0)
    }

    /// Whether the transform can be inverted
    pub fn is_invertible(&self) -> bool {
        self.0.len() < 2 || self.scale() != 0.0
    }

    /// physical -> raw
    pub fn forward(&self, physical: f64) -> f64 {
        match self.0.len() {
            0 => physical,
            1 => physical + self.offset(),
            _ => self.0.iter().rev().fold(0.0, |acc, c| acc * physical + c),
        }
    }

    fn derivative(&self, x: f64) -> f64 {
        self.0
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .fold(0.0, |acc, (power, c)| acc * x + c * power as f64)
    }

    /// raw -> physical
    pub fn inverse(&self, raw: f64) -> f64 {
        let linear = (raw - self.offset()) / self.scale();
        if self.0.len() <= 2 {
            return linear;
        }
        // Newton iteration seeded with the linear inverse
        let mut x = linear;
        for _ in 0..Self::NEWTON_STEPS {
            let slope = self.derivative(x);
            if slope == 0.0 || !slope.is_finite() {
                break;
            }
            let step = (self.forward(x) - raw) / slope;
            x -= step;
            if step.abs() <= f64::EPSILON * x.abs().max(1.0) {
                break;
            }
        }
        x
    }
}

/// One named value inside a sensor group
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Measurement name, e.g. `temp`
    pub name: String,
    /// Binary representation
    pub packed: PackedType,
    /// "No reading" marker
    pub sentinel: Sentinel,
    /// Raw <-> physical transform
    pub calibration: Calibration,
    /// Physical unit
    pub unit: Option<String>,
    /// Decimal places kept after calibration, derived when absent
    pub decimals: Option<u8>,
}

impl Field {
    /// Field with the conventional sentinel for its type and no calibration
    pub fn new(name: impl Into<String>, packed: PackedType) -> Self {
        Self {
            name: name.into(),
            packed,
            sentinel: packed.default_sentinel(),
            calibration: Calibration::identity(),
            unit: None,
            decimals: None,
        }
    }

    /// Set a linear calibration
    pub fn scaled(mut self, offset: f64, scale: f64) -> Self {
        self.calibration = Calibration::linear(offset, scale);
        self
    }

    /// Set the physical unit
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Override the sentinel
    pub fn sentinel(mut self, sentinel: Sentinel) -> Self {
        self.sentinel = sentinel;
        self
    }

    /// Latitude or longitude, combined into a geohash and never calibrated
    pub fn is_coordinate(&self) -> bool {
        self.name.starts_with("lat") || self.name.starts_with("lon")
    }

    /// Decimal places kept after calibration
    pub fn precision(&self) -> u8 {
        if let Some(decimals) = self.decimals {
            return decimals;
        }
        if self.packed.is_float() {
            return 1;
        }
        let scale = self.calibration.scale().abs();
        if scale <= 1.0 {
            0
        } else {
            scale.log10().ceil().clamp(0.0, 6.0) as u8
        }
    }

    fn validate(&self) -> Result<(), RuleError> {
        if !self.calibration.is_invertible() {
            return Err(RuleError::NonInvertibleCalibration {
                field: self.name.clone(),
            });
        }
        match (self.sentinel, self.packed.int_range()) {
            (Sentinel::Int(sentinel), Some((min, max))) if sentinel < min || sentinel > max => {
                Err(RuleError::SentinelOutOfRange {
                    field: self.name.clone(),
                    sentinel,
                    packed: self.packed.tag(),
                })
            }
            (Sentinel::Int(sentinel), None) => Err(RuleError::SentinelOutOfRange {
                field: self.name.clone(),
                sentinel,
                packed: self.packed.tag(),
            }),
            _ => Ok(()),
        }
    }
}

/// A sensor group: the fields one sensor contributes
#[derive(Debug, Clone, PartialEq)]
pub struct SubRecord {
    /// Leading type byte in self-describing layouts
    pub type_id: Option<u8>,
    /// Sensor group name, e.g. `BME280`
    pub sensor: String,
    /// Ordered fields
    pub fields: Vec<Field>,
}

impl SubRecord {
    /// Create a group
    pub fn new(type_id: Option<u8>, sensor: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            type_id,
            sensor: sensor.into(),
            fields,
        }
    }

    /// Bytes consumed by the field list
    pub fn width(&self) -> usize {
        self.fields.iter().map(|f| f.packed.width()).sum()
    }

    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Byte order of multi-byte fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    #[serde(alias = ">")]
    Big,
    #[serde(alias = "<")]
    Little,
}

/// Hand-coded layouts of the older kit firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyLayout {
    /// Port 2: dust mass, compact counts, meteo, gps, wind, battery
    CompactCounts,
    /// Port 3: kit meta information
    Meta,
    /// Port 4: dust mass, full counts, meteo, gps, wind, battery
    FullCounts,
}

/// How a product lays out its sensor groups
#[derive(Debug, Clone, PartialEq)]
pub enum Layout {
    /// Optional header, then type-byte-prefixed groups in any order
    SelfDescribing {
        header: Option<SubRecord>,
        sensors: Vec<SubRecord>,
    },
    /// Every group, concatenated, no type bytes
    Fixed { records: Vec<SubRecord> },
    /// Hand-coded decoder
    Legacy(LegacyLayout),
}

/// Rule set for one product
#[derive(Debug, Clone, PartialEq)]
pub struct ProductRule {
    pub name: String,
    pub byte_order: ByteOrder,
    pub layout: Layout,
}

impl ProductRule {
    /// All groups defined by this product, header first
    pub fn sub_records(&self) -> Vec<&SubRecord> {
        match &self.layout {
            Layout::SelfDescribing { header, sensors } => {
                header.iter().chain(sensors.iter()).collect()
            }
            Layout::Fixed { records } => records.iter().collect(),
            Layout::Legacy(_) => Vec::new(),
        }
    }

    /// Group selected by a type byte
    pub fn sensor_by_type(&self, type_id: u8) -> Option<&SubRecord> {
        match &self.layout {
            Layout::SelfDescribing { sensors, .. } => {
                sensors.iter().find(|s| s.type_id == Some(type_id))
            }
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), RuleError> {
        let mut seen = HashSet::new();
        for sub in self.sub_records() {
            if let (Layout::SelfDescribing { .. }, Some(type_id)) = (&self.layout, sub.type_id) {
                if !seen.insert(type_id) {
                    return Err(RuleError::DuplicateTypeId {
                        product: self.name.clone(),
                        type_id,
                    });
                }
            }
            for field in &sub.fields {
                field.validate()?;
            }
        }
        Ok(())
    }
}

/// Product identifier: a name, or the port the payload arrived on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProductKey {
    ByName(String),
    ByPort(u8),
}

impl From<&str> for ProductKey {
    fn from(name: &str) -> Self {
        Self::ByName(name.to_string())
    }
}

impl From<String> for ProductKey {
    fn from(name: String) -> Self {
        Self::ByName(name)
    }
}

impl From<u8> for ProductKey {
    fn from(port: u8) -> Self {
        Self::ByPort(port)
    }
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByName(name) => write!(f, "{}", name),
            Self::ByPort(port) => write!(f, "port {}", port),
        }
    }
}

/// Immutable collection of product rules
#[derive(Debug, Clone, PartialEq)]
pub struct RuleTable {
    products: HashMap<String, ProductRule>,
    ports: BTreeMap<u8, String>,
    default_units: Vec<String>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RuleTable {
    /// Table without products
    pub fn empty() -> Self {
        Self {
            products: HashMap::new(),
            ports: BTreeMap::new(),
            default_units: DEFAULT_UNITS.iter().map(|u| u.to_string()).collect(),
        }
    }

    /// Products shipped with the library
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for rule in [
            weer_diy1(),
            diy0(),
            legacy("MySenseV1", LegacyLayout::CompactCounts),
            legacy("MySenseMeta", LegacyLayout::Meta),
            legacy("MySenseV2", LegacyLayout::FullCounts),
        ] {
            table.products.insert(rule.name.clone(), rule);
        }
        for (port, name) in [
            (2, "MySenseV1"),
            (3, "MySenseMeta"),
            (4, "MySenseV2"),
            (12, "weerDIY1"),
        ] {
            table.ports.insert(port, name.to_string());
        }
        table
    }

    /// Add or replace a product
    pub fn insert(&mut self, rule: ProductRule) -> Result<(), RuleError> {
        rule.validate()?;
        self.products.insert(rule.name.clone(), rule);
        Ok(())
    }

    /// Map a port to a product name
    pub fn map_port(&mut self, port: u8, product: impl Into<String>) -> Result<(), RuleError> {
        let product = product.into();
        if !self.products.contains_key(&product) {
            return Err(RuleError::DanglingPort { port, product });
        }
        self.ports.insert(port, product);
        Ok(())
    }

    /// Overlay another table: its products, ports and units win
    pub fn extend(&mut self, other: RuleTable) {
        self.products.extend(other.products);
        self.ports.extend(other.ports);
        for unit in other.default_units {
            if !self.default_units.contains(&unit) {
                self.default_units.push(unit);
            }
        }
    }

    /// Resolve a product key
    pub fn resolve(&self, key: &ProductKey) -> Option<&ProductRule> {
        match key {
            ProductKey::ByName(name) => self.products.get(name),
            ProductKey::ByPort(port) => self
                .ports
                .get(port)
                .and_then(|name| self.products.get(name)),
        }
    }

    /// Product name behind a key, for diagnostics
    pub fn product_name(&self, key: &ProductKey) -> String {
        match key {
            ProductKey::ByName(name) => name.clone(),
            ProductKey::ByPort(port) => self
                .ports
                .get(port)
                .cloned()
                .unwrap_or_else(|| key.to_string()),
        }
    }

    /// Whether a unit is implied and left off decoded values
    pub fn is_default_unit(&self, unit: &str) -> bool {
        self.default_units.iter().any(|u| u == unit)
    }

    /// Number of products
    pub fn len(&self) -> usize {
        self.products.len()
    }

    /// Whether the table has no products
    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// Product names, sorted
    pub fn product_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.products.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Every measurement name any rule-driven product can emit
    pub fn field_names(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        for rule in self.products.values() {
            if let Layout::Legacy(_) = rule.layout {
                names.extend(crate::legacy::FIELD_NAMES.iter().map(|n| n.to_string()));
                continue;
            }
            let mut has_coordinates = false;
            for sub in rule.sub_records() {
                for field in &sub.fields {
                    if field.is_coordinate() {
                        has_coordinates = true;
                    } else {
                        names.insert(field.name.clone());
                    }
                }
            }
            if has_coordinates {
                names.insert("geohash".to_string());
            }
        }
        names
    }

    /// Parse a JSON rule document
    pub fn from_json(document: &str) -> Result<Self, RuleError> {
        let doc: RuleDocument =
            serde_json::from_str(document).map_err(|e| RuleError::Parse(e.to_string()))?;
        doc.into_table()
    }

    /// Read a JSON rule document from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .map_err(|e| RuleError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&document)
    }
}

fn weer_diy1() -> ProductRule {
    use PackedType::*;
    let temp = || Field::new("temp", I16).scaled(0.0, 10.0).unit("C");
    let luchtdruk = || Field::new("luchtdruk", U16).scaled(0.0, 1.0).unit("hPa");
    // wind direction keeps the signed-short marker of the firmware
    let wr = || {
        Field::new("wr", U16)
            .sentinel(Sentinel::Int(i16::MAX as i64))
            .scaled(0.0, 1.0)
            .unit("degrees")
    };
    let ws = |scale| Field::new("ws", U16).scaled(0.0, scale).unit("m/sec");

    ProductRule {
        name: "weerDIY1".to_string(),
        byte_order: ByteOrder::Big,
        layout: Layout::SelfDescribing {
            header: Some(SubRecord::new(
                None,
                "version",
                vec![Field::new("version", U8).scaled(0.0, 10.0)],
            )),
            sensors: vec![
                SubRecord::new(
                    Some(1),
                    "BME280",
                    vec![
                        temp(),
                        Field::new("rv", I16).scaled(0.0, 10.0).unit("%"),
                        luchtdruk(),
                    ],
                ),
                SubRecord::new(
                    Some(2),
                    "BME680",
                    vec![
                        temp(),
                        Field::new("rv", U16).scaled(0.0, 10.0).unit("%"),
                        luchtdruk(),
                        Field::new("voc", U16).scaled(0.0, 1.0).unit("Kohm"),
                        Field::new("aqi", U8).scaled(0.0, 1.0).unit("%"),
                    ],
                ),
                SubRecord::new(
                    Some(3),
                    "SHT31",
                    vec![temp(), Field::new("rv", U16).scaled(0.0, 10.0).unit("%")],
                ),
                SubRecord::new(
                    Some(19),
                    "NEO-6",
                    vec![
                        Field::new("lon", F32).unit("degrees"),
                        Field::new("lat", F32).unit("degrees"),
                        Field::new("alt", U32).scaled(0.0, 10.0).unit("m"),
                    ],
                ),
                SubRecord::new(Some(20), "windDIY1", vec![wr(), ws(10.0)]),
                SubRecord::new(Some(21), "Argent", vec![wr(), ws(20.0)]),
                SubRecord::new(Some(22), "Ultrasonic", vec![wr(), ws(10.0)]),
                SubRecord::new(
                    Some(23),
                    "RainCounter",
                    vec![Field::new("rain", U16).scaled(0.0, 10.0).unit("mm/h")],
                ),
                SubRecord::new(Some(254), "time", vec![Field::new("time", U32).unit("sec")]),
            ],
        },
    }
}

fn diy0() -> ProductRule {
    use PackedType::I16;
    ProductRule {
        name: "DIY0".to_string(),
        byte_order: ByteOrder::Big,
        layout: Layout::Fixed {
            records: vec![SubRecord::new(
                None,
                "BME280",
                vec![
                    Field::new("wr", I16).scaled(0.0, 1.0).unit("degrees"),
                    Field::new("ws", I16).scaled(0.0, 100.0).unit("m/sec"),
                    Field::new("accu", I16).scaled(0.0, 100.0).unit("V"),
                    Field::new("temp", I16).scaled(0.0, 100.0).unit("C"),
                    Field::new("rv", I16).scaled(0.0, 100.0).unit("%"),
                    Field::new("luchtdruk", I16).scaled(0.0, 1.0).unit("hPa"),
                ],
            )],
        },
    }
}

fn legacy(name: &str, kind: LegacyLayout) -> ProductRule {
    ProductRule {
        name: name.to_string(),
        byte_order: ByteOrder::Big,
        layout: Layout::Legacy(kind),
    }
}

// ----------------------------------------------------------------------------
// JSON document form
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDocument {
    #[serde(default)]
    default_units: Option<Vec<String>>,
    #[serde(default)]
    ports: BTreeMap<u8, String>,
    products: Vec<ProductDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum LayoutKind {
    SelfDescribing,
    Fixed,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProductDocument {
    name: String,
    #[serde(default)]
    byte_order: ByteOrder,
    layout: LayoutKind,
    #[serde(default)]
    header: Option<SubRecordDocument>,
    sensors: Vec<SubRecordDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubRecordDocument {
    #[serde(default)]
    type_id: Option<u8>,
    sensor: String,
    fields: Vec<FieldDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FieldDocument {
    name: String,
    #[serde(rename = "type")]
    packed: PackedType,
    #[serde(default)]
    sentinel: Option<serde_json::Value>,
    #[serde(default)]
    calibration: Calibration,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    decimals: Option<u8>,
}

impl FieldDocument {
    fn into_field(self) -> Result<Field, RuleError> {
        let sentinel = match &self.sentinel {
            None | Some(serde_json::Value::Null) => self.packed.default_sentinel(),
            Some(serde_json::Value::Number(n)) => n.as_i64().map(Sentinel::Int).ok_or_else(|| {
                RuleError::Parse(format!("field {}: sentinel must be an integer", self.name))
            })?,
            Some(serde_json::Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "nan" => Sentinel::NaN,
                "none" => Sentinel::None,
                "max" => self.packed.default_sentinel(),
                other => {
                    return Err(RuleError::Parse(format!(
                        "field {}: unknown sentinel '{}'",
                        self.name, other
                    )))
                }
            },
            Some(other) => {
                return Err(RuleError::Parse(format!(
                    "field {}: unsupported sentinel {}",
                    self.name, other
                )))
            }
        };
        Ok(Field {
            name: self.name,
            packed: self.packed,
            sentinel,
            calibration: self.calibration,
            unit: self.unit,
            decimals: self.decimals,
        })
    }
}

impl SubRecordDocument {
    fn into_sub_record(self) -> Result<SubRecord, RuleError> {
        let fields = self
            .fields
            .into_iter()
            .map(FieldDocument::into_field)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SubRecord::new(self.type_id, self.sensor, fields))
    }
}

impl ProductDocument {
    fn into_rule(self) -> Result<ProductRule, RuleError> {
        let sensors = self
            .sensors
            .into_iter()
            .map(SubRecordDocument::into_sub_record)
            .collect::<Result<Vec<_>, _>>()?;
        let layout = match self.layout {
            LayoutKind::SelfDescribing => {
                if let Some(missing) = sensors.iter().find(|s| s.type_id.is_none()) {
                    return Err(RuleError::Parse(format!(
                        "product {}: sensor {} needs a type_id",
                        self.name, missing.sensor
                    )));
                }
                Layout::SelfDescribing {
                    header: self
                        .header
                        .map(SubRecordDocument::into_sub_record)
                        .transpose()?,
                    sensors,
                }
            }
            LayoutKind::Fixed => {
                let mut records = Vec::with_capacity(sensors.len() + 1);
                if let Some(header) = self.header {
                    records.push(header.into_sub_record()?);
                }
                records.extend(sensors);
                Layout::Fixed { records }
            }
        };
        Ok(ProductRule {
            name: self.name,
            byte_order: self.byte_order,
            layout,
        })
    }
}

impl RuleDocument {
    fn into_table(self) -> Result<RuleTable, RuleError> {
        let mut table = RuleTable::empty();
        if let Some(units) = self.default_units {
            table.default_units = units;
        }
        for product in self.products {
            table.insert(product.into_rule()?)?;
        }
        for (port, product) in self.ports {
            table.map_port(port, product)?;
        }
        Ok(table)
    }
}
