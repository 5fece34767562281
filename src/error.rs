//! Error types for aqlink
//!
//! Every failure here is scoped to a single payload: callers log and
//! discard, the stream keeps flowing.

use thiserror::Error;

/// Result type alias for aqlink operations
pub type Result<T> = std::result::Result<T, AqlinkError>;

/// Main error type for aqlink operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AqlinkError {
    /// Encoding error
    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),

    /// Decoding error
    #[error("Decoding error: {0}")]
    Decode(#[from] DecodeError),

    /// Rule table error
    #[error("Rule table error: {0}")]
    Rule(#[from] RuleError),
}

/// Errors during encoding
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    /// No rule table for this product
    #[error("Unknown product: {0}")]
    UnknownProduct(String),

    /// Product has no rule-driven encoder (hand-coded legacy layouts)
    #[error("Encoding not supported for product {0}")]
    Unsupported(String),

    /// Record names a sensor group the product does not define
    #[error("Product {product} has no sensor group {sensor}")]
    UnknownSensor { product: String, sensor: String },

    /// Value does not fit the packed type after calibration
    #[error("{product}/{sensor}.{field}: value {value} out of range for packed type '{packed}'")]
    OutOfRange {
        product: String,
        sensor: String,
        field: String,
        value: f64,
        packed: char,
    },

    /// Value is not a valid number (NaN, Inf) or has the wrong shape
    #[error("{product}/{sensor}.{field}: invalid value: {reason}")]
    InvalidValue {
        product: String,
        sensor: String,
        field: String,
        reason: String,
    },
}

/// Errors during decoding
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// No rule table for this product
    #[error("Unknown product: {0}")]
    UnknownProduct(String),

    /// Type byte does not select any sensor group
    #[error("Product {product}: unknown sensor type 0x{type_id:02x} at offset {offset}")]
    UnknownSensor {
        product: String,
        type_id: u8,
        offset: usize,
    },

    /// Buffer ends before the declared field widths are satisfied
    #[error("Product {product}/{sensor}: truncated, need {needed} bytes, {available} available")]
    Truncated {
        product: String,
        sensor: String,
        needed: usize,
        available: usize,
    },

    /// Fixed layout buffer carries more bytes than the format consumes
    #[error("Product {product}: {extra} trailing bytes after fixed layout")]
    TrailingBytes { product: String, extra: usize },

    /// Empty payload
    #[error("Product {0}: empty payload")]
    Empty(String),
}

impl DecodeError {
    /// Product identifier the error is tagged with
    pub fn product(&self) -> &str {
        match self {
            Self::UnknownProduct(product) | Self::Empty(product) => product,
            Self::UnknownSensor { product, .. }
            | Self::Truncated { product, .. }
            | Self::TrailingBytes { product, .. } => product,
        }
    }
}

/// Errors in a rule table definition
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    /// Unsupported packed type tag
    #[error("Unknown packed type tag '{0}'")]
    UnknownPackedType(char),

    /// Two sensor groups share a type byte
    #[error("Product {product}: duplicate type byte {type_id}")]
    DuplicateTypeId { product: String, type_id: u8 },

    /// Linear coefficient is zero, the transform cannot be inverted
    #[error("Field {field}: calibration is not invertible")]
    NonInvertibleCalibration { field: String },

    /// Sentinel does not fit the packed type
    #[error("Field {field}: sentinel {sentinel} does not fit packed type '{packed}'")]
    SentinelOutOfRange {
        field: String,
        sentinel: i64,
        packed: char,
    },

    /// Port refers to an undefined product
    #[error("Port {port} maps to undefined product {product}")]
    DanglingPort { port: u8, product: String },

    /// Malformed JSON document
    #[error("Invalid rule document: {0}")]
    Parse(String),

    /// Rule file could not be read
    #[error("Cannot read rule file: {0}")]
    Io(String),
}
