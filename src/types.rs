//! Core data types for the vssdag pipeline
//!
//! This module contains the fundamental data structures used throughout the
//! crate for representing signal values, their declared types, and their
//! quality.
//!
//! # Main Types
//!
//! - [`Value`] - Tagged union over every supported signal value shape
//! - [`ValueType`] - Enum naming each concrete [`Value`] variant (used in
//!   mapping declarations to drive output coercion)
//! - [`SignalQuality`] - Validity tag attached to every value
//! - [`QualifiedValue`] - A value bundled with its quality and timestamp
//! - [`StructValue`] - A named tuple with insertion-ordered fields
//!
//! # Canonical text form
//!
//! [`Value::to_text`] produces the canonical human-readable rendering that
//! the evaluator compares for change detection: floats below 1e-6 in
//! magnitude collapse to `"0"`, everything else is fixed-point with six
//! digits and trailing zeros stripped. Structs and arrays render as their
//! JSON form.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

/// Signal validity tag.
///
/// The integer codes are part of the external contract: scripts observe
/// them through the `STATUS_*` constants and downstream consumers receive
/// them on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalQuality {
    #[default]
    Unknown,
    Valid,
    Invalid,
    NotAvailable,
    Stale,
    OutOfRange,
}

impl SignalQuality {
    /// Integer code published to scripts and downstream consumers.
    pub fn code(self) -> i64 {
        match self {
            SignalQuality::Unknown => 0,
            SignalQuality::Valid => 1,
            SignalQuality::Invalid => 2,
            SignalQuality::NotAvailable => 3,
            SignalQuality::Stale => 4,
            SignalQuality::OutOfRange => 5,
        }
    }

    /// Inverse of [`SignalQuality::code`]; unrecognised codes map to
    /// `Unknown`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => SignalQuality::Valid,
            2 => SignalQuality::Invalid,
            3 => SignalQuality::NotAvailable,
            4 => SignalQuality::Stale,
            5 => SignalQuality::OutOfRange,
            _ => SignalQuality::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalQuality::Unknown => "UNKNOWN",
            SignalQuality::Valid => "VALID",
            SignalQuality::Invalid => "INVALID",
            SignalQuality::NotAvailable => "NOT_AVAILABLE",
            SignalQuality::Stale => "STALE",
            SignalQuality::OutOfRange => "OUT_OF_RANGE",
        }
    }

    pub fn is_valid(self) -> bool {
        self == SignalQuality::Valid
    }
}

impl std::fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named tuple with insertion-ordered, uniquely named fields.
///
/// Struct values are reference-shared via `Arc` and treated as logically
/// immutable once inserted into the signal store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructValue {
    /// Declared struct type, e.g. `"Types.Location"` (may be empty)
    pub type_name: String,
    fields: Vec<(String, Value)>,
}

impl StructValue {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Insert a field, replacing an existing field of the same name in
    /// place (insertion order is preserved).
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Enumeration of every concrete [`Value`] variant, plus `Unspecified`.
///
/// Mapping declarations name one of these to drive coercion of the
/// transform result on output. The integer codes are published to scripts
/// as `TYPE_*` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueType {
    #[default]
    Unspecified,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    String,
    Struct,
    BoolArray,
    Int8Array,
    Int16Array,
    Int32Array,
    Int64Array,
    UInt8Array,
    UInt16Array,
    UInt32Array,
    UInt64Array,
    FloatArray,
    DoubleArray,
    StringArray,
    StructArray,
}

impl ValueType {
    /// Parse a datatype name from the mapping document. Array types accept
    /// both `"float[]"` and `"float_array"` spellings.
    pub fn from_name(name: &str) -> Option<Self> {
        let ty = match name {
            "" | "unspecified" => ValueType::Unspecified,
            "bool" | "boolean" => ValueType::Bool,
            "int8" => ValueType::Int8,
            "int16" => ValueType::Int16,
            "int32" => ValueType::Int32,
            "int64" => ValueType::Int64,
            "uint8" => ValueType::UInt8,
            "uint16" => ValueType::UInt16,
            "uint32" => ValueType::UInt32,
            "uint64" => ValueType::UInt64,
            "float" => ValueType::Float,
            "double" => ValueType::Double,
            "string" => ValueType::String,
            "struct" => ValueType::Struct,
            "bool[]" | "boolean[]" | "bool_array" => ValueType::BoolArray,
            "int8[]" | "int8_array" => ValueType::Int8Array,
            "int16[]" | "int16_array" => ValueType::Int16Array,
            "int32[]" | "int32_array" => ValueType::Int32Array,
            "int64[]" | "int64_array" => ValueType::Int64Array,
            "uint8[]" | "uint8_array" => ValueType::UInt8Array,
            "uint16[]" | "uint16_array" => ValueType::UInt16Array,
            "uint32[]" | "uint32_array" => ValueType::UInt32Array,
            "uint64[]" | "uint64_array" => ValueType::UInt64Array,
            "float[]" | "float_array" => ValueType::FloatArray,
            "double[]" | "double_array" => ValueType::DoubleArray,
            "string[]" | "string_array" => ValueType::StringArray,
            "struct[]" | "struct_array" => ValueType::StructArray,
            _ => return None,
        };
        Some(ty)
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Unspecified => "unspecified",
            ValueType::Bool => "boolean",
            ValueType::Int8 => "int8",
            ValueType::Int16 => "int16",
            ValueType::Int32 => "int32",
            ValueType::Int64 => "int64",
            ValueType::UInt8 => "uint8",
            ValueType::UInt16 => "uint16",
            ValueType::UInt32 => "uint32",
            ValueType::UInt64 => "uint64",
            ValueType::Float => "float",
            ValueType::Double => "double",
            ValueType::String => "string",
            ValueType::Struct => "struct",
            ValueType::BoolArray => "boolean[]",
            ValueType::Int8Array => "int8[]",
            ValueType::Int16Array => "int16[]",
            ValueType::Int32Array => "int32[]",
            ValueType::Int64Array => "int64[]",
            ValueType::UInt8Array => "uint8[]",
            ValueType::UInt16Array => "uint16[]",
            ValueType::UInt32Array => "uint32[]",
            ValueType::UInt64Array => "uint64[]",
            ValueType::FloatArray => "float[]",
            ValueType::DoubleArray => "double[]",
            ValueType::StringArray => "string[]",
            ValueType::StructArray => "struct[]",
        }
    }

    /// Integer code published to scripts as a `TYPE_*` constant.
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ValueType::Int8
                | ValueType::Int16
                | ValueType::Int32
                | ValueType::Int64
                | ValueType::UInt8
                | ValueType::UInt16
                | ValueType::UInt32
                | ValueType::UInt64
                | ValueType::Float
                | ValueType::Double
        )
    }

    pub fn is_array(self) -> bool {
        matches!(
            self,
            ValueType::BoolArray
                | ValueType::Int8Array
                | ValueType::Int16Array
                | ValueType::Int32Array
                | ValueType::Int64Array
                | ValueType::UInt8Array
                | ValueType::UInt16Array
                | ValueType::UInt32Array
                | ValueType::UInt64Array
                | ValueType::FloatArray
                | ValueType::DoubleArray
                | ValueType::StringArray
                | ValueType::StructArray
        )
    }

    /// Element type of an array type (`Unspecified` for non-arrays).
    pub fn element_type(self) -> ValueType {
        match self {
            ValueType::BoolArray => ValueType::Bool,
            ValueType::Int8Array => ValueType::Int8,
            ValueType::Int16Array => ValueType::Int16,
            ValueType::Int32Array => ValueType::Int32,
            ValueType::Int64Array => ValueType::Int64,
            ValueType::UInt8Array => ValueType::UInt8,
            ValueType::UInt16Array => ValueType::UInt16,
            ValueType::UInt32Array => ValueType::UInt32,
            ValueType::UInt64Array => ValueType::UInt64,
            ValueType::FloatArray => ValueType::Float,
            ValueType::DoubleArray => ValueType::Double,
            ValueType::StringArray => ValueType::String,
            ValueType::StructArray => ValueType::Struct,
            _ => ValueType::Unspecified,
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A typed signal value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// The empty marker ("no value"); script-visible as nil/unit
    #[default]
    Empty,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Struct(Arc<StructValue>),
    BoolArray(Vec<bool>),
    Int8Array(Vec<i8>),
    Int16Array(Vec<i16>),
    Int32Array(Vec<i32>),
    Int64Array(Vec<i64>),
    UInt8Array(Vec<u8>),
    UInt16Array(Vec<u16>),
    UInt32Array(Vec<u32>),
    UInt64Array(Vec<u64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    StructArray(Vec<Arc<StructValue>>),
}

/// Canonical fixed-point rendering of a float: magnitudes below 1e-6
/// collapse to "0", otherwise six digits with trailing zeros (and a bare
/// trailing dot) stripped.
fn format_float(v: f64) -> String {
    if v.is_finite() && v.abs() < 1e-6 {
        return "0".to_string();
    }
    let mut s = format!("{:.6}", v);
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    s
}

/// JSON-escape a string (quotes, backslashes, controls).
fn json_escape(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

impl Value {
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    /// The concrete [`ValueType`] of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Empty => ValueType::Unspecified,
            Value::Bool(_) => ValueType::Bool,
            Value::Int8(_) => ValueType::Int8,
            Value::Int16(_) => ValueType::Int16,
            Value::Int32(_) => ValueType::Int32,
            Value::Int64(_) => ValueType::Int64,
            Value::UInt8(_) => ValueType::UInt8,
            Value::UInt16(_) => ValueType::UInt16,
            Value::UInt32(_) => ValueType::UInt32,
            Value::UInt64(_) => ValueType::UInt64,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Struct(_) => ValueType::Struct,
            Value::BoolArray(_) => ValueType::BoolArray,
            Value::Int8Array(_) => ValueType::Int8Array,
            Value::Int16Array(_) => ValueType::Int16Array,
            Value::Int32Array(_) => ValueType::Int32Array,
            Value::Int64Array(_) => ValueType::Int64Array,
            Value::UInt8Array(_) => ValueType::UInt8Array,
            Value::UInt16Array(_) => ValueType::UInt16Array,
            Value::UInt32Array(_) => ValueType::UInt32Array,
            Value::UInt64Array(_) => ValueType::UInt64Array,
            Value::FloatArray(_) => ValueType::FloatArray,
            Value::DoubleArray(_) => ValueType::DoubleArray,
            Value::StringArray(_) => ValueType::StringArray,
            Value::StructArray(_) => ValueType::StructArray,
        }
    }

    /// Numeric view of the value, if it has one. Booleans count as 0/1;
    /// strings parse when they hold a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int8(v) => Some(*v as f64),
            Value::Int16(v) => Some(*v as f64),
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::UInt8(v) => Some(*v as f64),
            Value::UInt16(v) => Some(*v as f64),
            Value::UInt32(v) => Some(*v as f64),
            Value::UInt64(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int8(v) => Some(*v as i64),
            Value::Int16(v) => Some(*v as i64),
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            Value::UInt8(v) => Some(*v as i64),
            Value::UInt16(v) => Some(*v as i64),
            Value::UInt32(v) => Some(*v as i64),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            _ => self.as_f64().map(|f| f as i64),
        }
    }

    /// Canonical human-readable form. Idempotent on strings.
    pub fn to_text(&self) -> String {
        match self {
            Value::Empty => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int8(v) => v.to_string(),
            Value::Int16(v) => v.to_string(),
            Value::Int32(v) => v.to_string(),
            Value::Int64(v) => v.to_string(),
            Value::UInt8(v) => v.to_string(),
            Value::UInt16(v) => v.to_string(),
            Value::UInt32(v) => v.to_string(),
            Value::UInt64(v) => v.to_string(),
            Value::Float(v) => format_float(*v as f64),
            Value::Double(v) => format_float(*v),
            Value::String(s) => s.clone(),
            Value::Struct(_)
            | Value::BoolArray(_)
            | Value::Int8Array(_)
            | Value::Int16Array(_)
            | Value::Int32Array(_)
            | Value::Int64Array(_)
            | Value::UInt8Array(_)
            | Value::UInt16Array(_)
            | Value::UInt32Array(_)
            | Value::UInt64Array(_)
            | Value::FloatArray(_)
            | Value::DoubleArray(_)
            | Value::StringArray(_)
            | Value::StructArray(_) => self.to_json(),
        }
    }

    /// Strict JSON rendering. Field names and element order are preserved;
    /// numbers use the same canonical forms as [`Value::to_text`].
    pub fn to_json(&self) -> String {
        fn join<T>(items: &[T], f: impl Fn(&T) -> String) -> String {
            let parts: Vec<String> = items.iter().map(f).collect();
            format!("[{}]", parts.join(","))
        }

        fn struct_json(s: &StructValue) -> String {
            let parts: Vec<String> = s
                .fields()
                .map(|(name, value)| format!("{}:{}", json_escape(name), value.to_json()))
                .collect();
            format!("{{{}}}", parts.join(","))
        }

        match self {
            Value::Empty => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int8(v) => v.to_string(),
            Value::Int16(v) => v.to_string(),
            Value::Int32(v) => v.to_string(),
            Value::Int64(v) => v.to_string(),
            Value::UInt8(v) => v.to_string(),
            Value::UInt16(v) => v.to_string(),
            Value::UInt32(v) => v.to_string(),
            Value::UInt64(v) => v.to_string(),
            Value::Float(v) => format_float(*v as f64),
            Value::Double(v) => format_float(*v),
            Value::String(s) => json_escape(s),
            Value::Struct(s) => struct_json(s),
            Value::BoolArray(a) => join(a, |b| b.to_string()),
            Value::Int8Array(a) => join(a, |v| v.to_string()),
            Value::Int16Array(a) => join(a, |v| v.to_string()),
            Value::Int32Array(a) => join(a, |v| v.to_string()),
            Value::Int64Array(a) => join(a, |v| v.to_string()),
            Value::UInt8Array(a) => join(a, |v| v.to_string()),
            Value::UInt16Array(a) => join(a, |v| v.to_string()),
            Value::UInt32Array(a) => join(a, |v| v.to_string()),
            Value::UInt64Array(a) => join(a, |v| v.to_string()),
            Value::FloatArray(a) => join(a, |v| format_float(*v as f64)),
            Value::DoubleArray(a) => join(a, |v| format_float(*v)),
            Value::StringArray(a) => join(a, |s| json_escape(s)),
            Value::StructArray(a) => join(a, |s| Value::Struct(s.clone()).to_json()),
        }
    }

    /// Total coercion toward a declared target type.
    ///
    /// Numeric conversions truncate toward zero when narrowing; booleans
    /// coerce to/from 0/1 and the literal strings "true"/"1"; the empty
    /// marker passes through unchanged; an unparsable string coerced to a
    /// numeric target yields the empty marker.
    pub fn coerce(&self, target: ValueType) -> Value {
        fn numeric(value: &Value, target: ValueType) -> Value {
            // integer sources convert through i64 so wide values stay
            // lossless
            let as_int: Option<i64> = match value {
                Value::Int8(v) => Some(*v as i64),
                Value::Int16(v) => Some(*v as i64),
                Value::Int32(v) => Some(*v as i64),
                Value::Int64(v) => Some(*v),
                Value::UInt8(v) => Some(*v as i64),
                Value::UInt16(v) => Some(*v as i64),
                Value::UInt32(v) => Some(*v as i64),
                Value::UInt64(v) => i64::try_from(*v).ok(),
                _ => None,
            };
            if let Some(i) = as_int {
                return match target {
                    ValueType::Int8 => Value::Int8(i as i8),
                    ValueType::Int16 => Value::Int16(i as i16),
                    ValueType::Int32 => Value::Int32(i as i32),
                    ValueType::Int64 => Value::Int64(i),
                    ValueType::UInt8 => Value::UInt8(i as u8),
                    ValueType::UInt16 => Value::UInt16(i as u16),
                    ValueType::UInt32 => Value::UInt32(i as u32),
                    ValueType::UInt64 => Value::UInt64(i as u64),
                    ValueType::Float => Value::Float(i as f32),
                    ValueType::Double => Value::Double(i as f64),
                    _ => Value::Empty,
                };
            }
            let Some(f) = value.as_f64() else {
                return Value::Empty;
            };
            match target {
                ValueType::Int8 => Value::Int8(f as i8),
                ValueType::Int16 => Value::Int16(f as i16),
                ValueType::Int32 => Value::Int32(f as i32),
                ValueType::Int64 => Value::Int64(f as i64),
                ValueType::UInt8 => Value::UInt8(f as u8),
                ValueType::UInt16 => Value::UInt16(f as u16),
                ValueType::UInt32 => Value::UInt32(f as u32),
                ValueType::UInt64 => Value::UInt64(f as u64),
                ValueType::Float => Value::Float(f as f32),
                ValueType::Double => Value::Double(f),
                _ => Value::Empty,
            }
        }

        if self.is_empty() || target == ValueType::Unspecified {
            return self.clone();
        }
        if self.value_type() == target {
            return self.clone();
        }

        match target {
            ValueType::Bool => match self {
                Value::Bool(b) => Value::Bool(*b),
                Value::String(s) => match s.trim() {
                    "true" | "1" => Value::Bool(true),
                    "false" | "0" => Value::Bool(false),
                    _ => Value::Empty,
                },
                other => match other.as_f64() {
                    Some(f) => Value::Bool(f != 0.0),
                    None => Value::Empty,
                },
            },
            ValueType::String => Value::String(self.to_text()),
            t if t.is_numeric() => numeric(self, t),
            ValueType::Struct => match self {
                Value::Struct(s) => Value::Struct(s.clone()),
                _ => Value::Empty,
            },
            t if t.is_array() => match (self, t) {
                (Value::BoolArray(_), ValueType::BoolArray)
                | (Value::Int8Array(_), ValueType::Int8Array)
                | (Value::Int16Array(_), ValueType::Int16Array)
                | (Value::Int32Array(_), ValueType::Int32Array)
                | (Value::Int64Array(_), ValueType::Int64Array)
                | (Value::UInt8Array(_), ValueType::UInt8Array)
                | (Value::UInt16Array(_), ValueType::UInt16Array)
                | (Value::UInt32Array(_), ValueType::UInt32Array)
                | (Value::UInt64Array(_), ValueType::UInt64Array)
                | (Value::FloatArray(_), ValueType::FloatArray)
                | (Value::DoubleArray(_), ValueType::DoubleArray)
                | (Value::StringArray(_), ValueType::StringArray)
                | (Value::StructArray(_), ValueType::StructArray) => self.clone(),
                _ => Value::Empty,
            },
            _ => Value::Empty,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

/// A value bundled with its quality tag and wall-clock timestamp.
///
/// The wall clock is used only for emission; scheduling and operator
/// arithmetic run on the monotonic clock kept by the evaluator.
#[derive(Debug, Clone)]
pub struct QualifiedValue {
    pub value: Value,
    pub quality: SignalQuality,
    pub timestamp: SystemTime,
}

impl QualifiedValue {
    pub fn new(value: Value, quality: SignalQuality, timestamp: SystemTime) -> Self {
        Self {
            value,
            quality,
            timestamp,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.quality.is_valid()
    }
}

/// Bidirectional map between enum labels and raw integer codes, extracted
/// from the database's value descriptions.
#[derive(Debug, Clone, Default)]
pub struct EnumMap {
    by_label: HashMap<String, i64>,
    by_value: HashMap<i64, String>,
}

impl EnumMap {
    pub fn insert(&mut self, label: impl Into<String>, value: i64) {
        let label = label.into();
        self.by_value.insert(value, label.clone());
        self.by_label.insert(label, value);
    }

    pub fn value_of(&self, label: &str) -> Option<i64> {
        self.by_label.get(label).copied()
    }

    pub fn label_of(&self, value: i64) -> Option<&str> {
        self.by_value.get(&value).map(String::as_str)
    }

    pub fn labels(&self) -> impl Iterator<Item = (&str, i64)> {
        self.by_label.iter().map(|(l, v)| (l.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.by_label.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_label.len()
    }
}
