//! Signal mapping model and YAML loader
//!
//! A mapping document declares one entry per signal: where the value comes
//! from (an external source for input signals, `depends_on` for derived
//! signals), the declared output datatype, the transform to apply, and the
//! output throttle. The loader parses the YAML into raw serde structs,
//! validates them into [`SignalMapping`] records, and resolves enum labels
//! in value-mapping tables against the DBC database.
//!
//! Document order is preserved: it is the tie-break for the topological
//! order, which keeps the processing order stable across runs.

use crate::can::DbcDatabase;
use crate::error::{Result, VssDagError};
use crate::types::ValueType;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, warn};

/// Where an input signal's value comes from.
///
/// Both fields non-empty marks the signal as an input signal; otherwise the
/// signal is derived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalSource {
    /// Source kind tag; `"dbc"` is recognised natively, others are reserved
    pub kind: String,
    /// Source-specific signal name (e.g. the DBC signal name)
    pub name: String,
}

impl SignalSource {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn is_input(&self) -> bool {
        !self.kind.is_empty() && !self.name.is_empty()
    }
}

/// The transform applied to produce a signal's value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Transform {
    /// Identity on the input
    #[default]
    Direct,
    /// A fragment of script text, single- or multi-line
    Code(String),
    /// Finite map from stringified value to stringified value; targets are
    /// coerced to bool/number at compile time when they parse as one
    ValueMapping(Vec<(String, String)>),
}

/// When a signal is re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateTrigger {
    /// Only when a dependency updates
    #[default]
    OnDependency,
    /// Every `interval_ms` regardless of dependencies
    Periodic,
    /// On dependency update or periodically
    Both,
}

impl UpdateTrigger {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "on_dependency" => Some(UpdateTrigger::OnDependency),
            "periodic" => Some(UpdateTrigger::Periodic),
            "both" => Some(UpdateTrigger::Both),
            _ => None,
        }
    }
}

/// Declarative specification for one signal.
#[derive(Debug, Clone, Default)]
pub struct SignalMapping {
    /// Declared output datatype; drives coercion on output
    pub datatype: ValueType,
    /// Output throttle in milliseconds; 0 means emit whenever a new value
    /// is produced
    pub interval_ms: u64,
    pub transform: Transform,
    pub source: SignalSource,
    /// Signal names this signal depends on (derived signals only)
    pub depends_on: Vec<String>,
    pub update_trigger: UpdateTrigger,
    /// Struct type name when `datatype == struct`, e.g. `"Types.Location"`
    pub struct_type: String,
    /// Field within the struct this signal writes into
    pub struct_field: String,
    /// Declared field order for a struct-typed result. Script object maps
    /// do not preserve declaration order, so this list fixes the field
    /// sequence of the materialised struct value.
    pub struct_fields: Vec<String>,
}

impl SignalMapping {
    pub fn is_input(&self) -> bool {
        self.source.is_input()
    }
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    mappings: Vec<RawMapping>,
}

#[derive(Debug, Deserialize)]
struct RawMapping {
    signal: Option<String>,
    source: Option<RawSource>,
    datatype: Option<String>,
    interval_ms: Option<i64>,
    #[serde(default)]
    depends_on: Vec<String>,
    update_trigger: Option<String>,
    transform: Option<RawTransform>,
    #[serde(default)]
    struct_type: String,
    #[serde(default)]
    struct_field: String,
    #[serde(default)]
    struct_fields: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    #[serde(rename = "type")]
    kind: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawTransform {
    code: Option<String>,
    /// Legacy alias of `code`
    math: Option<String>,
    mapping: Option<Vec<RawMapEntry>>,
}

#[derive(Debug, Deserialize)]
struct RawMapEntry {
    from: serde_yaml::Value,
    to: serde_yaml::Value,
}

/// Stringify a scalar YAML value the way the document author wrote it.
fn yaml_scalar_to_string(value: &serde_yaml::Value, field: &str) -> Result<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(VssDagError::Config(format!(
            "mapping entry field '{}' must be a scalar, got {:?}",
            field, other
        ))),
    }
}

/// Load and validate a mapping document.
///
/// The DBC database, when given, is used to resolve enum labels appearing
/// in `mapping.from` entries of input signals. Returns the mappings in
/// document order.
pub fn load_mapping_file(
    path: &Path,
    dbc: Option<&DbcDatabase>,
) -> Result<Vec<(String, SignalMapping)>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| VssDagError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    parse_mapping_document(&text, dbc)
}

/// Parse a mapping document from a YAML string. See [`load_mapping_file`].
pub fn parse_mapping_document(
    yaml: &str,
    dbc: Option<&DbcDatabase>,
) -> Result<Vec<(String, SignalMapping)>> {
    let document: RawDocument = serde_yaml::from_str(yaml)
        .map_err(|e| VssDagError::Config(format!("failed to parse mapping document: {}", e)))?;

    let mut mappings: Vec<(String, SignalMapping)> = Vec::with_capacity(document.mappings.len());

    for raw in document.mappings {
        let Some(signal_name) = raw.signal else {
            warn!("skipping mapping entry without a 'signal' field");
            continue;
        };

        if mappings.iter().any(|(name, _)| *name == signal_name) {
            return Err(VssDagError::Config(format!(
                "duplicate mapping for signal '{}'",
                signal_name
            )));
        }

        let source = match raw.source {
            Some(s) => SignalSource::new(s.kind, s.name),
            None => SignalSource::default(),
        };

        let datatype = match raw.datatype.as_deref() {
            Some(name) => ValueType::from_name(name).ok_or_else(|| {
                VssDagError::Config(format!(
                    "signal '{}': unknown datatype '{}'",
                    signal_name, name
                ))
            })?,
            None => {
                // Legacy schema: datatype may be omitted
                debug!(signal = %signal_name, "no datatype declared, defaulting to double");
                ValueType::Double
            }
        };

        let interval_ms = match raw.interval_ms {
            Some(ms) if ms < 0 => {
                return Err(VssDagError::Config(format!(
                    "signal '{}': interval_ms must be >= 0, got {}",
                    signal_name, ms
                )));
            }
            Some(ms) => ms as u64,
            None => 0,
        };

        let update_trigger = match raw.update_trigger.as_deref() {
            Some(name) => UpdateTrigger::from_name(name).ok_or_else(|| {
                VssDagError::Config(format!(
                    "signal '{}': unknown update_trigger '{}' \
                     (expected on_dependency, periodic, or both)",
                    signal_name, name
                ))
            })?,
            None => UpdateTrigger::OnDependency,
        };

        let transform = parse_transform(&signal_name, raw.transform, &source, dbc)?;

        mappings.push((
            signal_name,
            SignalMapping {
                datatype,
                interval_ms,
                transform,
                source,
                depends_on: raw.depends_on,
                update_trigger,
                struct_type: raw.struct_type,
                struct_field: raw.struct_field,
                struct_fields: raw.struct_fields,
            },
        ));
    }

    debug!(count = mappings.len(), "loaded signal mappings");
    Ok(mappings)
}

fn parse_transform(
    signal_name: &str,
    raw: Option<RawTransform>,
    source: &SignalSource,
    dbc: Option<&DbcDatabase>,
) -> Result<Transform> {
    let Some(raw) = raw else {
        return Ok(Transform::Direct);
    };

    if let Some(code) = raw.code {
        return Ok(Transform::Code(code));
    }
    if let Some(code) = raw.math {
        // Legacy keyword kept for old documents
        debug!(signal = %signal_name, "using legacy 'math' transform keyword");
        return Ok(Transform::Code(code));
    }
    if let Some(entries) = raw.mapping {
        let mut pairs = Vec::with_capacity(entries.len());
        for entry in entries {
            let from = yaml_scalar_to_string(&entry.from, "from")?;
            let to = yaml_scalar_to_string(&entry.to, "to")?;
            let resolved = resolve_enum_label(signal_name, source, &from, dbc)?;
            pairs.push((resolved, to));
        }
        return Ok(Transform::ValueMapping(pairs));
    }

    Ok(Transform::Direct)
}

/// Resolve an enum label in a `mapping.from` entry to its raw integer code.
///
/// Numeric strings pass through unresolved. An unknown label is a fatal
/// configuration error; the message lists the valid labels.
fn resolve_enum_label(
    signal_name: &str,
    source: &SignalSource,
    label: &str,
    dbc: Option<&DbcDatabase>,
) -> Result<String> {
    if label.parse::<f64>().is_ok() {
        return Ok(label.to_string());
    }
    let Some(dbc) = dbc else {
        return Ok(label.to_string());
    };
    if !source.is_input() {
        return Ok(label.to_string());
    }

    let enums = dbc.enum_of(&source.name);
    if enums.is_empty() {
        return Err(VssDagError::Config(format!(
            "signal '{}': label '{}' used in a value mapping but '{}' \
             has no enum definitions in the database",
            signal_name, label, source.name
        )));
    }

    match enums.value_of(label) {
        Some(value) => Ok(value.to_string()),
        None => {
            let mut labels: Vec<String> = enums
                .labels()
                .map(|(l, v)| format!("{} = {}", v, l))
                .collect();
            labels.sort();
            Err(VssDagError::Config(format!(
                "signal '{}': enum label '{}' not found for '{}'; valid labels: {}",
                signal_name,
                label,
                source.name,
                labels.join(", ")
            )))
        }
    }
}
