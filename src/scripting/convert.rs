//! Marshalling between host [`Value`]s and rhai [`Dynamic`]s
//!
//! The scripting boundary is deliberately narrow: typed values are pushed
//! into script space as plain rhai types (unit for the empty marker, INT,
//! FLOAT, bool, string, maps for structs, arrays for arrays) and results
//! come back through [`dynamic_to_value`], which applies the declared
//! datatype coercion.

use crate::types::{StructValue, Value, ValueType};
use rhai::{Array, Dynamic, Map};
use std::sync::Arc;

/// Convert a host value into its script-space representation.
///
/// The empty marker becomes unit (script-visible nil). Unsigned 64-bit
/// values outside the i64 range degrade to floats.
pub fn value_to_dynamic(value: &Value) -> Dynamic {
    fn array_of<T: Clone, F: Fn(&T) -> Dynamic>(items: &[T], f: F) -> Dynamic {
        let array: Array = items.iter().map(f).collect();
        Dynamic::from_array(array)
    }

    match value {
        Value::Empty => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Int8(v) => Dynamic::from_int(*v as i64),
        Value::Int16(v) => Dynamic::from_int(*v as i64),
        Value::Int32(v) => Dynamic::from_int(*v as i64),
        Value::Int64(v) => Dynamic::from_int(*v),
        Value::UInt8(v) => Dynamic::from_int(*v as i64),
        Value::UInt16(v) => Dynamic::from_int(*v as i64),
        Value::UInt32(v) => Dynamic::from_int(*v as i64),
        Value::UInt64(v) => match i64::try_from(*v) {
            Ok(i) => Dynamic::from_int(i),
            Err(_) => Dynamic::from_float(*v as f64),
        },
        Value::Float(v) => Dynamic::from_float(*v as f64),
        Value::Double(v) => Dynamic::from_float(*v),
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Struct(s) => Dynamic::from_map(struct_to_map(s)),
        Value::BoolArray(a) => array_of(a, |b| Dynamic::from_bool(*b)),
        Value::Int8Array(a) => array_of(a, |v| Dynamic::from_int(*v as i64)),
        Value::Int16Array(a) => array_of(a, |v| Dynamic::from_int(*v as i64)),
        Value::Int32Array(a) => array_of(a, |v| Dynamic::from_int(*v as i64)),
        Value::Int64Array(a) => array_of(a, |v| Dynamic::from_int(*v)),
        Value::UInt8Array(a) => array_of(a, |v| Dynamic::from_int(*v as i64)),
        Value::UInt16Array(a) => array_of(a, |v| Dynamic::from_int(*v as i64)),
        Value::UInt32Array(a) => array_of(a, |v| Dynamic::from_int(*v as i64)),
        Value::UInt64Array(a) => array_of(a, |v| match i64::try_from(*v) {
            Ok(i) => Dynamic::from_int(i),
            Err(_) => Dynamic::from_float(*v as f64),
        }),
        Value::FloatArray(a) => array_of(a, |v| Dynamic::from_float(*v as f64)),
        Value::DoubleArray(a) => array_of(a, |v| Dynamic::from_float(*v)),
        Value::StringArray(a) => array_of(a, |s| Dynamic::from(s.clone())),
        Value::StructArray(a) => array_of(a, |s| Dynamic::from_map(struct_to_map(s))),
    }
}

fn struct_to_map(s: &StructValue) -> Map {
    let mut map = Map::new();
    for (name, value) in s.fields() {
        map.insert(name.into(), value_to_dynamic(value));
    }
    map
}

/// Infer the natural host value of a script result, without a declared
/// target type. Script maps become structs (with the given type name),
/// arrays infer a homogeneous element type.
pub fn dynamic_to_natural_value(d: &Dynamic, struct_type: &str) -> Value {
    natural_value(d, struct_type, &[])
}

fn natural_value(d: &Dynamic, struct_type: &str, field_order: &[String]) -> Value {
    let d = d.clone().flatten();

    if d.is_unit() {
        return Value::Empty;
    }
    if let Ok(b) = d.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = d.as_int() {
        return Value::Int64(i);
    }
    if let Ok(f) = d.as_float() {
        return Value::Double(f);
    }
    if let Some(s) = d.clone().try_cast::<rhai::ImmutableString>() {
        return Value::String(s.to_string());
    }
    if let Some(map) = d.clone().try_cast::<Map>() {
        return Value::Struct(Arc::new(map_to_struct(&map, struct_type, field_order)));
    }
    if let Some(array) = d.try_cast::<Array>() {
        return infer_array(&array, struct_type);
    }
    Value::Empty
}

/// Script object maps do not preserve declaration order, so the declared
/// `field_order` fixes the field sequence; fields the declaration does not
/// name follow in the map's deterministic order.
fn map_to_struct(map: &Map, struct_type: &str, field_order: &[String]) -> StructValue {
    let mut s = StructValue::new(struct_type);
    for name in field_order {
        if let Some(value) = map.get(name.as_str()) {
            s.insert(name.clone(), dynamic_to_natural_value(value, ""));
        }
    }
    for (key, value) in map.iter() {
        if field_order.iter().all(|f| f.as_str() != key.as_str()) {
            s.insert(key.to_string(), dynamic_to_natural_value(value, ""));
        }
    }
    s
}

fn infer_array(array: &Array, struct_type: &str) -> Value {
    if array.iter().all(|d| d.as_bool().is_ok()) {
        return Value::BoolArray(array.iter().filter_map(|d| d.as_bool().ok()).collect());
    }
    if array.iter().all(|d| d.as_int().is_ok()) {
        return Value::Int64Array(array.iter().filter_map(|d| d.as_int().ok()).collect());
    }
    if array
        .iter()
        .all(|d| d.as_float().is_ok() || d.as_int().is_ok())
    {
        return Value::DoubleArray(
            array
                .iter()
                .filter_map(|d| d.as_float().ok().or_else(|| d.as_int().ok().map(|i| i as f64)))
                .collect(),
        );
    }
    if array.iter().all(|d| d.is_map()) {
        return Value::StructArray(
            array
                .iter()
                .filter_map(|d| {
                    d.clone()
                        .try_cast::<Map>()
                        .map(|m| Arc::new(map_to_struct(&m, struct_type, &[])))
                })
                .collect(),
        );
    }
    Value::StringArray(array.iter().map(|d| d.to_string()).collect())
}

/// Convert a script result to a host value coerced to the declared
/// datatype. `field_order`, when non-empty, fixes the field sequence of a
/// struct result. The value itself is never canonicalised here; collapsing
/// tiny floats to "0" is a rendering rule and lives in the text/JSON
/// layer.
pub fn dynamic_to_value(
    d: &Dynamic,
    target: ValueType,
    struct_type: &str,
    field_order: &[String],
) -> Value {
    natural_value(d, struct_type, field_order).coerce(target)
}

/// Canonical text of a script value, used as the lookup key for value
/// mappings. Unit has no key.
pub fn dynamic_to_key(d: &Dynamic) -> Option<String> {
    if d.is_unit() {
        return None;
    }
    Some(dynamic_to_natural_value(d, "").to_text())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_round_trip() {
        let d = value_to_dynamic(&Value::Empty);
        assert!(d.is_unit());
        assert_eq!(dynamic_to_value(&d, ValueType::Double, "", &[]), Value::Empty);
    }

    #[test]
    fn test_numeric_round_trip() {
        let d = value_to_dynamic(&Value::Int64(42));
        assert_eq!(d.as_int().unwrap(), 42);
        assert_eq!(
            dynamic_to_value(&d, ValueType::Int64, "", &[]),
            Value::Int64(42)
        );
        assert_eq!(
            dynamic_to_value(&d, ValueType::Double, "", &[]),
            Value::Double(42.0)
        );
    }

    #[test]
    fn test_tiny_floats_are_preserved() {
        // canonical-zero is a rendering rule; the stored value keeps its
        // real magnitude
        let d = Dynamic::from_float(3.2e-9);
        let value = dynamic_to_value(&d, ValueType::Double, "", &[]);
        assert_eq!(value, Value::Double(3.2e-9));
        assert_eq!(value.to_text(), "0");
    }

    #[test]
    fn test_struct_conversion_uses_declared_type() {
        let mut map = Map::new();
        map.insert("Latitude".into(), Dynamic::from_float(48.1));
        map.insert("Longitude".into(), Dynamic::from_float(11.5));
        let d = Dynamic::from_map(map);
        match dynamic_to_value(&d, ValueType::Struct, "Types.Location", &[]) {
            Value::Struct(s) => {
                assert_eq!(s.type_name, "Types.Location");
                assert_eq!(s.get("Latitude"), Some(&Value::Double(48.1)));
            }
            other => panic!("expected struct, got {:?}", other),
        }
    }

    #[test]
    fn test_struct_field_order_follows_declaration() {
        let mut map = Map::new();
        map.insert("Zulu".into(), Dynamic::from_int(1));
        map.insert("Alpha".into(), Dynamic::from_int(2));
        let d = Dynamic::from_map(map);

        // the declared order wins over the map's alphabetical order
        let order = vec!["Zulu".to_string(), "Alpha".to_string()];
        match dynamic_to_value(&d, ValueType::Struct, "T", &order) {
            Value::Struct(s) => {
                let names: Vec<&str> = s.fields().map(|(n, _)| n).collect();
                assert_eq!(names, vec!["Zulu", "Alpha"]);
                assert_eq!(s.get("Zulu"), Some(&Value::Int64(1)));
                assert_eq!(s.get("Alpha"), Some(&Value::Int64(2)));
            }
            other => panic!("expected struct, got {:?}", other),
        }
    }

    #[test]
    fn test_undeclared_struct_fields_follow_declared_ones() {
        let mut map = Map::new();
        map.insert("Zulu".into(), Dynamic::from_int(1));
        map.insert("Alpha".into(), Dynamic::from_int(2));
        map.insert("Mike".into(), Dynamic::from_int(3));
        let d = Dynamic::from_map(map);

        let order = vec!["Zulu".to_string()];
        match dynamic_to_value(&d, ValueType::Struct, "T", &order) {
            Value::Struct(s) => {
                let names: Vec<&str> = s.fields().map(|(n, _)| n).collect();
                // Zulu leads; the rest keep the map's deterministic order
                assert_eq!(names, vec!["Zulu", "Alpha", "Mike"]);
            }
            other => panic!("expected struct, got {:?}", other),
        }
    }

    #[test]
    fn test_array_inference() {
        let array: Array = vec![Dynamic::from_int(1), Dynamic::from_int(2)];
        let d = Dynamic::from_array(array);
        assert_eq!(
            dynamic_to_natural_value(&d, ""),
            Value::Int64Array(vec![1, 2])
        );

        let array: Array = vec![Dynamic::from_int(1), Dynamic::from_float(2.5)];
        let d = Dynamic::from_array(array);
        assert_eq!(
            dynamic_to_natural_value(&d, ""),
            Value::DoubleArray(vec![1.0, 2.5])
        );
    }

    #[test]
    fn test_mapping_keys() {
        assert_eq!(dynamic_to_key(&Dynamic::from_int(3)), Some("3".into()));
        assert_eq!(dynamic_to_key(&Dynamic::from_float(25.0)), Some("25".into()));
        assert_eq!(
            dynamic_to_key(&Dynamic::from("DRIVE".to_string())),
            Some("DRIVE".into())
        );
        assert_eq!(dynamic_to_key(&Dynamic::UNIT), None);
    }

    #[test]
    fn test_uint64_beyond_i64_degrades_to_float() {
        let d = value_to_dynamic(&Value::UInt64(u64::MAX));
        assert!(d.is_float());
    }
}
