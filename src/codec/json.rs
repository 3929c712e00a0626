//! Bridge between field maps and the JSON documents kept by storage.

use super::shapes::{encode_color, encode_pose};
use crate::core::{DataError, FieldMap, FieldValue, Result};
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

pub fn value_to_json(value: &FieldValue) -> Result<JsonValue> {
    Ok(match value {
        FieldValue::Null => JsonValue::Null,
        FieldValue::Bool(b) => JsonValue::Bool(*b),
        FieldValue::Integer(i) => JsonValue::Number(Number::from(*i)),
        FieldValue::Number(n) => Number::from_f64(*n)
            .map(JsonValue::Number)
            .ok_or_else(|| DataError::Serialization(format!("Cannot store non-finite number {}", n)))?,
        FieldValue::Text(s) => JsonValue::String(s.clone()),
        FieldValue::List(items) => {
            JsonValue::Array(items.iter().map(value_to_json).collect::<Result<Vec<_>>>()?)
        }
        FieldValue::Map(map) => JsonValue::Object(fields_to_json(map)?),
        FieldValue::Pose(pose) => value_to_json(&encode_pose(pose))?,
        FieldValue::Color(color) => value_to_json(&encode_color(color))?,
    })
}

pub fn fields_to_json(fields: &FieldMap) -> Result<JsonMap<String, JsonValue>> {
    let mut object = JsonMap::new();
    for (key, value) in fields {
        object.insert(key.clone(), value_to_json(value)?);
    }
    Ok(object)
}

/// Plain conversion; stored shapes stay maps until `deserialize_record`.
pub fn value_from_json(value: &JsonValue) -> FieldValue {
    match value {
        JsonValue::Null => FieldValue::Null,
        JsonValue::Bool(b) => FieldValue::Bool(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Integer(i),
            None => FieldValue::Number(n.as_f64().unwrap_or(0.0)),
        },
        JsonValue::String(s) => FieldValue::Text(s.clone()),
        JsonValue::Array(items) => FieldValue::List(items.iter().map(value_from_json).collect()),
        JsonValue::Object(object) => FieldValue::Map(fields_from_json(object)),
    }
}

pub fn fields_from_json(object: &JsonMap<String, JsonValue>) -> FieldMap {
    object
        .iter()
        .map(|(key, value)| (key.clone(), value_from_json(value)))
        .collect()
}
