use super::shapes::{POSITION, RED, decode_color, decode_pose, encode_color, encode_pose};
use crate::core::{DataError, FieldMap, FieldValue, Result};

/// Replaces every top-level pose or color with its stored map form.
///
/// Already encoded fields are plain maps, so calling this twice is a no-op.
pub fn serialize_record(fields: &mut FieldMap) {
    for value in fields.values_mut() {
        let encoded = match value {
            FieldValue::Pose(pose) => encode_pose(pose),
            FieldValue::Color(color) => encode_color(color),
            _ => continue,
        };
        *value = encoded;
    }
}

/// Decodes stored shapes back into rich values.
///
/// A map holding a `Red` key is a color, one holding a `Position` key is a
/// pose. Nothing is replaced unless every candidate decodes.
pub fn deserialize_record(fields: &mut FieldMap) -> Result<()> {
    let mut decoded = Vec::new();
    for (name, value) in fields.iter() {
        let FieldValue::Map(shape) = value else {
            continue;
        };
        let rich = if shape.contains_key(RED) {
            FieldValue::Color(decode_color(shape).map_err(|err| within(name, err))?)
        } else if shape.contains_key(POSITION) {
            FieldValue::Pose(decode_pose(shape).map_err(|err| within(name, err))?)
        } else {
            continue;
        };
        decoded.push((name.clone(), rich));
    }

    for (name, rich) in decoded {
        fields.insert(name, rich);
    }
    Ok(())
}

fn within(field: &str, err: DataError) -> DataError {
    match err {
        DataError::MalformedShape { field: inner, reason } => {
            DataError::malformed(field, format!("{}: {}", inner, reason))
        }
        other => other,
    }
}
