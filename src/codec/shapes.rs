//! Pose and color conversions to their stored map form.

use crate::core::{Color, DataError, FieldMap, FieldValue, Pose, Result, Vec3};

pub const POSITION: &str = "Position";
pub const RIGHT_VECTOR: &str = "RightVector";
pub const UP_VECTOR: &str = "UpVector";
pub const LOOK_VECTOR: &str = "LookVector";

pub const RED: &str = "Red";
pub const GREEN: &str = "Green";
pub const BLUE: &str = "Blue";

const AXES: [&str; 3] = ["X", "Y", "Z"];

fn encode_vec3(v: &Vec3) -> FieldValue {
    let mut map = FieldMap::new();
    map.insert(AXES[0].to_string(), FieldValue::Number(v.x));
    map.insert(AXES[1].to_string(), FieldValue::Number(v.y));
    map.insert(AXES[2].to_string(), FieldValue::Number(v.z));
    FieldValue::Map(map)
}

fn decode_vec3(shape: &FieldMap, name: &str) -> Result<Vec3> {
    let component = shape
        .get(name)
        .ok_or_else(|| DataError::malformed(name, "missing vector"))?
        .as_map()
        .ok_or_else(|| DataError::malformed(name, "vector is not a map"))?;

    let mut xyz = [0.0; 3];
    for (slot, axis) in xyz.iter_mut().zip(AXES) {
        *slot = component
            .get(axis)
            .and_then(FieldValue::as_f64)
            .ok_or_else(|| DataError::malformed(name, format!("missing numeric component '{}'", axis)))?;
    }
    Ok(Vec3::new(xyz[0], xyz[1], xyz[2]))
}

/// `{Position, RightVector, UpVector, LookVector}`, each `{X, Y, Z}`.
pub fn encode_pose(pose: &Pose) -> FieldValue {
    let mut map = FieldMap::new();
    map.insert(POSITION.to_string(), encode_vec3(&pose.position));
    map.insert(RIGHT_VECTOR.to_string(), encode_vec3(&pose.right_vector));
    map.insert(UP_VECTOR.to_string(), encode_vec3(&pose.up_vector));
    map.insert(LOOK_VECTOR.to_string(), encode_vec3(&pose.look_vector));
    FieldValue::Map(map)
}

pub fn decode_pose(shape: &FieldMap) -> Result<Pose> {
    Ok(Pose::from_vectors(
        decode_vec3(shape, POSITION)?,
        decode_vec3(shape, RIGHT_VECTOR)?,
        decode_vec3(shape, UP_VECTOR)?,
        decode_vec3(shape, LOOK_VECTOR)?,
    ))
}

fn quantize(channel: f64) -> i64 {
    let scaled = (channel * 255.0).floor();
    if scaled.is_nan() {
        return 0;
    }
    scaled.clamp(0.0, 255.0) as i64
}

/// Channels are floored to 8-bit integers, so this conversion is lossy:
/// a decoded channel may differ from the original by less than `1/255`.
pub fn encode_color(color: &Color) -> FieldValue {
    let mut map = FieldMap::new();
    map.insert(RED.to_string(), FieldValue::Integer(quantize(color.r)));
    map.insert(GREEN.to_string(), FieldValue::Integer(quantize(color.g)));
    map.insert(BLUE.to_string(), FieldValue::Integer(quantize(color.b)));
    FieldValue::Map(map)
}

pub fn decode_color(shape: &FieldMap) -> Result<Color> {
    let channel = |name: &str| -> Result<f64> {
        shape
            .get(name)
            .and_then(FieldValue::as_f64)
            .map(|value| value / 255.0)
            .ok_or_else(|| DataError::malformed(name, "missing numeric color channel"))
    };
    Ok(Color::new(channel(RED)?, channel(GREEN)?, channel(BLUE)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(value: FieldValue) -> FieldMap {
        match value {
            FieldValue::Map(map) => map,
            other => panic!("expected map, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_pose_round_trip_is_exact() {
        let pose = Pose::look_at(Vec3::new(1.25, -3.5, 1e6), Vec3::new(-7.0, 2.0, 0.1));
        let decoded = decode_pose(&map_of(encode_pose(&pose))).unwrap();
        assert_eq!(decoded, pose);
    }

    #[test]
    fn test_pose_missing_vector_is_malformed() {
        let mut shape = map_of(encode_pose(&Pose::IDENTITY));
        shape.remove(UP_VECTOR);
        let err = decode_pose(&shape).unwrap_err();
        assert!(matches!(err, DataError::MalformedShape { ref field, .. } if field == UP_VECTOR));
    }

    #[test]
    fn test_pose_missing_component_is_malformed() {
        let mut shape = map_of(encode_pose(&Pose::IDENTITY));
        if let Some(FieldValue::Map(position)) = shape.get_mut(POSITION) {
            position.remove("Y");
        }
        assert!(decode_pose(&shape).is_err());
    }

    #[test]
    fn test_color_encoding_floors_and_clamps() {
        let shape = map_of(encode_color(&Color::new(1.0, 0.5, 2.0)));
        assert_eq!(shape[RED], FieldValue::Integer(255));
        assert_eq!(shape[GREEN], FieldValue::Integer(127));
        assert_eq!(shape[BLUE], FieldValue::Integer(255));

        let shape = map_of(encode_color(&Color::new(-0.3, f64::NAN, 0.0)));
        assert_eq!(shape[RED], FieldValue::Integer(0));
        assert_eq!(shape[GREEN], FieldValue::Integer(0));
    }

    #[test]
    fn test_color_round_trip_within_quantization() {
        for color in [
            Color::new(0.0, 0.0, 0.0),
            Color::new(1.0, 1.0, 1.0),
            Color::new(0.123, 0.456, 0.789),
            Color::from_rgb(12, 200, 99),
        ] {
            let decoded = decode_color(&map_of(encode_color(&color))).unwrap();
            for (a, b) in decoded.channels().iter().zip(color.channels()) {
                assert!((a - b).abs() <= 1.0 / 255.0 + 1e-12, "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_color_missing_channel_is_malformed() {
        let mut shape = map_of(encode_color(&Color::new(0.2, 0.2, 0.2)));
        shape.remove(BLUE);
        assert!(matches!(
            decode_color(&shape),
            Err(DataError::MalformedShape { .. })
        ));
    }
}
