// ============================================================================
// Value Codec
// ============================================================================
//
// Converts the rich values a live record holds (poses, colors) to the plain
// nested maps storage accepts, and back again after a load.
//
// ============================================================================

pub mod json;
pub mod record;
pub mod shapes;

pub use json::{fields_from_json, fields_to_json, value_from_json, value_to_json};
pub use record::{deserialize_record, serialize_record};
pub use shapes::{decode_color, decode_pose, encode_color, encode_pose};
