pub mod error;
pub mod shapes;
pub mod value;

pub use error::{DataError, Result};
pub use shapes::{Color, Pose, Vec3};
pub use value::{FieldMap, FieldValue};
