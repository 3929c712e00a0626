use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};

/// Three component vector used by [`Pose`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);
    pub const X: Vec3 = Vec3::new(1.0, 0.0, 0.0);
    pub const Y: Vec3 = Vec3::new(0.0, 1.0, 0.0);
    pub const Z: Vec3 = Vec3::new(0.0, 0.0, 1.0);

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn dot(&self, other: &Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: &Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn magnitude(&self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Neg for Vec3 {
    type Output = Vec3;

    fn neg(self) -> Vec3 {
        Vec3::new(-self.x, -self.y, -self.z)
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.x, self.y, self.z)
    }
}

/// Rigid transform: a position plus an orthonormal basis.
///
/// The basis is kept as the three direction vectors a world editor exposes:
/// right (+X), up (+Y) and look (-Z). The rotation matrix columns are
/// therefore `right`, `up` and `-look`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub right_vector: Vec3,
    pub up_vector: Vec3,
    pub look_vector: Vec3,
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: Vec3::ZERO,
        right_vector: Vec3::X,
        up_vector: Vec3::Y,
        look_vector: Vec3::new(0.0, 0.0, -1.0),
    };

    /// Pure translation with the identity basis.
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    pub fn from_vectors(position: Vec3, right: Vec3, up: Vec3, look: Vec3) -> Self {
        Self {
            position,
            right_vector: right,
            up_vector: up,
            look_vector: look,
        }
    }

    /// Builds a pose at `eye` looking towards `target` with world +Y as up.
    pub fn look_at(eye: Vec3, target: Vec3) -> Self {
        let forward = target - eye;
        let length = forward.magnitude();
        if length == 0.0 {
            return Self::at(eye);
        }
        let look = Vec3::new(forward.x / length, forward.y / length, forward.z / length);
        let mut right = look.cross(&Vec3::Y);
        let right_len = right.magnitude();
        if right_len == 0.0 {
            right = Vec3::X;
        } else {
            right = Vec3::new(right.x / right_len, right.y / right_len, right.z / right_len);
        }
        let up = right.cross(&look);
        Self::from_vectors(eye, right, up, look)
    }

    /// Rotation matrix columns (right, up, back).
    pub fn rotation_columns(&self) -> [Vec3; 3] {
        [self.right_vector, self.up_vector, -self.look_vector]
    }

    pub fn is_orthonormal(&self, tolerance: f64) -> bool {
        let [r, u, b] = self.rotation_columns();
        let unit = |v: &Vec3| (v.magnitude() - 1.0).abs() <= tolerance;
        unit(&r)
            && unit(&u)
            && unit(&b)
            && r.dot(&u).abs() <= tolerance
            && r.dot(&b).abs() <= tolerance
            && u.dot(&b).abs() <= tolerance
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// RGB color with channels in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Color {
    pub const fn new(r: f64, g: f64, b: f64) -> Self {
        Self { r, g, b }
    }

    pub fn from_rgb(red: u8, green: u8, blue: u8) -> Self {
        Self::new(
            red as f64 / 255.0,
            green as f64 / 255.0,
            blue as f64 / 255.0,
        )
    }

    pub fn channels(&self) -> [f64; 3] {
        [self.r, self.g, self.b]
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.r, self.g, self.b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_orthonormal() {
        assert!(Pose::IDENTITY.is_orthonormal(1e-12));
    }

    #[test]
    fn test_look_at_builds_orthonormal_basis() {
        let pose = Pose::look_at(Vec3::new(0.0, 5.0, 0.0), Vec3::new(10.0, 5.0, 10.0));
        assert!(pose.is_orthonormal(1e-9));
        assert_eq!(pose.position, Vec3::new(0.0, 5.0, 0.0));
    }

    #[test]
    fn test_rotation_columns_negate_look() {
        let [_, _, back] = Pose::IDENTITY.rotation_columns();
        assert_eq!(back, Vec3::Z);
    }
}
