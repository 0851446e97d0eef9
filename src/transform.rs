//! Coordinate transform applied to geometry as it is compiled.
//!
//! The builder keeps one of these and pushes every incoming point through it
//! at the moment the point is appended to an instruction. Changing the
//! transform never touches instructions that were already compiled.

use crate::model::Position;

/// Active translation offset and rotation.
///
/// Rotation happens in the x/y marking plane about an arbitrary center and is
/// applied before translation. The focal (z) axis is only ever translated,
/// and the auxiliary `a` component passes through untouched.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Transform {
    offset: [f32; 3],
    angle_deg: f32,
    center: [f32; 2],
}

impl Transform {
    /// The identity transform: zero offset, zero rotation.
    pub fn identity() -> Self {
        Transform::default()
    }

    /// Replaces the translation offset.
    pub fn set_offset(&mut self, dx: f32, dy: f32, dz: f32) {
        self.offset = [dx, dy, dz];
    }

    /// Replaces the rotation: `angle_deg` degrees counterclockwise about
    /// `(cx, cy)`.
    pub fn set_rotation(&mut self, angle_deg: f32, cx: f32, cy: f32) {
        self.angle_deg = angle_deg;
        self.center = [cx, cy];
    }

    /// Whether applying this transform is a no-op.
    pub fn is_identity(&self) -> bool {
        self.offset == [0.0; 3] && self.angle_deg == 0.0
    }

    pub fn offset(&self) -> [f32; 3] {
        self.offset
    }

    pub fn angle_deg(&self) -> f32 {
        self.angle_deg
    }

    pub fn center(&self) -> [f32; 2] {
        self.center
    }

    /// Rotates `p` about the center, then translates.
    pub fn apply(&self, p: Position) -> Position {
        let (sin, cos) = self.angle_deg.to_radians().sin_cos();
        let rx = p.x - self.center[0];
        let ry = p.y - self.center[1];
        Position {
            x: rx * cos - ry * sin + self.center[0] + self.offset[0],
            y: rx * sin + ry * cos + self.center[1] + self.offset[1],
            z: p.z + self.offset[2],
            a: p.a,
        }
    }

    /// Undoes [`Transform::apply`]: translates back, then rotates back.
    pub fn invert(&self, p: Position) -> Position {
        let (sin, cos) = (-self.angle_deg).to_radians().sin_cos();
        let rx = p.x - self.offset[0] - self.center[0];
        let ry = p.y - self.offset[1] - self.center[1];
        Position {
            x: rx * cos - ry * sin + self.center[0],
            y: rx * sin + ry * cos + self.center[1],
            z: p.z - self.offset[2],
            a: p.a,
        }
    }
}
