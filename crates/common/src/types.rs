use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a spatial cell in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(pub Uuid);

impl CellId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CellId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell cells apart in logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// The principal a unit of scheduled work runs on behalf of (usually a
/// connected client session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Identity used for work the server does on its own behalf.
    pub fn system() -> Self {
        Self("system".into())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Spatial transform: position, rotation, scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    /// Pure translation.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Map a point from this transform's local space into its parent space.
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.position + self.rotation * (self.scale * point)
    }

    /// Compose `self` (parent) with `child`, yielding the child's transform in
    /// the parent's parent space.
    pub fn mul(&self, child: &Transform) -> Transform {
        Transform {
            position: self.transform_point(child.position),
            rotation: self.rotation * child.rotation,
            scale: self.scale * child.scale,
        }
    }
}

/// The payload unit of load/unload messages: which cell, and which root graph
/// it was loaded through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellDescription {
    pub id: CellId,
    pub root: CellId,
}

impl CellDescription {
    pub fn new(id: CellId, root: CellId) -> Self {
        Self { id, root }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_id_uniqueness() {
        let a = CellId::new();
        let b = CellId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn transform_default_is_identity() {
        let t = Transform::default();
        assert_eq!(t.position, Vec3::ZERO);
        assert_eq!(t.rotation, Quat::IDENTITY);
        assert_eq!(t.scale, Vec3::ONE);
    }

    #[test]
    fn compose_translations() {
        let parent = Transform::from_position(Vec3::new(10.0, 0.0, 0.0));
        let child = Transform::from_position(Vec3::new(0.0, 5.0, 0.0));
        let world = parent.mul(&child);
        assert_eq!(world.position, Vec3::new(10.0, 5.0, 0.0));
    }

    #[test]
    fn compose_applies_parent_rotation_and_scale() {
        let parent = Transform {
            position: Vec3::ZERO,
            rotation: Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
            scale: Vec3::splat(2.0),
        };
        let child = Transform::from_position(Vec3::X);
        let world = parent.mul(&child);
        assert!((world.position - Vec3::new(0.0, 2.0, 0.0)).length() < 1e-5);
        assert_eq!(world.scale, Vec3::splat(2.0));
    }

    #[test]
    fn identity_display_is_name() {
        assert_eq!(Identity::new("alice").to_string(), "alice");
    }
}
