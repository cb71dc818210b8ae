use glam::{Mat3, Vec3};
use serde::{Deserialize, Serialize};

use crate::types::Transform;

/// A bounding volume in some coordinate space.
///
/// Only axis-aligned boxes and spheres exist; every consumer (merging,
/// intersection, space lookup) handles both, so there is no unsupported
/// volume type to reject at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Bounds {
    Box { center: Vec3, half_extents: Vec3 },
    Sphere { center: Vec3, radius: f32 },
}

impl Default for Bounds {
    /// A point at the origin.
    fn default() -> Self {
        Self::Sphere {
            center: Vec3::ZERO,
            radius: 0.0,
        }
    }
}

impl Bounds {
    pub fn sphere(center: Vec3, radius: f32) -> Self {
        Self::Sphere { center, radius }
    }

    pub fn aabb(center: Vec3, half_extents: Vec3) -> Self {
        Self::Box {
            center,
            half_extents,
        }
    }

    pub fn cube(center: Vec3, half_extent: f32) -> Self {
        Self::aabb(center, Vec3::splat(half_extent))
    }

    pub fn center(&self) -> Vec3 {
        match *self {
            Self::Box { center, .. } | Self::Sphere { center, .. } => center,
        }
    }

    /// Radius of the smallest sphere around `center()` enclosing the volume.
    pub fn radius(&self) -> f32 {
        match *self {
            Self::Box { half_extents, .. } => half_extents.length(),
            Self::Sphere { radius, .. } => radius,
        }
    }

    /// Express this volume in the parent space of `transform`.
    ///
    /// Boxes stay axis aligned, so a rotated box grows to the AABB of its
    /// rotated corners.
    pub fn transformed(&self, transform: &Transform) -> Bounds {
        match *self {
            Self::Box {
                center,
                half_extents,
            } => {
                let rot = Mat3::from_quat(transform.rotation);
                let h = half_extents * transform.scale.abs();
                let half_extents =
                    rot.x_axis.abs() * h.x + rot.y_axis.abs() * h.y + rot.z_axis.abs() * h.z;
                Self::Box {
                    center: transform.transform_point(center),
                    half_extents,
                }
            }
            Self::Sphere { center, radius } => Self::Sphere {
                center: transform.transform_point(center),
                radius: radius * transform.scale.abs().max_element(),
            },
        }
    }

    /// Smallest volume of `self`'s kind enclosing both `self` and `other`.
    pub fn merged(&self, other: &Bounds) -> Bounds {
        match *self {
            Self::Box { .. } => {
                let (a_min, a_max) = self.min_max();
                let (b_min, b_max) = other.min_max();
                let min = a_min.min(b_min);
                let max = a_max.max(b_max);
                Self::Box {
                    center: (min + max) * 0.5,
                    half_extents: (max - min) * 0.5,
                }
            }
            Self::Sphere { center, radius } => {
                merge_spheres(center, radius, other.center(), other.radius())
            }
        }
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        match (*self, *other) {
            (
                Self::Box {
                    center: ca,
                    half_extents: ha,
                },
                Self::Box {
                    center: cb,
                    half_extents: hb,
                },
            ) => {
                let d = (ca - cb).abs();
                let reach = ha + hb;
                d.x <= reach.x && d.y <= reach.y && d.z <= reach.z
            }
            (
                Self::Sphere {
                    center: ca,
                    radius: ra,
                },
                Self::Sphere {
                    center: cb,
                    radius: rb,
                },
            ) => ca.distance_squared(cb) <= (ra + rb) * (ra + rb),
            (
                Self::Box {
                    center: bc,
                    half_extents,
                },
                Self::Sphere { center, radius },
            )
            | (
                Self::Sphere { center, radius },
                Self::Box {
                    center: bc,
                    half_extents,
                },
            ) => {
                let closest = center.clamp(bc - half_extents, bc + half_extents);
                closest.distance_squared(center) <= radius * radius
            }
        }
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        match *self {
            Self::Box {
                center,
                half_extents,
            } => {
                let d = (point - center).abs();
                d.x <= half_extents.x && d.y <= half_extents.y && d.z <= half_extents.z
            }
            Self::Sphere { center, radius } => center.distance_squared(point) <= radius * radius,
        }
    }

    /// Axis-aligned corners of the volume.
    pub fn min_max(&self) -> (Vec3, Vec3) {
        match *self {
            Self::Box {
                center,
                half_extents,
            } => (center - half_extents, center + half_extents),
            Self::Sphere { center, radius } => {
                (center - Vec3::splat(radius), center + Vec3::splat(radius))
            }
        }
    }
}

fn merge_spheres(ca: Vec3, ra: f32, cb: Vec3, rb: f32) -> Bounds {
    let offset = cb - ca;
    let dist = offset.length();
    if dist + rb <= ra {
        return Bounds::sphere(ca, ra);
    }
    if dist + ra <= rb {
        return Bounds::sphere(cb, rb);
    }
    let radius = (dist + ra + rb) * 0.5;
    let center = ca + offset * ((radius - ra) / dist);
    Bounds::sphere(center, radius)
}
