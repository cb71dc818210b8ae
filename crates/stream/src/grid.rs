use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use glam::Vec3;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use worldspace_common::Bounds;

use crate::config::StreamConfig;
use crate::space::Space;

/// Widest neighbourhood, in spaces either side of the centre, one lookup
/// scans.
pub const MAX_SCAN_STEP: i32 = 16;

/// Integer coordinate of a space in the world grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpaceCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl SpaceCoord {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Neighbouring coordinate; saturates at the edge of the grid.
    fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(
            self.x.saturating_add(dx),
            self.y.saturating_add(dy),
            self.z.saturating_add(dz),
        )
    }
}

/// Formats as the space key, e.g. `1_0_-2`.
impl fmt::Display for SpaceCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.x, self.y, self.z)
    }
}

/// Fixed-size grid partitioning of unbounded 3D space.
///
/// Space `c` is centred on `c * 2 * space_size` and reaches `space_size`
/// (times the fudge factor) in every direction. Spaces are created lazily the
/// first time a volume touches them and are never evicted.
pub struct SpaceManager {
    space_size: f32,
    fudge: f32,
    spaces: Mutex<BTreeMap<SpaceCoord, Arc<Space>>>,
}

impl SpaceManager {
    pub fn new(config: &StreamConfig) -> Self {
        assert!(config.space_size > 0.0, "space_size must be positive");
        Self {
            space_size: config.space_size,
            fudge: config.space_fudge.max(1.0),
            spaces: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn space_size(&self) -> f32 {
        self.space_size
    }

    /// Grid coordinate of the space whose centre is nearest to `point`.
    pub fn coord_of(&self, point: Vec3) -> SpaceCoord {
        let pitch = 2.0 * self.space_size;
        let axis = |v: f32| (v / pitch + 0.5).floor() as i32;
        SpaceCoord::new(axis(point.x), axis(point.y), axis(point.z))
    }

    /// Padded world bounds of the space at `coord`.
    pub fn space_bounds(&self, coord: SpaceCoord) -> Bounds {
        let pitch = 2.0 * self.space_size;
        let center = Vec3::new(coord.x as f32, coord.y as f32, coord.z as f32) * pitch;
        Bounds::cube(center, self.space_size * self.fudge)
    }

    /// Every space intersecting `volume`, creating missing ones.
    ///
    /// The space holding the volume's centre always comes first. Neighbours
    /// are scanned in a cube wide enough that no padded space overlapping the
    /// volume can be skipped, up to [`MAX_SCAN_STEP`] spaces either side.
    pub fn enclosing_spaces(&self, volume: &Bounds) -> Vec<Arc<Space>> {
        let pitch = 2.0 * self.space_size;
        let center = self.coord_of(volume.center());
        let padding = self.space_size * (self.fudge - 1.0);
        let wanted = ((volume.radius() + padding) / pitch).ceil().max(0.0) as i32;
        let step = wanted.min(MAX_SCAN_STEP);
        if wanted > step {
            tracing::warn!(%center, radius = volume.radius(), step, "volume too wide, lookup truncated");
        }

        let mut spaces = self.spaces.lock();
        let mut seen = BTreeSet::from([center]);
        let mut out = vec![self.get_or_create(&mut spaces, center)];
        for dx in -step..=step {
            for dy in -step..=step {
                for dz in -step..=step {
                    let coord = center.offset(dx, dy, dz);
                    if !seen.insert(coord) {
                        continue;
                    }
                    if self.space_bounds(coord).intersects(volume) {
                        out.push(self.get_or_create(&mut spaces, coord));
                    }
                }
            }
        }
        tracing::trace!(%center, step, found = out.len(), "enclosing spaces");
        out
    }

    /// The space at `coord`, if any volume has touched it yet.
    pub fn space(&self, coord: SpaceCoord) -> Option<Arc<Space>> {
        self.spaces.lock().get(&coord).cloned()
    }

    /// Number of spaces created so far.
    pub fn space_count(&self) -> usize {
        self.spaces.lock().len()
    }

    pub fn coords(&self) -> Vec<SpaceCoord> {
        self.spaces.lock().keys().copied().collect()
    }

    fn get_or_create(
        &self,
        spaces: &mut BTreeMap<SpaceCoord, Arc<Space>>,
        coord: SpaceCoord,
    ) -> Arc<Space> {
        Arc::clone(spaces.entry(coord).or_insert_with(|| {
            tracing::debug!(space = %coord, "space created");
            Arc::new(Space::new(coord, self.space_bounds(coord)))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SpaceManager {
        SpaceManager::new(&StreamConfig::default())
    }

    fn keys(spaces: &[Arc<Space>]) -> Vec<String> {
        let mut keys: Vec<String> = spaces.iter().map(|s| s.name().to_string()).collect();
        keys.sort();
        keys
    }

    #[test]
    fn coord_of_is_centred_and_floors_negatives() {
        let m = manager();
        assert_eq!(m.coord_of(Vec3::ZERO), SpaceCoord::new(0, 0, 0));
        assert_eq!(m.coord_of(Vec3::new(24.9, -24.9, 0.0)), SpaceCoord::new(0, 0, 0));
        assert_eq!(m.coord_of(Vec3::new(60.0, 0.0, 0.0)), SpaceCoord::new(1, 0, 0));
        assert_eq!(m.coord_of(Vec3::new(-26.0, 0.0, -80.0)), SpaceCoord::new(-1, 0, -2));
    }

    #[test]
    fn key_format() {
        assert_eq!(SpaceCoord::new(1, 0, -2).to_string(), "1_0_-2");
    }

    #[test]
    fn small_volume_at_origin_is_in_one_space() {
        let m = manager();
        let spaces = m.enclosing_spaces(&Bounds::sphere(Vec3::ZERO, 10.0));
        assert_eq!(keys(&spaces), vec!["0_0_0"]);
        assert_eq!(m.space_count(), 1);
    }

    #[test]
    fn boundary_volume_lands_in_both_neighbours() {
        let m = manager();
        let spaces = m.enclosing_spaces(&Bounds::sphere(Vec3::new(25.0, 0.0, 0.0), 3.0));
        assert_eq!(keys(&spaces), vec!["0_0_0", "1_0_0"]);
        assert_eq!(spaces[0].coord(), SpaceCoord::new(1, 0, 0));
    }

    #[test]
    fn fudge_catches_volumes_just_past_the_edge() {
        let m = manager();
        // Past the nominal edge of 0_0_0 but still inside its padding.
        let spaces = m.enclosing_spaces(&Bounds::sphere(Vec3::new(25.1, 0.0, 0.0), 0.0));
        assert_eq!(keys(&spaces), vec!["0_0_0", "1_0_0"]);
    }

    #[test]
    fn large_volume_covers_every_intersecting_space() {
        let m = manager();
        let volume = Bounds::aabb(Vec3::ZERO, Vec3::new(60.0, 1.0, 1.0));
        let spaces = m.enclosing_spaces(&volume);
        assert_eq!(keys(&spaces), vec!["-1_0_0", "0_0_0", "1_0_0"]);
        for space in &spaces {
            assert!(space.bounds().intersects(&volume));
        }
    }

    #[test]
    fn repeated_queries_reuse_spaces() {
        let m = manager();
        let volume = Bounds::sphere(Vec3::new(-30.0, 10.0, 0.0), 12.0);
        let first = m.enclosing_spaces(&volume);
        let count = m.space_count();
        let second = m.enclosing_spaces(&volume);
        assert_eq!(keys(&first), keys(&second));
        assert_eq!(m.space_count(), count);
        for (a, b) in first.iter().zip(&second) {
            assert!(Arc::ptr_eq(a, b));
        }
    }

    #[test]
    fn far_edge_of_the_grid_does_not_overflow() {
        let m = manager();
        let spaces = m.enclosing_spaces(&Bounds::sphere(Vec3::splat(f32::MAX), 1.0e3));
        let edge = SpaceCoord::new(i32::MAX, i32::MAX, i32::MAX);
        assert_eq!(spaces[0].coord(), edge);
        assert_eq!(m.coords().iter().filter(|c| **c == edge).count(), 1);
        assert_eq!(m.space_count(), m.coords().len());
    }

    #[test]
    fn huge_volume_scan_is_bounded() {
        let m = manager();
        m.enclosing_spaces(&Bounds::sphere(Vec3::ZERO, 1.0e6));
        let side = 2 * MAX_SCAN_STEP as usize + 1;
        assert_eq!(m.space_count(), side * side * side);
        let reach = MAX_SCAN_STEP;
        assert!(m.coords().iter().all(|c| c.x.abs() <= reach && c.y.abs() <= reach && c.z.abs() <= reach));
    }

    #[test]
    fn concurrent_lookups_share_one_space_per_coord() {
        let m = manager();
        let pitch = 2.0 * m.space_size();
        let volumes: Vec<Bounds> = (-3..=3)
            .map(|i| Bounds::sphere(Vec3::new(i as f32 * pitch * 0.5, 0.0, i as f32 * 7.0), 20.0))
            .collect();

        let results: Vec<Vec<Vec<Arc<Space>>>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let (m, volumes) = (&m, &volumes);
                    s.spawn(move || {
                        // Each thread walks the volumes from a different start.
                        (0..volumes.len())
                            .map(|i| m.enclosing_spaces(&volumes[(i + t) % volumes.len()]))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let coords = m.coords();
        assert_eq!(m.space_count(), coords.len());
        for space in results.iter().flatten().flatten() {
            let registered = m.space(space.coord()).unwrap();
            assert!(Arc::ptr_eq(space, &registered));
            assert!(coords.contains(&space.coord()));
        }
        let expected: BTreeSet<SpaceCoord> = volumes
            .iter()
            .flat_map(|v| SpaceManager::new(&StreamConfig::default()).enclosing_spaces(v))
            .map(|s| s.coord())
            .collect();
        assert_eq!(coords.into_iter().collect::<BTreeSet<_>>(), expected);
    }
}
