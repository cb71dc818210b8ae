use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use worldspace_common::{Bounds, CellId};
use worldspace_kernel::{CellTree, RootPlacement};

use crate::grid::{SpaceCoord, SpaceManager};
use crate::space::Space;

/// Keeps every live root registered in exactly the spaces its world bounds
/// intersect.
pub struct SpacePlacement {
    spaces: Arc<SpaceManager>,
    memberships: Mutex<HashMap<CellId, BTreeMap<SpaceCoord, Arc<Space>>>>,
}

impl SpacePlacement {
    pub fn new(spaces: Arc<SpaceManager>) -> Self {
        Self {
            spaces,
            memberships: Mutex::new(HashMap::new()),
        }
    }

    /// Spaces `root` is currently placed in, in grid order.
    pub fn spaces_of(&self, root: CellId) -> Vec<SpaceCoord> {
        self.memberships
            .lock()
            .get(&root)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of roots placed in at least one space.
    pub fn placed_roots(&self) -> usize {
        self.memberships.lock().len()
    }
}

impl RootPlacement for SpacePlacement {
    fn place_root(&self, tree: &Arc<CellTree>, world_bounds: &Bounds) {
        let root = tree.root();
        let wanted: BTreeMap<SpaceCoord, Arc<Space>> = self
            .spaces
            .enclosing_spaces(world_bounds)
            .into_iter()
            .map(|s| (s.coord(), s))
            .collect();

        let mut memberships = self.memberships.lock();
        let current = memberships.remove(&root).unwrap_or_default();
        // Join new spaces before leaving old ones so watchers of both never
        // see the root disappear in between.
        for (coord, space) in &wanted {
            if !current.contains_key(coord) {
                space.add_root_cell(tree);
            }
        }
        for (coord, space) in &current {
            if !wanted.contains_key(coord) {
                withdraw(space, tree);
            }
        }
        tracing::trace!(%root, spaces = wanted.len(), "root placed");
        memberships.insert(root, wanted);
    }

    fn remove_root(&self, tree: &Arc<CellTree>) {
        let root = tree.root();
        let Some(current) = self.memberships.lock().remove(&root) else {
            return;
        };
        for space in current.values() {
            withdraw(space, tree);
        }
        tracing::trace!(%root, "root removed from spaces");
    }
}

// The memberships map is the only writer of root membership in spaces, so a
// missing root means the two indexes disagree.
fn withdraw(space: &Space, tree: &Arc<CellTree>) {
    if let Err(err) = space.remove_root_cell(tree) {
        tracing::error!(error = %err, "placement and space membership disagree");
        panic!("space membership out of sync: {err}");
    }
}
