//! Hooks through which the graph tells the rest of the server about changes.
//!
//! Every callback here runs while the graph's write lock is held. Implementors
//! must not touch the graph again from inside a callback; they record or
//! enqueue work and return.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use worldspace_common::{Bounds, CellId, TaskError, Transform};

use crate::tree::CellTree;

/// Identity of a registered observer, used for reference-counted membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub u64);

impl ObserverId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// Observes a whole root graph (registered on the graph's root).
pub trait CellObserver: Send + Sync {
    fn observer_id(&self) -> ObserverId;

    /// A cell in the graph has a new world transform.
    fn cell_moved(&self, cell: CellId, world: &Transform);

    /// `cells` (the attached child and its descendants) joined the graph rooted
    /// at `root`.
    fn child_attached(&self, root: CellId, parent: CellId, cells: &[CellId]);

    /// `cells` (the detached child and its descendants) left the graph rooted
    /// at `root`.
    fn child_detached(&self, root: CellId, parent: CellId, cells: &[CellId]);
}

/// Observes the world transform of a single cell (the cell a viewer sees
/// through).
pub trait ViewObserver: Send + Sync {
    fn view_moved(&self, cell: CellId, world: &Transform);
}

/// Receives asynchronous transform change notifications for one cell.
pub trait TransformListener: Send + Sync {
    fn transform_changed(
        &self,
        cell: CellId,
        local: &Transform,
        world: &Transform,
    ) -> Result<(), TaskError>;
}

/// Places live root graphs into the world's spatial index.
pub trait RootPlacement: Send + Sync {
    /// The root's world bounds were computed or changed.
    fn place_root(&self, tree: &Arc<CellTree>, world_bounds: &Bounds);

    /// The root left the world.
    fn remove_root(&self, tree: &Arc<CellTree>);
}

/// Placement that indexes nothing, for graphs used outside a universe.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlacement;

impl RootPlacement for NoPlacement {
    fn place_root(&self, _tree: &Arc<CellTree>, _world_bounds: &Bounds) {}

    fn remove_root(&self, _tree: &Arc<CellTree>) {}
}
