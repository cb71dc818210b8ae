use std::fmt;
use std::sync::Arc;

use worldspace_common::{Bounds, CellId, Identity, Transform};

use crate::graph::{GraphError, SpatialGraph};
use crate::observer::{TransformListener, ViewObserver};

/// Handle to one node of the [`SpatialGraph`].
///
/// Handles are cheap to clone; the graph owns the node. Operations on a
/// handle whose cell was destroyed fail with [`GraphError::UnknownCell`].
#[derive(Clone)]
pub struct SpatialCell {
    id: CellId,
    graph: Arc<SpatialGraph>,
}

impl SpatialCell {
    pub(crate) fn new(id: CellId, graph: Arc<SpatialGraph>) -> Self {
        Self { id, graph }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn graph(&self) -> &Arc<SpatialGraph> {
        &self.graph
    }

    pub fn set_local_transform(&self, transform: Transform) -> Result<(), GraphError> {
        self.graph.set_local_transform(self.id, transform)
    }

    pub fn local_transform(&self) -> Result<Transform, GraphError> {
        self.graph.local_transform(self.id)
    }

    pub fn set_local_bounds(&self, bounds: Bounds) -> Result<(), GraphError> {
        self.graph.set_local_bounds(self.id, bounds)
    }

    pub fn world_transform(&self) -> Result<Transform, GraphError> {
        self.graph.world_transform(self.id)
    }

    pub fn world_bounds(&self) -> Result<Bounds, GraphError> {
        self.graph.world_bounds(self.id)
    }

    pub fn add_child(&self, child: &SpatialCell) -> Result<(), GraphError> {
        self.graph.add_child(self.id, child.id)
    }

    pub fn remove_child(&self, child: &SpatialCell) -> Result<(), GraphError> {
        self.graph.remove_child(self.id, child.id)
    }

    pub fn parent(&self) -> Result<Option<CellId>, GraphError> {
        self.graph.parent(self.id)
    }

    pub fn children(&self) -> Result<Vec<CellId>, GraphError> {
        self.graph.children(self.id)
    }

    /// Root of the graph this cell currently belongs to.
    pub fn root(&self) -> Result<CellId, GraphError> {
        self.graph.root_of(self.id)
    }

    pub fn is_live(&self) -> Result<bool, GraphError> {
        self.graph.is_live(self.id)
    }

    pub fn set_root(&self) -> Result<(), GraphError> {
        self.graph.set_root(self.id)
    }

    pub fn clear_root(&self) -> Result<(), GraphError> {
        self.graph.clear_root(self.id)
    }

    pub fn set_view_observer(&self, observer: Option<Arc<dyn ViewObserver>>) -> Result<(), GraphError> {
        self.graph.set_view_observer(self.id, observer)
    }

    pub fn add_transform_listener(
        &self,
        listener: Arc<dyn TransformListener>,
        identity: Identity,
    ) -> Result<(), GraphError> {
        self.graph.add_transform_listener(self.id, listener, identity)
    }

    pub fn remove_transform_listener(
        &self,
        listener: &Arc<dyn TransformListener>,
    ) -> Result<bool, GraphError> {
        self.graph.remove_transform_listener(self.id, listener)
    }

    pub fn destroy(&self) -> Result<(), GraphError> {
        self.graph.destroy(self.id)
    }
}

impl fmt::Debug for SpatialCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpatialCell").field("id", &self.id).finish()
    }
}

impl PartialEq for SpatialCell {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.graph, &other.graph)
    }
}

impl Eq for SpatialCell {}
