use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use worldspace_common::{Bounds, CellId, Identity, TaskScheduler, Transform};

use crate::cell::SpatialCell;
use crate::observer::{ObserverId, RootPlacement, TransformListener, ViewObserver};
use crate::tree::{CellNode, CellTree, ListenerEntry, TreeState, TreeView};

/// Errors from structural and transform operations on the cell graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("unknown cell {0}")]
    UnknownCell(CellId),
    #[error("cell {0} already exists")]
    DuplicateCell(CellId),
    #[error("cell {child} already has parent {parent}")]
    MultipleParents { child: CellId, parent: CellId },
    #[error("attaching {child} under {parent} would create a cycle")]
    WouldCycle { parent: CellId, child: CellId },
    #[error("cell {child} is not a child of {parent}")]
    NotAChild { parent: CellId, child: CellId },
    #[error("cell {0} is not the root of its graph")]
    NotRoot(CellId),
    #[error("{observer} is not registered on graph {root}")]
    UnknownObserver { root: CellId, observer: ObserverId },
}

/// Every cell in the world, partitioned into root graphs.
///
/// The registry maps each cell to the graph that currently owns it. Attaching
/// a root under another graph's cell merges the two arenas; detaching splits a
/// subtree off into a new graph. Mutations take only the owning graph's write
/// lock, so unrelated graphs never contend.
pub struct SpatialGraph {
    trees: RwLock<HashMap<CellId, Arc<CellTree>>>,
    placement: Arc<dyn RootPlacement>,
    scheduler: Arc<dyn TaskScheduler>,
}

impl SpatialGraph {
    pub fn new(placement: Arc<dyn RootPlacement>, scheduler: Arc<dyn TaskScheduler>) -> Arc<Self> {
        Arc::new(Self {
            trees: RwLock::new(HashMap::new()),
            placement,
            scheduler,
        })
    }

    /// Create a detached cell with identity transform and empty bounds.
    pub fn create_cell(self: &Arc<Self>, id: CellId) -> Result<SpatialCell, GraphError> {
        let mut trees = self.trees.write();
        if trees.contains_key(&id) {
            return Err(GraphError::DuplicateCell(id));
        }
        let mut nodes = HashMap::new();
        nodes.insert(id, CellNode::new());
        trees.insert(id, CellTree::new(id, nodes));
        tracing::trace!(cell = %id, "cell created");
        Ok(SpatialCell::new(id, Arc::clone(self)))
    }

    pub fn cell(self: &Arc<Self>, id: CellId) -> Option<SpatialCell> {
        self.contains(id).then(|| SpatialCell::new(id, Arc::clone(self)))
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.trees.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.trees.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.read().is_empty()
    }

    /// The graph currently owning `id`. The answer can be stale as soon as
    /// it is returned if the cell is concurrently attached or detached.
    pub fn tree(&self, id: CellId) -> Result<Arc<CellTree>, GraphError> {
        self.trees
            .read()
            .get(&id)
            .cloned()
            .ok_or(GraphError::UnknownCell(id))
    }

    pub fn root_of(&self, id: CellId) -> Result<CellId, GraphError> {
        loop {
            let tree = self.tree(id)?;
            if tree.read().contains(id) {
                return Ok(tree.root());
            }
        }
    }

    pub fn is_live(&self, id: CellId) -> Result<bool, GraphError> {
        self.with_read(id, |view, _| view.is_live())
    }

    pub fn local_transform(&self, id: CellId) -> Result<Transform, GraphError> {
        self.with_read(id, |view, id| view.local_transform(id).unwrap_or_default())
    }

    pub fn world_transform(&self, id: CellId) -> Result<Transform, GraphError> {
        self.with_read(id, |view, id| view.world_transform(id).unwrap_or_default())
    }

    pub fn world_bounds(&self, id: CellId) -> Result<Bounds, GraphError> {
        self.with_read(id, |view, id| view.world_bounds(id).unwrap_or_default())
    }

    pub fn parent(&self, id: CellId) -> Result<Option<CellId>, GraphError> {
        self.with_read(id, |view, id| view.parent(id))
    }

    pub fn children(&self, id: CellId) -> Result<Vec<CellId>, GraphError> {
        self.with_read(id, |view, id| view.children(id).to_vec())
    }

    pub fn set_local_transform(&self, id: CellId, transform: Transform) -> Result<(), GraphError> {
        tracing::trace!(cell = %id, position = ?transform.position, "set local transform");
        self.update_local(id, |node| node.local_transform = transform)
    }

    pub fn set_local_bounds(&self, id: CellId, bounds: Bounds) -> Result<(), GraphError> {
        self.update_local(id, |node| node.local_bounds = bounds)
    }

    /// Attach the root `child` (and its subtree) under `parent`.
    pub fn add_child(&self, parent: CellId, child: CellId) -> Result<(), GraphError> {
        if parent == child {
            return Err(GraphError::WouldCycle { parent, child });
        }
        loop {
            let parent_tree = self.tree(parent)?;
            let child_tree = self.tree(child)?;

            if Arc::ptr_eq(&parent_tree, &child_tree) {
                let view = parent_tree.read();
                if !view.contains(parent) || !view.contains(child) {
                    continue;
                }
                return Err(match view.parent(child) {
                    Some(current) => GraphError::MultipleParents { child, parent: current },
                    None => GraphError::WouldCycle { parent, child },
                });
            }

            // Two graphs are locked in root order so concurrent attaches cannot
            // deadlock.
            let (mut target, mut source) = if parent_tree.root() < child_tree.root() {
                let target = parent_tree.state.write();
                (target, child_tree.state.write())
            } else {
                let source = child_tree.state.write();
                (parent_tree.state.write(), source)
            };
            if !target.nodes.contains_key(&parent) || !source.nodes.contains_key(&child) {
                continue;
            }
            if let Some(current) = source.nodes.get(&child).and_then(|n| n.parent) {
                return Err(GraphError::MultipleParents { child, parent: current });
            }

            if source.live {
                source.live = false;
                self.placement.remove_root(&child_tree);
            }
            let cells = source.descendants(child);
            target.nodes.extend(source.nodes.drain());
            {
                let mut trees = self.trees.write();
                for cell in &cells {
                    trees.insert(*cell, Arc::clone(&parent_tree));
                }
            }
            drop(source);

            if let Some(node) = target.nodes.get_mut(&child) {
                node.parent = Some(parent);
            }
            if let Some(node) = target.nodes.get_mut(&parent) {
                node.children.push(child);
            }
            tracing::debug!(%parent, %child, cells = cells.len(), "child attached");

            if target.live {
                self.recompute(&parent_tree, &mut *target, child, false);
                let root = parent_tree.root();
                parent_tree.for_each_observer(|o| o.child_attached(root, parent, &cells));
            }
            return Ok(());
        }
    }

    /// Detach `child` from `parent`; the child's subtree becomes its own
    /// (not live) graph.
    pub fn remove_child(&self, parent: CellId, child: CellId) -> Result<(), GraphError> {
        self.with_write(parent, |tree, state| {
            let attached = state
                .nodes
                .get(&child)
                .is_some_and(|n| n.parent == Some(parent));
            if !attached {
                return Err(GraphError::NotAChild { parent, child });
            }

            let cells = state.descendants(child);
            if let Some(node) = state.nodes.get_mut(&parent) {
                node.children.retain(|c| *c != child);
            }
            let mut detached = HashMap::with_capacity(cells.len());
            for cell in &cells {
                if let Some(node) = state.nodes.remove(cell) {
                    detached.insert(*cell, node);
                }
            }
            if let Some(node) = detached.get_mut(&child) {
                node.parent = None;
            }
            let split = CellTree::new(child, detached);
            {
                let mut trees = self.trees.write();
                for cell in &cells {
                    trees.insert(*cell, Arc::clone(&split));
                }
            }
            tracing::debug!(%parent, %child, cells = cells.len(), "child detached");

            if state.live {
                let before = state.world_bounds(tree.root());
                state.refresh_ancestors(Some(parent));
                self.replace_root(tree, state, before, false);
                let root = tree.root();
                tree.for_each_observer(|o| o.child_detached(root, parent, &cells));
            }
            Ok(())
        })
    }

    /// Make the graph rooted at `id` live: world state is computed and the
    /// root is placed in the spatial index. Idempotent.
    pub fn set_root(&self, id: CellId) -> Result<(), GraphError> {
        self.with_write(id, |tree, state| {
            if tree.root() != id {
                return Err(GraphError::NotRoot(id));
            }
            if !state.live {
                state.live = true;
                self.recompute(tree, state, id, true);
                tracing::debug!(root = %id, cells = state.nodes.len(), "root attached to world");
            }
            Ok(())
        })
    }

    /// Withdraw the graph rooted at `id` from the world. Idempotent.
    pub fn clear_root(&self, id: CellId) -> Result<(), GraphError> {
        self.with_write(id, |tree, state| {
            if tree.root() != id {
                return Err(GraphError::NotRoot(id));
            }
            if state.live {
                state.live = false;
                self.placement.remove_root(tree);
                tracing::debug!(root = %id, "root withdrawn from world");
            }
            Ok(())
        })
    }

    /// Detach `id` from its parent, withdraw it, and forget it and every
    /// cell below it.
    pub fn destroy(&self, id: CellId) -> Result<(), GraphError> {
        if let Some(parent) = self.parent(id)? {
            match self.remove_child(parent, id) {
                Ok(()) | Err(GraphError::NotAChild { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        self.with_write(id, |tree, state| {
            if tree.root() != id {
                // Re-attached by someone else after the detach above.
                return Err(GraphError::NotRoot(id));
            }
            if state.live {
                state.live = false;
                self.placement.remove_root(tree);
            }
            let cells: Vec<CellId> = state.nodes.drain().map(|(cell, _)| cell).collect();
            let mut trees = self.trees.write();
            for cell in &cells {
                trees.remove(cell);
            }
            tracing::debug!(cell = %id, cells = cells.len(), "subtree destroyed");
            Ok(())
        })
    }

    pub fn set_view_observer(
        &self,
        id: CellId,
        observer: Option<Arc<dyn ViewObserver>>,
    ) -> Result<(), GraphError> {
        self.with_write(id, |_, state| {
            let node = state.nodes.get_mut(&id).ok_or(GraphError::UnknownCell(id))?;
            node.view_observer = observer;
            Ok(())
        })
    }

    /// Register a listener that is told, through the task scheduler and on
    /// behalf of `identity`, about every world transform change of `id`.
    pub fn add_transform_listener(
        &self,
        id: CellId,
        listener: Arc<dyn TransformListener>,
        identity: Identity,
    ) -> Result<(), GraphError> {
        self.with_write(id, |_, state| {
            let node = state.nodes.get_mut(&id).ok_or(GraphError::UnknownCell(id))?;
            node.transform_listeners.push(ListenerEntry { listener, identity });
            Ok(())
        })
    }

    /// Returns whether the listener was registered.
    pub fn remove_transform_listener(
        &self,
        id: CellId,
        listener: &Arc<dyn TransformListener>,
    ) -> Result<bool, GraphError> {
        self.with_write(id, |_, state| {
            let node = state.nodes.get_mut(&id).ok_or(GraphError::UnknownCell(id))?;
            let before = node.transform_listeners.len();
            node.transform_listeners
                .retain(|e| !std::ptr::addr_eq(Arc::as_ptr(&e.listener), Arc::as_ptr(listener)));
            Ok(node.transform_listeners.len() != before)
        })
    }

    fn with_read<R>(
        &self,
        id: CellId,
        f: impl FnOnce(&TreeView<'_>, CellId) -> R,
    ) -> Result<R, GraphError> {
        loop {
            let tree = self.tree(id)?;
            let view = tree.read();
            if view.contains(id) {
                return Ok(f(&view, id));
            }
            // The cell changed graphs between lookup and lock.
        }
    }

    fn with_write<R>(
        &self,
        id: CellId,
        f: impl FnOnce(&Arc<CellTree>, &mut TreeState) -> Result<R, GraphError>,
    ) -> Result<R, GraphError> {
        loop {
            let tree = self.tree(id)?;
            let mut state = tree.state.write();
            if state.nodes.contains_key(&id) {
                return f(&tree, &mut *state);
            }
        }
    }

    fn update_local(&self, id: CellId, apply: impl FnOnce(&mut CellNode)) -> Result<(), GraphError> {
        self.with_write(id, |tree, state| {
            let node = state.nodes.get_mut(&id).ok_or(GraphError::UnknownCell(id))?;
            apply(node);
            if state.live {
                self.recompute(tree, state, id, false);
            }
            Ok(())
        })
    }

    /// Recompute world state below `id` and the bounds of its ancestors,
    /// re-place the root if its bounds changed, and notify about moved cells.
    fn recompute(&self, tree: &Arc<CellTree>, state: &mut TreeState, id: CellId, force_place: bool) {
        let before = state.world_bounds(tree.root());
        let mut moved = Vec::new();
        state.update_world(id, &mut moved);
        let parent = state.nodes.get(&id).and_then(|n| n.parent);
        state.refresh_ancestors(parent);
        self.replace_root(tree, state, before, force_place);
        self.notify_moved(tree, state, &moved);
    }

    fn replace_root(&self, tree: &Arc<CellTree>, state: &TreeState, before: Option<Bounds>, force: bool) {
        let Some(after) = state.world_bounds(tree.root()) else {
            return;
        };
        if force || before != Some(after) {
            self.placement.place_root(tree, &after);
        }
    }

    fn notify_moved(&self, tree: &CellTree, state: &TreeState, moved: &[CellId]) {
        for &id in moved {
            let Some(node) = state.nodes.get(&id) else {
                continue;
            };
            let world = node.world_transform;
            if let Some(view) = &node.view_observer {
                view.view_moved(id, &world);
            }
            for entry in &node.transform_listeners {
                let listener = Arc::clone(&entry.listener);
                let local = node.local_transform;
                self.scheduler.schedule_transaction(
                    Box::new(move || listener.transform_changed(id, &local, &world)),
                    &entry.identity,
                );
            }
            tree.for_each_observer(|o| o.cell_moved(id, &world));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{CellObserver, NoPlacement};
    use glam::Vec3;
    use parking_lot::Mutex;
    use worldspace_common::{InlineScheduler, TaskError};

    #[derive(Default)]
    struct RecordingPlacement {
        placed: Mutex<Vec<(CellId, Bounds)>>,
        removed: Mutex<Vec<CellId>>,
    }

    impl RootPlacement for RecordingPlacement {
        fn place_root(&self, tree: &Arc<CellTree>, world_bounds: &Bounds) {
            self.placed.lock().push((tree.root(), *world_bounds));
        }

        fn remove_root(&self, tree: &Arc<CellTree>) {
            self.removed.lock().push(tree.root());
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        id: Option<ObserverId>,
        moved: Mutex<Vec<CellId>>,
        attached: Mutex<Vec<Vec<CellId>>>,
        detached: Mutex<Vec<Vec<CellId>>>,
    }

    impl CellObserver for RecordingObserver {
        fn observer_id(&self) -> ObserverId {
            self.id.unwrap_or(ObserverId(0))
        }
        fn cell_moved(&self, cell: CellId, _world: &Transform) {
            self.moved.lock().push(cell);
        }
        fn child_attached(&self, _root: CellId, _parent: CellId, cells: &[CellId]) {
            self.attached.lock().push(cells.to_vec());
        }
        fn child_detached(&self, _root: CellId, _parent: CellId, cells: &[CellId]) {
            self.detached.lock().push(cells.to_vec());
        }
    }

    fn graph() -> Arc<SpatialGraph> {
        SpatialGraph::new(Arc::new(NoPlacement), Arc::new(InlineScheduler))
    }

    fn recorded() -> (Arc<SpatialGraph>, Arc<RecordingPlacement>) {
        let placement = Arc::new(RecordingPlacement::default());
        let graph = SpatialGraph::new(placement.clone(), Arc::new(InlineScheduler));
        (graph, placement)
    }

    fn at(x: f32, y: f32, z: f32) -> Transform {
        Transform::from_position(Vec3::new(x, y, z))
    }

    #[test]
    fn world_transform_composes_through_parents() {
        let g = graph();
        let a = g.create_cell(CellId::new()).unwrap();
        let b = g.create_cell(CellId::new()).unwrap();
        a.set_local_transform(at(10.0, 0.0, 0.0)).unwrap();
        b.set_local_transform(at(0.0, 5.0, 0.0)).unwrap();
        a.add_child(&b).unwrap();
        a.set_root().unwrap();

        let world = b.world_transform().unwrap();
        assert_eq!(world.position, Vec3::new(10.0, 5.0, 0.0));

        a.set_local_transform(at(-3.0, 0.0, 0.0)).unwrap();
        assert_eq!(b.world_transform().unwrap().position, Vec3::new(-3.0, 5.0, 0.0));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let g = graph();
        let id = CellId::new();
        g.create_cell(id).unwrap();
        assert_eq!(g.create_cell(id).unwrap_err(), GraphError::DuplicateCell(id));
    }

    #[test]
    fn structural_errors() {
        let g = graph();
        let a = g.create_cell(CellId::new()).unwrap();
        let b = g.create_cell(CellId::new()).unwrap();
        let c = g.create_cell(CellId::new()).unwrap();
        a.add_child(&b).unwrap();

        assert_eq!(
            c.add_child(&b).unwrap_err(),
            GraphError::MultipleParents { child: b.id(), parent: a.id() }
        );
        assert_eq!(
            b.add_child(&a).unwrap_err(),
            GraphError::WouldCycle { parent: b.id(), child: a.id() }
        );
        assert_eq!(
            a.add_child(&a).unwrap_err(),
            GraphError::WouldCycle { parent: a.id(), child: a.id() }
        );
        assert_eq!(
            c.remove_child(&b).unwrap_err(),
            GraphError::NotAChild { parent: c.id(), child: b.id() }
        );
        assert_eq!(b.set_root().unwrap_err(), GraphError::NotRoot(b.id()));
        assert!(matches!(
            g.set_local_transform(CellId::new(), Transform::default()),
            Err(GraphError::UnknownCell(_))
        ));
    }

    #[test]
    fn root_bounds_merge_descendants() {
        let g = graph();
        let a = g.create_cell(CellId::new()).unwrap();
        let b = g.create_cell(CellId::new()).unwrap();
        a.set_local_bounds(Bounds::sphere(Vec3::ZERO, 1.0)).unwrap();
        b.set_local_bounds(Bounds::sphere(Vec3::ZERO, 1.0)).unwrap();
        b.set_local_transform(at(20.0, 0.0, 0.0)).unwrap();
        a.add_child(&b).unwrap();
        a.set_root().unwrap();

        let bounds = a.world_bounds().unwrap();
        assert!(bounds.contains_point(Vec3::new(-0.5, 0.0, 0.0)));
        assert!(bounds.contains_point(Vec3::new(20.5, 0.0, 0.0)));

        a.remove_child(&b).unwrap();
        let bounds = a.world_bounds().unwrap();
        assert!(!bounds.contains_point(Vec3::new(20.5, 0.0, 0.0)));
    }

    #[test]
    fn placement_follows_root_lifecycle() {
        let (g, placement) = recorded();
        let a = g.create_cell(CellId::new()).unwrap();
        a.set_local_bounds(Bounds::sphere(Vec3::ZERO, 2.0)).unwrap();
        // Not live yet: nothing is indexed.
        a.set_local_transform(at(1.0, 0.0, 0.0)).unwrap();
        assert!(placement.placed.lock().is_empty());

        a.set_root().unwrap();
        a.set_root().unwrap();
        assert_eq!(placement.placed.lock().len(), 1);

        a.set_local_transform(at(4.0, 0.0, 0.0)).unwrap();
        {
            let placed = placement.placed.lock();
            assert_eq!(placed.len(), 2);
            assert_eq!(placed[1].1.center(), Vec3::new(4.0, 0.0, 0.0));
        }

        a.clear_root().unwrap();
        a.clear_root().unwrap();
        assert_eq!(*placement.removed.lock(), vec![a.id()]);
    }

    #[test]
    fn attaching_live_root_withdraws_it() {
        let (g, placement) = recorded();
        let a = g.create_cell(CellId::new()).unwrap();
        let b = g.create_cell(CellId::new()).unwrap();
        a.set_root().unwrap();
        b.set_root().unwrap();
        a.add_child(&b).unwrap();
        assert_eq!(*placement.removed.lock(), vec![b.id()]);
        assert_eq!(b.root().unwrap(), a.id());
        assert!(b.is_live().unwrap());
    }

    #[test]
    fn observers_see_moves_and_structure_changes() {
        let g = graph();
        let a = g.create_cell(CellId::new()).unwrap();
        let b = g.create_cell(CellId::new()).unwrap();
        let c = g.create_cell(CellId::new()).unwrap();
        b.add_child(&c).unwrap();
        a.set_root().unwrap();

        let observer = Arc::new(RecordingObserver {
            id: Some(ObserverId::next()),
            ..Default::default()
        });
        g.tree(a.id()).unwrap().add_observer(observer.clone());

        a.add_child(&b).unwrap();
        assert_eq!(*observer.attached.lock(), vec![vec![b.id(), c.id()]]);

        b.set_local_transform(at(1.0, 1.0, 1.0)).unwrap();
        assert_eq!(*observer.moved.lock(), vec![b.id(), c.id()]);

        a.remove_child(&b).unwrap();
        assert_eq!(*observer.detached.lock(), vec![vec![b.id(), c.id()]]);
        assert_eq!(b.root().unwrap(), b.id());
        assert_eq!(c.root().unwrap(), b.id());
        assert!(!b.is_live().unwrap());
    }

    #[test]
    fn destroy_forgets_subtree() {
        let (g, placement) = recorded();
        let a = g.create_cell(CellId::new()).unwrap();
        let b = g.create_cell(CellId::new()).unwrap();
        let c = g.create_cell(CellId::new()).unwrap();
        b.add_child(&c).unwrap();
        a.add_child(&b).unwrap();
        a.set_root().unwrap();

        b.destroy().unwrap();
        assert!(!g.contains(b.id()));
        assert!(!g.contains(c.id()));
        assert!(a.children().unwrap().is_empty());
        assert!(placement.removed.lock().is_empty());

        a.destroy().unwrap();
        assert!(g.is_empty());
        assert_eq!(*placement.removed.lock(), vec![a.id()]);
    }

    #[test]
    fn transform_listeners_run_through_scheduler() {
        struct Count(Mutex<Vec<Vec3>>);
        impl TransformListener for Count {
            fn transform_changed(
                &self,
                _cell: CellId,
                _local: &Transform,
                world: &Transform,
            ) -> Result<(), TaskError> {
                self.0.lock().push(world.position);
                Ok(())
            }
        }

        let g = graph();
        let a = g.create_cell(CellId::new()).unwrap();
        a.set_root().unwrap();
        let listener = Arc::new(Count(Mutex::new(Vec::new())));
        let dyn_listener: Arc<dyn TransformListener> = listener.clone();
        a.add_transform_listener(dyn_listener.clone(), Identity::new("tester"))
            .unwrap();

        a.set_local_transform(at(2.0, 0.0, 0.0)).unwrap();
        // Same transform again: no change, no notification.
        a.set_local_transform(at(2.0, 0.0, 0.0)).unwrap();
        assert_eq!(*listener.0.lock(), vec![Vec3::new(2.0, 0.0, 0.0)]);

        assert!(a.remove_transform_listener(&dyn_listener).unwrap());
        assert!(!a.remove_transform_listener(&dyn_listener).unwrap());
        a.set_local_transform(at(3.0, 0.0, 0.0)).unwrap();
        assert_eq!(listener.0.lock().len(), 1);
    }
}
