use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use worldspace_common::{Bounds, CellId, Identity, Transform};

use crate::graph::GraphError;
use crate::observer::{CellObserver, ObserverId, TransformListener, ViewObserver};

/// One connected graph of cells, owned by its root.
///
/// All nodes of the graph live in a single arena guarded by one read/write
/// lock. Readers share the lock (and may take it recursively), writers are
/// exclusive, so a bounds merge up the ancestor chain is atomic with respect
/// to readers.
pub struct CellTree {
    root: CellId,
    pub(crate) state: RwLock<TreeState>,
    observers: Mutex<BTreeMap<ObserverId, ObserverEntry>>,
}

struct ObserverEntry {
    observer: Arc<dyn CellObserver>,
    refs: usize,
}

/// The arena behind a [`CellTree`]'s lock.
#[derive(Default)]
pub(crate) struct TreeState {
    /// Whether the graph is attached to the world (world state is maintained
    /// and the root is placed in the spatial index).
    pub(crate) live: bool,
    pub(crate) nodes: HashMap<CellId, CellNode>,
}

pub(crate) struct CellNode {
    pub(crate) parent: Option<CellId>,
    pub(crate) children: Vec<CellId>,
    pub(crate) local_transform: Transform,
    pub(crate) local_bounds: Bounds,
    pub(crate) world_transform: Transform,
    pub(crate) world_bounds: Bounds,
    pub(crate) view_observer: Option<Arc<dyn ViewObserver>>,
    pub(crate) transform_listeners: Vec<ListenerEntry>,
}

pub(crate) struct ListenerEntry {
    pub(crate) listener: Arc<dyn TransformListener>,
    pub(crate) identity: Identity,
}

impl CellNode {
    pub(crate) fn new() -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            local_transform: Transform::default(),
            local_bounds: Bounds::default(),
            world_transform: Transform::default(),
            world_bounds: Bounds::default(),
            view_observer: None,
            transform_listeners: Vec::new(),
        }
    }
}

impl CellTree {
    pub(crate) fn new(root: CellId, nodes: HashMap<CellId, CellNode>) -> Arc<Self> {
        Arc::new(Self {
            root,
            state: RwLock::new(TreeState { live: false, nodes }),
            observers: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn root(&self) -> CellId {
        self.root
    }

    /// Take the graph's read lock. Everything read through the returned view
    /// is a consistent snapshot until the view is dropped.
    pub fn read(&self) -> TreeView<'_> {
        TreeView {
            state: self.state.read_recursive(),
        }
    }

    /// Register interest in this graph. Membership is reference counted;
    /// returns the observer's count after the add.
    pub fn add_observer(&self, observer: Arc<dyn CellObserver>) -> usize {
        let mut observers = self.observers.lock();
        let entry = observers
            .entry(observer.observer_id())
            .or_insert(ObserverEntry { observer, refs: 0 });
        entry.refs += 1;
        entry.refs
    }

    /// Drop one reference of an observer; returns the remaining count.
    pub fn remove_observer(&self, id: ObserverId) -> Result<usize, GraphError> {
        let mut observers = self.observers.lock();
        let Some(entry) = observers.get_mut(&id) else {
            return Err(GraphError::UnknownObserver {
                root: self.root,
                observer: id,
            });
        };
        entry.refs -= 1;
        let remaining = entry.refs;
        if remaining == 0 {
            observers.remove(&id);
        }
        Ok(remaining)
    }

    /// Number of references `id` holds on this graph (0 if unregistered).
    pub fn observer_refs(&self, id: ObserverId) -> usize {
        self.observers.lock().get(&id).map_or(0, |e| e.refs)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    pub(crate) fn for_each_observer(&self, mut f: impl FnMut(&dyn CellObserver)) {
        for entry in self.observers.lock().values() {
            f(entry.observer.as_ref());
        }
    }
}

impl std::fmt::Debug for CellTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellTree").field("root", &self.root).finish()
    }
}

impl TreeState {
    /// Recompute world transform and bounds of `id` and everything below it.
    ///
    /// A node's world bounds are its local bounds in world space merged with
    /// the world bounds of its children. Cells whose world transform changed
    /// are appended to `moved`.
    pub(crate) fn update_world(&mut self, id: CellId, moved: &mut Vec<CellId>) -> Option<Bounds> {
        let parent_world = self
            .nodes
            .get(&id)?
            .parent
            .and_then(|p| self.nodes.get(&p))
            .map(|p| p.world_transform);

        let node = self.nodes.get_mut(&id)?;
        let world = match parent_world {
            Some(parent) => parent.mul(&node.local_transform),
            None => node.local_transform,
        };
        if node.world_transform != world {
            moved.push(id);
        }
        node.world_transform = world;
        let mut bounds = node.local_bounds.transformed(&world);
        let children = node.children.clone();

        for child in children {
            if let Some(child_bounds) = self.update_world(child, moved) {
                bounds = bounds.merged(&child_bounds);
            }
        }

        if let Some(node) = self.nodes.get_mut(&id) {
            node.world_bounds = bounds;
        }
        Some(bounds)
    }

    /// Re-merge world bounds from `from` up to the root.
    pub(crate) fn refresh_ancestors(&mut self, from: Option<CellId>) {
        let mut current = from;
        while let Some(id) = current {
            let Some(node) = self.nodes.get(&id) else {
                break;
            };
            let mut bounds = node.local_bounds.transformed(&node.world_transform);
            for child in &node.children {
                if let Some(child) = self.nodes.get(child) {
                    bounds = bounds.merged(&child.world_bounds);
                }
            }
            let parent = node.parent;
            if let Some(node) = self.nodes.get_mut(&id) {
                node.world_bounds = bounds;
            }
            current = parent;
        }
    }

    /// `id` followed by all of its descendants, depth first.
    pub(crate) fn descendants(&self, id: CellId) -> Vec<CellId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(node) = self.nodes.get(&next) else {
                continue;
            };
            out.push(next);
            stack.extend(node.children.iter().rev());
        }
        out
    }

    pub(crate) fn world_bounds(&self, id: CellId) -> Option<Bounds> {
        self.nodes.get(&id).map(|n| n.world_bounds)
    }
}

/// Read access to a graph, holding its read lock.
pub struct TreeView<'a> {
    state: RwLockReadGuard<'a, TreeState>,
}

impl TreeView<'_> {
    pub fn is_live(&self) -> bool {
        self.state.live
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.state.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.state.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.nodes.is_empty()
    }

    pub fn local_transform(&self, id: CellId) -> Option<Transform> {
        self.state.nodes.get(&id).map(|n| n.local_transform)
    }

    pub fn local_bounds(&self, id: CellId) -> Option<Bounds> {
        self.state.nodes.get(&id).map(|n| n.local_bounds)
    }

    /// World transform; only maintained while the graph is live.
    pub fn world_transform(&self, id: CellId) -> Option<Transform> {
        self.state.nodes.get(&id).map(|n| n.world_transform)
    }

    /// World bounds; only maintained while the graph is live.
    pub fn world_bounds(&self, id: CellId) -> Option<Bounds> {
        self.state.world_bounds(id)
    }

    pub fn parent(&self, id: CellId) -> Option<CellId> {
        self.state.nodes.get(&id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: CellId) -> &[CellId] {
        self.state
            .nodes
            .get(&id)
            .map_or(&[][..], |n| n.children.as_slice())
    }

    /// `id` and all cells below it, depth first, parents before children.
    pub fn descendants(&self, id: CellId) -> Vec<CellId> {
        self.state.descendants(id)
    }
}
