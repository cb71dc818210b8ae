use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use worldspace_common::{Bounds, CellId};
use worldspace_kernel::{CellObserver, CellTree, ObserverId};

use crate::grid::SpaceCoord;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpaceError {
    #[error("root {root} is not in space {space}")]
    RootNotPresent { space: SpaceCoord, root: CellId },
}

/// Something that watches spaces: it is told about every root entering or
/// leaving a watched space, and is registered as an observer on each root
/// graph it can see.
///
/// Callbacks run under the space's lock and must only enqueue work.
pub trait SpaceWatcher: Send + Sync {
    fn watcher_id(&self) -> ObserverId;

    /// The observer registered on root graphs of watched spaces.
    fn as_observer(self: Arc<Self>) -> Arc<dyn CellObserver>;

    fn root_cell_added(&self, space: SpaceCoord, tree: &Arc<CellTree>);

    fn root_cell_removed(&self, space: SpaceCoord, tree: &Arc<CellTree>);

    /// Watching started; `roots` are the space's roots at that moment.
    fn space_entered(&self, space: SpaceCoord, roots: Vec<Arc<CellTree>>);

    /// Watching stopped; `roots` are the roots the watcher could see. The
    /// watcher stays registered on them until `roots` is dropped.
    fn space_exited(&self, space: SpaceCoord, roots: ExitedRoots);
}

/// Roots of a space a watcher just stopped watching, together with the
/// observer registration the watcher held on each through that space.
///
/// The registrations are released when this value is dropped, so a watcher
/// can keep following the roots (for example while an exit is deferred) for
/// exactly as long as it holds on to them.
pub struct ExitedRoots {
    observer: ObserverId,
    roots: Vec<Arc<CellTree>>,
}

impl ExitedRoots {
    pub fn roots(&self) -> &[Arc<CellTree>] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

impl Drop for ExitedRoots {
    fn drop(&mut self) {
        for tree in &self.roots {
            if std::thread::panicking() {
                let _ = tree.remove_observer(self.observer);
            } else {
                release_observer(tree, self.observer);
            }
        }
    }
}

impl std::fmt::Debug for ExitedRoots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitedRoots")
            .field("observer", &self.observer)
            .field("roots", &self.roots.len())
            .finish()
    }
}

/// One cube of the world grid.
///
/// Holds the roots whose world bounds intersect it (reference counted, so a
/// root placed twice must be removed twice) and the view caches watching it.
pub struct Space {
    coord: SpaceCoord,
    name: String,
    bounds: Bounds,
    inner: Mutex<SpaceState>,
}

#[derive(Default)]
struct SpaceState {
    roots: BTreeMap<CellId, RootEntry>,
    watchers: BTreeMap<ObserverId, Arc<dyn SpaceWatcher>>,
}

struct RootEntry {
    tree: Arc<CellTree>,
    refs: usize,
}

impl Space {
    pub fn new(coord: SpaceCoord, bounds: Bounds) -> Self {
        Self {
            coord,
            name: coord.to_string(),
            bounds,
            inner: Mutex::new(SpaceState::default()),
        }
    }

    pub fn coord(&self) -> SpaceCoord {
        self.coord
    }

    /// The space key, `x_y_z`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Add a reference to `tree`'s root. Returns the root's count after the
    /// add; watchers hear about the root only when it goes from 0 to 1.
    pub fn add_root_cell(&self, tree: &Arc<CellTree>) -> usize {
        let root = tree.root();
        let mut inner = self.inner.lock();
        let entry = inner.roots.entry(root).or_insert_with(|| RootEntry {
            tree: Arc::clone(tree),
            refs: 0,
        });
        entry.refs += 1;
        let refs = entry.refs;
        if refs == 1 {
            tracing::debug!(space = %self.name, %root, watchers = inner.watchers.len(), "root entered space");
            for watcher in inner.watchers.values() {
                tree.add_observer(Arc::clone(watcher).as_observer());
                watcher.root_cell_added(self.coord, tree);
            }
        }
        refs
    }

    /// Drop a reference to `tree`'s root. Returns the remaining count;
    /// watchers hear about the root leaving when it reaches 0.
    pub fn remove_root_cell(&self, tree: &Arc<CellTree>) -> Result<usize, SpaceError> {
        let root = tree.root();
        let mut inner = self.inner.lock();
        let Some(entry) = inner.roots.get_mut(&root) else {
            return Err(SpaceError::RootNotPresent {
                space: self.coord,
                root,
            });
        };
        entry.refs -= 1;
        let refs = entry.refs;
        if refs == 0 {
            inner.roots.remove(&root);
            tracing::debug!(space = %self.name, %root, "root left space");
            for (id, watcher) in &inner.watchers {
                release_observer(tree, *id);
                watcher.root_cell_removed(self.coord, tree);
            }
        }
        Ok(refs)
    }

    /// Start watching. The watcher receives the current roots through
    /// [`SpaceWatcher::space_entered`]. Returns false if it already watches.
    pub fn add_view_cache(&self, watcher: Arc<dyn SpaceWatcher>) -> bool {
        let id = watcher.watcher_id();
        let mut inner = self.inner.lock();
        if inner.watchers.contains_key(&id) {
            return false;
        }
        let roots: Vec<Arc<CellTree>> = inner.roots.values().map(|e| Arc::clone(&e.tree)).collect();
        for tree in &roots {
            tree.add_observer(Arc::clone(&watcher).as_observer());
        }
        tracing::debug!(space = %self.name, watcher = %id, roots = roots.len(), "watcher entered space");
        watcher.space_entered(self.coord, roots);
        inner.watchers.insert(id, watcher);
        true
    }

    /// Stop watching. The watcher receives the roots it has to let go of
    /// through [`SpaceWatcher::space_exited`], still observed until it drops
    /// them. Returns false if it was not watching.
    pub fn remove_view_cache(&self, id: ObserverId) -> bool {
        let mut inner = self.inner.lock();
        let Some(watcher) = inner.watchers.remove(&id) else {
            return false;
        };
        let roots: Vec<Arc<CellTree>> = inner.roots.values().map(|e| Arc::clone(&e.tree)).collect();
        tracing::debug!(space = %self.name, watcher = %id, roots = roots.len(), "watcher left space");
        watcher.space_exited(self.coord, ExitedRoots { observer: id, roots });
        true
    }

    pub fn root_cells(&self) -> Vec<CellId> {
        self.inner.lock().roots.keys().copied().collect()
    }

    /// References held on `root` (0 when absent).
    pub fn root_refs(&self, root: CellId) -> usize {
        self.inner.lock().roots.get(&root).map_or(0, |e| e.refs)
    }

    pub fn root_count(&self) -> usize {
        self.inner.lock().roots.len()
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space").field("name", &self.name).finish()
    }
}

// Every watcher of a space is an observer of each of its roots, so a
// missing registration means the two indexes disagree.
fn release_observer(tree: &CellTree, id: ObserverId) {
    if let Err(err) = tree.remove_observer(id) {
        tracing::error!(error = %err, "space watcher missing from root graph");
        panic!("observer membership out of sync: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use worldspace_common::{InlineScheduler, Transform};
    use worldspace_kernel::{NoPlacement, SpatialGraph};

    #[derive(Debug, PartialEq)]
    enum Seen {
        Added(CellId),
        Removed(CellId),
        Entered(Vec<CellId>),
        Exited(Vec<CellId>),
    }

    struct Recorder {
        id: ObserverId,
        seen: Mutex<Vec<Seen>>,
        // Exits held on to instead of dropped, when set.
        kept: Mutex<Option<Vec<ExitedRoots>>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ObserverId::next(),
                seen: Mutex::new(Vec::new()),
                kept: Mutex::new(None),
            })
        }

        fn keeping_exits() -> Arc<Self> {
            let recorder = Self::new();
            *recorder.kept.lock() = Some(Vec::new());
            recorder
        }

        fn take(&self) -> Vec<Seen> {
            std::mem::take(&mut *self.seen.lock())
        }
    }

    impl CellObserver for Recorder {
        fn observer_id(&self) -> ObserverId {
            self.id
        }
        fn cell_moved(&self, _: CellId, _: &Transform) {}
        fn child_attached(&self, _: CellId, _: CellId, _: &[CellId]) {}
        fn child_detached(&self, _: CellId, _: CellId, _: &[CellId]) {}
    }

    impl SpaceWatcher for Recorder {
        fn watcher_id(&self) -> ObserverId {
            self.id
        }
        fn as_observer(self: Arc<Self>) -> Arc<dyn CellObserver> {
            self
        }
        fn root_cell_added(&self, _: SpaceCoord, tree: &Arc<CellTree>) {
            self.seen.lock().push(Seen::Added(tree.root()));
        }
        fn root_cell_removed(&self, _: SpaceCoord, tree: &Arc<CellTree>) {
            self.seen.lock().push(Seen::Removed(tree.root()));
        }
        fn space_entered(&self, _: SpaceCoord, roots: Vec<Arc<CellTree>>) {
            self.seen
                .lock()
                .push(Seen::Entered(roots.iter().map(|t| t.root()).collect()));
        }
        fn space_exited(&self, _: SpaceCoord, roots: ExitedRoots) {
            let ids = roots.roots().iter().map(|t| t.root()).collect();
            self.seen.lock().push(Seen::Exited(ids));
            if let Some(kept) = self.kept.lock().as_mut() {
                kept.push(roots);
            }
        }
    }

    fn space() -> Space {
        Space::new(SpaceCoord::new(0, 0, 0), Bounds::cube(Vec3::ZERO, 25.0))
    }

    fn tree() -> Arc<CellTree> {
        let graph = SpatialGraph::new(Arc::new(NoPlacement), Arc::new(InlineScheduler));
        let cell = graph.create_cell(CellId::new()).unwrap();
        graph.tree(cell.id()).unwrap()
    }

    #[test]
    fn root_membership_is_reference_counted() {
        let space = space();
        let watcher = Recorder::new();
        space.add_view_cache(watcher.clone());
        watcher.take();

        let t = tree();
        assert_eq!(space.add_root_cell(&t), 1);
        assert_eq!(space.add_root_cell(&t), 2);
        assert_eq!(space.root_refs(t.root()), 2);
        assert_eq!(space.remove_root_cell(&t).unwrap(), 1);
        assert_eq!(space.root_refs(t.root()), 1);
        assert_eq!(space.root_cells(), vec![t.root()]);
        assert_eq!(watcher.take(), vec![Seen::Added(t.root())]);
        assert_eq!(t.observer_refs(watcher.id), 1);

        assert_eq!(space.remove_root_cell(&t).unwrap(), 0);
        assert_eq!(space.root_refs(t.root()), 0);
        assert_eq!(watcher.take(), vec![Seen::Removed(t.root())]);
        assert_eq!(t.observer_refs(watcher.id), 0);
        assert_eq!(
            space.remove_root_cell(&t).unwrap_err(),
            SpaceError::RootNotPresent {
                space: space.coord(),
                root: t.root()
            }
        );
    }

    #[test]
    fn watchers_get_snapshots_on_enter_and_exit() {
        let space = space();
        let (a, b) = (tree(), tree());
        space.add_root_cell(&a);
        space.add_root_cell(&b);

        let watcher = Recorder::new();
        assert!(space.add_view_cache(watcher.clone()));
        assert!(!space.add_view_cache(watcher.clone()));
        assert_eq!(space.watcher_count(), 1);
        assert_eq!(a.observer_refs(watcher.id), 1);
        assert_eq!(b.observer_refs(watcher.id), 1);

        space.remove_root_cell(&a).unwrap();
        assert!(space.remove_view_cache(watcher.id));
        assert!(!space.remove_view_cache(watcher.id));
        assert_eq!(b.observer_refs(watcher.id), 0);

        let mut entered = vec![a.root(), b.root()];
        entered.sort();
        assert_eq!(
            watcher.take(),
            vec![
                Seen::Entered(entered),
                Seen::Removed(a.root()),
                Seen::Exited(vec![b.root()]),
            ]
        );
    }

    #[test]
    fn observer_refs_accumulate_across_spaces() {
        let first = space();
        let second = Space::new(SpaceCoord::new(1, 0, 0), Bounds::cube(Vec3::X * 50.0, 25.0));
        let t = tree();
        first.add_root_cell(&t);
        second.add_root_cell(&t);

        let watcher = Recorder::new();
        first.add_view_cache(watcher.clone());
        second.add_view_cache(watcher.clone());
        assert_eq!(t.observer_refs(watcher.id), 2);
        first.remove_view_cache(watcher.id);
        assert_eq!(t.observer_refs(watcher.id), 1);
        second.remove_root_cell(&t).unwrap();
        assert_eq!(t.observer_refs(watcher.id), 0);
    }

    #[test]
    fn exited_roots_stay_observed_until_dropped() {
        let space = space();
        let t = tree();
        space.add_root_cell(&t);

        let watcher = Recorder::keeping_exits();
        space.add_view_cache(watcher.clone());
        assert!(space.remove_view_cache(watcher.id));
        assert_eq!(space.watcher_count(), 0);
        assert_eq!(t.observer_refs(watcher.id), 1);

        let kept = watcher.kept.lock().take().unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].len(), 1);
        drop(kept);
        assert_eq!(t.observer_refs(watcher.id), 0);
    }
}
