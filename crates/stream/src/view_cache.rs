//! Per-viewer incremental visibility index.
//!
//! A [`ViewCache`] watches the spaces around its view cell and keeps the
//! viewer's client loaded with every cell of every root in those spaces.
//! Notifications from the graph and from spaces only enqueue an update; one
//! worker thread per logged-in cache applies them in order, so watched spaces
//! and root counts are never touched concurrently.
//!
//! # Invariants
//! - A root is loaded on its first reference and unloaded exactly once, when
//!   its last reference goes away. A cell reachable through several loaded
//!   roots is loaded once.
//! - Roots of a space the viewer left stay observed until their exit is
//!   applied, so their cell lists never go stale.
//! - Once the queue is drained, the loaded roots are exactly the roots of the
//!   watched spaces plus those held by exits still within their grace window.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use glam::Vec3;
use parking_lot::Mutex;
use worldspace_common::{Bounds, CellDescription, CellId, TaskScheduler, Transform};
use worldspace_kernel::{
    CellObserver, CellTree, GraphError, ObserverId, SpatialGraph, ViewObserver,
};

use crate::config::StreamConfig;
use crate::delivery::ViewSession;
use crate::grid::{SpaceCoord, SpaceManager};
use crate::space::{ExitedRoots, Space, SpaceWatcher};

const FLUSH_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("root {0} released more often than it was acquired")]
    RefCountUnderflow(CellId),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("failed to start cache worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("cache worker for view {0} stopped")]
    WorkerStopped(CellId),
}

/// What a cache's worker is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewCachePhase {
    /// Waiting for or applying ordinary updates.
    Idle,
    /// Recomputing the watched spaces.
    Revalidating,
    /// Logged out (or logging out); queued work is being discarded.
    Draining,
}

impl ViewCachePhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Revalidating,
            2 => Self::Draining,
            _ => Self::Idle,
        }
    }
}

/// Counters for one cache, kept across logins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewCacheStats {
    pub revalidations: u64,
    pub spaces_entered: u64,
    pub spaces_exited: u64,
    pub cells_loaded: u64,
    pub cells_unloaded: u64,
}

/// A unit of work for a cache's worker.
enum CacheUpdate {
    ViewMoved(Vec3),
    Revalidate,
    EnterSpace {
        space: SpaceCoord,
        roots: Vec<Arc<CellTree>>,
    },
    ExitSpace {
        space: SpaceCoord,
        roots: ExitedRoots,
    },
    RootAdded {
        space: SpaceCoord,
        tree: Arc<CellTree>,
    },
    RootRemoved {
        space: SpaceCoord,
        tree: Arc<CellTree>,
    },
    ChildAttached {
        root: CellId,
        cells: Vec<CellId>,
    },
    ChildDetached {
        root: CellId,
        cells: Vec<CellId>,
    },
    /// `requeued` marks the marker's second pass through the queue, behind
    /// the space changes earlier updates queued.
    Flush { ack: Sender<()>, requeued: bool },
    Shutdown,
}

/// The face a cache shows to the graph and to spaces. It holds nothing but
/// the sending half of the queue, so registrations never keep the cache
/// itself alive.
struct Inbox {
    id: ObserverId,
    view_cell: CellId,
    tx: Sender<CacheUpdate>,
    active: AtomicBool,
}

impl Inbox {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn push(&self, update: CacheUpdate) {
        if self.tx.send(update).is_err() {
            tracing::trace!(view = %self.view_cell, "cache queue closed");
        }
    }
}

impl CellObserver for Inbox {
    fn observer_id(&self) -> ObserverId {
        self.id
    }

    fn cell_moved(&self, cell: CellId, _world: &Transform) {
        // Membership follows root placement, not individual cell moves.
        tracing::trace!(view = %self.view_cell, %cell, "visible cell moved");
    }

    fn child_attached(&self, root: CellId, _parent: CellId, cells: &[CellId]) {
        self.push(CacheUpdate::ChildAttached {
            root,
            cells: cells.to_vec(),
        });
    }

    fn child_detached(&self, root: CellId, _parent: CellId, cells: &[CellId]) {
        self.push(CacheUpdate::ChildDetached {
            root,
            cells: cells.to_vec(),
        });
    }
}

impl ViewObserver for Inbox {
    fn view_moved(&self, _cell: CellId, world: &Transform) {
        if self.is_active() {
            self.push(CacheUpdate::ViewMoved(world.position));
        }
    }
}

impl SpaceWatcher for Inbox {
    fn watcher_id(&self) -> ObserverId {
        self.id
    }

    fn as_observer(self: Arc<Self>) -> Arc<dyn CellObserver> {
        self
    }

    fn root_cell_added(&self, space: SpaceCoord, tree: &Arc<CellTree>) {
        self.push(CacheUpdate::RootAdded {
            space,
            tree: Arc::clone(tree),
        });
    }

    fn root_cell_removed(&self, space: SpaceCoord, tree: &Arc<CellTree>) {
        self.push(CacheUpdate::RootRemoved {
            space,
            tree: Arc::clone(tree),
        });
    }

    fn space_entered(&self, space: SpaceCoord, roots: Vec<Arc<CellTree>>) {
        self.push(CacheUpdate::EnterSpace { space, roots });
    }

    fn space_exited(&self, space: SpaceCoord, roots: ExitedRoots) {
        self.push(CacheUpdate::ExitSpace { space, roots });
    }
}

/// Load and unload lists produced while applying one update.
#[derive(Default)]
struct Delta {
    load: Vec<CellDescription>,
    unload: Vec<CellDescription>,
}

impl Delta {
    fn load(&mut self, root: CellId, cells: &[CellId]) {
        self.load
            .extend(cells.iter().map(|c| CellDescription::new(*c, root)));
    }

    fn unload(&mut self, root: CellId, cells: &[CellId]) {
        self.unload
            .extend(cells.iter().map(|c| CellDescription::new(*c, root)));
    }
}

struct LoadedRoot {
    refs: usize,
    cells: Vec<CellId>,
}

/// Reference-counted roots, the cells listed under each, and how many loaded
/// roots list each cell. The client sees a cell when its count leaves zero
/// and loses it when the count returns to zero.
#[derive(Default)]
struct RootCells {
    entries: HashMap<CellId, LoadedRoot>,
    cells: HashMap<CellId, usize>,
}

impl RootCells {
    fn acquire(&mut self, tree: &CellTree, delta: &mut Delta) {
        let root = tree.root();
        if let Some(entry) = self.entries.get_mut(&root) {
            entry.refs += 1;
            return;
        }
        let cells = tree.read().descendants(root);
        self.hold(root, &cells, delta);
        self.entries.insert(root, LoadedRoot { refs: 1, cells });
    }

    fn release(&mut self, root: CellId, delta: &mut Delta) -> Result<(), CacheError> {
        let Some(entry) = self.entries.get_mut(&root) else {
            return Err(CacheError::RefCountUnderflow(root));
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = self.entries.remove(&root) {
                self.let_go(root, &entry.cells, delta);
            }
        }
        Ok(())
    }

    fn attach(&mut self, root: CellId, cells: &[CellId], delta: &mut Delta) {
        let Some(entry) = self.entries.get_mut(&root) else {
            return;
        };
        let known: HashSet<CellId> = entry.cells.iter().copied().collect();
        let fresh: Vec<CellId> = cells.iter().filter(|c| !known.contains(*c)).copied().collect();
        entry.cells.extend_from_slice(&fresh);
        self.hold(root, &fresh, delta);
    }

    fn detach(&mut self, root: CellId, cells: &[CellId], delta: &mut Delta) {
        let Some(entry) = self.entries.get_mut(&root) else {
            return;
        };
        let leaving: HashSet<CellId> = cells.iter().copied().collect();
        let (gone, kept): (Vec<CellId>, Vec<CellId>) =
            entry.cells.iter().partition(|c| leaving.contains(*c));
        entry.cells = kept;
        self.let_go(root, &gone, delta);
    }

    fn hold(&mut self, root: CellId, cells: &[CellId], delta: &mut Delta) {
        let mut fresh = Vec::new();
        for cell in cells {
            let count = self.cells.entry(*cell).or_insert(0);
            *count += 1;
            if *count == 1 {
                fresh.push(*cell);
            }
        }
        delta.load(root, &fresh);
    }

    fn let_go(&mut self, root: CellId, cells: &[CellId], delta: &mut Delta) {
        let mut gone = Vec::new();
        for cell in cells {
            let Some(count) = self.cells.get_mut(cell) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                self.cells.remove(cell);
                gone.push(*cell);
            }
        }
        delta.unload(root, &gone);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// An exit whose unload waits for the grace window to pass.
struct PendingExit {
    deadline: Instant,
    roots: ExitedRoots,
}

#[derive(Default)]
struct CacheState {
    spaces: BTreeMap<SpaceCoord, Arc<Space>>,
    roots: RootCells,
    last_validation: Option<Vec3>,
    pending_exits: BTreeMap<SpaceCoord, PendingExit>,
    stats: ViewCacheStats,
}

struct Shared {
    inbox: Arc<Inbox>,
    rx: Receiver<CacheUpdate>,
    session: ViewSession,
    config: StreamConfig,
    spaces: Arc<SpaceManager>,
    graph: Arc<SpatialGraph>,
    scheduler: Arc<dyn TaskScheduler>,
    state: Mutex<CacheState>,
    phase: AtomicU8,
}

impl Shared {
    fn run(self: Arc<Self>) {
        let _span = tracing::info_span!("view_cache", view = %self.inbox.view_cell).entered();
        tracing::debug!("cache worker started");
        loop {
            let deadline = self
                .state
                .lock()
                .pending_exits
                .values()
                .map(|p| p.deadline)
                .min();
            let received = match deadline {
                Some(deadline) => self.rx.recv_deadline(deadline),
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(CacheUpdate::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(CacheUpdate::Flush { ack, requeued }) => {
                    if requeued {
                        self.update_state(|_, _| Ok(()));
                        let _ = ack.send(());
                    } else {
                        // Space changes queued by earlier updates come first.
                        self.inbox.push(CacheUpdate::Flush { ack, requeued: true });
                    }
                }
                Ok(update) => self.update_state(|state, delta| self.apply(state, update, delta)),
                Err(RecvTimeoutError::Timeout) => self.update_state(|_, _| Ok(())),
            }
        }
        tracing::debug!("cache worker stopped");
    }

    /// Run `f` under the state lock and expire due exits, then deliver the
    /// result once the lock is released. A failure means the cache's counts
    /// are corrupt.
    fn update_state(
        &self,
        f: impl FnOnce(&mut CacheState, &mut Delta) -> Result<(), CacheError>,
    ) {
        let delta = {
            let mut state = self.state.lock();
            if !self.inbox.is_active() {
                tracing::trace!("cache inactive, update dropped");
                return;
            }
            let mut delta = Delta::default();
            let result = f(&mut *state, &mut delta)
                .and_then(|()| expire_due(&mut *state, Instant::now(), &mut delta));
            if let Err(err) = result {
                tracing::error!(error = %err, "view cache state corrupted");
                panic!("view cache for {} corrupted: {err}", self.inbox.view_cell);
            }
            state.stats.cells_unloaded += delta.unload.len() as u64;
            state.stats.cells_loaded += delta.load.len() as u64;
            delta
        };
        self.deliver(delta);
    }

    fn apply(
        &self,
        state: &mut CacheState,
        update: CacheUpdate,
        delta: &mut Delta,
    ) -> Result<(), CacheError> {
        match update {
            CacheUpdate::ViewMoved(position) => {
                let threshold = self.config.revalidation_distance_squared();
                match state.last_validation {
                    Some(last) if last.distance_squared(position) <= threshold => {
                        tracing::trace!(?position, "view moved within threshold");
                    }
                    _ => self.revalidate(state, position),
                }
                Ok(())
            }
            CacheUpdate::Revalidate => {
                match self.graph.world_transform(self.inbox.view_cell) {
                    Ok(world) => self.revalidate(state, world.position),
                    Err(err) => tracing::warn!(error = %err, "cannot locate view cell"),
                }
                Ok(())
            }
            CacheUpdate::EnterSpace { space, roots } => {
                state.stats.spaces_entered += 1;
                tracing::debug!(%space, roots = roots.len(), "entered space");
                for tree in &roots {
                    state.roots.acquire(tree, delta);
                }
                if let Some(parked) = state.pending_exits.remove(&space) {
                    tracing::debug!(%space, "re-entered space within exit grace");
                    for tree in parked.roots.roots() {
                        state.roots.release(tree.root(), delta)?;
                    }
                }
                Ok(())
            }
            CacheUpdate::ExitSpace { space, roots } => {
                state.stats.spaces_exited += 1;
                let grace = self.config.exit_grace();
                if grace.is_zero() {
                    tracing::debug!(%space, roots = roots.len(), "left space");
                    for tree in roots.roots() {
                        state.roots.release(tree.root(), delta)?;
                    }
                    return Ok(());
                }
                tracing::debug!(%space, roots = roots.len(), ?grace, "left space, unload deferred");
                let parked = PendingExit {
                    deadline: Instant::now() + grace,
                    roots,
                };
                if let Some(previous) = state.pending_exits.insert(space, parked) {
                    for tree in previous.roots.roots() {
                        state.roots.release(tree.root(), delta)?;
                    }
                }
                Ok(())
            }
            CacheUpdate::RootAdded { space, tree } => {
                tracing::trace!(%space, root = %tree.root(), "root added");
                state.roots.acquire(&tree, delta);
                Ok(())
            }
            CacheUpdate::RootRemoved { space, tree } => {
                tracing::trace!(%space, root = %tree.root(), "root removed");
                state.roots.release(tree.root(), delta)
            }
            CacheUpdate::ChildAttached { root, cells } => {
                state.roots.attach(root, &cells, delta);
                Ok(())
            }
            CacheUpdate::ChildDetached { root, cells } => {
                state.roots.detach(root, &cells, delta);
                Ok(())
            }
            CacheUpdate::Flush { .. } | CacheUpdate::Shutdown => Ok(()),
        }
    }

    /// Watch exactly the spaces touching the viewer's proximity sphere.
    /// Spaces report back through the queue.
    fn revalidate(&self, state: &mut CacheState, position: Vec3) {
        let _span = tracing::debug_span!("revalidate", ?position).entered();
        let _ = self.phase.compare_exchange(
            ViewCachePhase::Idle as u8,
            ViewCachePhase::Revalidating as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        state.last_validation = Some(position);
        state.stats.revalidations += 1;

        let proximity = Bounds::sphere(position, self.config.proximity_radius);
        let wanted: BTreeMap<SpaceCoord, Arc<Space>> = self
            .spaces
            .enclosing_spaces(&proximity)
            .into_iter()
            .map(|s| (s.coord(), s))
            .collect();

        // Enter before leaving, so a root visible from both the old and the
        // new spaces keeps its reference throughout.
        for (coord, space) in &wanted {
            if !state.spaces.contains_key(coord) {
                space.add_view_cache(Arc::clone(&self.inbox) as Arc<dyn SpaceWatcher>);
                state.spaces.insert(*coord, Arc::clone(space));
            }
        }
        let left: Vec<SpaceCoord> = state
            .spaces
            .keys()
            .filter(|c| !wanted.contains_key(c))
            .copied()
            .collect();
        for coord in left {
            if let Some(space) = state.spaces.remove(&coord) {
                space.remove_view_cache(self.inbox.id);
            }
        }
        tracing::debug!(spaces = state.spaces.len(), "revalidated");

        let _ = self.phase.compare_exchange(
            ViewCachePhase::Revalidating as u8,
            ViewCachePhase::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn deliver(&self, delta: Delta) {
        let Delta { load, unload } = delta;
        let identity = &self.session.identity;
        if !unload.is_empty() {
            tracing::trace!(cells = unload.len(), "scheduling unload");
            let cache = Arc::clone(&self.session.cell_cache);
            self.scheduler.schedule_transaction(
                Box::new(move || cache.generate_unload_messages(&unload)),
                identity,
            );
        }
        if !load.is_empty() {
            tracing::trace!(cells = load.len(), "scheduling load");
            let cache = Arc::clone(&self.session.cell_cache);
            self.scheduler.schedule_transaction(
                Box::new(move || cache.generate_load_messages(&load)),
                identity,
            );
        }
    }
}

fn expire_due(state: &mut CacheState, now: Instant, delta: &mut Delta) -> Result<(), CacheError> {
    let due: Vec<SpaceCoord> = state
        .pending_exits
        .iter()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(c, _)| *c)
        .collect();
    for space in due {
        if let Some(parked) = state.pending_exits.remove(&space) {
            tracing::debug!(%space, roots = parked.roots.len(), "exit grace expired");
            for tree in parked.roots.roots() {
                state.roots.release(tree.root(), delta)?;
            }
        }
    }
    Ok(())
}

/// The set of cells one viewer must have loaded, kept current as the viewer
/// and the world move.
pub struct ViewCache {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ViewCache {
    pub fn new(
        view_cell: CellId,
        session: ViewSession,
        config: StreamConfig,
        spaces: Arc<SpaceManager>,
        graph: Arc<SpatialGraph>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        let (tx, rx) = unbounded();
        let inbox = Arc::new(Inbox {
            id: ObserverId::next(),
            view_cell,
            tx,
            active: AtomicBool::new(false),
        });
        Self {
            shared: Arc::new(Shared {
                inbox,
                rx,
                session,
                config,
                spaces,
                graph,
                scheduler,
                state: Mutex::new(CacheState::default()),
                phase: AtomicU8::new(ViewCachePhase::Idle as u8),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ObserverId {
        self.shared.inbox.id
    }

    pub fn view_cell(&self) -> CellId {
        self.shared.inbox.view_cell
    }

    pub fn session(&self) -> &ViewSession {
        &self.shared.session
    }

    pub fn is_active(&self) -> bool {
        self.shared.inbox.is_active()
    }

    pub fn phase(&self) -> ViewCachePhase {
        ViewCachePhase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    /// Start the worker and follow the view cell. The first revalidation is
    /// queued immediately. Logging in twice is a no-op.
    pub fn login(&self) -> Result<(), CacheError> {
        let view_cell = self.view_cell();
        let mut worker = self.worker.lock();
        if self.is_active() {
            return Ok(());
        }
        while self.shared.rx.try_recv().is_ok() {}

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("view-cache-{view_cell}"))
            .spawn(move || shared.run())?;
        *worker = Some(handle);
        self.shared
            .phase
            .store(ViewCachePhase::Idle as u8, Ordering::Release);
        self.shared.inbox.active.store(true, Ordering::Release);
        drop(worker);

        let observer: Arc<dyn ViewObserver> = self.shared.inbox.clone();
        if let Err(err) = self.shared.graph.set_view_observer(view_cell, Some(observer)) {
            self.logout();
            return Err(err.into());
        }
        self.shared.inbox.push(CacheUpdate::Revalidate);
        tracing::info!(view = %view_cell, identity = %self.shared.session.identity, "view logged in");
        Ok(())
    }

    /// Stop following the view cell, leave every watched space and stop the
    /// worker. Queued work is discarded; nothing more is delivered.
    ///
    /// Must not be called from inside a delivery task run by the worker.
    pub fn logout(&self) {
        let view_cell = self.view_cell();
        let mut worker = self.worker.lock();
        if !self.shared.inbox.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared
            .phase
            .store(ViewCachePhase::Draining as u8, Ordering::Release);
        if let Err(err) = self.shared.graph.set_view_observer(view_cell, None) {
            tracing::debug!(view = %view_cell, error = %err, "view cell already gone");
        }
        {
            let mut state = self.shared.state.lock();
            for space in std::mem::take(&mut state.spaces).into_values() {
                space.remove_view_cache(self.id());
            }
            let stats = state.stats;
            *state = CacheState {
                stats,
                ..CacheState::default()
            };
        }
        while self.shared.rx.try_recv().is_ok() {}
        self.shared.inbox.push(CacheUpdate::Shutdown);
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                tracing::error!(view = %view_cell, "view cache worker panicked");
            }
        }
        tracing::info!(view = %view_cell, identity = %self.shared.session.identity, "view logged out");
    }

    /// Recompute the watched spaces now, ignoring the movement threshold.
    pub fn revalidate(&self) {
        if self.is_active() {
            self.shared.inbox.push(CacheUpdate::Revalidate);
        }
    }

    /// Block until every update queued before the call, and the space
    /// changes those updates queued in turn, has been applied and its
    /// delivery scheduled. Updates queued after the call are not waited for
    /// beyond one more pass through the queue.
    pub fn flush(&self) -> Result<(), CacheError> {
        if !self.is_active() {
            return Ok(());
        }
        let (tx, rx) = bounded(1);
        self.shared.inbox.push(CacheUpdate::Flush {
            ack: tx,
            requeued: false,
        });
        loop {
            match rx.recv_timeout(FLUSH_POLL) {
                // Disconnected: logout discarded the request.
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {
                    let stopped = self
                        .worker
                        .lock()
                        .as_ref()
                        .is_none_or(|h| h.is_finished());
                    if stopped && self.is_active() {
                        return Err(CacheError::WorkerStopped(self.view_cell()));
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> ViewCacheStats {
        self.shared.state.lock().stats
    }

    /// Watched spaces in grid order.
    pub fn spaces(&self) -> Vec<SpaceCoord> {
        self.shared.state.lock().spaces.keys().copied().collect()
    }

    /// Number of loaded roots.
    pub fn root_count(&self) -> usize {
        self.shared.state.lock().roots.len()
    }

    /// Every cell currently loaded, sorted.
    pub fn loaded_cells(&self) -> Vec<CellId> {
        let mut cells: Vec<CellId> = self.shared.state.lock().roots.cells.keys().copied().collect();
        cells.sort();
        cells
    }
}

impl Drop for ViewCache {
    fn drop(&mut self) {
        self.logout();
    }
}

impl std::fmt::Debug for ViewCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewCache")
            .field("view_cell", &self.view_cell())
            .field("active", &self.is_active())
            .finish()
    }
}
