use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use worldspace_common::{CellId, TaskScheduler};
use worldspace_kernel::{GraphError, SpatialCell, SpatialGraph};

use crate::config::{ConfigError, StreamConfig};
use crate::delivery::ViewSession;
use crate::grid::SpaceManager;
use crate::placement::SpacePlacement;
use crate::view_cache::{CacheError, ViewCache};

#[derive(Debug, thiserror::Error)]
pub enum UniverseError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cell {0} is not a view cell")]
    NotAViewCell(CellId),
    #[error("view cell {0} already has a view cache")]
    ViewAlreadyRegistered(CellId),
}

/// What a cell is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellKind {
    /// An ordinary world object.
    Plain,
    /// A cell a viewer sees the world through; it can own a view cache.
    View,
}

/// Binds cells and viewers to the space index.
///
/// The universe owns the services every cell and cache shares: the space
/// manager, the root placement feeding it, the cell graph and the task
/// scheduler. They are built once here and handed down.
pub struct Universe {
    config: StreamConfig,
    spaces: Arc<SpaceManager>,
    placement: Arc<SpacePlacement>,
    graph: Arc<SpatialGraph>,
    scheduler: Arc<dyn TaskScheduler>,
    kinds: Mutex<HashMap<CellId, CellKind>>,
    view_caches: Mutex<HashMap<CellId, Arc<ViewCache>>>,
}

impl Universe {
    pub fn new(config: StreamConfig, scheduler: Arc<dyn TaskScheduler>) -> Result<Self, UniverseError> {
        config.validate()?;
        let spaces = Arc::new(SpaceManager::new(&config));
        let placement = Arc::new(SpacePlacement::new(Arc::clone(&spaces)));
        let graph = SpatialGraph::new(placement.clone(), Arc::clone(&scheduler));
        tracing::info!(
            space_size = config.space_size,
            proximity_radius = config.proximity_radius,
            exit_grace_ms = config.exit_grace_ms,
            "universe created"
        );
        Ok(Self {
            config,
            spaces,
            placement,
            graph,
            scheduler,
            kinds: Mutex::new(HashMap::new()),
            view_caches: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn spaces(&self) -> &Arc<SpaceManager> {
        &self.spaces
    }

    pub fn placement(&self) -> &Arc<SpacePlacement> {
        &self.placement
    }

    pub fn graph(&self) -> &Arc<SpatialGraph> {
        &self.graph
    }

    /// Create a detached cell. It joins the world once it, or a root it is
    /// attached under, is added.
    pub fn create_spatial_cell(&self, id: CellId, kind: CellKind) -> Result<SpatialCell, UniverseError> {
        let cell = self.graph.create_cell(id)?;
        self.kinds.lock().insert(id, kind);
        Ok(cell)
    }

    pub fn spatial_cell(&self, id: CellId) -> Option<SpatialCell> {
        self.graph.cell(id)
    }

    pub fn cell_kind(&self, id: CellId) -> Option<CellKind> {
        self.kinds.lock().get(&id).copied()
    }

    /// Make `id` a live root: place it in the spaces its bounds touch.
    pub fn add_spatial_cell(&self, id: CellId) -> Result<(), UniverseError> {
        self.graph.set_root(id)?;
        Ok(())
    }

    /// Make the view cell `id` a live root and give it a view cache for
    /// `session`. The cache starts working at [`Universe::view_login`].
    pub fn add_view_spatial_cell(
        &self,
        id: CellId,
        session: ViewSession,
    ) -> Result<Arc<ViewCache>, UniverseError> {
        if self.cell_kind(id) != Some(CellKind::View) {
            return Err(UniverseError::NotAViewCell(id));
        }
        let mut caches = self.view_caches.lock();
        if caches.contains_key(&id) {
            return Err(UniverseError::ViewAlreadyRegistered(id));
        }
        self.graph.set_root(id)?;
        let cache = Arc::new(ViewCache::new(
            id,
            session,
            self.config.clone(),
            Arc::clone(&self.spaces),
            Arc::clone(&self.graph),
            Arc::clone(&self.scheduler),
        ));
        caches.insert(id, Arc::clone(&cache));
        tracing::debug!(view = %id, "view cell added");
        Ok(cache)
    }

    pub fn view_cache(&self, id: CellId) -> Option<Arc<ViewCache>> {
        self.view_caches.lock().get(&id).cloned()
    }

    /// Start the view cache of `id`. Unknown view cells are ignored so a
    /// restarting server can replay session hooks for cells it no longer has.
    pub fn view_login(&self, id: CellId) -> Result<(), UniverseError> {
        match self.view_cache(id) {
            Some(cache) => cache.login()?,
            None => tracing::warn!(view = %id, "login for unknown view cell ignored"),
        }
        Ok(())
    }

    pub fn view_logout(&self, id: CellId) {
        match self.view_cache(id) {
            Some(cache) => cache.logout(),
            None => tracing::warn!(view = %id, "logout for unknown view cell ignored"),
        }
    }

    /// Force the view cache of `id` to recompute its spaces.
    pub fn view_revalidate(&self, id: CellId) {
        match self.view_cache(id) {
            Some(cache) => cache.revalidate(),
            None => tracing::warn!(view = %id, "revalidate for unknown view cell ignored"),
        }
    }

    /// Withdraw the root `id` from the world without destroying it.
    pub fn remove_root_spatial_cell(&self, id: CellId) -> Result<(), UniverseError> {
        self.graph.clear_root(id)?;
        Ok(())
    }

    /// Destroy `id` and every cell below it. View caches of destroyed view
    /// cells are logged out and dropped.
    pub fn remove_cell(&self, id: CellId) -> Result<(), UniverseError> {
        let cells = self.graph.tree(id)?.read().descendants(id);
        {
            let mut caches = self.view_caches.lock();
            for cell in &cells {
                if let Some(cache) = caches.remove(cell) {
                    cache.logout();
                }
            }
        }
        self.graph.destroy(id)?;
        let mut kinds = self.kinds.lock();
        for cell in &cells {
            kinds.remove(cell);
        }
        tracing::debug!(cell = %id, cells = cells.len(), "cell removed");
        Ok(())
    }

    pub fn view_cache_count(&self) -> usize {
        self.view_caches.lock().len()
    }
}

impl Drop for Universe {
    fn drop(&mut self) {
        for (_, cache) in self.view_caches.lock().drain() {
            cache.logout();
        }
    }
}
