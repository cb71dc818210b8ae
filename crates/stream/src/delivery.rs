//! The client side of a view cache: where load and unload lists end up.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use worldspace_common::{CellDescription, Identity, TaskError};

/// A viewer's client-side cell cache. Implementations turn cell lists into
/// messages for the client; they run inside scheduled tasks.
pub trait ViewCellCache: Send + Sync {
    fn generate_load_messages(&self, cells: &[CellDescription]) -> Result<(), TaskError>;

    fn generate_unload_messages(&self, cells: &[CellDescription]) -> Result<(), TaskError>;
}

/// A connected viewer: who it acts as and where its cells are delivered.
#[derive(Clone)]
pub struct ViewSession {
    pub identity: Identity,
    pub cell_cache: Arc<dyn ViewCellCache>,
}

impl ViewSession {
    pub fn new(identity: Identity, cell_cache: Arc<dyn ViewCellCache>) -> Self {
        Self {
            identity,
            cell_cache,
        }
    }
}

impl std::fmt::Debug for ViewSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewSession")
            .field("identity", &self.identity)
            .finish()
    }
}

/// Cell cache with no client behind it: logs deliveries and counts cells.
#[derive(Debug)]
pub struct LoggingCellCache {
    identity: Identity,
    loaded: AtomicUsize,
    unloaded: AtomicUsize,
}

impl LoggingCellCache {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            loaded: AtomicUsize::new(0),
            unloaded: AtomicUsize::new(0),
        }
    }

    pub fn loaded(&self) -> usize {
        self.loaded.load(Ordering::Relaxed)
    }

    pub fn unloaded(&self) -> usize {
        self.unloaded.load(Ordering::Relaxed)
    }

    /// Cells currently present on the client.
    pub fn resident(&self) -> usize {
        self.loaded().saturating_sub(self.unloaded())
    }
}

impl ViewCellCache for LoggingCellCache {
    fn generate_load_messages(&self, cells: &[CellDescription]) -> Result<(), TaskError> {
        self.loaded.fetch_add(cells.len(), Ordering::Relaxed);
        tracing::debug!(identity = %self.identity, cells = cells.len(), "load");
        Ok(())
    }

    fn generate_unload_messages(&self, cells: &[CellDescription]) -> Result<(), TaskError> {
        self.unloaded.fetch_add(cells.len(), Ordering::Relaxed);
        tracing::debug!(identity = %self.identity, cells = cells.len(), "unload");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldspace_common::CellId;

    #[test]
    fn logging_cache_counts_cells() {
        let cache = LoggingCellCache::new(Identity::new("viewer"));
        let root = CellId::new();
        let cells = [CellDescription::new(root, root), CellDescription::new(CellId::new(), root)];
        cache.generate_load_messages(&cells).unwrap();
        cache.generate_unload_messages(&cells[1..]).unwrap();
        assert_eq!(cache.loaded(), 2);
        assert_eq!(cache.unloaded(), 1);
        assert_eq!(cache.resident(), 1);
    }
}
