//! Spatial kernel: the authoritative graph of spatial cells, their transforms
//! and bounds, and the hooks through which changes reach the spatial index.
//!
//! # Invariants
//! - A cell has at most one parent, and the graph never contains a cycle.
//! - A cell's world transform is its parent's world transform composed with
//!   its local transform (the local transform alone for a root).
//! - A cell's world bounds enclose its own bounds and those of every
//!   descendant.
//! - World state is only maintained while the owning graph is live, and only
//!   live roots are placed in the spatial index.
//! - Every mutation of one root graph is serialized by that graph's lock.

pub mod cell;
pub mod graph;
pub mod observer;
pub mod tree;

pub use cell::SpatialCell;
pub use graph::{GraphError, SpatialGraph};
pub use observer::{
    CellObserver, NoPlacement, ObserverId, RootPlacement, TransformListener, ViewObserver,
};
pub use tree::{CellTree, TreeView};
