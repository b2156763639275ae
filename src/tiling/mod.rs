//! Tiled execution of image kernels.
//!
//! - [`region`]: tile geometry and the tile walk
//! - [`tile`]: per-call addressing records handed to entry points
//! - [`scheduler`]: entry point selection and dispatch

pub mod region;
pub mod scheduler;
pub mod tile;

pub use region::{Neighborhood, TileBlock, TileIterator, TileRegion};
pub use scheduler::{plan_tiles, FastTilePolicy, PlannedTile, TileCall, TilingOptions, TilingStats};
pub use tile::{ImageTile, TileParameter};
