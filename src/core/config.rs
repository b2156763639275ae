//! Context configuration.
//!
//! All fixed-size tables in a [`Context`](crate::core::context::Context) take
//! their bounds from here. A configuration can be built in code or read from
//! TOML; keys missing from the document keep their defaults.
//!
//! ```toml
//! max_references = 1024
//! max_views_per_tensor = 8
//! fast_tile_policy = "interior"
//!
//! [default_tile_block]
//! width = 32
//! height = 32
//! ```

use crate::core::error::{VxError, VxResult};
use crate::tiling::region::TileBlock;
use crate::tiling::scheduler::FastTilePolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of live references per context.
pub const DEFAULT_MAX_REFERENCES: usize = 4096;

/// Default number of accessor slots and of memory-map slots.
pub const DEFAULT_MAX_ACCESS_SLOTS: usize = 4096;

/// Default number of kernels per backend.
pub const DEFAULT_MAX_KERNELS: usize = 1024;

/// Default number of parameters per kernel.
pub const DEFAULT_MAX_PARAMETERS: usize = 10;

/// Default maximum tensor rank.
pub const DEFAULT_MAX_TENSOR_DIMS: usize = 6;

/// Default number of nodes per graph.
pub const DEFAULT_MAX_NODES: usize = 256;

/// Default number of live views per tensor.
pub const DEFAULT_MAX_VIEWS_PER_TENSOR: usize = 64;

/// Limits and defaults for one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Live references the context can hold.
    pub max_references: usize,
    /// Size of the accessor table and of the memory-map table.
    pub max_access_slots: usize,
    /// Kernels per backend.
    pub max_kernels: usize,
    /// Parameters per kernel.
    pub max_parameters: usize,
    /// Maximum tensor rank.
    pub max_tensor_dims: usize,
    /// Nodes per graph.
    pub max_nodes: usize,
    /// Live child views per tensor.
    pub max_views_per_tensor: usize,
    /// Tile block used when a tiling kernel declares none.
    pub default_tile_block: TileBlock,
    /// When the fast tile entry point may run.
    pub fast_tile_policy: FastTilePolicy,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_references: DEFAULT_MAX_REFERENCES,
            max_access_slots: DEFAULT_MAX_ACCESS_SLOTS,
            max_kernels: DEFAULT_MAX_KERNELS,
            max_parameters: DEFAULT_MAX_PARAMETERS,
            max_tensor_dims: DEFAULT_MAX_TENSOR_DIMS,
            max_nodes: DEFAULT_MAX_NODES,
            max_views_per_tensor: DEFAULT_MAX_VIEWS_PER_TENSOR,
            default_tile_block: TileBlock::new(64, 64),
            fast_tile_policy: FastTilePolicy::default(),
        }
    }
}

impl ContextConfig {
    /// Create a configuration with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(document: &str) -> VxResult<Self> {
        let config: Self = toml::from_str(document)
            .map_err(|e| VxError::InvalidParameters(format!("context config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> VxResult<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|e| {
            VxError::InvalidParameters(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&document)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> VxResult<String> {
        toml::to_string(self)
            .map_err(|e| VxError::InvalidParameters(format!("context config: {}", e)))
    }

    /// Check that every limit is usable.
    pub fn validate(&self) -> VxResult<()> {
        let limits = [
            ("max_references", self.max_references),
            ("max_access_slots", self.max_access_slots),
            ("max_kernels", self.max_kernels),
            ("max_parameters", self.max_parameters),
            ("max_tensor_dims", self.max_tensor_dims),
            ("max_nodes", self.max_nodes),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(VxError::InvalidParameters(format!("{} must be non-zero", name)));
            }
        }
        if self.default_tile_block.is_empty() {
            return Err(VxError::InvalidParameters(
                "default_tile_block must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the reference table size.
    pub fn with_max_references(mut self, max: usize) -> Self {
        self.max_references = max;
        self
    }

    /// Set the accessor and memory-map table size.
    pub fn with_max_access_slots(mut self, max: usize) -> Self {
        self.max_access_slots = max;
        self
    }

    /// Set the number of kernels per backend.
    pub fn with_max_kernels(mut self, max: usize) -> Self {
        self.max_kernels = max;
        self
    }

    /// Set the number of parameters per kernel.
    pub fn with_max_parameters(mut self, max: usize) -> Self {
        self.max_parameters = max;
        self
    }

    /// Set the maximum tensor rank.
    pub fn with_max_tensor_dims(mut self, max: usize) -> Self {
        self.max_tensor_dims = max;
        self
    }

    /// Set the number of nodes per graph.
    pub fn with_max_nodes(mut self, max: usize) -> Self {
        self.max_nodes = max;
        self
    }

    /// Set the number of live views per tensor.
    pub fn with_max_views_per_tensor(mut self, max: usize) -> Self {
        self.max_views_per_tensor = max;
        self
    }

    /// Set the fallback tile block.
    pub fn with_default_tile_block(mut self, width: u32, height: u32) -> Self {
        self.default_tile_block = TileBlock::new(width, height);
        self
    }

    /// Set the fast tile policy.
    pub fn with_fast_tile_policy(mut self, policy: FastTilePolicy) -> Self {
        self.fast_tile_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ContextConfig::default();
        assert_eq!(config.max_references, 4096);
        assert_eq!(config.max_tensor_dims, 6);
        assert_eq!(config.fast_tile_policy, FastTilePolicy::WholeImage);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ContextConfig::from_toml_str(
            r#"
            max_references = 16
            fast_tile_policy = "interior"

            [default_tile_block]
            width = 32
            height = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.max_references, 16);
        assert_eq!(config.max_kernels, DEFAULT_MAX_KERNELS);
        assert_eq!(config.fast_tile_policy, FastTilePolicy::Interior);
        assert_eq!(config.default_tile_block, TileBlock::new(32, 8));
    }

    #[test]
    fn test_rejects_zero_limits() {
        let err = ContextConfig::from_toml_str("max_nodes = 0").unwrap_err();
        assert_eq!(err.status(), crate::core::error::Status::InvalidParameters);
        assert!(ContextConfig::from_toml_str("max_nodes = \"many\"").is_err());
    }

    #[test]
    fn test_from_file_round_trip() {
        let config = ContextConfig::new().with_max_views_per_tensor(3);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();

        let loaded = ContextConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
