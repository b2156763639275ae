//! The context: root owner of every table.
//!
//! A [`Context`] owns the reference table, the accessor and memory-map session
//! tables and the kernel registry, each behind its own lock. Contexts are
//! independent: handles carry their context id and are rejected elsewhere,
//! and dropping a context tears down everything it still holds.

use crate::core::config::ContextConfig;
use crate::core::error::VxResult;
use crate::core::memory::{Session, SlotTable};
use crate::core::reference::ReferenceTable;
use crate::kernels::registry::KernelRegistry;
use log::debug;
use parking_lot::Mutex;
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Root object of the runtime.
///
/// `Context` is `Send + Sync`; share it between threads by reference or in an
/// `Arc`. All operations take `&self`.
pub struct Context {
    id: ContextId,
    config: ContextConfig,
    pub(crate) references: Mutex<ReferenceTable>,
    pub(crate) accessors: Mutex<SlotTable<Session>>,
    pub(crate) maps: Mutex<SlotTable<Session>>,
    pub(crate) kernels: Mutex<KernelRegistry>,
}

impl Context {
    /// Create a context with default limits.
    pub fn new() -> Self {
        Self::build(ContextConfig::default())
    }

    /// Create a context with custom limits.
    pub fn with_config(config: ContextConfig) -> VxResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: ContextConfig) -> Self {
        let id = ContextId::new();
        debug!("context {} created", id);
        Self {
            id,
            references: Mutex::new(ReferenceTable::new(config.max_references)),
            accessors: Mutex::new(SlotTable::new("accessor", config.max_access_slots)),
            maps: Mutex::new(SlotTable::new("memory map", config.max_access_slots)),
            kernels: Mutex::new(KernelRegistry::new(config.max_kernels)),
            config,
        }
    }

    /// Identifier of this context.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Limits this context enforces.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("references", &self.reference_count())
            .field("accessors", &self.active_accessors())
            .field("maps", &self.active_maps())
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let leaked = self.references.get_mut().drain();
        if !leaked.is_empty() {
            debug!("context {} dropped with {} live references", self.id, leaked.len());
        }
        self.kernels.get_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DataType;

    #[test]
    fn test_context_id_display() {
        let ctx = Context::new();
        assert_eq!(ctx.id().to_string().len(), 8);
        assert_ne!(ctx.id(), Context::new().id());
    }

    #[test]
    fn test_contexts_are_independent() {
        let a = Context::new();
        let b = Context::new();
        a.create_array(DataType::UInt8, 4).unwrap();
        assert_eq!(a.reference_count(), 1);
        assert_eq!(b.reference_count(), 0);
        drop(a);
        assert_eq!(b.reference_count(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ContextConfig::new().with_max_nodes(0);
        assert!(Context::with_config(config).is_err());
    }

    #[test]
    fn test_context_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Context>();
    }
}
