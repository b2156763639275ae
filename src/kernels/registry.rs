//! Per-context kernel registry.
//!
//! Kernels are grouped by backend; each backend holds at most
//! `max_kernels` of them, keyed by full name in registration order. Only
//! finalized kernels are visible to lookups and counted.

use crate::core::error::{VxError, VxResult};
use crate::core::reference::Kernel;
use indexmap::IndexMap;

/// One registered kernel.
#[derive(Debug, Clone)]
pub(crate) struct RegistryEntry {
    kernel: Kernel,
    id: u32,
    enabled: bool,
}

impl RegistryEntry {
    pub(crate) fn new(kernel: Kernel, id: u32) -> Self {
        Self {
            kernel,
            id,
            enabled: false,
        }
    }
}

/// Kernels of one backend.
#[derive(Debug, Default)]
struct Backend {
    kernels: IndexMap<String, RegistryEntry>,
}

/// Registry for all kernels of a context.
#[derive(Debug)]
pub(crate) struct KernelRegistry {
    backends: IndexMap<String, Backend>,
    max_kernels: usize,
}

impl KernelRegistry {
    pub(crate) fn new(max_kernels: usize) -> Self {
        Self {
            backends: IndexMap::new(),
            max_kernels,
        }
    }

    /// Check that `name` is free and `backend` has room.
    pub(crate) fn check_room(&self, backend: &str, name: &str) -> VxResult<()> {
        if self.contains(name) {
            return Err(VxError::InvalidParameters(format!("kernel {} already registered", name)));
        }
        let used = self.backends.get(backend).map_or(0, |b| b.kernels.len());
        if used >= self.max_kernels {
            return Err(VxError::NoResources(format!(
                "backend {} holds {} kernels",
                backend, used
            )));
        }
        Ok(())
    }

    pub(crate) fn insert(&mut self, backend: &str, name: &str, entry: RegistryEntry) -> VxResult<()> {
        self.check_room(backend, name)?;
        self.backends
            .entry(backend.to_string())
            .or_default()
            .kernels
            .insert(name.to_string(), entry);
        Ok(())
    }

    /// Mark a kernel finalized. Returns whether its id is new among enabled
    /// kernels.
    pub(crate) fn enable(&mut self, kernel: Kernel) -> bool {
        let id = match self.entries().find(|e| e.kernel == kernel) {
            Some(entry) => entry.id,
            None => return false,
        };
        let unique = !self.entries().any(|e| e.enabled && e.id == id);
        for backend in self.backends.values_mut() {
            for entry in backend.kernels.values_mut() {
                if entry.kernel == kernel {
                    entry.enabled = true;
                }
            }
        }
        unique
    }

    pub(crate) fn remove(&mut self, backend: &str, name: &str) -> VxResult<RegistryEntry> {
        let kernels = &mut self
            .backends
            .get_mut(backend)
            .ok_or_else(|| VxError::InvalidParameters(format!("no backend {}", backend)))?
            .kernels;
        let entry = kernels
            .shift_remove(name)
            .ok_or_else(|| VxError::InvalidParameters(format!("{} is not registered", name)))?;
        if kernels.is_empty() {
            self.backends.shift_remove(backend);
        }
        Ok(entry)
    }

    fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.backends.values().flat_map(|b| b.kernels.values())
    }

    fn contains(&self, name: &str) -> bool {
        self.backends.values().any(|b| b.kernels.contains_key(name))
    }

    /// Enabled kernel named `name`, with or without its backend prefix.
    pub(crate) fn find_by_name(&self, name: &str) -> Option<Kernel> {
        self.backends
            .values()
            .flat_map(|b| b.kernels.iter())
            .filter(|(_, entry)| entry.enabled)
            .find(|(full, _)| full.as_str() == name)
            .or_else(|| {
                self.backends
                    .values()
                    .flat_map(|b| b.kernels.iter())
                    .filter(|(_, entry)| entry.enabled)
                    .find(|(full, _)| full.split_once(':').map(|(_, short)| short) == Some(name))
            })
            .map(|(_, entry)| entry.kernel)
    }

    /// First enabled kernel with `id`, in registration order.
    pub(crate) fn find_by_id(&self, id: u32) -> Option<Kernel> {
        self.entries()
            .find(|e| e.enabled && e.id == id)
            .map(|e| e.kernel)
    }

    pub(crate) fn num_kernels(&self) -> usize {
        self.entries().filter(|e| e.enabled).count()
    }

    pub(crate) fn num_unique_kernels(&self) -> usize {
        let mut ids: Vec<u32> = self.entries().filter(|e| e.enabled).map(|e| e.id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    pub(crate) fn backend_names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.backends.clear();
    }
}
