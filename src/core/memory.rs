//! Buffer storage and the memory-access protocol.
//!
//! Buffers keep their bytes in a [`Storage`] allocated on first touch. Hosts
//! and executors reach those bytes through *sessions*:
//!
//! - copy style (`access_*` / `commit_*`): the caller reads or writes a
//!   framework-owned temporary or its own buffer, and write-capable sessions
//!   are flushed back on commit;
//! - map style (`map_*` / `unmap_*`): the caller gets a [`Mapping`] that
//!   aliases the real storage when the region is contiguous, or a staged copy
//!   that is written back on unmap.
//!
//! Every open session occupies a slot in one of the context's two fixed-size
//! tables (accessors and memory maps) and pins its target with an external
//! reference. A write-capable session holds the buffer's [`BufferLock`] from
//! open to close; other writers block until it is released. Read-only
//! sessions never touch the lock.

use crate::buffers::image::ImageAddressing;
use crate::core::context::Context;
use crate::core::error::{VxError, VxResult};
use crate::core::reference::{RefKind, Reference, ReferenceEntry};
use crate::core::types::Usage;
use bytemuck::Pod;
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

// ============================================================================
// Storage
// ============================================================================

/// Heap bytes with a stable address.
///
/// The address never changes for the lifetime of the storage, which lets
/// mappings hand out pointers into it while the owning object keeps its own
/// bookkeeping behind a mutex.
pub(crate) struct Storage {
    raw: NonNull<[u8]>,
}

// SAFETY: Storage owns its allocation. Concurrent access is coordinated by the
// session protocol (write-capable sessions hold the buffer lock).
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    /// Allocate `len` zeroed bytes, reporting failure as no-memory.
    pub(crate) fn zeroed(len: usize) -> VxResult<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| VxError::NoMemory(format!("cannot allocate {} bytes", len)))?;
        bytes.resize(len, 0);
        Ok(Self::from_vec(bytes))
    }

    /// Take ownership of host memory.
    pub(crate) fn from_vec(bytes: Vec<u8>) -> Self {
        let raw = NonNull::from(Box::leak(bytes.into_boxed_slice()));
        Self { raw }
    }

    /// Give the bytes back to the host.
    pub(crate) fn into_vec(self) -> Vec<u8> {
        let this = ManuallyDrop::new(self);
        // SAFETY: raw came from Box::leak and is not used after this point.
        unsafe { Box::from_raw(this.raw.as_ptr()) }.into_vec()
    }

    pub(crate) fn len(&self) -> usize {
        self.raw.len()
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.raw.as_ptr() as *mut u8
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // SAFETY: raw came from Box::leak and is dropped exactly once.
        unsafe { drop(Box::from_raw(self.raw.as_ptr())) }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").field("len", &self.len()).finish()
    }
}

/// Bytes spanned by a strided block: offset of the last element plus its size.
///
/// Fails with `InvalidParameters` when the span does not fit in `usize`.
pub(crate) fn strided_span(extents: &[usize], strides: &[usize], element_size: usize) -> VxResult<usize> {
    if extents.iter().any(|&e| e == 0) {
        return Ok(0);
    }
    extents
        .iter()
        .zip(strides)
        .try_fold(element_size, |span, (&extent, &stride)| {
            (extent - 1).checked_mul(stride)?.checked_add(span)
        })
        .ok_or_else(|| {
            VxError::InvalidParameters(format!(
                "extents {:?} at strides {:?} overflow the address space",
                extents, strides
            ))
        })
}

/// Copy a block of `extents` elements between two strided layouts.
///
/// Axis 0 is the innermost axis. When both sides are packed along axis 0 each
/// row is copied with one call.
///
/// # Safety
/// `src` must be readable for `strided_span(extents, src_strides, element_size)`
/// bytes and `dst` writable for `strided_span(extents, dst_strides, element_size)`
/// bytes.
pub(crate) unsafe fn copy_strided(
    src: *const u8,
    src_strides: &[usize],
    dst: *mut u8,
    dst_strides: &[usize],
    extents: &[usize],
    element_size: usize,
) {
    if extents.iter().any(|&e| e == 0) {
        return;
    }
    let packed_rows = !extents.is_empty()
        && src_strides[0] == element_size
        && dst_strides[0] == element_size;
    let (row_bytes, first_axis) = if packed_rows {
        (extents[0] * element_size, 1)
    } else {
        (element_size, 0)
    };

    let mut index = vec![0usize; extents.len()];
    loop {
        let mut src_offset = 0;
        let mut dst_offset = 0;
        for axis in first_axis..extents.len() {
            src_offset += index[axis] * src_strides[axis];
            dst_offset += index[axis] * dst_strides[axis];
        }
        std::ptr::copy(src.add(src_offset), dst.add(dst_offset), row_bytes);

        let mut axis = first_axis;
        loop {
            if axis == extents.len() {
                return;
            }
            index[axis] += 1;
            if index[axis] < extents[axis] {
                break;
            }
            index[axis] = 0;
            axis += 1;
        }
    }
}

// ============================================================================
// Buffer lock
// ============================================================================

/// The single writer lock of one buffer.
///
/// Held from the open of a write-capable session to its close, which may be
/// on a different thread, so it is a flag guarded by a mutex rather than a
/// guard-based lock.
#[derive(Debug, Default)]
pub(crate) struct BufferLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl BufferLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is free, then take it.
    pub(crate) fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
    }

    pub(crate) fn release(&self) {
        let mut held = self.held.lock();
        *held = false;
        self.released.notify_one();
    }

    pub(crate) fn is_held(&self) -> bool {
        *self.held.lock()
    }

    /// Take the lock for the duration of a synchronous write.
    pub(crate) fn hold(&self) -> LockHold<'_> {
        self.acquire();
        LockHold { lock: self }
    }
}

/// Releases a [`BufferLock`] when dropped.
pub(crate) struct LockHold<'a> {
    lock: &'a BufferLock,
}

impl Drop for LockHold<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

// ============================================================================
// Session tables
// ============================================================================

/// Identifier of an open accessor or memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}.{}", self.index, self.generation)
    }
}

/// Which table a session lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionTable {
    Accessors,
    Maps,
}

/// Region of the target a session covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionRegion {
    Array { start: usize, end: usize },
    Tensor { start: Vec<usize>, end: Vec<usize> },
    Image { x: u32, y: u32, width: u32, height: u32 },
}

/// One open access or map.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) target: Reference,
    pub(crate) usage: Usage,
    pub(crate) region: SessionRegion,
    /// Framework-owned temporary; `None` when the caller's memory or the
    /// object's own storage is used directly.
    pub(crate) staging: Option<Storage>,
    locked: bool,
}

struct TableSlot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity slot table with generation-checked ids.
pub(crate) struct SlotTable<T> {
    slots: Vec<TableSlot<T>>,
    capacity: usize,
    label: &'static str,
}

impl<T> SlotTable<T> {
    pub(crate) fn new(label: &'static str, capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
            label,
        }
    }

    /// Store a value in the first free slot.
    pub(crate) fn insert(&mut self, value: T) -> VxResult<SessionId> {
        let index = match self.slots.iter().position(|s| s.value.is_none()) {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(TableSlot {
                    generation: 0,
                    value: None,
                });
                self.slots.len() - 1
            }
            None => {
                return Err(VxError::NoResources(format!(
                    "{} table full ({} slots)",
                    self.label, self.capacity
                )))
            }
        };
        let slot = &mut self.slots[index];
        slot.value = Some(value);
        Ok(SessionId {
            index: index as u32,
            generation: slot.generation,
        })
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|s| s.value.as_ref())
    }
}

/// Parts of a session produced once the target is pinned and locked.
pub(crate) struct SessionSetup<T> {
    pub(crate) region: SessionRegion,
    pub(crate) staging: Option<Storage>,
    pub(crate) output: T,
}

impl Context {
    fn session_table(&self, table: SessionTable) -> &Mutex<SlotTable<Session>> {
        match table {
            SessionTable::Accessors => &self.accessors,
            SessionTable::Maps => &self.maps,
        }
    }

    /// Open a session on `target`.
    ///
    /// Checks accessibility, pins the target, takes the buffer lock for
    /// write-capable usage, runs `prepare` (which allocates storage and fills
    /// any staging copy) and registers the session. Every step is undone if a
    /// later one fails.
    pub(crate) fn open_session<T>(
        &self,
        table: SessionTable,
        target: Reference,
        entry: &ReferenceEntry,
        lock: &BufferLock,
        usage: Usage,
        prepare: impl FnOnce() -> VxResult<SessionSetup<T>>,
    ) -> VxResult<(SessionId, T)> {
        self.check_accessible(target, entry)?;
        self.increment(target, RefKind::External)?;
        if usage.writes() {
            lock.acquire();
        }

        let result = prepare().and_then(|setup| {
            let session = Session {
                target,
                usage,
                region: setup.region,
                staging: setup.staging,
                locked: usage.writes(),
            };
            let id = self.session_table(table).lock().insert(session)?;
            Ok((id, setup.output))
        });

        match &result {
            Ok((id, _)) => {
                entry.header.record_access(usage.reads(), usage.writes());
                trace!("opened {} on {} ({:?}, {:?})", id, target, table, usage);
            }
            Err(_) => {
                if usage.writes() {
                    lock.release();
                }
                if let Err(e) = self.decrement(target, RefKind::External) {
                    warn!("unpinning {} after a failed open: {}", target, e);
                }
            }
        }
        result
    }

    /// Close a session opened by [`open_session`](Self::open_session).
    ///
    /// For write-capable sessions `write_back` runs while the buffer lock is
    /// still held. The lock is released and the pin dropped even when the
    /// write-back fails.
    pub(crate) fn close_session(
        &self,
        table: SessionTable,
        id: SessionId,
        target: Reference,
        lock: &BufferLock,
        write_back: impl FnOnce(&Session) -> VxResult<()>,
    ) -> VxResult<()> {
        let session = {
            let mut sessions = self.session_table(table).lock();
            match sessions.get(id) {
                Some(session) if session.target == target => sessions.remove(id),
                _ => None,
            }
        }
        .ok_or_else(|| {
            warn!("{} is not an open {:?} session of {}", id, table, target);
            VxError::InvalidParameters(format!("{} is not open on {}", id, target))
        })?;

        let result = if session.usage.writes() {
            write_back(&session)
        } else {
            Ok(())
        };
        if session.locked {
            lock.release();
        }
        self.decrement(target, RefKind::External)?;
        trace!("closed {} on {}", id, target);
        result
    }

    /// Whether `id` is an open session of `table` on `target`.
    pub(crate) fn session_is_open(&self, table: SessionTable, id: SessionId, target: Reference) -> bool {
        self.session_table(table)
            .lock()
            .get(id)
            .map_or(false, |session| session.target == target)
    }

    /// Sessions of either kind currently open on `target`.
    pub(crate) fn open_sessions_on(&self, target: Reference) -> usize {
        let count = |table: &Mutex<SlotTable<Session>>| {
            table.lock().values().filter(|s| s.target == target).count()
        };
        count(&self.accessors) + count(&self.maps)
    }

    /// Number of open copy-style accessors.
    pub fn active_accessors(&self) -> usize {
        self.accessors.lock().len()
    }

    /// Number of open memory maps.
    pub fn active_maps(&self) -> usize {
        self.maps.lock().len()
    }
}

// ============================================================================
// Mapping
// ============================================================================

/// Addressing of the bytes behind a [`Mapping`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapLayout {
    /// Items of `item_size` bytes, `stride` bytes apart.
    Linear {
        /// Number of items.
        count: usize,
        /// Bytes per item.
        item_size: usize,
        /// Bytes between consecutive items.
        stride: usize,
    },
    /// Multi-dimensional block, axis 0 innermost.
    Strided {
        /// Extent of each axis.
        dims: Vec<usize>,
        /// Byte stride of each axis.
        strides: Vec<usize>,
        /// Bytes per element.
        element_size: usize,
    },
    /// Image rectangle.
    Image(ImageAddressing),
}

/// Pointer-style access to a region of a buffer.
///
/// Returned by the `map_*` operations and handed back to the matching
/// `unmap_*`. A mapping that is dropped without being unmapped keeps its
/// target pinned and, for write-capable usage, keeps the buffer locked.
pub struct Mapping {
    id: SessionId,
    target: Reference,
    usage: Usage,
    ptr: NonNull<u8>,
    len: usize,
    layout: MapLayout,
    zero_copy: bool,
}

// SAFETY: the mapped bytes stay allocated while the session pins the target;
// exclusive writers are serialized by the buffer lock.
unsafe impl Send for Mapping {}

impl Mapping {
    pub(crate) fn new(
        id: SessionId,
        target: Reference,
        usage: Usage,
        ptr: *mut u8,
        len: usize,
        layout: MapLayout,
        zero_copy: bool,
    ) -> Self {
        Self {
            id,
            target,
            usage,
            ptr: NonNull::new(ptr).unwrap_or(NonNull::dangling()),
            len,
            layout,
            zero_copy,
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The mapped object.
    pub fn target(&self) -> Reference {
        self.target
    }

    /// Usage the mapping was opened with.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Addressing of the mapped bytes.
    pub fn layout(&self) -> &MapLayout {
        &self.layout
    }

    /// Whether the bytes are the object's own storage rather than a copy.
    pub fn is_zero_copy(&self) -> bool {
        self.zero_copy
    }

    /// Number of addressable bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping spans no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes while the session is open, and
        // the session lives at least as long as this Mapping.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The mapped bytes, writable. Fails for read-only mappings.
    pub fn as_mut_slice(&mut self) -> VxResult<&mut [u8]> {
        if !self.usage.writes() {
            return Err(VxError::NotSupported(format!(
                "{} is mapped read-only",
                self.target
            )));
        }
        // SAFETY: as in as_slice; the buffer lock is held for write usage.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
    }

    /// The mapped bytes as typed elements.
    pub fn as_slice_of<T: Pod>(&self) -> VxResult<&[T]> {
        bytemuck::try_cast_slice(self.as_slice())
            .map_err(|e| VxError::invalid_type(std::any::type_name::<T>(), e))
    }

    /// The mapped bytes as writable typed elements.
    pub fn as_mut_slice_of<T: Pod>(&mut self) -> VxResult<&mut [T]> {
        bytemuck::try_cast_slice_mut(self.as_mut_slice()?)
            .map_err(|e| VxError::invalid_type(std::any::type_name::<T>(), e))
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("usage", &self.usage)
            .field("len", &self.len)
            .field("layout", &self.layout)
            .field("zero_copy", &self.zero_copy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Status;
    use crate::core::reference::Handle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_storage_round_trip() {
        let storage = Storage::from_vec(vec![1, 2, 3]);
        assert_eq!(storage.len(), 3);
        assert_eq!(storage.into_vec(), vec![1, 2, 3]);
        assert_eq!(Storage::zeroed(5).unwrap().len(), 5);
    }

    #[test]
    fn test_strided_span() {
        assert_eq!(strided_span(&[4, 4], &[1, 8], 1).unwrap(), 28);
        assert_eq!(strided_span(&[3], &[5], 2).unwrap(), 12);
        assert_eq!(strided_span(&[0, 4], &[1, 8], 1).unwrap(), 0);
    }

    #[test]
    fn test_strided_span_overflow() {
        let err = strided_span(&[usize::MAX / 2], &[4], 4).unwrap_err();
        assert_eq!(err.status(), Status::InvalidParameters);
        let err = strided_span(&[2, 2], &[usize::MAX - 1, 1], 2).unwrap_err();
        assert_eq!(err.status(), Status::InvalidParameters);
        assert_eq!(strided_span(&[2], &[usize::MAX / 4], 1).unwrap(), usize::MAX / 4 + 1);
    }

    #[test]
    fn test_failed_open_undoes_pin_and_lock() {
        let ctx = Context::new();
        let array = ctx.create_array(crate::core::types::DataType::UInt8, 4).unwrap();
        let entry = ctx.entry(array.reference()).unwrap();
        let lock = BufferLock::new();
        let result: VxResult<(SessionId, ())> = ctx.open_session(
            SessionTable::Maps,
            array.reference(),
            &entry,
            &lock,
            Usage::WriteOnly,
            || Err(VxError::InvalidParameters("staging".into())),
        );
        assert_eq!(result.unwrap_err().status(), Status::InvalidParameters);
        assert_eq!(ctx.query_reference(array).unwrap().external_count, 1);
        assert_eq!(ctx.open_sessions_on(array.reference()), 0);
        assert!(!lock.is_held());
    }

    #[test]
    fn test_copy_strided_gathers_sub_block() {
        // 4x3 source, axis 0 innermost; copy the 2x2 block at (1, 1)
        let src: Vec<u8> = (0..12).collect();
        let mut dst = vec![0u8; 4];
        unsafe {
            copy_strided(src.as_ptr().add(1 + 4), &[1, 4], dst.as_mut_ptr(), &[1, 2], &[2, 2], 1);
        }
        assert_eq!(dst, vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_copy_strided_scatters_items() {
        let src = [1u8, 2, 3, 4];
        let mut dst = vec![0u8; 7];
        unsafe {
            copy_strided(src.as_ptr(), &[2], dst.as_mut_ptr(), &[5], &[2], 2);
        }
        assert_eq!(dst, vec![1, 2, 0, 0, 0, 3, 4]);
    }

    #[test]
    fn test_slot_table_generations() {
        let mut table = SlotTable::new("test", 2);
        let a = table.insert("a").unwrap();
        let b = table.insert("b").unwrap();
        assert!(table.insert("c").is_err());

        assert_eq!(table.remove(a), Some("a"));
        assert_eq!(table.remove(a), None);
        let c = table.insert("c").unwrap();
        assert_ne!(a, c);
        assert_eq!(table.get(a), None);
        assert_eq!(table.get(c), Some(&"c"));
        assert_eq!(table.get(b), Some(&"b"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_buffer_lock_serializes_writers() {
        let lock = Arc::new(BufferLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        lock.acquire();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.release();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!lock.is_held());
    }
}
