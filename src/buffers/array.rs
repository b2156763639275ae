//! Arrays: typed linear buffers with a fixed capacity.
//!
//! An array holds up to `capacity` items of one [`DataType`]. Items are
//! appended with [`Context::add_array_items`] and read or modified through the
//! access and map protocols. Backing memory is allocated on first touch.
//!
//! Virtual arrays may be created without an item type or capacity; graph
//! verification fills both in from the producing kernel's output metadata.

use crate::core::context::Context;
use crate::core::error::{VxError, VxResult};
use crate::core::memory::{
    copy_strided, strided_span, BufferLock, MapLayout, Mapping, SessionId, SessionRegion,
    SessionSetup, SessionTable, Storage,
};
use crate::core::reference::{Array, Graph, Handle, NewReference, Object};
use crate::core::types::{DataType, Usage};
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use std::ptr::NonNull;

/// Array object stored in the reference table.
pub(crate) struct ArrayObject {
    state: Mutex<ArrayState>,
    lock: BufferLock,
}

#[derive(Debug)]
struct ArrayState {
    item_type: Option<DataType>,
    capacity: usize,
    num_items: usize,
    storage: Option<Storage>,
}

impl ArrayState {
    fn item_size(&self) -> usize {
        self.item_type.map(DataType::size).unwrap_or(0)
    }

    fn check_range(&self, start: usize, end: usize) -> VxResult<()> {
        if start >= end || end > self.num_items {
            return Err(VxError::InvalidParameters(format!(
                "range [{}, {}) outside {} items",
                start, end, self.num_items
            )));
        }
        Ok(())
    }

    /// Base of the item memory, allocating it on first use.
    fn base(&mut self) -> VxResult<*mut u8> {
        if self.item_type.is_none() || self.capacity == 0 {
            return Err(VxError::InvalidParameters(
                "array has no item type or capacity yet".to_string(),
            ));
        }
        if self.storage.is_none() {
            self.storage = Some(Storage::zeroed(self.capacity * self.item_size())?);
        }
        Ok(self
            .storage
            .as_ref()
            .map(Storage::as_ptr)
            .unwrap_or(std::ptr::null_mut()))
    }
}

impl ArrayObject {
    fn new(item_type: Option<DataType>, capacity: usize) -> Self {
        Self {
            state: Mutex::new(ArrayState {
                item_type,
                capacity,
                num_items: 0,
                storage: None,
            }),
            lock: BufferLock::new(),
        }
    }

    pub(crate) fn info(&self) -> ArrayInfo {
        let state = self.state.lock();
        ArrayInfo {
            item_type: state.item_type,
            num_items: state.num_items,
            capacity: state.capacity,
            item_size: state.item_size(),
        }
    }
}

/// Attributes of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArrayInfo {
    /// Item type; `None` for a virtual array not yet initialized.
    pub item_type: Option<DataType>,
    /// Items currently stored.
    pub num_items: usize,
    /// Maximum number of items.
    pub capacity: usize,
    /// Bytes per item.
    pub item_size: usize,
}

/// Memory used by a copy-style array access.
pub enum AccessBuffer<'a> {
    /// A framework-owned temporary with items packed at `item_size`.
    Framework,
    /// The caller's buffer, items `stride` bytes apart.
    User {
        /// Destination and source of the copies.
        buffer: &'a mut [u8],
        /// Bytes between consecutive items.
        stride: usize,
    },
}

#[derive(Debug)]
enum AccessMemory<'a> {
    Framework { ptr: NonNull<u8>, len: usize },
    User(&'a mut [u8]),
}

/// An open copy-style access to a range of array items.
///
/// Hand it back to [`Context::commit_array_range`] to flush writes and release
/// the array.
#[derive(Debug)]
pub struct ArrayAccess<'a> {
    id: SessionId,
    array: Array,
    usage: Usage,
    count: usize,
    item_size: usize,
    stride: usize,
    memory: AccessMemory<'a>,
}

impl<'a> ArrayAccess<'a> {
    /// Accessor id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Number of items in the range.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Bytes between consecutive items.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// The accessed bytes.
    pub fn as_slice(&self) -> &[u8] {
        match &self.memory {
            // SAFETY: the staging buffer lives in the accessor slot until commit.
            AccessMemory::Framework { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
            AccessMemory::User(buffer) => buffer,
        }
    }

    /// The accessed bytes, writable. Fails for read-only accesses.
    pub fn as_mut_slice(&mut self) -> VxResult<&mut [u8]> {
        if !self.usage.writes() {
            return Err(VxError::NotSupported(format!(
                "{} was accessed read-only",
                self.array
            )));
        }
        Ok(match &mut self.memory {
            // SAFETY: as in as_slice; the array's lock is held for write usage.
            AccessMemory::Framework { ptr, len } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), *len)
            },
            AccessMemory::User(buffer) => buffer,
        })
    }

    fn source_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }
}

fn check_user_buffer(len: usize, count: usize, stride: usize, item_size: usize) -> VxResult<()> {
    if stride < item_size {
        return Err(VxError::InvalidParameters(format!(
            "stride {} smaller than item size {}",
            stride, item_size
        )));
    }
    let needed = strided_span(&[count], &[stride], item_size)?;
    if len < needed {
        return Err(VxError::InvalidParameters(format!(
            "buffer of {} bytes cannot hold {} items at stride {}",
            len, count, stride
        )));
    }
    Ok(())
}

impl Context {
    /// Create an array of `capacity` items of `item_type`.
    pub fn create_array(&self, item_type: DataType, capacity: usize) -> VxResult<Array> {
        if capacity == 0 {
            return Err(VxError::InvalidParameters("array capacity must be non-zero".to_string()));
        }
        let object = ArrayObject::new(Some(item_type), capacity);
        let reference = self.create_reference(NewReference::external(Object::Array(object)))?;
        debug!("array {} of {} x {}", reference, capacity, item_type);
        Ok(Array::wrap(reference))
    }

    /// Create a virtual array scoped to `graph`.
    ///
    /// Item type and capacity may be left open (`None`, `0`) until verification.
    pub fn create_virtual_array(
        &self,
        graph: Graph,
        item_type: Option<DataType>,
        capacity: usize,
    ) -> VxResult<Array> {
        self.entry(graph.reference())?.graph()?;
        let object = ArrayObject::new(item_type, capacity);
        let reference =
            self.create_reference(NewReference::virtual_in(Object::Array(object), graph))?;
        Ok(Array::wrap(reference))
    }

    /// Fix the item type and capacity of a virtual array.
    ///
    /// Attributes already set must agree with the requested ones.
    pub fn init_virtual_array(
        &self,
        array: Array,
        item_type: DataType,
        capacity: usize,
    ) -> VxResult<()> {
        let entry = self.entry(array.reference())?;
        if !entry.header.is_virtual() {
            return Err(VxError::NotSupported(format!("{} is not virtual", array)));
        }
        if capacity == 0 {
            return Err(VxError::InvalidParameters("array capacity must be non-zero".to_string()));
        }
        let mut state = entry.array()?.state.lock();
        match state.item_type {
            Some(existing) if existing != item_type => {
                return Err(VxError::InvalidParameters(format!(
                    "{} already holds {} items",
                    array, existing
                )))
            }
            _ => state.item_type = Some(item_type),
        }
        if state.capacity == 0 {
            state.capacity = capacity;
        }
        Ok(())
    }

    /// Attributes of an array.
    pub fn query_array(&self, array: Array) -> VxResult<ArrayInfo> {
        Ok(self.entry(array.reference())?.array()?.info())
    }

    /// Append `count` items read from `items`, `stride` bytes apart.
    ///
    /// Fails without changing the array when the items would exceed its
    /// capacity.
    pub fn add_array_items(
        &self,
        array: Array,
        count: usize,
        items: &[u8],
        stride: usize,
    ) -> VxResult<()> {
        let entry = self.entry(array.reference())?;
        self.check_accessible(array.reference(), &entry)?;
        let object = entry.array()?;
        if count == 0 {
            return Err(VxError::InvalidParameters("no items to add".to_string()));
        }

        let _hold = object.lock.hold();
        let mut state = object.state.lock();
        let item_size = state.item_size();
        check_user_buffer(items.len(), count, stride, item_size)?;
        if state.num_items + count > state.capacity {
            return Err(VxError::InvalidParameters(format!(
                "{} + {} items exceed capacity {}",
                state.num_items, count, state.capacity
            )));
        }
        let base = state.base()?;
        // SAFETY: the destination lies inside capacity * item_size and the
        // source span was checked against items.len().
        unsafe {
            copy_strided(
                items.as_ptr(),
                &[stride],
                base.add(state.num_items * item_size),
                &[item_size],
                &[count],
                item_size,
            );
        }
        state.num_items += count;
        entry.header.record_access(false, true);
        Ok(())
    }

    /// Drop items past `new_num_items`.
    pub fn truncate_array(&self, array: Array, new_num_items: usize) -> VxResult<()> {
        let entry = self.entry(array.reference())?;
        self.check_accessible(array.reference(), &entry)?;
        let object = entry.array()?;
        let _hold = object.lock.hold();
        let mut state = object.state.lock();
        if new_num_items > state.num_items {
            return Err(VxError::InvalidParameters(format!(
                "cannot truncate {} items to {}",
                state.num_items, new_num_items
            )));
        }
        state.num_items = new_num_items;
        Ok(())
    }

    /// Copy items `[start, end)` into or out of `buffer`.
    ///
    /// `ReadOnly` copies out of the array, `WriteOnly` copies into it.
    pub fn copy_array_range(
        &self,
        array: Array,
        start: usize,
        end: usize,
        stride: usize,
        buffer: &mut [u8],
        usage: Usage,
    ) -> VxResult<()> {
        if usage == Usage::ReadWrite {
            return Err(VxError::InvalidParameters(
                "copies are either read-only or write-only".to_string(),
            ));
        }
        let entry = self.entry(array.reference())?;
        self.check_accessible(array.reference(), &entry)?;
        let object = entry.array()?;

        let _hold = usage.writes().then(|| object.lock.hold());
        let mut state = object.state.lock();
        state.check_range(start, end)?;
        let item_size = state.item_size();
        let count = end - start;
        check_user_buffer(buffer.len(), count, stride, item_size)?;
        let items = state.base()?;

        // SAFETY: the range was checked against num_items and the user span
        // against buffer.len().
        unsafe {
            let items = items.add(start * item_size);
            if usage.writes() {
                copy_strided(buffer.as_ptr(), &[stride], items, &[item_size], &[count], item_size);
            } else {
                copy_strided(items, &[item_size], buffer.as_mut_ptr(), &[stride], &[count], item_size);
            }
        }
        entry.header.record_access(usage.reads(), usage.writes());
        Ok(())
    }

    /// Open a copy-style access to items `[start, end)`.
    ///
    /// With [`AccessBuffer::Framework`] the items are staged in a temporary
    /// (pre-filled unless write-only); with [`AccessBuffer::User`] they are
    /// copied into the caller's buffer. Write-capable accesses lock the array
    /// until [`commit_array_range`](Self::commit_array_range).
    pub fn access_array_range<'a>(
        &self,
        array: Array,
        start: usize,
        end: usize,
        mut buffer: AccessBuffer<'a>,
        usage: Usage,
    ) -> VxResult<ArrayAccess<'a>> {
        let entry = self.entry(array.reference())?;
        let object = entry.array()?;
        let info = object.info();
        let count = end.saturating_sub(start);

        let (user_ptr, stride) = match &mut buffer {
            AccessBuffer::Framework => (None, info.item_size),
            AccessBuffer::User { buffer, stride } => {
                check_user_buffer(buffer.len(), count, *stride, info.item_size)?;
                (Some(buffer.as_mut_ptr()), *stride)
            }
        };

        let (id, staging_ptr) = self.open_session(
            SessionTable::Accessors,
            array.reference(),
            &entry,
            &object.lock,
            usage,
            || {
                let mut state = object.state.lock();
                state.check_range(start, end)?;
                let item_size = state.item_size();
                let items = state.base()?;
                // SAFETY: range checked above.
                let items = unsafe { items.add(start * item_size) };
                let (staging, destination) = match user_ptr {
                    Some(ptr) => (None, ptr),
                    None => {
                        let staging = Storage::zeroed(count * item_size)?;
                        let ptr = staging.as_ptr();
                        (Some(staging), ptr)
                    }
                };
                if usage.reads() {
                    // SAFETY: destination is the staging buffer or a user
                    // buffer checked for this count and stride.
                    unsafe {
                        copy_strided(items, &[item_size], destination, &[stride], &[count], item_size)
                    };
                }
                Ok(SessionSetup {
                    region: SessionRegion::Array { start, end },
                    staging,
                    output: destination,
                })
            },
        )?;

        let memory = match buffer {
            AccessBuffer::User { buffer, .. } => AccessMemory::User(buffer),
            AccessBuffer::Framework => AccessMemory::Framework {
                ptr: NonNull::new(staging_ptr).unwrap_or(NonNull::dangling()),
                len: count * info.item_size,
            },
        };
        Ok(ArrayAccess {
            id,
            array,
            usage,
            count,
            item_size: info.item_size,
            stride,
            memory,
        })
    }

    /// Close an access, copying write-capable data back into the array.
    pub fn commit_array_range(&self, array: Array, access: ArrayAccess<'_>) -> VxResult<()> {
        if access.array != array {
            return Err(VxError::InvalidParameters(format!(
                "accessor {} belongs to {}",
                access.id, access.array
            )));
        }
        let entry = self.entry(array.reference())?;
        let object = entry.array()?;
        let source = access.source_ptr();
        self.close_session(
            SessionTable::Accessors,
            access.id,
            array.reference(),
            &object.lock,
            |session| {
                let SessionRegion::Array { start, .. } = session.region else {
                    return Err(VxError::InvalidParameters(format!(
                        "{} is not an array session",
                        access.id
                    )));
                };
                let mut state = object.state.lock();
                let items = state.base()?;
                // SAFETY: the range was validated when the access was opened
                // and the array cannot shrink its storage.
                unsafe {
                    copy_strided(
                        source,
                        &[access.stride],
                        items.add(start * access.item_size),
                        &[access.item_size],
                        &[access.count],
                        access.item_size,
                    );
                }
                Ok(())
            },
        )
    }

    /// Map items `[start, end)` directly.
    ///
    /// The mapping aliases the array's own memory.
    pub fn map_array_range(
        &self,
        array: Array,
        start: usize,
        end: usize,
        usage: Usage,
    ) -> VxResult<Mapping> {
        let entry = self.entry(array.reference())?;
        let object = entry.array()?;
        let (id, (ptr, item_size)) = self.open_session(
            SessionTable::Maps,
            array.reference(),
            &entry,
            &object.lock,
            usage,
            || {
                let mut state = object.state.lock();
                state.check_range(start, end)?;
                let item_size = state.item_size();
                let base = state.base()?;
                Ok(SessionSetup {
                    region: SessionRegion::Array { start, end },
                    staging: None,
                    // SAFETY: range checked above.
                    output: (unsafe { base.add(start * item_size) }, item_size),
                })
            },
        )?;
        let count = end - start;
        Ok(Mapping::new(
            id,
            array.reference(),
            usage,
            ptr,
            count * item_size,
            MapLayout::Linear {
                count,
                item_size,
                stride: item_size,
            },
            true,
        ))
    }

    /// Release a mapping opened by [`map_array_range`](Self::map_array_range).
    pub fn unmap_array_range(&self, array: Array, mapping: Mapping) -> VxResult<()> {
        let entry = self.entry(array.reference())?;
        let object = entry.array()?;
        self.close_session(
            SessionTable::Maps,
            mapping.id(),
            array.reference(),
            &object.lock,
            |_| Ok(()),
        )
    }
}
