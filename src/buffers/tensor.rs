//! Tensors: strided multi-dimensional buffers and zero-copy views.
//!
//! Axis 0 is innermost. A freshly created tensor is compact:
//! `stride[0] = element_size` and `stride[i] = stride[i - 1] * dim[i - 1]`.
//!
//! A view is a tensor over a box of its parent's coordinates. It never owns
//! bytes: it records its root tensor and a byte offset into the root's
//! storage, copies the parent's strides verbatim and shares the root's buffer
//! lock. Each view holds an internal reference on its parent for its whole
//! life, so the root's storage outlives every view built on it.
//!
//! Views over intersecting boxes are allowed and alias the same bytes. Writers
//! on any of them are serialized by the shared lock, but nothing else keeps
//! overlapping views apart.

use crate::core::context::Context;
use crate::core::error::{VxError, VxResult};
use crate::core::memory::{
    copy_strided, strided_span, BufferLock, MapLayout, Mapping, SessionRegion, SessionSetup,
    SessionTable, Storage,
};
use crate::core::reference::{Graph, Handle, NewReference, Object, RefKind, Tensor};
use crate::core::types::{DataType, Usage};
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Tensor object stored in the reference table.
pub(crate) struct TensorObject {
    state: Mutex<TensorState>,
    lock: Arc<BufferLock>,
    /// Open maps whose pointers address this tensor's storage.
    pins: AtomicUsize,
}

#[derive(Debug)]
struct TensorState {
    dims: Vec<usize>,
    strides: Vec<usize>,
    data_type: DataType,
    fixed_point: i8,
    backing: Backing,
    children: Vec<Tensor>,
}

#[derive(Debug)]
enum Backing {
    Unallocated,
    Owned(Storage),
    Imported(Storage),
    View {
        parent: Tensor,
        root: Tensor,
        offset: usize,
    },
}

impl TensorState {
    fn element_size(&self) -> usize {
        self.data_type.size()
    }

    fn span(&self) -> VxResult<usize> {
        strided_span(&self.dims, &self.strides, self.element_size())
    }

    fn is_view(&self) -> bool {
        matches!(self.backing, Backing::View { .. })
    }

    fn root_and_offset(&self) -> Option<(Tensor, usize)> {
        match self.backing {
            Backing::View { root, offset, .. } => Some((root, offset)),
            _ => None,
        }
    }

    /// Base address of a root tensor, allocating on first touch.
    fn root_base(&mut self) -> VxResult<*mut u8> {
        if let Backing::Unallocated = self.backing {
            self.backing = Backing::Owned(Storage::zeroed(self.span()?)?);
        }
        match &self.backing {
            Backing::Owned(storage) | Backing::Imported(storage) => Ok(storage.as_ptr()),
            Backing::Unallocated | Backing::View { .. } => Err(VxError::InvalidParameters(
                "tensor view has no storage of its own".to_string(),
            )),
        }
    }
}

impl TensorObject {
    pub(crate) fn info(&self) -> TensorInfo {
        let state = self.state.lock();
        TensorInfo {
            dims: state.dims.clone(),
            data_type: state.data_type,
            fixed_point_position: state.fixed_point,
            strides: state.strides.clone(),
            is_view: state.is_view(),
        }
    }

    /// Detach from the parent and drop the hold on it.
    pub(crate) fn destruct(&self, ctx: &Context, this: Tensor) -> VxResult<()> {
        let parent = match &self.state.lock().backing {
            Backing::View { parent, .. } => *parent,
            _ => return Ok(()),
        };
        if let Ok(entry) = ctx.entry(parent.reference()) {
            entry.tensor()?.state.lock().children.retain(|c| *c != this);
        }
        ctx.decrement(parent.reference(), RefKind::Internal)?;
        Ok(())
    }
}

/// Attributes of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorInfo {
    /// Extent of each axis, innermost first.
    pub dims: Vec<usize>,
    /// Element type.
    pub data_type: DataType,
    /// Fixed-point position of the elements.
    pub fixed_point_position: i8,
    /// Byte stride of each axis.
    pub strides: Vec<usize>,
    /// Whether the tensor is a view of another tensor.
    pub is_view: bool,
}

impl TensorInfo {
    /// Number of elements.
    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Compact innermost-first strides for `dims`.
///
/// Fails with `InvalidParameters` when a stride does not fit in `usize`.
pub fn compact_strides(dims: &[usize], element_size: usize) -> VxResult<Vec<usize>> {
    let mut strides = Vec::with_capacity(dims.len());
    let mut stride = element_size;
    for (axis, &dim) in dims.iter().enumerate() {
        strides.push(stride);
        if axis + 1 < dims.len() {
            stride = stride.checked_mul(dim).ok_or_else(|| {
                VxError::InvalidParameters(format!("dims {:?} overflow the address space", dims))
            })?;
        }
    }
    Ok(strides)
}

fn check_format(data_type: DataType, fixed_point: i8) -> VxResult<()> {
    match (data_type, fixed_point) {
        (DataType::Int16, 8) | (DataType::Int8, 0) | (DataType::UInt8, 0) => Ok(()),
        _ => Err(VxError::InvalidParameters(format!(
            "unsupported tensor format {} with fixed point {}",
            data_type, fixed_point
        ))),
    }
}

/// Resolved patch box: full-rank start and extents.
struct Patch {
    start: Vec<usize>,
    extents: Vec<usize>,
}

/// Check a patch against `dims`. Axes past `start.len()` cover their whole
/// extent.
fn check_patch(dims: &[usize], start: &[usize], end: &[usize]) -> VxResult<Patch> {
    if start.len() != end.len() || start.is_empty() || start.len() > dims.len() {
        return Err(VxError::InvalidParameters(format!(
            "patch of rank {}/{} on a tensor of rank {}",
            start.len(),
            end.len(),
            dims.len()
        )));
    }
    let mut patch = Patch {
        start: Vec::with_capacity(dims.len()),
        extents: Vec::with_capacity(dims.len()),
    };
    for (axis, &dim) in dims.iter().enumerate() {
        let (s, e) = match (start.get(axis), end.get(axis)) {
            (Some(&s), Some(&e)) => (s, e),
            _ => (0, dim),
        };
        if s >= e || e > dim {
            return Err(VxError::InvalidParameters(format!(
                "axis {}: [{}, {}) outside [0, {})",
                axis, s, e, dim
            )));
        }
        patch.start.push(s);
        patch.extents.push(e - s);
    }
    Ok(patch)
}

fn offset_of(start: &[usize], strides: &[usize]) -> usize {
    start.iter().zip(strides).map(|(s, stride)| s * stride).sum()
}

impl Context {
    fn check_dims(&self, dims: &[usize]) -> VxResult<()> {
        if dims.is_empty() || dims.len() > self.config().max_tensor_dims {
            return Err(VxError::InvalidParameters(format!(
                "tensor rank {} outside 1..={}",
                dims.len(),
                self.config().max_tensor_dims
            )));
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(VxError::InvalidParameters(format!("zero extent in {:?}", dims)));
        }
        Ok(())
    }

    fn new_tensor_object(
        &self,
        dims: &[usize],
        data_type: DataType,
        fixed_point: i8,
    ) -> VxResult<TensorObject> {
        self.check_dims(dims)?;
        check_format(data_type, fixed_point)?;
        let strides = compact_strides(dims, data_type.size())?;
        strided_span(dims, &strides, data_type.size())?;
        Ok(TensorObject {
            state: Mutex::new(TensorState {
                dims: dims.to_vec(),
                strides,
                data_type,
                fixed_point,
                backing: Backing::Unallocated,
                children: Vec::new(),
            }),
            lock: Arc::new(BufferLock::new()),
            pins: AtomicUsize::new(0),
        })
    }

    /// Create a compact tensor. Storage is allocated on first touch.
    pub fn create_tensor(
        &self,
        dims: &[usize],
        data_type: DataType,
        fixed_point_position: i8,
    ) -> VxResult<Tensor> {
        let object = self.new_tensor_object(dims, data_type, fixed_point_position)?;
        let reference = self.create_reference(NewReference::external(Object::Tensor(object)))?;
        debug!("tensor {} {:?} of {}", reference, dims, data_type);
        Ok(Tensor::wrap(reference))
    }

    /// Create a virtual tensor scoped to `graph`.
    pub fn create_virtual_tensor(
        &self,
        graph: Graph,
        dims: &[usize],
        data_type: DataType,
        fixed_point_position: i8,
    ) -> VxResult<Tensor> {
        self.entry(graph.reference())?.graph()?;
        let object = self.new_tensor_object(dims, data_type, fixed_point_position)?;
        let reference =
            self.create_reference(NewReference::virtual_in(Object::Tensor(object), graph))?;
        Ok(Tensor::wrap(reference))
    }

    /// Wrap host memory as a tensor.
    ///
    /// `strides[0]` must equal the element size and `memory` must cover every
    /// addressed element.
    pub fn create_tensor_from_handle(
        &self,
        dims: &[usize],
        data_type: DataType,
        fixed_point_position: i8,
        strides: &[usize],
        memory: Vec<u8>,
    ) -> VxResult<Tensor> {
        let object = self.new_tensor_object(dims, data_type, fixed_point_position)?;
        if strides.len() != dims.len() {
            return Err(VxError::InvalidParameters(format!(
                "{} strides for {} dims",
                strides.len(),
                dims.len()
            )));
        }
        if strides[0] != data_type.size() {
            return Err(VxError::InvalidValue(format!(
                "innermost stride {} differs from element size {}",
                strides[0],
                data_type.size()
            )));
        }
        let needed = strided_span(dims, strides, data_type.size())?;
        if memory.len() < needed {
            return Err(VxError::InvalidParameters(format!(
                "{} bytes imported, {} addressed",
                memory.len(),
                needed
            )));
        }
        {
            let mut state = object.state.lock();
            state.strides = strides.to_vec();
            state.backing = Backing::Imported(Storage::from_vec(memory));
        }
        let reference = self.create_reference(NewReference::external(Object::Tensor(object)))?;
        Ok(Tensor::wrap(reference))
    }

    /// Replace the memory behind a tensor, returning the previous memory.
    ///
    /// Passing `None` detaches the memory; the tensor allocates fresh zeroed
    /// storage on its next touch. Not supported on views, on tensors that
    /// have live views, or while an access or map is open.
    pub fn swap_tensor_handle(
        &self,
        tensor: Tensor,
        new_memory: Option<Vec<u8>>,
    ) -> VxResult<Option<Vec<u8>>> {
        let entry = self.entry(tensor.reference())?;
        let object = entry.tensor()?;

        let _hold = object.lock.hold();
        let mut state = object.state.lock();
        if object.pins.load(Ordering::SeqCst) > 0 || self.open_sessions_on(tensor.reference()) > 0 {
            return Err(VxError::NotSupported(format!("{} is mapped", tensor)));
        }
        if state.is_view() || !state.children.is_empty() {
            return Err(VxError::NotSupported(format!(
                "{} takes part in a view hierarchy",
                tensor
            )));
        }
        let replacement = match new_memory {
            Some(memory) => {
                let needed = state.span()?;
                if memory.len() < needed {
                    return Err(VxError::InvalidParameters(format!(
                        "{} bytes supplied, {} addressed",
                        memory.len(),
                        needed
                    )));
                }
                Backing::Imported(Storage::from_vec(memory))
            }
            None => Backing::Unallocated,
        };
        let previous = std::mem::replace(&mut state.backing, replacement);
        Ok(match previous {
            Backing::Owned(storage) | Backing::Imported(storage) => Some(storage.into_vec()),
            Backing::Unallocated | Backing::View { .. } => None,
        })
    }

    /// Create a view over `[start, end)` of `tensor`.
    ///
    /// Requires `start[i] < end[i] <= dims[i]` on every axis. The root tensor
    /// is allocated if it has not been touched yet.
    pub fn create_tensor_view(
        &self,
        tensor: Tensor,
        start: &[usize],
        end: &[usize],
    ) -> VxResult<Tensor> {
        let entry = self.entry(tensor.reference())?;
        let parent = entry.tensor()?;

        let view = {
            let mut state = parent.state.lock();
            if start.len() != state.dims.len() {
                return Err(VxError::InvalidParameters(format!(
                    "view rank {} on a tensor of rank {}",
                    start.len(),
                    state.dims.len()
                )));
            }
            let patch = check_patch(&state.dims, start, end)?;
            if state.children.len() >= self.config().max_views_per_tensor {
                return Err(VxError::NoResources(format!(
                    "{} already has {} views",
                    tensor,
                    state.children.len()
                )));
            }
            let (root, base_offset) = match state.root_and_offset() {
                Some(found) => found,
                None => {
                    state.root_base()?;
                    (tensor, 0)
                }
            };
            TensorObject {
                state: Mutex::new(TensorState {
                    dims: patch.extents,
                    strides: state.strides.clone(),
                    data_type: state.data_type,
                    fixed_point: state.fixed_point,
                    backing: Backing::View {
                        parent: tensor,
                        root,
                        offset: base_offset + offset_of(&patch.start, &state.strides),
                    },
                    children: Vec::new(),
                }),
                lock: Arc::clone(&parent.lock),
                pins: AtomicUsize::new(0),
            }
        };

        self.increment(tensor.reference(), RefKind::Internal)?;
        let reference = match self.create_reference(NewReference::external(Object::Tensor(view))) {
            Ok(reference) => Tensor::wrap(reference),
            Err(e) => {
                self.decrement(tensor.reference(), RefKind::Internal)?;
                return Err(e);
            }
        };
        parent.state.lock().children.push(reference);
        debug!("view {} of {} over {:?}..{:?}", reference, tensor, start, end);
        Ok(reference)
    }

    /// Attributes of a tensor.
    pub fn query_tensor(&self, tensor: Tensor) -> VxResult<TensorInfo> {
        Ok(self.entry(tensor.reference())?.tensor()?.info())
    }

    /// Refuse access through a view whose root is virtual and not accessible.
    fn check_view_root(&self, state: &TensorState) -> VxResult<()> {
        if let Some((root, _)) = state.root_and_offset() {
            let entry = self.entry(root.reference())?;
            self.check_accessible(root.reference(), &entry)?;
        }
        Ok(())
    }

    /// Base address of the bytes `state` addresses.
    fn tensor_base(&self, state: &mut TensorState) -> VxResult<*mut u8> {
        match state.root_and_offset() {
            None => state.root_base(),
            Some((root, offset)) => {
                let entry = self.entry(root.reference())?;
                let base = entry.tensor()?.state.lock().root_base()?;
                // SAFETY: offset was checked against the parent extents when
                // the view was created; root storage cannot be swapped while
                // views exist.
                Ok(unsafe { base.add(offset) })
            }
        }
    }

    /// Map the patch `[start, end)`.
    ///
    /// The mapping aliases the tensor's storage when the patch is laid out
    /// compactly in it; otherwise it is a packed copy, written back on unmap
    /// for write-capable usage.
    pub fn map_tensor_patch(
        &self,
        tensor: Tensor,
        start: &[usize],
        end: &[usize],
        usage: Usage,
    ) -> VxResult<Mapping> {
        let entry = self.entry(tensor.reference())?;
        let object = entry.tensor()?;
        // Pinned before the storage pointer is taken so a concurrent swap
        // cannot replace the backing under the mapping.
        object.pins.fetch_add(1, Ordering::SeqCst);
        let opened = self.open_session(
            SessionTable::Maps,
            tensor.reference(),
            &entry,
            &object.lock,
            usage,
            || {
                let mut state = object.state.lock();
                self.check_view_root(&state)?;
                let patch = check_patch(&state.dims, start, end)?;
                let element_size = state.element_size();
                let packed = compact_strides(&patch.extents, element_size)?;
                let base = self.tensor_base(&mut state)?;
                // SAFETY: patch bounds were checked against dims.
                let origin = unsafe { base.add(offset_of(&patch.start, &state.strides)) };
                let region = SessionRegion::Tensor {
                    start: patch.start.clone(),
                    end: patch.start.iter().zip(&patch.extents).map(|(s, e)| s + e).collect(),
                };

                let zero_copy = patch
                    .extents
                    .iter()
                    .zip(packed.iter().zip(&state.strides))
                    .all(|(&extent, (p, s))| extent == 1 || p == s);
                let len = patch.extents.iter().product::<usize>() * element_size;
                let layout = MapLayout::Strided {
                    dims: patch.extents.clone(),
                    strides: packed.clone(),
                    element_size,
                };
                if zero_copy {
                    return Ok(SessionSetup {
                        region,
                        staging: None,
                        output: (origin, len, layout, true),
                    });
                }

                let staging = Storage::zeroed(len)?;
                if usage.reads() {
                    // SAFETY: origin spans the patch; staging holds it packed.
                    unsafe {
                        copy_strided(
                            origin,
                            &state.strides,
                            staging.as_ptr(),
                            &packed,
                            &patch.extents,
                            element_size,
                        )
                    };
                }
                let ptr = staging.as_ptr();
                Ok(SessionSetup {
                    region,
                    staging: Some(staging),
                    output: (ptr, len, layout, false),
                })
            },
        );
        let (id, (ptr, len, layout, zero_copy)) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                object.pins.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        Ok(Mapping::new(
            id,
            tensor.reference(),
            usage,
            ptr,
            len,
            layout,
            zero_copy,
        ))
    }

    /// Release a mapping opened by [`map_tensor_patch`](Self::map_tensor_patch).
    pub fn unmap_tensor_patch(&self, tensor: Tensor, mapping: Mapping) -> VxResult<()> {
        let entry = self.entry(tensor.reference())?;
        let object = entry.tensor()?;
        let pinned = self.session_is_open(SessionTable::Maps, mapping.id(), tensor.reference());
        let result = self.close_session(
            SessionTable::Maps,
            mapping.id(),
            tensor.reference(),
            &object.lock,
            |session| {
                let (Some(staging), SessionRegion::Tensor { start, end }) =
                    (&session.staging, &session.region)
                else {
                    return Ok(());
                };
                let mut state = object.state.lock();
                let element_size = state.element_size();
                let extents: Vec<usize> = start.iter().zip(end).map(|(s, e)| e - s).collect();
                let base = self.tensor_base(&mut state)?;
                // SAFETY: the region was validated when the map was opened.
                unsafe {
                    copy_strided(
                        staging.as_ptr(),
                        &compact_strides(&extents, element_size)?,
                        base.add(offset_of(start, &state.strides)),
                        &state.strides,
                        &extents,
                        element_size,
                    );
                }
                Ok(())
            },
        );
        if pinned {
            object.pins.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    /// Copy the patch `[start, end)` into or out of `buffer`.
    ///
    /// `user_strides` gives the byte stride of each patch axis in `buffer`.
    /// `ReadOnly` copies out of the tensor, `WriteOnly` copies into it.
    pub fn copy_tensor_patch(
        &self,
        tensor: Tensor,
        start: &[usize],
        end: &[usize],
        user_strides: &[usize],
        buffer: &mut [u8],
        usage: Usage,
    ) -> VxResult<()> {
        if usage == Usage::ReadWrite {
            return Err(VxError::InvalidParameters(
                "copies are either read-only or write-only".to_string(),
            ));
        }
        let entry = self.entry(tensor.reference())?;
        self.check_accessible(tensor.reference(), &entry)?;
        let object = entry.tensor()?;

        let _hold = usage.writes().then(|| object.lock.hold());
        let mut state = object.state.lock();
        self.check_view_root(&state)?;
        let patch = check_patch(&state.dims, start, end)?;
        let element_size = state.element_size();
        let mut strides = user_strides.to_vec();
        if strides.len() != start.len() || strides[0] < element_size {
            return Err(VxError::InvalidParameters(format!(
                "user strides {:?} do not describe a patch of rank {}",
                user_strides,
                start.len()
            )));
        }
        // trailing full-extent axes continue packed after the last user axis
        while strides.len() < patch.extents.len() {
            let axis = strides.len() - 1;
            let next = strides[axis].checked_mul(patch.extents[axis]).ok_or_else(|| {
                VxError::InvalidParameters(format!("user strides {:?} overflow", user_strides))
            })?;
            strides.push(next);
        }
        if buffer.len() < strided_span(&patch.extents, &strides, element_size)? {
            return Err(VxError::InvalidParameters(format!(
                "buffer of {} bytes too small for the patch",
                buffer.len()
            )));
        }
        let base = self.tensor_base(&mut state)?;
        // SAFETY: patch checked against dims and buffer against its span.
        unsafe {
            let origin = base.add(offset_of(&patch.start, &state.strides));
            if usage.writes() {
                copy_strided(buffer.as_ptr(), &strides, origin, &state.strides, &patch.extents, element_size);
            } else {
                copy_strided(origin, &state.strides, buffer.as_mut_ptr(), &strides, &patch.extents, element_size);
            }
        }
        entry.header.record_access(usage.reads(), usage.writes());
        Ok(())
    }
}
