//! Kernel descriptors and their registration protocol.
//!
//! A kernel is built in three steps: it is registered with its entry point
//! and validator, each parameter slot is declared with
//! [`Context::add_kernel_parameter`], and [`Context::finalize_kernel`] checks
//! the signature and publishes the kernel for lookup. After that the
//! descriptor is immutable.
//!
//! The registry of the kernel's backend holds an internal reference, the
//! caller an external one. Nodes built from the kernel add internal
//! references of their own.

use crate::buffers::scalar::ScalarValue;
use crate::core::context::Context;
use crate::core::error::{VxError, VxResult};
use crate::core::reference::{Handle, Kernel, NewReference, Node, Object, RefKind, Reference};
use crate::core::types::{BorderMode, DataType, Direction, ImageFormat, ParameterState, ParameterType};
use crate::kernels::registry::RegistryEntry;
use crate::tiling::region::{Neighborhood, TileBlock};
use crate::tiling::tile::TileParameter;
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Backend of kernels registered without a `backend:` prefix.
pub const DEFAULT_BACKEND: &str = "host.any";

/// Backend of tiling kernels registered without a `backend:` prefix.
pub const TILING_BACKEND: &str = "host.tiling";

// ============================================================================
// Entry points and validators
// ============================================================================

/// Plain entry point: called once per node execution with the bound
/// arguments.
pub type KernelFunction =
    Arc<dyn Fn(&Context, Node, &[Option<Reference>]) -> VxResult<()> + Send + Sync>;

/// Tile entry point: called once per tile with one record per parameter and
/// the node's scratch memory.
pub type TileFunction = Arc<dyn Fn(&mut [TileParameter], &mut [u8]) -> VxResult<()> + Send + Sync>;

/// Whole-signature validator: sees every argument and fills the output
/// meta formats.
pub type ValidateFn = Arc<
    dyn Fn(&Context, Node, &[Option<Reference>], &mut [MetaFormat]) -> VxResult<()> + Send + Sync,
>;

/// Per-parameter input validator, called with the slot index.
pub type InputValidateFn = Arc<dyn Fn(&Context, Node, usize) -> VxResult<()> + Send + Sync>;

/// Per-parameter output validator, called with the slot index.
pub type OutputValidateFn =
    Arc<dyn Fn(&Context, Node, usize, &mut MetaFormat) -> VxResult<()> + Send + Sync>;

/// How graph verification checks a node's arguments.
#[derive(Clone)]
pub enum KernelValidator {
    /// One call covering the whole signature.
    Whole(ValidateFn),
    /// One call per input slot and one per output slot.
    PerParameter {
        /// Checks an input or bidirectional slot.
        input: InputValidateFn,
        /// Describes an output slot.
        output: OutputValidateFn,
    },
}

impl KernelValidator {
    /// A whole-signature validator.
    pub fn whole<F>(f: F) -> Self
    where
        F: Fn(&Context, Node, &[Option<Reference>], &mut [MetaFormat]) -> VxResult<()>
            + Send
            + Sync
            + 'static,
    {
        KernelValidator::Whole(Arc::new(f))
    }

    /// A pair of per-parameter validators.
    pub fn per_parameter<I, O>(input: I, output: O) -> Self
    where
        I: Fn(&Context, Node, usize) -> VxResult<()> + Send + Sync + 'static,
        O: Fn(&Context, Node, usize, &mut MetaFormat) -> VxResult<()> + Send + Sync + 'static,
    {
        KernelValidator::PerParameter {
            input: Arc::new(input),
            output: Arc::new(output),
        }
    }

    /// Build from optional parts: exactly one of the whole validator or the
    /// complete input and output pair must be given.
    pub fn from_parts(
        whole: Option<ValidateFn>,
        input: Option<InputValidateFn>,
        output: Option<OutputValidateFn>,
    ) -> VxResult<Self> {
        match (whole, input, output) {
            (Some(whole), None, None) => Ok(KernelValidator::Whole(whole)),
            (None, Some(input), Some(output)) => Ok(KernelValidator::PerParameter { input, output }),
            (whole, input, output) => Err(VxError::InvalidParameters(format!(
                "validator needs either a whole validator or an input/output pair \
                 (whole: {}, input: {}, output: {})",
                whole.is_some(),
                input.is_some(),
                output.is_some()
            ))),
        }
    }
}

impl fmt::Debug for KernelValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelValidator::Whole(_) => f.write_str("Whole(<fn>)"),
            KernelValidator::PerParameter { .. } => f.write_str("PerParameter(<fn>, <fn>)"),
        }
    }
}

/// Tile entry points of a tiling kernel.
#[derive(Clone)]
pub enum TileEntry {
    /// Unchecked entry only; runs only on tiles whose halo fits the image.
    Fast(TileFunction),
    /// Boundary-aware entry only.
    Flexible(TileFunction),
    /// Both conventions.
    Both {
        /// Unchecked entry.
        fast: TileFunction,
        /// Boundary-aware entry.
        flexible: TileFunction,
    },
}

impl TileEntry {
    /// The unchecked entry, if any.
    pub fn fast(&self) -> Option<&TileFunction> {
        match self {
            TileEntry::Fast(f) | TileEntry::Both { fast: f, .. } => Some(f),
            TileEntry::Flexible(_) => None,
        }
    }

    /// The boundary-aware entry, if any.
    pub fn flexible(&self) -> Option<&TileFunction> {
        match self {
            TileEntry::Flexible(f) | TileEntry::Both { flexible: f, .. } => Some(f),
            TileEntry::Fast(_) => None,
        }
    }
}

impl fmt::Debug for TileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileEntry::Fast(_) => f.write_str("Fast"),
            TileEntry::Flexible(_) => f.write_str("Flexible"),
            TileEntry::Both { .. } => f.write_str("Both"),
        }
    }
}

/// What a node execution calls.
#[derive(Clone)]
pub(crate) enum KernelEntry {
    Plain(KernelFunction),
    Tiled(TileEntry),
}

// ============================================================================
// Meta formats
// ============================================================================

/// Description of an output object produced by a validator.
///
/// Verification uses it to size virtual outputs and to check real ones.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub enum MetaFormat {
    /// The validator said nothing about this slot.
    #[default]
    Unset,
    /// An array of `capacity` items.
    Array {
        /// Item type.
        item_type: DataType,
        /// Maximum item count.
        capacity: usize,
    },
    /// An image.
    Image {
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
        /// Pixel format.
        format: ImageFormat,
    },
    /// A tensor.
    Tensor {
        /// Extent of each axis.
        dims: Vec<usize>,
        /// Element type.
        data_type: DataType,
        /// Fixed-point position.
        fixed_point_position: i8,
    },
    /// A scalar.
    Scalar {
        /// Value type.
        data_type: DataType,
    },
}

impl MetaFormat {
    /// Describe an array output.
    pub fn set_array(&mut self, item_type: DataType, capacity: usize) {
        *self = MetaFormat::Array { item_type, capacity };
    }

    /// Describe an image output.
    pub fn set_image(&mut self, width: u32, height: u32, format: ImageFormat) {
        *self = MetaFormat::Image { width, height, format };
    }

    /// Describe a tensor output.
    pub fn set_tensor(&mut self, dims: &[usize], data_type: DataType, fixed_point_position: i8) {
        *self = MetaFormat::Tensor {
            dims: dims.to_vec(),
            data_type,
            fixed_point_position,
        };
    }

    /// Describe a scalar output.
    pub fn set_scalar(&mut self, data_type: DataType) {
        *self = MetaFormat::Scalar { data_type };
    }
}

// ============================================================================
// Signature and attributes
// ============================================================================

/// One declared parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParameterInfo {
    /// Data flow direction.
    pub direction: Direction,
    /// Accepted object type.
    pub ty: ParameterType,
    /// Whether the slot must be bound.
    pub state: ParameterState,
}

/// Attributes a node copies from its kernel and may override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KernelAttributes {
    /// Bytes of scratch memory handed to each call.
    pub local_data_size: usize,
    /// Pixels read beyond each side of a tile.
    pub neighborhood: Neighborhood,
    /// Largest tile produced per call.
    pub tile_block: TileBlock,
    /// Border handling.
    pub border: BorderMode,
}

impl KernelAttributes {
    pub(crate) fn with_tile_block(tile_block: TileBlock) -> Self {
        Self {
            local_data_size: 0,
            neighborhood: Neighborhood::default(),
            tile_block,
            border: BorderMode::Undefined,
        }
    }

    /// Apply one attribute change.
    pub(crate) fn apply(&mut self, attribute: KernelAttribute) -> VxResult<()> {
        match attribute {
            KernelAttribute::LocalDataSize(size) => self.local_data_size = size,
            KernelAttribute::Neighborhood(halo) => self.neighborhood = halo,
            KernelAttribute::TileBlockSize(block) => {
                if block.is_empty() {
                    return Err(VxError::InvalidValue(format!("empty tile block {:?}", block)));
                }
                self.tile_block = block;
            }
            KernelAttribute::Border(mode) => {
                check_tile_border(mode)?;
                self.border = mode;
            }
        }
        Ok(())
    }
}

/// Borders a kernel or node may declare.
pub(crate) fn check_tile_border(mode: BorderMode) -> VxResult<()> {
    match mode {
        BorderMode::Undefined | BorderMode::SelfManaged => Ok(()),
        other => Err(VxError::InvalidValue(format!(
            "border {:?} is not supported; use undefined or self-managed",
            other
        ))),
    }
}

/// A settable kernel or node attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelAttribute {
    /// Scratch bytes per call.
    LocalDataSize(usize),
    /// Tile halo.
    Neighborhood(Neighborhood),
    /// Tile block size.
    TileBlockSize(TileBlock),
    /// Border mode.
    Border(BorderMode),
}

/// Public description of a kernel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelInfo {
    /// Full name, including any backend prefix.
    pub name: String,
    /// Numeric id.
    pub id: u32,
    /// Number of parameter slots.
    pub parameter_count: usize,
    /// Current attributes.
    pub attributes: KernelAttributes,
    /// Finalized and available for lookup.
    pub enabled: bool,
    /// Registered by the host rather than shipped with a backend.
    pub user_kernel: bool,
    /// Backend holding the kernel.
    pub backend: String,
    /// Whether the kernel runs through tile entry points.
    pub tiled: bool,
}

// ============================================================================
// Kernel object
// ============================================================================

pub(crate) struct KernelObject {
    name: String,
    id: u32,
    backend: String,
    user_kernel: bool,
    entry: KernelEntry,
    validator: KernelValidator,
    state: Mutex<KernelState>,
}

struct KernelState {
    signature: Vec<Option<ParameterInfo>>,
    attributes: KernelAttributes,
    enabled: bool,
}

impl KernelObject {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn entry(&self) -> &KernelEntry {
        &self.entry
    }

    pub(crate) fn validator(&self) -> &KernelValidator {
        &self.validator
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub(crate) fn attributes(&self) -> KernelAttributes {
        self.state.lock().attributes
    }

    pub(crate) fn parameter_count(&self) -> usize {
        self.state.lock().signature.len()
    }

    /// Declared slots; complete once the kernel is finalized.
    pub(crate) fn signature(&self) -> Vec<Option<ParameterInfo>> {
        self.state.lock().signature.clone()
    }

    fn info(&self) -> KernelInfo {
        let state = self.state.lock();
        KernelInfo {
            name: self.name.clone(),
            id: self.id,
            parameter_count: state.signature.len(),
            attributes: state.attributes,
            enabled: state.enabled,
            user_kernel: self.user_kernel,
            backend: self.backend.clone(),
            tiled: matches!(self.entry, KernelEntry::Tiled(_)),
        }
    }
}

/// Split `backend:name`, falling back to `default_backend`.
fn backend_of<'a>(name: &'a str, default_backend: &'a str) -> &'a str {
    match name.split_once(':') {
        Some((backend, _)) if !backend.is_empty() => backend,
        _ => default_backend,
    }
}

/// Kernel definition before it enters the table.
struct KernelDefinition {
    name: String,
    id: u32,
    entry: KernelEntry,
    parameter_count: usize,
    validator: KernelValidator,
    user_kernel: bool,
    default_backend: &'static str,
}

impl Context {
    fn register(&self, definition: KernelDefinition) -> VxResult<Kernel> {
        let KernelDefinition {
            name,
            id,
            entry,
            parameter_count,
            validator,
            user_kernel,
            default_backend,
        } = definition;
        if name.is_empty() {
            return Err(VxError::InvalidParameters("kernel name is empty".to_string()));
        }
        if parameter_count > self.config().max_parameters {
            return Err(VxError::InvalidParameters(format!(
                "{} parameters exceed the maximum of {}",
                parameter_count,
                self.config().max_parameters
            )));
        }
        let backend = backend_of(&name, default_backend).to_string();
        self.kernels.lock().check_room(&backend, &name)?;

        let object = KernelObject {
            name: name.clone(),
            id,
            backend: backend.clone(),
            user_kernel,
            entry,
            validator,
            state: Mutex::new(KernelState {
                signature: vec![None; parameter_count],
                attributes: KernelAttributes::with_tile_block(self.config().default_tile_block),
                enabled: false,
            }),
        };
        let reference = self.create_reference(NewReference::internal(Object::Kernel(object)))?;
        let kernel = Kernel::wrap(reference);
        let inserted = self.kernels.lock().insert(
            &backend,
            &name,
            RegistryEntry::new(kernel, id),
        );
        if let Err(e) = inserted {
            self.decrement(reference, RefKind::Internal)?;
            return Err(e);
        }
        self.increment(reference, RefKind::External)?;
        debug!("registered kernel {} ({}) on {} as {}", name, id, backend, kernel);
        Ok(kernel)
    }

    /// Register a host kernel with a plain entry point.
    ///
    /// A `backend:` prefix in `name` selects the backend; otherwise the kernel
    /// lands in [`DEFAULT_BACKEND`]. The kernel is not usable until its
    /// parameters are declared and it is finalized.
    pub fn register_kernel(
        &self,
        name: &str,
        id: u32,
        function: KernelFunction,
        parameter_count: usize,
        validator: KernelValidator,
    ) -> VxResult<Kernel> {
        self.register(KernelDefinition {
            name: name.to_string(),
            id,
            entry: KernelEntry::Plain(function),
            parameter_count,
            validator,
            user_kernel: true,
            default_backend: DEFAULT_BACKEND,
        })
    }

    /// Register a kernel that ships with its backend. Such kernels cannot be
    /// removed.
    pub fn register_library_kernel(
        &self,
        name: &str,
        id: u32,
        function: KernelFunction,
        parameter_count: usize,
        validator: KernelValidator,
    ) -> VxResult<Kernel> {
        self.register(KernelDefinition {
            name: name.to_string(),
            id,
            entry: KernelEntry::Plain(function),
            parameter_count,
            validator,
            user_kernel: false,
            default_backend: DEFAULT_BACKEND,
        })
    }

    /// Register a kernel that runs once per image tile.
    ///
    /// Tiling kernels accept only image and scalar parameters and default to
    /// the [`TILING_BACKEND`] backend.
    pub fn add_tiling_kernel(
        &self,
        name: &str,
        id: u32,
        entry: TileEntry,
        parameter_count: usize,
        validator: KernelValidator,
    ) -> VxResult<Kernel> {
        self.register(KernelDefinition {
            name: name.to_string(),
            id,
            entry: KernelEntry::Tiled(entry),
            parameter_count,
            validator,
            user_kernel: true,
            default_backend: TILING_BACKEND,
        })
    }

    /// Declare parameter slot `index`. Only allowed before finalize.
    pub fn add_kernel_parameter(
        &self,
        kernel: Kernel,
        index: usize,
        direction: Direction,
        ty: ParameterType,
        state: ParameterState,
    ) -> VxResult<()> {
        let entry = self.entry(kernel.reference())?;
        let object = entry.kernel()?;
        if matches!(object.entry, KernelEntry::Tiled(_))
            && !matches!(ty, ParameterType::Image | ParameterType::Scalar)
        {
            return Err(VxError::InvalidParameters(format!(
                "tiling kernel {} cannot take a {} parameter",
                object.name, ty
            )));
        }
        let mut kernel_state = object.state.lock();
        if kernel_state.enabled {
            return Err(VxError::NotSupported(format!("{} is finalized", object.name)));
        }
        let count = kernel_state.signature.len();
        let slot = kernel_state.signature.get_mut(index).ok_or_else(|| {
            VxError::InvalidParameters(format!("parameter {} of {} slots", index, count))
        })?;
        *slot = Some(ParameterInfo {
            direction,
            ty,
            state,
        });
        Ok(())
    }

    /// Check the signature and publish the kernel for lookup.
    pub fn finalize_kernel(&self, kernel: Kernel) -> VxResult<()> {
        let entry = self.entry(kernel.reference())?;
        let object = entry.kernel()?;
        {
            let mut state = object.state.lock();
            if state.enabled {
                return Err(VxError::NotSupported(format!("{} is already finalized", object.name)));
            }
            if let Some(missing) = state.signature.iter().position(Option::is_none) {
                return Err(VxError::InvalidParameters(format!(
                    "{} parameter {} was never declared",
                    object.name, missing
                )));
            }
            state.enabled = true;
        }
        let unique = self.kernels.lock().enable(kernel);
        debug!(
            "finalized kernel {} with {} parameters (unique id: {})",
            object.name,
            object.parameter_count(),
            unique
        );
        Ok(())
    }

    /// Change an attribute. Only allowed before finalize.
    pub fn set_kernel_attribute(&self, kernel: Kernel, attribute: KernelAttribute) -> VxResult<()> {
        let entry = self.entry(kernel.reference())?;
        let object = entry.kernel()?;
        let mut state = object.state.lock();
        if state.enabled {
            return Err(VxError::NotSupported(format!("{} is finalized", object.name)));
        }
        state.attributes.apply(attribute)
    }

    /// Describe a kernel.
    pub fn query_kernel(&self, kernel: Kernel) -> VxResult<KernelInfo> {
        Ok(self.entry(kernel.reference())?.kernel()?.info())
    }

    /// Declared parameter slot `index` of a kernel.
    pub fn kernel_parameter(&self, kernel: Kernel, index: usize) -> VxResult<Option<ParameterInfo>> {
        let entry = self.entry(kernel.reference())?;
        let signature = entry.kernel()?.signature();
        signature.get(index).copied().ok_or_else(|| {
            VxError::InvalidParameters(format!("parameter {} of {} slots", index, signature.len()))
        })
    }

    /// Find a finalized kernel by full or unprefixed name. The caller receives
    /// an external reference.
    pub fn get_kernel_by_name(&self, name: &str) -> VxResult<Kernel> {
        let kernel = self
            .kernels
            .lock()
            .find_by_name(name)
            .ok_or_else(|| VxError::InvalidParameters(format!("no kernel named {}", name)))?;
        self.increment(kernel.reference(), RefKind::External)?;
        Ok(kernel)
    }

    /// Find a finalized kernel by id. The caller receives an external
    /// reference.
    pub fn get_kernel_by_id(&self, id: u32) -> VxResult<Kernel> {
        let kernel = self
            .kernels
            .lock()
            .find_by_id(id)
            .ok_or_else(|| VxError::InvalidParameters(format!("no kernel with id {}", id)))?;
        self.increment(kernel.reference(), RefKind::External)?;
        Ok(kernel)
    }

    /// Unregister a host kernel and drop the caller's reference.
    ///
    /// Nodes still built from the kernel keep it alive.
    pub fn remove_kernel(&self, kernel: Kernel) -> VxResult<()> {
        let entry = self.entry(kernel.reference())?;
        let object = entry.kernel()?;
        if !object.user_kernel {
            return Err(VxError::InvalidParameters(format!(
                "{} ships with {} and cannot be removed",
                object.name, object.backend
            )));
        }
        self.kernels.lock().remove(&object.backend, &object.name)?;
        // The registry's internal hold keeps the kernel alive until last.
        if self.query_reference(kernel)?.external_count > 0 {
            self.decrement(kernel.reference(), RefKind::External)?;
        }
        self.decrement(kernel.reference(), RefKind::Internal)?;
        debug!("removed kernel {}", object.name);
        Ok(())
    }

    /// Number of finalized kernels.
    pub fn num_kernels(&self) -> usize {
        self.kernels.lock().num_kernels()
    }

    /// Number of distinct ids among finalized kernels.
    pub fn num_unique_kernels(&self) -> usize {
        self.kernels.lock().num_unique_kernels()
    }

    /// Names of every backend with registered kernels, in registration order.
    pub fn kernel_backends(&self) -> Vec<String> {
        self.kernels.lock().backend_names()
    }
}

/// Read the scalar bound at `index`, for use inside entry points and
/// validators.
pub fn scalar_argument(ctx: &Context, args: &[Option<Reference>], index: usize) -> VxResult<ScalarValue> {
    let reference = args
        .get(index)
        .copied()
        .flatten()
        .ok_or_else(|| VxError::InvalidParameters(format!("argument {} is unbound", index)))?;
    let scalar = reference
        .downcast()
        .ok_or_else(|| VxError::invalid_type("scalar", reference.ty()))?;
    ctx.read_scalar(scalar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ContextConfig;
    use crate::core::error::Status;

    fn noop() -> KernelFunction {
        Arc::new(|_: &Context, _: Node, _: &[Option<Reference>]| Ok(()))
    }

    fn accept_all() -> KernelValidator {
        KernelValidator::whole(|_: &Context, _: Node, _: &[Option<Reference>], _: &mut [MetaFormat]| Ok(()))
    }

    fn two_slot_kernel(ctx: &Context, name: &str, id: u32) -> Kernel {
        let kernel = ctx.register_kernel(name, id, noop(), 2, accept_all()).unwrap();
        ctx.add_kernel_parameter(kernel, 0, Direction::Input, ParameterType::Array, ParameterState::Required)
            .unwrap();
        ctx.add_kernel_parameter(kernel, 1, Direction::Output, ParameterType::Array, ParameterState::Required)
            .unwrap();
        kernel
    }

    #[test]
    fn test_validator_parts_must_be_exclusive() {
        let whole: ValidateFn = Arc::new(|_: &Context, _: Node, _: &[Option<Reference>], _: &mut [MetaFormat]| Ok(()));
        let input: InputValidateFn = Arc::new(|_: &Context, _: Node, _: usize| Ok(()));
        let output: OutputValidateFn = Arc::new(|_: &Context, _: Node, _: usize, _: &mut MetaFormat| Ok(()));

        assert!(KernelValidator::from_parts(Some(whole.clone()), None, None).is_ok());
        assert!(KernelValidator::from_parts(None, Some(input.clone()), Some(output.clone())).is_ok());
        assert!(KernelValidator::from_parts(None, None, None).is_err());
        assert!(KernelValidator::from_parts(None, Some(input.clone()), None).is_err());
        assert!(KernelValidator::from_parts(Some(whole), Some(input), Some(output)).is_err());
    }

    #[test]
    fn test_register_finalize_lookup() {
        let ctx = Context::new();
        let kernel = two_slot_kernel(&ctx, "org.test.copy", 100);
        assert!(ctx.get_kernel_by_name("org.test.copy").is_err());

        let counts = ctx.query_reference(kernel).unwrap();
        assert_eq!((counts.external_count, counts.internal_count), (1, 1));

        ctx.finalize_kernel(kernel).unwrap();
        assert_eq!(ctx.num_kernels(), 1);
        assert_eq!(ctx.num_unique_kernels(), 1);

        let found = ctx.get_kernel_by_name("org.test.copy").unwrap();
        assert_eq!(found, kernel);
        assert_eq!(ctx.get_kernel_by_id(100).unwrap(), kernel);
        assert_eq!(ctx.query_reference(kernel).unwrap().external_count, 3);

        let info = ctx.query_kernel(kernel).unwrap();
        assert_eq!(info.backend, DEFAULT_BACKEND);
        assert!(info.enabled && info.user_kernel && !info.tiled);
        assert_eq!(info.parameter_count, 2);
    }

    #[test]
    fn test_register_errors() {
        let ctx = Context::with_config(ContextConfig::new().with_max_parameters(3)).unwrap();
        assert!(ctx.register_kernel("", 1, noop(), 1, accept_all()).is_err());
        assert_eq!(
            ctx.register_kernel("big", 1, noop(), 4, accept_all()).unwrap_err().status(),
            Status::InvalidParameters
        );
        ctx.register_kernel("dup", 1, noop(), 1, accept_all()).unwrap();
        assert!(ctx.register_kernel("dup", 2, noop(), 1, accept_all()).is_err());
        assert_eq!(ctx.reference_count(), 1);
    }

    #[test]
    fn test_parameters_frozen_after_finalize() {
        let ctx = Context::new();
        let kernel = ctx.register_kernel("k", 7, noop(), 2, accept_all()).unwrap();
        ctx.add_kernel_parameter(kernel, 0, Direction::Input, ParameterType::Scalar, ParameterState::Required)
            .unwrap();
        assert!(ctx.finalize_kernel(kernel).is_err());
        assert!(ctx
            .add_kernel_parameter(kernel, 2, Direction::Input, ParameterType::Scalar, ParameterState::Required)
            .is_err());
        ctx.add_kernel_parameter(kernel, 1, Direction::Bidirectional, ParameterType::Reference, ParameterState::Optional)
            .unwrap();
        ctx.finalize_kernel(kernel).unwrap();

        let err = ctx
            .add_kernel_parameter(kernel, 1, Direction::Output, ParameterType::Scalar, ParameterState::Required)
            .unwrap_err();
        assert_eq!(err.status(), Status::NotSupported);
        assert_eq!(
            ctx.set_kernel_attribute(kernel, KernelAttribute::LocalDataSize(8)).unwrap_err().status(),
            Status::NotSupported
        );
        assert_eq!(
            ctx.kernel_parameter(kernel, 1).unwrap().map(|p| p.direction),
            Some(Direction::Bidirectional)
        );
    }

    #[test]
    fn test_attributes() {
        let ctx = Context::new();
        let kernel = ctx.register_kernel("k", 7, noop(), 0, accept_all()).unwrap();
        ctx.set_kernel_attribute(kernel, KernelAttribute::Neighborhood(Neighborhood::symmetric(2)))
            .unwrap();
        ctx.set_kernel_attribute(kernel, KernelAttribute::TileBlockSize(TileBlock::new(16, 8)))
            .unwrap();
        ctx.set_kernel_attribute(kernel, KernelAttribute::Border(BorderMode::SelfManaged))
            .unwrap();
        for rejected in [BorderMode::Replicate, BorderMode::Constant { value: 0 }] {
            assert_eq!(
                ctx.set_kernel_attribute(kernel, KernelAttribute::Border(rejected)).unwrap_err().status(),
                Status::InvalidValue
            );
        }
        let attributes = ctx.query_kernel(kernel).unwrap().attributes;
        assert_eq!(attributes.neighborhood, Neighborhood::symmetric(2));
        assert_eq!(attributes.tile_block, TileBlock::new(16, 8));
        assert_eq!(attributes.border, BorderMode::SelfManaged);
    }

    #[test]
    fn test_backend_prefix_and_unique_ids() {
        let ctx = Context::new();
        let a = two_slot_kernel(&ctx, "gpu.fake:org.test.copy", 5);
        let b = two_slot_kernel(&ctx, "org.test.copy", 5);
        ctx.finalize_kernel(a).unwrap();
        ctx.finalize_kernel(b).unwrap();

        assert_eq!(ctx.query_kernel(a).unwrap().backend, "gpu.fake");
        assert_eq!(ctx.num_kernels(), 2);
        assert_eq!(ctx.num_unique_kernels(), 1);
        assert_eq!(ctx.kernel_backends(), vec!["gpu.fake".to_string(), DEFAULT_BACKEND.to_string()]);

        ctx.remove_kernel(a).unwrap();
        assert_eq!(ctx.num_kernels(), 1);
        assert_eq!(ctx.num_unique_kernels(), 1);
        assert!(!ctx.is_valid_reference(a));
    }

    #[test]
    fn test_library_kernels_cannot_be_removed() {
        let ctx = Context::new();
        let kernel = ctx.register_library_kernel("lib.k", 1, noop(), 0, accept_all()).unwrap();
        ctx.finalize_kernel(kernel).unwrap();
        assert_eq!(ctx.remove_kernel(kernel).unwrap_err().status(), Status::InvalidParameters);
        assert_eq!(ctx.num_kernels(), 1);
    }

    #[test]
    fn test_remove_after_release() {
        let ctx = Context::new();
        let kernel = ctx.register_kernel("host.k", 3, noop(), 0, accept_all()).unwrap();
        ctx.finalize_kernel(kernel).unwrap();
        ctx.release(kernel).unwrap();
        assert!(ctx.is_valid_reference(kernel));

        ctx.remove_kernel(kernel).unwrap();
        assert!(!ctx.is_valid_reference(kernel));
        assert_eq!(ctx.reference_count(), 0);
        assert_eq!(ctx.num_kernels(), 0);
    }

    #[test]
    fn test_removed_kernel_stays_pinned_by_node() {
        let ctx = Context::new();
        let kernel = ctx.register_kernel("host.k", 3, noop(), 0, accept_all()).unwrap();
        ctx.finalize_kernel(kernel).unwrap();
        let graph = ctx.create_graph().unwrap();
        let node = ctx.create_generic_node(graph, kernel).unwrap();

        ctx.remove_kernel(kernel).unwrap();
        let info = ctx.query_reference(kernel).unwrap();
        assert_eq!((info.external_count, info.internal_count), (0, 1));
        assert!(ctx.get_kernel_by_name("host.k").is_err());

        ctx.remove_node(node).unwrap();
        assert!(!ctx.is_valid_reference(kernel));
    }

    #[test]
    fn test_tiling_kernels_take_images_and_scalars() {
        let ctx = Context::new();
        let tile: TileFunction = Arc::new(|_: &mut [TileParameter], _: &mut [u8]| Ok(()));
        let kernel = ctx
            .add_tiling_kernel("tile.k", 9, TileEntry::Flexible(tile), 2, accept_all())
            .unwrap();
        assert_eq!(ctx.query_kernel(kernel).unwrap().backend, TILING_BACKEND);
        assert!(ctx
            .add_kernel_parameter(kernel, 0, Direction::Input, ParameterType::Array, ParameterState::Required)
            .is_err());
        ctx.add_kernel_parameter(kernel, 0, Direction::Input, ParameterType::Image, ParameterState::Required)
            .unwrap();
        ctx.add_kernel_parameter(kernel, 1, Direction::Input, ParameterType::Scalar, ParameterState::Optional)
            .unwrap();
        ctx.finalize_kernel(kernel).unwrap();
        assert!(ctx.query_kernel(kernel).unwrap().tiled);
    }
}
