//! Shared enums describing objects, data layouts and access modes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag carried by every reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceType {
    /// Resizable typed linear buffer.
    Array,
    /// Strided multi-dimensional buffer.
    Tensor,
    /// Two-dimensional pixel buffer.
    Image,
    /// Single typed value.
    Scalar,
    /// Computation descriptor.
    Kernel,
    /// Kernel instance inside a graph.
    Node,
    /// Container of nodes.
    Graph,
}

impl ReferenceType {
    /// Data objects can be bound to node parameters.
    pub fn is_data_object(self) -> bool {
        matches!(
            self,
            ReferenceType::Array | ReferenceType::Tensor | ReferenceType::Image | ReferenceType::Scalar
        )
    }

    /// Objects whose storage is reachable through access or map calls.
    pub fn has_storage(self) -> bool {
        matches!(
            self,
            ReferenceType::Array | ReferenceType::Tensor | ReferenceType::Image
        )
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReferenceType::Array => "array",
            ReferenceType::Tensor => "tensor",
            ReferenceType::Image => "image",
            ReferenceType::Scalar => "scalar",
            ReferenceType::Kernel => "kernel",
            ReferenceType::Node => "node",
            ReferenceType::Graph => "graph",
        };
        f.write_str(name)
    }
}

/// Element type of arrays, tensors and scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 8-bit integer.
    UInt8,
    /// Signed 16-bit integer.
    Int16,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 64-bit integer.
    UInt64,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
    /// Boolean stored in one byte.
    Bool,
    /// Pointer-sized unsigned integer.
    Size,
    /// Pair of u32 coordinates.
    Coordinates2d,
    /// Rectangle as four u32 (start_x, start_y, end_x, end_y).
    Rectangle,
    /// Keypoint record: x, y, strength, scale, orientation, tracking status, error.
    KeyPoint,
}

impl DataType {
    /// Size in bytes of one item.
    pub fn size(self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 | DataType::Bool => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
            DataType::Size => std::mem::size_of::<usize>(),
            DataType::Coordinates2d => 8,
            DataType::Rectangle => 16,
            DataType::KeyPoint => 28,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How a caller intends to use accessed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Usage {
    /// Read only; never takes the buffer lock.
    ReadOnly,
    /// Write only; contents are not pre-populated.
    WriteOnly,
    /// Read and write.
    ReadWrite,
}

impl Usage {
    /// Whether existing contents must be made visible to the caller.
    pub fn reads(self) -> bool {
        matches!(self, Usage::ReadOnly | Usage::ReadWrite)
    }

    /// Whether the caller may modify the contents.
    pub fn writes(self) -> bool {
        matches!(self, Usage::WriteOnly | Usage::ReadWrite)
    }
}

/// Direction of a kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Read by the kernel.
    Input,
    /// Written by the kernel.
    Output,
    /// Read and written by the kernel.
    Bidirectional,
}

impl Direction {
    /// Whether a node reads objects bound to this slot.
    pub fn reads(self) -> bool {
        matches!(self, Direction::Input | Direction::Bidirectional)
    }

    /// Whether a node writes objects bound to this slot.
    pub fn writes(self) -> bool {
        matches!(self, Direction::Output | Direction::Bidirectional)
    }

    /// Access mode the executor uses for objects bound to this slot.
    pub fn usage(self) -> Usage {
        match self {
            Direction::Input => Usage::ReadOnly,
            Direction::Output => Usage::WriteOnly,
            Direction::Bidirectional => Usage::ReadWrite,
        }
    }
}

/// Whether a parameter must be bound before verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterState {
    /// Must be bound.
    Required,
    /// May be left unbound.
    Optional,
}

/// Object type accepted by a kernel parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterType {
    /// Any data object.
    Reference,
    /// An array.
    Array,
    /// A tensor.
    Tensor,
    /// An image.
    Image,
    /// A scalar.
    Scalar,
}

impl ParameterType {
    /// Whether an object of type `ty` may be bound to this slot.
    pub fn accepts(self, ty: ReferenceType) -> bool {
        match self {
            ParameterType::Reference => ty.is_data_object(),
            ParameterType::Array => ty == ReferenceType::Array,
            ParameterType::Tensor => ty == ReferenceType::Tensor,
            ParameterType::Image => ty == ReferenceType::Image,
            ParameterType::Scalar => ty == ReferenceType::Scalar,
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How a kernel treats pixels outside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BorderMode {
    /// Border pixels of the output are unspecified.
    #[default]
    Undefined,
    /// Out-of-image reads return a constant.
    Constant {
        /// The constant value.
        value: u32,
    },
    /// Out-of-image reads return the nearest edge pixel.
    Replicate,
    /// The kernel handles its own borders.
    SelfManaged,
}

/// Pixel format of a single-plane image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    /// 8-bit unsigned.
    U8,
    /// 16-bit unsigned.
    U16,
    /// 16-bit signed.
    S16,
    /// 32-bit unsigned.
    U32,
    /// 32-bit signed.
    S32,
    /// Interleaved 8-bit RGB.
    Rgb,
    /// Interleaved 8-bit RGB plus padding byte.
    Rgbx,
}

impl ImageFormat {
    /// Bytes per pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ImageFormat::U8 => 1,
            ImageFormat::U16 | ImageFormat::S16 => 2,
            ImageFormat::Rgb => 3,
            ImageFormat::U32 | ImageFormat::S32 | ImageFormat::Rgbx => 4,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
