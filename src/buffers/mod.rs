//! Data objects: arrays, tensors, images and scalars.

pub mod array;
pub mod image;
pub mod scalar;
pub mod tensor;

pub use array::{AccessBuffer, ArrayAccess, ArrayInfo};
pub use image::{ImageAddressing, ImageInfo, Rectangle};
pub use scalar::ScalarValue;
pub use tensor::{compact_strides, TensorInfo};
