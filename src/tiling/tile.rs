//! Per-tile addressing records handed to tile entry points.

use crate::buffers::image::ImageAddressing;
use crate::buffers::scalar::ScalarValue;
use crate::core::error::{VxError, VxResult};
use crate::core::reference::Image;
use crate::core::types::{BorderMode, ImageFormat};
use crate::tiling::region::{Neighborhood, TileRegion};
use bytemuck::Pod;
use std::ptr::NonNull;

/// Addressing of one image argument for one tile call.
///
/// The block is the part of the image this call produces. Inputs may be read
/// anywhere in the block grown by the declared neighborhood. Writable
/// arguments are read and written only inside the block, since other tiles
/// may be writing the rest of the plane at the same time.
#[derive(Debug)]
pub struct ImageTile {
    image: Image,
    block: TileRegion,
    format: ImageFormat,
    addressing: ImageAddressing,
    neighborhood: Neighborhood,
    border: BorderMode,
    base: NonNull<u8>,
    writable: bool,
}

// SAFETY: the plane stays mapped for the whole dispatch. Safe access to a
// writable plane is confined to the tile's own block and tiles never share
// blocks; inputs are not written during the walk.
unsafe impl Send for ImageTile {}

impl ImageTile {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        image: Image,
        block: TileRegion,
        format: ImageFormat,
        addressing: ImageAddressing,
        neighborhood: Neighborhood,
        border: BorderMode,
        base: *mut u8,
        writable: bool,
    ) -> Self {
        Self {
            image,
            block,
            format,
            addressing,
            neighborhood,
            border,
            base: NonNull::new(base).unwrap_or(NonNull::dangling()),
            writable,
        }
    }

    /// The image this tile addresses.
    pub fn image(&self) -> Image {
        self.image
    }

    /// Left edge of the block.
    pub fn tile_x(&self) -> u32 {
        self.block.x
    }

    /// Top edge of the block.
    pub fn tile_y(&self) -> u32 {
        self.block.y
    }

    /// The clipped block this call produces.
    pub fn block(&self) -> TileRegion {
        self.block
    }

    /// Full image width.
    pub fn image_width(&self) -> u32 {
        self.addressing.dim_x
    }

    /// Full image height.
    pub fn image_height(&self) -> u32 {
        self.addressing.dim_y
    }

    /// Pixel format.
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Addressing of the whole plane.
    pub fn addressing(&self) -> &ImageAddressing {
        &self.addressing
    }

    /// Halo the kernel declared.
    pub fn neighborhood(&self) -> Neighborhood {
        self.neighborhood
    }

    /// Border mode of the node.
    pub fn border(&self) -> BorderMode {
        self.border
    }

    /// The block grown by the neighborhood and clipped to the image.
    pub fn read_region(&self) -> TileRegion {
        self.block
            .read_region(&self.neighborhood, self.image_width(), self.image_height())
    }

    fn bpp(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    /// Region the safe readers accept: the block for writable arguments,
    /// the read region for inputs.
    pub fn readable_region(&self) -> TileRegion {
        if self.writable {
            self.block
        } else {
            self.read_region()
        }
    }

    /// Bytes of pixel `(x, y)`, which must lie inside
    /// [`readable_region`](Self::readable_region).
    pub fn pixel(&self, x: u32, y: u32) -> VxResult<&[u8]> {
        let readable = self.readable_region();
        if !readable.contains(x, y) {
            return Err(VxError::InvalidParameters(format!(
                "pixel ({}, {}) outside readable {:?} of {}",
                x, y, readable, self.image
            )));
        }
        // SAFETY: (x, y) is inside the mapped plane and no other tile writes it.
        Ok(unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(self.addressing.offset(x, y)), self.bpp())
        })
    }

    /// Writable bytes of pixel `(x, y)`, which must lie inside the block.
    pub fn pixel_mut(&mut self, x: u32, y: u32) -> VxResult<&mut [u8]> {
        if !self.writable {
            return Err(VxError::NotSupported(format!("{} is an input", self.image)));
        }
        if !self.block.contains(x, y) {
            return Err(VxError::InvalidParameters(format!(
                "pixel ({}, {}) outside block {:?}",
                x, y, self.block
            )));
        }
        // SAFETY: (x, y) is inside this tile's block of the mapped plane.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(
                self.base.as_ptr().add(self.addressing.offset(x, y)),
                self.bpp(),
            )
        })
    }

    /// Pixel `(x, y)` as a typed value the size of one pixel.
    pub fn read<T: Pod>(&self, x: u32, y: u32) -> VxResult<T> {
        let bytes = self.pixel(x, y)?;
        if bytes.len() != std::mem::size_of::<T>() {
            return Err(VxError::invalid_type(self.format, std::any::type_name::<T>()));
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Store a typed value the size of one pixel at `(x, y)`.
    pub fn write<T: Pod>(&mut self, x: u32, y: u32, value: T) -> VxResult<()> {
        let format = self.format;
        let bytes = self.pixel_mut(x, y)?;
        if bytes.len() != std::mem::size_of::<T>() {
            return Err(VxError::invalid_type(format, std::any::type_name::<T>()));
        }
        bytes.copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    /// Address of pixel `(x, y)`; coordinates may be negative.
    ///
    /// # Safety
    /// `(x, y)` must lie inside the image. The fast entry point is only called
    /// when the block grown by the neighborhood does.
    #[inline]
    pub unsafe fn pixel_ptr(&self, x: i64, y: i64) -> *const u8 {
        let offset = y as isize * self.addressing.stride_y as isize
            + x as isize * self.addressing.stride_x as isize;
        self.base.as_ptr().offset(offset)
    }

    /// Writable address of pixel `(x, y)`.
    ///
    /// # Safety
    /// `(x, y)` must lie inside the block and the argument must be writable.
    #[inline]
    pub unsafe fn pixel_ptr_mut(&mut self, x: i64, y: i64) -> *mut u8 {
        self.pixel_ptr(x, y) as *mut u8
    }
}

/// One argument of a tile call.
#[derive(Debug)]
pub enum TileParameter {
    /// An image argument.
    Image(ImageTile),
    /// A scalar argument, read once before dispatch.
    Scalar(ScalarValue),
    /// An optional slot left unbound.
    Absent,
}

impl TileParameter {
    /// The image tile, if this is an image argument.
    pub fn as_image(&self) -> Option<&ImageTile> {
        match self {
            TileParameter::Image(tile) => Some(tile),
            _ => None,
        }
    }

    /// The image tile, writable.
    pub fn as_image_mut(&mut self) -> Option<&mut ImageTile> {
        match self {
            TileParameter::Image(tile) => Some(tile),
            _ => None,
        }
    }

    /// The scalar value, if this is a scalar argument.
    pub fn as_scalar(&self) -> Option<ScalarValue> {
        match self {
            TileParameter::Scalar(value) => Some(*value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Context;
    use crate::core::types::Usage;
    use crate::buffers::image::Rectangle;
    use crate::core::error::Status;

    fn tile_over(
        ctx: &Context,
        block: TileRegion,
        writable: bool,
    ) -> (Image, crate::core::memory::Mapping, ImageTile) {
        let image = ctx.create_image(8, 8, ImageFormat::U16).unwrap();
        let usage = if writable { Usage::ReadWrite } else { Usage::ReadOnly };
        let mapping = ctx.map_image_patch(image, Rectangle::whole(8, 8), usage).unwrap();
        let addressing = match mapping.layout() {
            crate::core::memory::MapLayout::Image(a) => *a,
            _ => unreachable!(),
        };
        let tile = ImageTile::new(
            image,
            block,
            ImageFormat::U16,
            addressing,
            Neighborhood::symmetric(1),
            BorderMode::Undefined,
            mapping.as_ptr(),
            writable,
        );
        (image, mapping, tile)
    }

    #[test]
    fn test_writes_confined_to_block() {
        let ctx = Context::new();
        let (image, mapping, mut tile) = tile_over(&ctx, TileRegion::new(4, 4, 4, 4), true);

        tile.write(5, 6, 0x1234u16).unwrap();
        assert_eq!(tile.read::<u16>(5, 6).unwrap(), 0x1234);
        assert!(tile.read::<u16>(0, 0).is_err());
        assert_eq!(
            tile.write(3, 6, 1u16).unwrap_err().status(),
            Status::InvalidParameters
        );
        assert_eq!(tile.read::<u16>(7, 7).unwrap(), 0);
        assert!(tile.read::<u16>(8, 0).is_err());
        assert_eq!(tile.read::<u32>(5, 6).unwrap_err().status(), Status::InvalidType);
        assert_eq!(tile.read_region(), TileRegion::new(3, 3, 5, 5));
        assert_eq!(tile.readable_region(), TileRegion::new(4, 4, 4, 4));

        ctx.unmap_image_patch(image, mapping).unwrap();
    }

    #[test]
    fn test_reads_confined_to_owned_pixels() {
        let ctx = Context::new();
        let (image, mapping, tile) = tile_over(&ctx, TileRegion::new(4, 4, 4, 4), true);
        for (x, y) in [(0, 0), (3, 4), (4, 3), (3, 3)] {
            assert_eq!(tile.read::<u16>(x, y).unwrap_err().status(), Status::InvalidParameters);
        }
        assert!(tile.pixel(3, 5).is_err());
        ctx.unmap_image_patch(image, mapping).unwrap();

        let (image, mapping, input) = tile_over(&ctx, TileRegion::new(2, 2, 2, 2), false);
        assert_eq!(input.readable_region(), TileRegion::new(1, 1, 4, 4));
        assert_eq!(input.read::<u16>(1, 1).unwrap(), 0);
        assert_eq!(input.read::<u16>(4, 4).unwrap(), 0);
        assert_eq!(input.read::<u16>(0, 2).unwrap_err().status(), Status::InvalidParameters);
        assert_eq!(input.read::<u16>(5, 2).unwrap_err().status(), Status::InvalidParameters);
        ctx.unmap_image_patch(image, mapping).unwrap();
    }

    #[test]
    fn test_inputs_are_read_only() {
        let ctx = Context::new();
        let (image, mapping, mut tile) = tile_over(&ctx, TileRegion::new(0, 0, 8, 8), false);
        assert_eq!(tile.write(1, 1, 1u16).unwrap_err().status(), Status::NotSupported);
        // SAFETY: (1, 1) is inside the image.
        let ptr = unsafe { tile.pixel_ptr(1, 1) };
        assert_eq!(ptr, tile.pixel(1, 1).unwrap().as_ptr());
        ctx.unmap_image_patch(image, mapping).unwrap();
    }
}
