//! Single-plane images.
//!
//! Pixels are stored row-major with no padding: `stride_x` is the pixel size
//! and `stride_y` is `width * stride_x`. Image patches are always mapped
//! in place.

use crate::core::context::Context;
use crate::core::error::{VxError, VxResult};
use crate::core::memory::{
    copy_strided, strided_span, BufferLock, MapLayout, Mapping, SessionRegion, SessionSetup,
    SessionTable, Storage,
};
use crate::core::reference::{Graph, Handle, Image, NewReference, Object};
use crate::core::types::{ImageFormat, Usage};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Addressing of a mapped image region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAddressing {
    /// Pixels per row.
    pub dim_x: u32,
    /// Rows.
    pub dim_y: u32,
    /// Bytes between horizontally adjacent pixels.
    pub stride_x: usize,
    /// Bytes between vertically adjacent pixels.
    pub stride_y: usize,
}

impl ImageAddressing {
    /// Byte offset of pixel `(x, y)`.
    #[inline]
    pub fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.stride_y + x as usize * self.stride_x
    }

    /// Bytes spanned from the first to the end of the last pixel.
    pub fn span(&self) -> VxResult<usize> {
        strided_span(
            &[self.dim_x as usize, self.dim_y as usize],
            &[self.stride_x, self.stride_y],
            self.stride_x,
        )
    }
}

/// Half-open pixel rectangle `[start_x, end_x) x [start_y, end_y)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rectangle {
    /// Left edge.
    pub start_x: u32,
    /// Top edge.
    pub start_y: u32,
    /// Right edge, exclusive.
    pub end_x: u32,
    /// Bottom edge, exclusive.
    pub end_y: u32,
}

impl Rectangle {
    /// Create a rectangle from its corners.
    pub fn new(start_x: u32, start_y: u32, end_x: u32, end_y: u32) -> Self {
        Self {
            start_x,
            start_y,
            end_x,
            end_y,
        }
    }

    /// The rectangle covering a whole `width x height` image.
    pub fn whole(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.end_x.saturating_sub(self.start_x)
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.end_y.saturating_sub(self.start_y)
    }
}

/// Image object stored in the reference table.
pub(crate) struct ImageObject {
    state: Mutex<ImageState>,
    pub(crate) lock: BufferLock,
}

#[derive(Debug)]
struct ImageState {
    width: u32,
    height: u32,
    format: Option<ImageFormat>,
    storage: Option<Storage>,
}

impl ImageState {
    fn addressing(&self) -> VxResult<(ImageFormat, ImageAddressing)> {
        match self.format {
            Some(format) if self.width > 0 && self.height > 0 => {
                let bpp = format.bytes_per_pixel();
                Ok((
                    format,
                    ImageAddressing {
                        dim_x: self.width,
                        dim_y: self.height,
                        stride_x: bpp,
                        stride_y: self.width as usize * bpp,
                    },
                ))
            }
            _ => Err(VxError::InvalidParameters(
                "image size or format not set yet".to_string(),
            )),
        }
    }

    fn check_rect(&self, rect: &Rectangle) -> VxResult<()> {
        if rect.start_x >= rect.end_x
            || rect.start_y >= rect.end_y
            || rect.end_x > self.width
            || rect.end_y > self.height
        {
            return Err(VxError::InvalidParameters(format!(
                "{:?} outside {}x{}",
                rect, self.width, self.height
            )));
        }
        Ok(())
    }

    fn base(&mut self) -> VxResult<*mut u8> {
        let (_, addressing) = self.addressing()?;
        if self.storage.is_none() {
            self.storage = Some(Storage::zeroed(addressing.span()?)?);
        }
        Ok(self
            .storage
            .as_ref()
            .map(Storage::as_ptr)
            .unwrap_or(std::ptr::null_mut()))
    }
}

impl ImageObject {
    fn new(width: u32, height: u32, format: Option<ImageFormat>) -> Self {
        Self {
            state: Mutex::new(ImageState {
                width,
                height,
                format,
                storage: None,
            }),
            lock: BufferLock::new(),
        }
    }

    pub(crate) fn info(&self) -> ImageInfo {
        let state = self.state.lock();
        ImageInfo {
            width: state.width,
            height: state.height,
            format: state.format,
        }
    }
}

/// Attributes of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    /// Width in pixels; 0 for a virtual image not yet sized.
    pub width: u32,
    /// Height in pixels; 0 for a virtual image not yet sized.
    pub height: u32,
    /// Pixel format, if set.
    pub format: Option<ImageFormat>,
}

impl Context {
    /// Create a `width x height` image.
    pub fn create_image(&self, width: u32, height: u32, format: ImageFormat) -> VxResult<Image> {
        if width == 0 || height == 0 {
            return Err(VxError::InvalidParameters(format!(
                "image size {}x{} must be non-zero",
                width, height
            )));
        }
        let object = ImageObject::new(width, height, Some(format));
        let reference = self.create_reference(NewReference::external(Object::Image(object)))?;
        debug!("image {} {}x{} {}", reference, width, height, format);
        Ok(Image::wrap(reference))
    }

    /// Create a virtual image scoped to `graph`. Size and format may be left
    /// open (`0`, `None`) for graph verification to fill in.
    pub fn create_virtual_image(
        &self,
        graph: Graph,
        width: u32,
        height: u32,
        format: Option<ImageFormat>,
    ) -> VxResult<Image> {
        self.entry(graph.reference())?.graph()?;
        let object = ImageObject::new(width, height, format);
        let reference =
            self.create_reference(NewReference::virtual_in(Object::Image(object), graph))?;
        Ok(Image::wrap(reference))
    }

    /// Fix the size and format of a virtual image. Attributes already set
    /// must agree.
    pub(crate) fn init_virtual_image(
        &self,
        image: Image,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> VxResult<()> {
        let entry = self.entry(image.reference())?;
        let mut state = entry.image()?.state.lock();
        let agrees = |current: u32, wanted: u32| current == 0 || current == wanted;
        if !agrees(state.width, width)
            || !agrees(state.height, height)
            || state.format.map_or(false, |f| f != format)
        {
            return Err(VxError::InvalidParameters(format!(
                "{} cannot become {}x{} {}",
                image, width, height, format
            )));
        }
        state.width = width;
        state.height = height;
        state.format = Some(format);
        Ok(())
    }

    /// Attributes of an image.
    pub fn query_image(&self, image: Image) -> VxResult<ImageInfo> {
        Ok(self.entry(image.reference())?.image()?.info())
    }

    /// Map the pixels of `rect` in place.
    ///
    /// The mapping's [`MapLayout::Image`] addressing carries the image's own
    /// row stride.
    pub fn map_image_patch(&self, image: Image, rect: Rectangle, usage: Usage) -> VxResult<Mapping> {
        let entry = self.entry(image.reference())?;
        let object = entry.image()?;
        let (id, (ptr, len, addressing)) = self.open_session(
            SessionTable::Maps,
            image.reference(),
            &entry,
            &object.lock,
            usage,
            || {
                let mut state = object.state.lock();
                state.check_rect(&rect)?;
                let (_, full) = state.addressing()?;
                let base = state.base()?;
                let addressing = ImageAddressing {
                    dim_x: rect.width(),
                    dim_y: rect.height(),
                    ..full
                };
                let len = addressing.span()?;
                Ok(SessionSetup {
                    region: SessionRegion::Image {
                        x: rect.start_x,
                        y: rect.start_y,
                        width: rect.width(),
                        height: rect.height(),
                    },
                    staging: None,
                    // SAFETY: rect was checked against the image extent.
                    output: (unsafe { base.add(full.offset(rect.start_x, rect.start_y)) }, len, addressing),
                })
            },
        )?;
        Ok(Mapping::new(
            id,
            image.reference(),
            usage,
            ptr,
            len,
            MapLayout::Image(addressing),
            true,
        ))
    }

    /// Release a mapping opened by [`map_image_patch`](Self::map_image_patch).
    pub fn unmap_image_patch(&self, image: Image, mapping: Mapping) -> VxResult<()> {
        let entry = self.entry(image.reference())?;
        let object = entry.image()?;
        self.close_session(
            SessionTable::Maps,
            mapping.id(),
            image.reference(),
            &object.lock,
            |_| Ok(()),
        )
    }

    /// Copy the pixels of `rect` into or out of `buffer`, whose rows are
    /// `user_stride_y` bytes apart.
    pub fn copy_image_patch(
        &self,
        image: Image,
        rect: Rectangle,
        buffer: &mut [u8],
        user_stride_y: usize,
        usage: Usage,
    ) -> VxResult<()> {
        if usage == Usage::ReadWrite {
            return Err(VxError::InvalidParameters(
                "copies are either read-only or write-only".to_string(),
            ));
        }
        let entry = self.entry(image.reference())?;
        self.check_accessible(image.reference(), &entry)?;
        let object = entry.image()?;

        let _hold = usage.writes().then(|| object.lock.hold());
        let mut state = object.state.lock();
        state.check_rect(&rect)?;
        let (format, full) = state.addressing()?;
        let bpp = format.bytes_per_pixel();
        let row_bytes = rect.width() as usize * bpp;
        let user = ImageAddressing {
            dim_x: rect.width(),
            dim_y: rect.height(),
            stride_x: bpp,
            stride_y: user_stride_y,
        };
        if user_stride_y < row_bytes || buffer.len() < user.span()? {
            return Err(VxError::InvalidParameters(format!(
                "buffer of {} bytes at row stride {} cannot hold {:?}",
                buffer.len(),
                user_stride_y,
                rect
            )));
        }
        let base = state.base()?;
        let extents = [row_bytes, rect.height() as usize];
        // SAFETY: rect checked against the image and buffer against its span.
        unsafe {
            let origin = base.add(full.offset(rect.start_x, rect.start_y));
            if usage.writes() {
                copy_strided(buffer.as_ptr(), &[1, user_stride_y], origin, &[1, full.stride_y], &extents, 1);
            } else {
                copy_strided(origin, &[1, full.stride_y], buffer.as_mut_ptr(), &[1, user_stride_y], &extents, 1);
            }
        }
        entry.header.record_access(usage.reads(), usage.writes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Status;

    #[test]
    fn test_map_patch_uses_image_stride() {
        let ctx = Context::new();
        let image = ctx.create_image(8, 4, ImageFormat::U16).unwrap();
        let mapping = ctx
            .map_image_patch(image, Rectangle::new(2, 1, 5, 3), Usage::ReadOnly)
            .unwrap();
        match mapping.layout() {
            MapLayout::Image(addressing) => {
                assert_eq!(addressing.dim_x, 3);
                assert_eq!(addressing.dim_y, 2);
                assert_eq!(addressing.stride_x, 2);
                assert_eq!(addressing.stride_y, 16);
            }
            other => panic!("unexpected layout {:?}", other),
        }
        assert!(mapping.is_zero_copy());
        assert_eq!(mapping.len(), 16 + 6);
        ctx.unmap_image_patch(image, mapping).unwrap();
    }

    #[test]
    fn test_copy_and_map_agree() {
        let ctx = Context::new();
        let image = ctx.create_image(4, 3, ImageFormat::U8).unwrap();
        let mut block = vec![1, 2, 0, 3, 4, 0];
        ctx.copy_image_patch(image, Rectangle::new(1, 1, 3, 3), &mut block, 3, Usage::WriteOnly)
            .unwrap();

        let mapping = ctx
            .map_image_patch(image, Rectangle::whole(4, 3), Usage::ReadOnly)
            .unwrap();
        assert_eq!(mapping.as_slice(), &[0, 0, 0, 0, 0, 1, 2, 0, 0, 3, 4, 0]);
        ctx.unmap_image_patch(image, mapping).unwrap();

        let mut out = vec![0u8; 4];
        ctx.copy_image_patch(image, Rectangle::new(1, 2, 3, 3), &mut out, 4, Usage::ReadOnly)
            .unwrap();
        assert_eq!(&out[..2], &[3, 4]);
    }

    #[test]
    fn test_rect_checked() {
        let ctx = Context::new();
        let image = ctx.create_image(4, 4, ImageFormat::U8).unwrap();
        for rect in [Rectangle::new(0, 0, 5, 4), Rectangle::new(2, 0, 2, 4)] {
            let err = ctx.map_image_patch(image, rect, Usage::ReadOnly).unwrap_err();
            assert_eq!(err.status(), Status::InvalidParameters);
        }
        assert!(ctx.create_image(0, 4, ImageFormat::U8).is_err());
    }

    #[test]
    fn test_virtual_image_init() {
        let ctx = Context::new();
        let graph = ctx.create_graph().unwrap();
        let image = ctx.create_virtual_image(graph, 0, 0, None).unwrap();
        ctx.init_virtual_image(image, 16, 8, ImageFormat::S16).unwrap();
        assert_eq!(
            ctx.query_image(image).unwrap(),
            ImageInfo {
                width: 16,
                height: 8,
                format: Some(ImageFormat::S16)
            }
        );
        assert!(ctx.init_virtual_image(image, 16, 9, ImageFormat::S16).is_err());
    }
}
