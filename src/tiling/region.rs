//! Tile geometry: regions, halos and the row-major tile walk.
//!
//! An image of `width x height` pixels is cut into blocks of at most
//! [`TileBlock`] pixels. Blocks on the right and bottom edges are clipped, so
//! the tiles cover the image exactly once. A kernel that reads around each
//! output pixel declares a [`Neighborhood`]; the region a tile may read is its
//! block grown by that halo and clipped to the image.

use serde::{Deserialize, Serialize};

/// A rectangular region within an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileRegion {
    /// X offset from the image origin
    pub x: u32,
    /// Y offset from the image origin
    pub y: u32,
    /// Width of the region
    pub width: u32,
    /// Height of the region
    pub height: u32,
}

impl TileRegion {
    /// Create a new tile region.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Get the right edge coordinate (exclusive).
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Get the bottom edge coordinate (exclusive).
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Calculate the area of this region in pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether `(x, y)` lies inside the region.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Whether the two regions share at least one pixel.
    pub fn overlaps(&self, other: &TileRegion) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// The region a tile may read: grown by `halo` and clamped to the image.
    pub fn read_region(&self, halo: &Neighborhood, image_width: u32, image_height: u32) -> Self {
        let new_x = self.x.saturating_sub(halo.left);
        let new_y = self.y.saturating_sub(halo.top);
        let new_right = (self.right().saturating_add(halo.right)).min(image_width);
        let new_bottom = (self.bottom().saturating_add(halo.bottom)).min(image_height);

        Self {
            x: new_x,
            y: new_y,
            width: new_right - new_x,
            height: new_bottom - new_y,
        }
    }

    /// Whether the region grown by `halo`, without clamping, stays inside the
    /// image.
    pub fn halo_fits(&self, halo: &Neighborhood, image_width: u32, image_height: u32) -> bool {
        self.x >= halo.left
            && self.y >= halo.top
            && self.right() as u64 + halo.right as u64 <= image_width as u64
            && self.bottom() as u64 + halo.bottom as u64 <= image_height as u64
    }

    /// Check if this region is entirely within the given bounds.
    pub fn is_within_bounds(&self, width: u32, height: u32) -> bool {
        self.right() <= width && self.bottom() <= height
    }

    /// Whether the region is exactly `[0, width) x [0, height)`.
    pub fn spans(&self, width: u32, height: u32) -> bool {
        self.x == 0 && self.y == 0 && self.width == width && self.height == height
    }
}

/// Pixels a kernel reads beyond each side of its output block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Neighborhood {
    /// Pixels needed to the left.
    pub left: u32,
    /// Pixels needed to the right.
    pub right: u32,
    /// Pixels needed above.
    pub top: u32,
    /// Pixels needed below.
    pub bottom: u32,
}

impl Neighborhood {
    /// Same halo on all sides.
    pub fn symmetric(radius: u32) -> Self {
        Self {
            left: radius,
            right: radius,
            top: radius,
            bottom: radius,
        }
    }

    /// Create an asymmetric halo.
    pub fn asymmetric(left: u32, right: u32, top: u32, bottom: u32) -> Self {
        Self { left, right, top, bottom }
    }

    /// Get the maximum extent in any direction.
    pub fn max_extent(&self) -> u32 {
        self.left.max(self.right).max(self.top).max(self.bottom)
    }

    /// Whether the kernel reads only its own pixels.
    pub fn is_empty(&self) -> bool {
        self.max_extent() == 0
    }

    /// Combine with another halo (take maximum of each side).
    pub fn combine(&self, other: &Neighborhood) -> Neighborhood {
        Neighborhood {
            left: self.left.max(other.left),
            right: self.right.max(other.right),
            top: self.top.max(other.top),
            bottom: self.bottom.max(other.bottom),
        }
    }
}

/// Largest tile a kernel processes in one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileBlock {
    /// Tile width in pixels.
    pub width: u32,
    /// Tile height in pixels.
    pub height: u32,
}

impl TileBlock {
    /// Create a block size.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either side is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Iterator over the tiles of an image, row by row.
pub struct TileIterator {
    image_width: u32,
    image_height: u32,
    tile_width: u32,
    tile_height: u32,
    current_x: u32,
    current_y: u32,
}

impl TileIterator {
    /// Create a tile iterator. An empty block yields no tiles.
    pub fn new(image_width: u32, image_height: u32, block: TileBlock) -> Self {
        let empty = block.is_empty() || image_width == 0;
        Self {
            image_width,
            image_height,
            tile_width: block.width,
            tile_height: block.height,
            current_x: 0,
            current_y: if empty { image_height } else { 0 },
        }
    }

    /// Get the total number of tiles.
    pub fn tile_count(&self) -> usize {
        if self.tile_width == 0 || self.tile_height == 0 {
            return 0;
        }
        let tiles_x = self.image_width.div_ceil(self.tile_width) as usize;
        let tiles_y = self.image_height.div_ceil(self.tile_height) as usize;
        tiles_x * tiles_y
    }
}

impl Iterator for TileIterator {
    type Item = TileRegion;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_y >= self.image_height {
            return None;
        }

        let x = self.current_x;
        let y = self.current_y;
        let width = self.tile_width.min(self.image_width - x);
        let height = self.tile_height.min(self.image_height - y);

        // Move to next tile
        self.current_x = self.current_x.saturating_add(self.tile_width);
        if self.current_x >= self.image_width {
            self.current_x = 0;
            self.current_y = self.current_y.saturating_add(self.tile_height);
        }

        Some(TileRegion::new(x, y, width, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tile_region() {
        let region = TileRegion::new(10, 20, 100, 200);
        assert_eq!(region.right(), 110);
        assert_eq!(region.bottom(), 220);
        assert_eq!(region.area(), 20000);
        assert!(region.contains(10, 20));
        assert!(!region.contains(110, 20));
    }

    #[test]
    fn test_read_region_inside() {
        let region = TileRegion::new(50, 50, 100, 100);
        let expanded = region.read_region(&Neighborhood::symmetric(10), 200, 200);
        assert_eq!(expanded, TileRegion::new(40, 40, 120, 120));
    }

    #[test]
    fn test_read_region_at_boundary() {
        let region = TileRegion::new(0, 0, 100, 100);
        let expanded = region.read_region(&Neighborhood::asymmetric(3, 10, 3, 10), 200, 200);
        assert_eq!(expanded, TileRegion::new(0, 0, 110, 110));
        assert!(!region.halo_fits(&Neighborhood::symmetric(1), 200, 200));
        assert!(region.halo_fits(&Neighborhood::asymmetric(0, 5, 0, 5), 200, 200));
    }

    #[test]
    fn test_tiles_scenario() {
        let block = TileBlock::new(16, 16);
        let tiles: Vec<_> = TileIterator::new(18, 18, block).collect();
        assert_eq!(
            tiles,
            vec![
                TileRegion::new(0, 0, 16, 16),
                TileRegion::new(16, 0, 2, 16),
                TileRegion::new(0, 16, 16, 2),
                TileRegion::new(16, 16, 2, 2),
            ]
        );

        let halo = Neighborhood::symmetric(1);
        assert_eq!(tiles[0].read_region(&halo, 18, 18), TileRegion::new(0, 0, 17, 17));
        assert_eq!(tiles[3].read_region(&halo, 18, 18), TileRegion::new(15, 15, 3, 3));
    }

    #[test]
    fn test_tile_iterator() {
        let iter = TileIterator::new(1000, 1000, TileBlock::new(256, 256));
        assert_eq!(iter.tile_count(), 16);

        let tiles: Vec<_> = TileIterator::new(100, 100, TileBlock::new(64, 64)).collect();
        assert_eq!(tiles.len(), 4);
        assert_eq!(tiles[3], TileRegion::new(64, 64, 36, 36));

        assert_eq!(TileIterator::new(10, 10, TileBlock::new(0, 4)).count(), 0);
        assert_eq!(TileIterator::new(0, 10, TileBlock::new(4, 4)).count(), 0);
    }

    #[test]
    fn test_neighborhood() {
        let halo = Neighborhood::symmetric(5);
        assert_eq!(halo.max_extent(), 5);
        assert!(!halo.is_empty());
        assert!(Neighborhood::default().is_empty());

        let combined = halo.combine(&Neighborhood::asymmetric(1, 2, 3, 9));
        assert_eq!(combined, Neighborhood::asymmetric(5, 5, 5, 9));
    }

    proptest! {
        #[test]
        fn prop_tiles_cover_exactly(
            width in 1u32..80,
            height in 1u32..80,
            bw in 1u32..40,
            bh in 1u32..40,
            halo in (0u32..4, 0u32..4, 0u32..4, 0u32..4),
        ) {
            let halo = Neighborhood::asymmetric(halo.0, halo.1, halo.2, halo.3);
            let iter = TileIterator::new(width, height, TileBlock::new(bw, bh));
            let expected = iter.tile_count();
            let tiles: Vec<_> = iter.collect();
            prop_assert_eq!(tiles.len(), expected);

            let mut hits = vec![0u8; (width * height) as usize];
            for tile in &tiles {
                prop_assert!(tile.width >= 1 && tile.width <= bw);
                prop_assert!(tile.height >= 1 && tile.height <= bh);
                for y in tile.y..tile.bottom() {
                    for x in tile.x..tile.right() {
                        hits[(y * width + x) as usize] += 1;
                    }
                }
                let read = tile.read_region(&halo, width, height);
                prop_assert!(read.is_within_bounds(width, height));
                prop_assert!(read.x <= tile.x && read.y <= tile.y);
                prop_assert!(read.right() >= tile.right() && read.bottom() >= tile.bottom());
            }
            prop_assert!(hits.iter().all(|&h| h == 1));
        }
    }
}
