//! Tile scheduling: planning the tile walk and calling tile entry points.
//!
//! A tiling node is executed by cutting the output image into blocks of the
//! node's tile block size and calling one of the kernel's entry points once
//! per block. Every call gets an [`ImageTile`] per image argument and the
//! value of every scalar argument, plus the node's scratch buffer.
//!
//! The fast entry point reads its halo without bounds checks, so it only
//! runs on tiles the [`FastTilePolicy`] allows; every other tile goes to the
//! flexible entry point.

use crate::buffers::image::Rectangle;
use crate::buffers::scalar::ScalarValue;
use crate::core::context::Context;
use crate::core::error::{VxError, VxResult};
use crate::core::memory::{MapLayout, Mapping};
use crate::core::reference::{Image, Reference, Scalar};
use crate::core::types::{Direction, ImageFormat, ParameterType};
use crate::kernels::kernel::{check_tile_border, KernelAttributes, ParameterInfo, TileEntry, TileFunction};
use crate::tiling::region::{Neighborhood, TileBlock, TileIterator, TileRegion};
use crate::tiling::tile::{ImageTile, TileParameter};
use log::{debug, trace};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// When the fast entry point of a tiling kernel may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FastTilePolicy {
    /// Only when the whole image is a single tile and the kernel reads
    /// nothing beyond it.
    #[default]
    WholeImage,
    /// On every tile whose halo-grown block lies inside the image.
    Interior,
}

impl FastTilePolicy {
    /// Whether `tile` may go to the fast entry point.
    pub fn allows(
        self,
        tile: &TileRegion,
        tile_count: usize,
        halo: &Neighborhood,
        width: u32,
        height: u32,
    ) -> bool {
        match self {
            FastTilePolicy::WholeImage => {
                tile_count == 1 && tile.spans(width, height) && tile.halo_fits(halo, width, height)
            }
            FastTilePolicy::Interior => tile.halo_fits(halo, width, height),
        }
    }
}

/// Options for executing tiling nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingOptions {
    /// Whether disjoint tiles may run on several threads.
    pub parallel: bool,
    /// Worker threads for parallel dispatch (0 = rayon's global pool).
    pub num_threads: usize,
}

impl Default for TilingOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            num_threads: 0,
        }
    }
}

impl TilingOptions {
    /// Create options for sequential dispatch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable parallel dispatch.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set the number of worker threads.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.num_threads = threads;
        self
    }
}

/// Which entry point a tile goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TileCall {
    /// The unchecked entry point.
    Fast,
    /// The boundary-aware entry point.
    Flexible,
}

/// One tile of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlannedTile {
    /// The clipped block.
    pub region: TileRegion,
    /// The entry point it goes to.
    pub call: TileCall,
}

/// Cut a `width x height` image into tiles and pick an entry point for each.
///
/// The fast entry point is preferred whenever `policy` allows it. Fails with
/// not-supported when a kernel with only a fast entry point meets a tile the
/// policy does not allow.
pub fn plan_tiles(
    width: u32,
    height: u32,
    block: TileBlock,
    neighborhood: &Neighborhood,
    entry: &TileEntry,
    policy: FastTilePolicy,
) -> VxResult<Vec<PlannedTile>> {
    if block.is_empty() {
        return Err(VxError::InvalidValue(format!("empty tile block {:?}", block)));
    }
    let tiles = TileIterator::new(width, height, block);
    let count = tiles.tile_count();
    tiles
        .map(|region| {
            let fast = entry.fast().is_some()
                && policy.allows(&region, count, neighborhood, width, height);
            let call = if fast {
                TileCall::Fast
            } else if entry.flexible().is_some() {
                TileCall::Flexible
            } else {
                return Err(VxError::NotSupported(format!(
                    "tile {:?} of a {}x{} image cannot use the fast entry point",
                    region, width, height
                )));
            };
            Ok(PlannedTile { region, call })
        })
        .collect()
}

/// Counters from one tiled execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TilingStats {
    /// Tiles dispatched.
    pub tiles: usize,
    /// Calls to the fast entry point.
    pub fast_calls: usize,
    /// Calls to the flexible entry point.
    pub flexible_calls: usize,
    /// Wall time of the tile walk.
    pub duration: Duration,
}

impl TilingStats {
    /// Add another run's counters.
    pub fn merge(&mut self, other: &TilingStats) {
        self.tiles += other.tiles;
        self.fast_calls += other.fast_calls;
        self.flexible_calls += other.flexible_calls;
        self.duration += other.duration;
    }
}

/// Everything needed to run one tiling node.
pub(crate) struct TileDispatch<'a> {
    pub(crate) entry: &'a TileEntry,
    pub(crate) attributes: KernelAttributes,
    pub(crate) signature: &'a [ParameterInfo],
    pub(crate) arguments: &'a [Option<Reference>],
}

/// A bound image, mapped for the whole walk.
struct MappedImage {
    image: Image,
    format: ImageFormat,
    mapping: Mapping,
    writable: bool,
}

enum Bound {
    Image(MappedImage),
    Scalar(ScalarValue),
    Absent,
}

impl Context {
    /// Run a tiling node over its image arguments.
    ///
    /// Images are mapped in place for the whole walk and unmapped afterwards,
    /// also when a tile call fails.
    pub(crate) fn dispatch_tiles(
        &self,
        dispatch: TileDispatch<'_>,
        options: &TilingOptions,
    ) -> VxResult<TilingStats> {
        let TileDispatch {
            entry,
            attributes,
            signature,
            arguments,
        } = dispatch;
        check_tile_border(attributes.border)
            .map_err(|e| VxError::NotSupported(format!("tiling border: {}", e)))?;
        let (width, height) = self.tile_grid(signature, arguments)?;

        let mut bound = Vec::with_capacity(arguments.len());
        let mut result = self
            .bind_tile_arguments(signature, arguments, &mut bound)
            .and_then(|()| self.walk_tiles(entry, &attributes, &bound, width, height, options));

        // Unmap everything, keeping the first error.
        for argument in bound {
            if let Bound::Image(mapped) = argument {
                if let Err(e) = self.unmap_image_patch(mapped.image, mapped.mapping) {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    /// Size of the tile grid: the first written image, else the first image.
    /// Every other image must have the same size.
    fn tile_grid(
        &self,
        signature: &[ParameterInfo],
        arguments: &[Option<Reference>],
    ) -> VxResult<(u32, u32)> {
        let images: Vec<(usize, Image)> = arguments
            .iter()
            .enumerate()
            .filter_map(|(slot, argument)| argument.and_then(|r| r.downcast::<Image>().map(|i| (slot, i))))
            .collect();
        let &(_, reference_image) = images
            .iter()
            .find(|(slot, _)| signature[*slot].direction.writes())
            .or_else(|| images.first())
            .ok_or_else(|| VxError::InvalidParameters("tiling node has no image argument".to_string()))?;

        let grid = self.query_image(reference_image)?;
        for &(slot, image) in &images {
            let info = self.query_image(image)?;
            if (info.width, info.height) != (grid.width, grid.height) {
                return Err(VxError::InvalidParameters(format!(
                    "argument {} is {}x{}, tiles cover {}x{}",
                    slot, info.width, info.height, grid.width, grid.height
                )));
            }
            let shared = images
                .iter()
                .filter(|(other, i)| *other != slot && *i == image)
                .any(|(other, _)| signature[slot].direction.writes() || signature[*other].direction.writes());
            if shared {
                return Err(VxError::InvalidParameters(format!(
                    "{} is bound to several slots and written through one of them",
                    image
                )));
            }
        }
        Ok((grid.width, grid.height))
    }

    fn bind_tile_arguments(
        &self,
        signature: &[ParameterInfo],
        arguments: &[Option<Reference>],
        bound: &mut Vec<Bound>,
    ) -> VxResult<()> {
        for (slot, (info, argument)) in signature.iter().zip(arguments).enumerate() {
            let Some(reference) = *argument else {
                bound.push(Bound::Absent);
                continue;
            };
            match info.ty {
                ParameterType::Image => {
                    let image = reference
                        .downcast::<Image>()
                        .ok_or_else(|| VxError::invalid_type("image", reference.ty()))?;
                    let format = self.query_image(image)?.format.ok_or_else(|| {
                        VxError::InvalidParameters(format!("{} has no format", image))
                    })?;
                    let mapping =
                        self.map_image_patch(image, self.whole_image(image)?, info.direction.usage())?;
                    bound.push(Bound::Image(MappedImage {
                        image,
                        format,
                        mapping,
                        writable: info.direction.writes(),
                    }));
                }
                ParameterType::Scalar => {
                    if info.direction != Direction::Input {
                        return Err(VxError::NotSupported(format!(
                            "scalar argument {} of a tiling node must be an input",
                            slot
                        )));
                    }
                    let scalar = reference
                        .downcast::<Scalar>()
                        .ok_or_else(|| VxError::invalid_type("scalar", reference.ty()))?;
                    bound.push(Bound::Scalar(self.read_scalar(scalar)?));
                }
                other => {
                    return Err(VxError::NotSupported(format!(
                        "tiling nodes cannot take {} arguments",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    fn whole_image(&self, image: Image) -> VxResult<Rectangle> {
        let info = self.query_image(image)?;
        Ok(Rectangle::whole(info.width, info.height))
    }

    fn walk_tiles(
        &self,
        entry: &TileEntry,
        attributes: &KernelAttributes,
        bound: &[Bound],
        width: u32,
        height: u32,
        options: &TilingOptions,
    ) -> VxResult<TilingStats> {
        let started = Instant::now();
        let plan = plan_tiles(
            width,
            height,
            attributes.tile_block,
            &attributes.neighborhood,
            entry,
            self.config().fast_tile_policy,
        )?;

        let mut stats = TilingStats {
            tiles: plan.len(),
            ..TilingStats::default()
        };
        let mut calls = Vec::with_capacity(plan.len());
        for tile in &plan {
            match tile.call {
                TileCall::Fast => stats.fast_calls += 1,
                TileCall::Flexible => stats.flexible_calls += 1,
            }
            calls.push((*tile, tile_parameters(bound, tile.region, attributes)?));
        }

        // Tiles of a read-modify-write image read pixels other tiles write.
        let parallel = options.parallel
            && plan.len() > 1
            && !bound
                .iter()
                .any(|b| matches!(b, Bound::Image(m) if m.writable && m.mapping.usage().reads()));
        let scratch_len = attributes.local_data_size;

        if parallel {
            let run = || {
                calls
                    .into_par_iter()
                    .try_for_each_init(|| vec![0u8; scratch_len], |scratch, (tile, mut params)| {
                        call_tile(entry, &tile, &mut params, scratch)
                    })
            };
            if options.num_threads > 0 {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(options.num_threads)
                    .build()
                    .map_err(|e| VxError::NoResources(format!("tile worker pool: {}", e)))?
                    .install(run)?;
            } else {
                run()?;
            }
        } else {
            let mut scratch = vec![0u8; scratch_len];
            for (tile, mut params) in calls {
                call_tile(entry, &tile, &mut params, &mut scratch)?;
            }
        }

        stats.duration = started.elapsed();
        debug!(
            "{}x{} image in {} tiles ({} fast, {} flexible, parallel={}) in {:?}",
            width, height, stats.tiles, stats.fast_calls, stats.flexible_calls, parallel, stats.duration
        );
        Ok(stats)
    }
}

fn tile_parameters(
    bound: &[Bound],
    block: TileRegion,
    attributes: &KernelAttributes,
) -> VxResult<Vec<TileParameter>> {
    bound
        .iter()
        .map(|argument| {
            Ok(match argument {
                Bound::Image(mapped) => {
                    let addressing = match mapped.mapping.layout() {
                        MapLayout::Image(addressing) => *addressing,
                        other => {
                            return Err(VxError::NotSupported(format!(
                                "{} mapped with {:?} layout",
                                mapped.image, other
                            )))
                        }
                    };
                    TileParameter::Image(ImageTile::new(
                        mapped.image,
                        block,
                        mapped.format,
                        addressing,
                        attributes.neighborhood,
                        attributes.border,
                        mapped.mapping.as_ptr(),
                        mapped.writable,
                    ))
                }
                Bound::Scalar(value) => TileParameter::Scalar(*value),
                Bound::Absent => TileParameter::Absent,
            })
        })
        .collect()
}

fn call_tile(
    entry: &TileEntry,
    tile: &PlannedTile,
    params: &mut [TileParameter],
    scratch: &mut [u8],
) -> VxResult<()> {
    let function: &TileFunction = match tile.call {
        TileCall::Fast => entry.fast(),
        TileCall::Flexible => entry.flexible(),
    }
    .ok_or_else(|| VxError::NotSupported(format!("no {:?} entry point", tile.call)))?;
    trace!("{:?} tile {:?}", tile.call, tile.region);
    function(params, scratch)
}
