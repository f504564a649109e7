// Copyright (C) 2023 Rastermill, Inc.
//
// Rastermill is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@rastermill.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rastermill_common::{Footprint, PixelBuf, RasterUid, TileIndex};

/// Everything the user's compute function receives for one cache tile.
pub struct ComputeInput {
    /// Extent of the tile to produce.
    pub tile_footprint: Footprint,
    /// Number of channels the output must carry.
    pub channels: u16,
    /// Arrays collected from the primitive rasters, keyed by primitive name.
    pub collected: HashMap<String, SubInput>,
}

pub struct SubInput {
    pub footprint: Footprint,
    pub data: PixelBuf,
}

pub type ComputeFn =
    Arc<dyn Fn(&ComputeInput) -> Result<Vec<(Footprint, PixelBuf)>, String> + Send + Sync>;

/// An upstream raster a recipe depends on.
///
/// `convert` maps a tile footprint of the dependent raster to the footprint
/// that must be collected from the primitive (often the identity, sometimes a
/// dilation for stencil computations).
#[derive(Clone)]
pub struct PrimitiveSpec {
    pub raster: RasterUid,
    pub convert: Arc<dyn Fn(&Footprint) -> Footprint + Send + Sync>,
}

impl PrimitiveSpec {
    pub fn same_footprint(raster: RasterUid) -> PrimitiveSpec {
        PrimitiveSpec {
            raster,
            convert: Arc::new(|footprint| *footprint),
        }
    }
}

/// A raster source to register: a recipe computing pixels on demand, backed
/// by a persistent tile cache.
///
/// A stored in-memory array is just a trivial recipe; see
/// [`RasterSpec::from_array`].
#[derive(Clone)]
pub struct RasterSpec {
    pub footprint: Footprint,
    pub channels: Vec<String>,
    pub tile_width: u32,
    pub tile_height: u32,
    pub cache_dir: PathBuf,
    /// Remove every pre-existing cache file of this raster on first touch.
    pub overwrite: bool,
    pub recipe_name: String,
    /// Part of the cache fingerprint: bump it when the compute function
    /// changes behavior.
    pub recipe_version: String,
    pub compute: ComputeFn,
    pub primitives: Vec<(String, PrimitiveSpec)>,
}

impl RasterSpec {
    pub fn new(
        footprint: Footprint,
        channels: Vec<String>,
        tile_width: u32,
        tile_height: u32,
        cache_dir: impl Into<PathBuf>,
        recipe_name: impl Into<String>,
        recipe_version: impl Into<String>,
        compute: ComputeFn,
    ) -> RasterSpec {
        RasterSpec {
            footprint,
            channels,
            tile_width,
            tile_height,
            cache_dir: cache_dir.into(),
            overwrite: false,
            recipe_name: recipe_name.into(),
            recipe_version: recipe_version.into(),
            compute,
            primitives: Vec::new(),
        }
    }

    /// A raster backed by an in-memory array covering the whole footprint.
    pub fn from_array(
        footprint: Footprint,
        channels: Vec<String>,
        tile_width: u32,
        tile_height: u32,
        cache_dir: impl Into<PathBuf>,
        recipe_name: impl Into<String>,
        data: PixelBuf,
    ) -> RasterSpec {
        assert_eq!(data.width(), footprint.width());
        assert_eq!(data.height(), footprint.height());
        assert_eq!(data.channels() as usize, channels.len());
        let data = Arc::new(data);
        let compute: ComputeFn = Arc::new(move |input: &ComputeInput| {
            let (col, row) = input.tile_footprint.slice_in(&footprint);
            let crop = data.crop(
                col,
                row,
                input.tile_footprint.width(),
                input.tile_footprint.height(),
            );
            Ok(vec![(input.tile_footprint, crop)])
        });
        RasterSpec::new(
            footprint,
            channels,
            tile_width,
            tile_height,
            cache_dir,
            recipe_name,
            "stored",
            compute,
        )
    }
}

/// The immutable grid facts of a registered raster, shared by the planner
/// and the per-raster actors.
#[derive(Clone, Debug)]
pub struct RasterLayout {
    pub footprint: Footprint,
    pub tile_width: u32,
    pub tile_height: u32,
    pub channels: u16,
}

impl RasterLayout {
    pub fn tile_footprint(&self, tile: TileIndex) -> Footprint {
        self.footprint.tile(tile, self.tile_width, self.tile_height)
    }
}
