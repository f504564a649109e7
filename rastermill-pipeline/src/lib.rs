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

//! The asynchronous raster pipeline of rastermill.
//!
//! A [`Dataset`] hosts raster *recipes* (pixels computed on demand, cached
//! as fingerprinted tiles on disk) and serves *queries*: a list of target
//! footprints consumed as a stream of sub-arrays through a bounded queue.
//! Per query, the scheduler decomposes the request, validates or computes
//! the cache tiles it needs, reads them back, remaps them onto the
//! consumer's grid and delivers in the requested order, lazily, at the pace
//! the consumer drains the queue.
//!
//! All coordination runs on one deterministic scheduler thread
//! (`rastermill-actors`); pixel work and file I/O run on worker pools.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rastermill_common::{Footprint, PixelBuf};
//! use rastermill_pipeline::{Dataset, DatasetConfig, QuerySpec, RasterSpec};
//!
//! let dataset = Dataset::open(DatasetConfig::default());
//! let footprint = Footprint::new(0.0, 0.0, 1.0, 1.0, 512, 512);
//! let raster = dataset
//!     .register_raster(RasterSpec::new(
//!         footprint,
//!         vec!["elevation".to_string()],
//!         256,
//!         256,
//!         "/tmp/cache/dsm",
//!         "dsm",
//!         "1.0",
//!         Arc::new(|input| {
//!             let tile = &input.tile_footprint;
//!             let data = PixelBuf::new_filled(tile.width(), tile.height(), 1, 0.0);
//!             Ok(vec![(*tile, data)])
//!         }),
//!     ))
//!     .unwrap();
//! let mut handle = dataset
//!     .post_query(&raster, QuerySpec::new(vec![footprint]))
//!     .unwrap();
//! while let Some(sub_array) = handle.next() {
//!     let sub_array = sub_array.unwrap();
//!     // consume sub_array.data ...
//! }
//! ```

pub mod actors;
mod dataset;
mod error;
mod models;

pub use dataset::{Dataset, DatasetConfig, QueryHandle};
pub use error::{ConfigError, QueryError};
pub use models::{
    ComputeFn, ComputeInput, DeliveryOrder, PrimitiveSpec, ProduceInfo, QueryPlan, QuerySpec,
    RasterLayout, RasterSpec, SubArray, SubInput,
};
