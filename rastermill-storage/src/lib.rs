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

//! The persistent tile cache of rastermill.
//!
//! A cache tile is one file whose name embeds the fingerprint `H` of its
//! expected content: `<x>_<y>.<H>.rmt`. `H` is derived from everything that
//! determines the tile's bytes (extent, channels, recipe identity, upstream
//! rasters, on-disk format version), so a stale or foreign file can never be
//! mistaken for a valid one. Publication is atomic: tmp file, fsync, rename,
//! fsync of the directory.

mod codec;
mod error;
mod fingerprint;
mod store;

pub use codec::{decode_tile, encode_tile, TileHeader};
pub use error::CacheError;
pub use fingerprint::{raster_fingerprint, tile_fingerprint, FORMAT_VERSION};
pub use store::TileStore;
