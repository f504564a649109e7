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

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejections reported synchronously when registering a raster or posting a
/// query.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown raster `{0}`")]
    UnknownRaster(String),
    #[error("raster has no channel `{0}`")]
    UnknownChannel(u16),
    #[error("a raster needs at least one channel")]
    NoChannels,
    #[error("tile dimensions must be non-zero")]
    ZeroTileSize,
    #[error("a query needs at least one footprint")]
    NoFootprints,
    #[error("queue capacity must be non-zero")]
    ZeroQueueCapacity,
    #[error("unknown primitive raster `{0}`")]
    UnknownPrimitiveRaster(String),
    #[error("duplicate primitive name `{0}`")]
    DuplicatePrimitiveName(String),
    #[error("the scheduler is shut down")]
    SchedulerStopped,
}

/// Terminal outcome of a query, delivered through its output queue.
///
/// `Cancelled` is not an error for the library: it acknowledges a kill
/// requested by the user or by a raster teardown.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryError {
    #[error("query cancelled")]
    Cancelled,
    #[error("raster closed while the query was running")]
    RasterClosed,
    #[error("compute function failed: {0}")]
    Compute(String),
    #[error("cache i/o failed: {0}")]
    Io(String),
}
