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

//! The per-raster actor graph.
//!
//! Data flow for one query: QueriesHandler → Producer → {CacheHandler,
//! BuilderBedroom} → Builder → {Sampler, Resampler} → back to Producer →
//! QueriesHandler → user output queue. Cache misses branch from CacheHandler
//! into Computer → ComputationBedroom → Computer → ComputeAccumulator →
//! Merger → Writer → CacheHandler.

mod accumulator;
mod bedrooms;
mod builder;
mod cache_handler;
mod computer;
mod file_hasher;
mod merger;
mod producer;
mod queries_handler;
mod rasters_handler;
mod resampler;
mod sampler;
mod writer;

use std::fmt;

use rastermill_actors::Mailbox;
use rastermill_common::QueryUid;

pub use accumulator::{AccumulatePartial, AccumulatorCounters, ComputeAccumulator, DropTile};
pub use bedrooms::{
    BedroomCounters, BuilderBedroom, ComputationBedroom, MakeArray, RegisterQuery, RegisterTiles,
    ScheduleCompute,
};
pub use builder::{Build, Builder, BuilderCounters, ResampledArray, SampleFailed, TileSampled};
pub use cache_handler::{
    CacheHandler, CacheHandlerCounters, EnsureTiles, MayIRead, TileChecked, TileComputeFailed,
    TileMerging, TileOrphaned, TileWriting, TileWritten, WriteFailed,
};
pub use computer::{
    CancelCompute, ComputeJobDone, ComputeTiles, Computer, ComputerCounters, ResolvedPrimitive,
    SubQueryDelivered, SubQueryFailed, SubQueryTag,
};
pub use file_hasher::{CheckOutcome, CheckTile, FileHasher, FileHasherCounters};
pub use merger::{Merger, MergerCounters, MergeTile};
pub use producer::{ArrayBuilt, Producer, ProducerCounters, TileReadable};
pub use queries_handler::{
    CloseWhenIdle, KillQuery, MadeArray, ParentLink, PostQuery, QueriesHandler,
    QueriesHandlerCounters, QueryFailed,
};
pub use rasters_handler::{
    CloseRaster, RasterActors, RasterIdle, RastersHandler, RastersHandlerCounters, SpawnRaster,
};
pub use resampler::{ResampleArray, Resampler, ResamplerCounters};
pub use sampler::{Sampler, SamplerCounters, SampleTile};
pub use writer::{Writer, WriterCounters, WriteTile};

/// Raster teardown. Unconditional: every actor honors it by releasing all
/// state and exiting.
#[derive(Debug)]
pub struct Die;

/// Fanout sent by the QueriesHandler when a query ends for any reason
/// (delivered, cancelled, failed). Receivers drop every piece of state keyed
/// to the query; actors with no such state ignore it.
#[derive(Debug, Clone)]
pub struct ForgetQuery {
    pub query: QueryUid,
}

/// Watermark update of a query's output queue, fanned out to the bedrooms.
///
/// `produced` counts arrays pushed so far; `queue_len` is the current queue
/// occupancy; their difference is what the consumer already pulled.
#[derive(Debug, Clone)]
pub struct OutputQueueUpdate {
    pub query: QueryUid,
    pub produced: usize,
    pub queue_len: usize,
    pub finished: bool,
}

/// The mailboxes of one raster's actor set. Cheap to clone; carried by every
/// actor that needs to talk across the set.
#[derive(Clone)]
pub struct RasterMailboxes {
    pub queries_handler: Mailbox<QueriesHandler>,
    pub producer: Mailbox<Producer>,
    pub builder_bedroom: Mailbox<BuilderBedroom>,
    pub computation_bedroom: Mailbox<ComputationBedroom>,
    pub cache_handler: Mailbox<CacheHandler>,
    pub file_hasher: Mailbox<FileHasher>,
    pub computer: Mailbox<Computer>,
    pub accumulator: Mailbox<ComputeAccumulator>,
    pub merger: Mailbox<Merger>,
    pub writer: Mailbox<Writer>,
    pub builder: Mailbox<Builder>,
    pub sampler: Mailbox<Sampler>,
    pub resampler: Mailbox<Resampler>,
}

impl fmt::Debug for RasterMailboxes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("RasterMailboxes")
    }
}
