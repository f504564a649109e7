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

use std::fmt;

use fnv::FnvHashMap;
use rastermill_actors::{Actor, ActorContext, ActorExitStatus, Handler};
use rastermill_common::RasterUid;
use serde::Serialize;
use tracing::info;

use crate::actors::builder::Builder;
use crate::actors::bedrooms::{BuilderBedroom, ComputationBedroom};
use crate::actors::accumulator::ComputeAccumulator;
use crate::actors::cache_handler::CacheHandler;
use crate::actors::computer::Computer;
use crate::actors::file_hasher::FileHasher;
use crate::actors::merger::Merger;
use crate::actors::producer::Producer;
use crate::actors::queries_handler::{CloseWhenIdle, QueriesHandler};
use crate::actors::resampler::Resampler;
use crate::actors::sampler::Sampler;
use crate::actors::writer::Writer;
use crate::actors::{Die, RasterMailboxes};

/// The 13 actors of one raster, constructed and wired by the dataset facade,
/// registered into the loop by the RastersHandler.
pub struct RasterActors {
    pub queries_handler: QueriesHandler,
    pub producer: Producer,
    pub builder_bedroom: BuilderBedroom,
    pub computation_bedroom: ComputationBedroom,
    pub cache_handler: CacheHandler,
    pub file_hasher: FileHasher,
    pub computer: Computer,
    pub accumulator: ComputeAccumulator,
    pub merger: Merger,
    pub writer: Writer,
    pub builder: Builder,
    pub sampler: Sampler,
    pub resampler: Resampler,
}

/// Registration of a new raster with its full actor set.
pub struct SpawnRaster {
    pub raster: RasterUid,
    pub mailboxes: RasterMailboxes,
    pub actors: Box<RasterActors>,
}

impl fmt::Debug for SpawnRaster {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SpawnRaster").field("raster", &self.raster).finish()
    }
}

/// Begin closing a raster; teardown happens once its queries drained.
#[derive(Debug)]
pub struct CloseRaster {
    pub raster: RasterUid,
}

/// Reply from a closing raster's QueriesHandler: no queries remain.
#[derive(Debug)]
pub struct RasterIdle {
    pub raster: RasterUid,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RastersHandlerCounters {
    pub num_rasters_registered: u64,
    pub num_rasters_closed: u64,
    pub num_live_rasters: usize,
}

struct RasterEntry {
    mailboxes: RasterMailboxes,
    closing: bool,
}

/// Top-level actor owning the lifecycle of every registered raster.
///
/// Close is reference-counted through the QueriesHandler: the actor set of a
/// raster is torn down only after all of its queries have terminated, and
/// the teardown itself is an unconditional `Die` fanout, QueriesHandler
/// first.
pub struct RastersHandler {
    rasters: FnvHashMap<RasterUid, RasterEntry>,
    counters: RastersHandlerCounters,
}

impl RastersHandler {
    pub fn new() -> RastersHandler {
        RastersHandler {
            rasters: FnvHashMap::default(),
            counters: RastersHandlerCounters::default(),
        }
    }
}

impl Default for RastersHandler {
    fn default() -> Self {
        RastersHandler::new()
    }
}

impl Actor for RastersHandler {
    type ObservableState = RastersHandlerCounters;

    fn name(&self) -> String {
        "RastersHandler".to_string()
    }

    fn observable_state(&self) -> RastersHandlerCounters {
        let mut counters = self.counters.clone();
        counters.num_live_rasters = self.rasters.len();
        counters
    }
}

impl Handler<SpawnRaster> for RastersHandler {
    fn handle(&mut self, msg: SpawnRaster, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        info!(raster = %msg.raster, "raster registered");
        let mailboxes = msg.mailboxes;
        let actors = *msg.actors;
        ctx.spawn_with_mailbox(&mailboxes.queries_handler, actors.queries_handler);
        ctx.spawn_with_mailbox(&mailboxes.producer, actors.producer);
        ctx.spawn_with_mailbox(&mailboxes.builder_bedroom, actors.builder_bedroom);
        ctx.spawn_with_mailbox(&mailboxes.computation_bedroom, actors.computation_bedroom);
        ctx.spawn_with_mailbox(&mailboxes.cache_handler, actors.cache_handler);
        ctx.spawn_with_mailbox(&mailboxes.file_hasher, actors.file_hasher);
        ctx.spawn_with_mailbox(&mailboxes.computer, actors.computer);
        ctx.spawn_with_mailbox(&mailboxes.accumulator, actors.accumulator);
        ctx.spawn_with_mailbox(&mailboxes.merger, actors.merger);
        ctx.spawn_with_mailbox(&mailboxes.writer, actors.writer);
        ctx.spawn_with_mailbox(&mailboxes.builder, actors.builder);
        ctx.spawn_with_mailbox(&mailboxes.sampler, actors.sampler);
        ctx.spawn_with_mailbox(&mailboxes.resampler, actors.resampler);
        self.counters.num_rasters_registered += 1;
        self.rasters.insert(
            msg.raster,
            RasterEntry {
                mailboxes,
                closing: false,
            },
        );
        Ok(())
    }
}

impl Handler<CloseRaster> for RastersHandler {
    fn handle(&mut self, msg: CloseRaster, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let Some(entry) = self.rasters.get_mut(&msg.raster) else {
            return Ok(());
        };
        if entry.closing {
            return Ok(());
        }
        entry.closing = true;
        ctx.send_message(&entry.mailboxes.queries_handler, CloseWhenIdle);
        Ok(())
    }
}

impl Handler<RasterIdle> for RastersHandler {
    fn handle(&mut self, msg: RasterIdle, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let Some(entry) = self.rasters.get(&msg.raster) else {
            return Ok(());
        };
        if !entry.closing {
            return Ok(());
        }
        let entry = self.rasters.remove(&msg.raster).unwrap();
        info!(raster = %msg.raster, "tearing raster down");
        self.counters.num_rasters_closed += 1;
        // QueriesHandler first: any straggler query dies before the rest of
        // the set goes away.
        ctx.send_message(&entry.mailboxes.queries_handler, Die);
        ctx.send_message(&entry.mailboxes.producer, Die);
        ctx.send_message(&entry.mailboxes.builder_bedroom, Die);
        ctx.send_message(&entry.mailboxes.computation_bedroom, Die);
        ctx.send_message(&entry.mailboxes.cache_handler, Die);
        ctx.send_message(&entry.mailboxes.file_hasher, Die);
        ctx.send_message(&entry.mailboxes.computer, Die);
        ctx.send_message(&entry.mailboxes.accumulator, Die);
        ctx.send_message(&entry.mailboxes.merger, Die);
        ctx.send_message(&entry.mailboxes.writer, Die);
        ctx.send_message(&entry.mailboxes.builder, Die);
        ctx.send_message(&entry.mailboxes.sampler, Die);
        ctx.send_message(&entry.mailboxes.resampler, Die);
        Ok(())
    }
}
