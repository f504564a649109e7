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

use fnv::FnvHashMap;
use rastermill_actors::{Actor, ActorContext, ActorExitStatus, Handler, Mailbox};
use rastermill_common::{Footprint, PixelBuf, TileIndex};
use serde::Serialize;

use crate::actors::merger::{Merger, MergeTile};
use crate::actors::Die;

/// One partial output of a compute function. The sub-extents of a tile's
/// partials must tile its footprint: coverage is tracked by area.
#[derive(Debug)]
pub struct AccumulatePartial {
    pub tile: TileIndex,
    pub tile_footprint: Footprint,
    pub partial_footprint: Footprint,
    pub data: PixelBuf,
}

/// The tile's computation was cancelled: discard gathered partials.
#[derive(Debug)]
pub struct DropTile {
    pub tile: TileIndex,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct AccumulatorCounters {
    pub num_partials: u64,
    pub num_tiles_completed: u64,
    pub num_live_tiles: usize,
}

struct Accumulation {
    tile_footprint: Footprint,
    covered_pixels: u64,
    partials: Vec<(Footprint, PixelBuf)>,
}

/// Gathers the partial outputs of each tile computation until the tile
/// extent is fully covered, then hands the lot to the Merger.
pub struct ComputeAccumulator {
    merger: Mailbox<Merger>,
    accumulations: FnvHashMap<TileIndex, Accumulation>,
    counters: AccumulatorCounters,
}

impl ComputeAccumulator {
    pub fn new(merger: Mailbox<Merger>) -> ComputeAccumulator {
        ComputeAccumulator {
            merger,
            accumulations: FnvHashMap::default(),
            counters: AccumulatorCounters::default(),
        }
    }
}

impl Actor for ComputeAccumulator {
    type ObservableState = AccumulatorCounters;

    fn name(&self) -> String {
        "ComputeAccumulator".to_string()
    }

    fn observable_state(&self) -> AccumulatorCounters {
        let mut counters = self.counters.clone();
        counters.num_live_tiles = self.accumulations.len();
        counters
    }
}

impl Handler<AccumulatePartial> for ComputeAccumulator {
    fn handle(&mut self, msg: AccumulatePartial, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.counters.num_partials += 1;
        let accumulation = self
            .accumulations
            .entry(msg.tile)
            .or_insert_with(|| Accumulation {
                tile_footprint: msg.tile_footprint,
                covered_pixels: 0,
                partials: Vec::new(),
            });
        let covered = msg
            .partial_footprint
            .aligned_cover(&msg.tile_footprint)
            .map(|cover| cover.num_pixels())
            .unwrap_or(0);
        accumulation.covered_pixels += covered;
        accumulation.partials.push((msg.partial_footprint, msg.data));
        if accumulation.covered_pixels >= accumulation.tile_footprint.num_pixels() {
            let accumulation = self.accumulations.remove(&msg.tile).unwrap();
            self.counters.num_tiles_completed += 1;
            ctx.send_message(
                &self.merger,
                MergeTile {
                    tile: msg.tile,
                    tile_footprint: accumulation.tile_footprint,
                    partials: accumulation.partials,
                },
            );
        }
        Ok(())
    }
}

impl Handler<DropTile> for ComputeAccumulator {
    fn handle(&mut self, msg: DropTile, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.accumulations.remove(&msg.tile);
        Ok(())
    }
}

impl Handler<Die> for ComputeAccumulator {
    fn handle(&mut self, _msg: Die, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.accumulations.clear();
        Err(ActorExitStatus::Success)
    }
}
