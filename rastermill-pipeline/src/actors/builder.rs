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

use std::path::PathBuf;
use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};
use rastermill_actors::{Actor, ActorContext, ActorExitStatus, Handler, Mailbox};
use rastermill_common::{Footprint, PixelBuf, QueryUid, TileIndex};
use serde::Serialize;

use crate::actors::producer::{ArrayBuilt, Producer};
use crate::actors::queries_handler::{QueriesHandler, QueryFailed};
use crate::actors::resampler::{ResampleArray, Resampler};
use crate::actors::sampler::{Sampler, SampleTile};
use crate::actors::{Die, ForgetQuery};
use crate::error::QueryError;
use crate::models::{QueryPlan, RasterLayout};

/// Assemble one production array from these readable cache tiles.
pub struct Build {
    pub query: QueryUid,
    pub prod_idx: usize,
    pub plan: Arc<QueryPlan>,
    pub tiles: Vec<(TileIndex, PathBuf)>,
}

impl std::fmt::Debug for Build {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Build")
            .field("query", &self.query)
            .field("prod_idx", &self.prod_idx)
            .finish()
    }
}

/// One tile rectangle was read into memory for this production array.
#[derive(Debug)]
pub struct TileSampled {
    pub query: QueryUid,
    pub prod_idx: usize,
    pub tile: TileIndex,
    /// Extent of `data` on the raster grid.
    pub rect: Footprint,
    pub data: PixelBuf,
}

/// Reading a tile for this production array failed for good.
#[derive(Debug)]
pub struct SampleFailed {
    pub query: QueryUid,
    pub prod_idx: usize,
    pub error: String,
}

/// Remap finished for this production array.
#[derive(Debug)]
pub struct ResampledArray {
    pub query: QueryUid,
    pub prod_idx: usize,
    pub data: PixelBuf,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BuilderCounters {
    pub num_builds: u64,
    pub num_nodata_fills: u64,
    pub num_resamples_requested: u64,
    pub num_live_builds: usize,
}

struct BuildState {
    plan: Arc<QueryPlan>,
    sample_fp: Footprint,
    sample_buf: PixelBuf,
    pending_tiles: FnvHashSet<TileIndex>,
}

/// Assembles production arrays: fans tile reads out to the Sampler, gathers
/// them into one sample buffer, and either delivers it directly (same grid)
/// or sends it through the Resampler.
///
/// Arrays outside the raster never touch the pools: they are nodata-filled
/// right here.
pub struct Builder {
    layout: RasterLayout,
    sampler: Mailbox<Sampler>,
    resampler: Mailbox<Resampler>,
    producer: Mailbox<Producer>,
    queries_handler: Mailbox<QueriesHandler>,
    builds: FnvHashMap<(QueryUid, usize), BuildState>,
    counters: BuilderCounters,
}

impl Builder {
    pub fn new(
        layout: RasterLayout,
        sampler: Mailbox<Sampler>,
        resampler: Mailbox<Resampler>,
        producer: Mailbox<Producer>,
        queries_handler: Mailbox<QueriesHandler>,
    ) -> Builder {
        Builder {
            layout,
            sampler,
            resampler,
            producer,
            queries_handler,
            builds: FnvHashMap::default(),
            counters: BuilderCounters::default(),
        }
    }

    /// Final assembly once every tile rectangle landed in the sample buffer.
    fn finish_build(
        &mut self,
        ctx: &mut ActorContext,
        query: QueryUid,
        prod_idx: usize,
        state: BuildState,
    ) {
        let info = &state.plan.produce[prod_idx];
        let channels = state.plan.channels.len() as u16;
        if info.same_grid {
            let mut data = PixelBuf::new_filled(
                info.footprint.width(),
                info.footprint.height(),
                channels,
                state.plan.nodata,
            );
            let (dst_col, dst_row) = state.sample_fp.slice_in(&info.footprint);
            data.copy_rect_from(
                &state.sample_buf,
                0,
                0,
                dst_col,
                dst_row,
                state.sample_fp.width(),
                state.sample_fp.height(),
            );
            self.counters.num_builds += 1;
            ctx.send_message(
                &self.producer,
                ArrayBuilt {
                    query,
                    prod_idx,
                    data,
                },
            );
        } else {
            self.counters.num_resamples_requested += 1;
            ctx.send_message(
                &self.resampler,
                ResampleArray {
                    query,
                    prod_idx,
                    src_footprint: state.sample_fp,
                    src: state.sample_buf,
                    dst_footprint: info.footprint,
                    nodata: state.plan.nodata,
                },
            );
        }
    }
}

impl Actor for Builder {
    type ObservableState = BuilderCounters;

    fn name(&self) -> String {
        "Builder".to_string()
    }

    fn observable_state(&self) -> BuilderCounters {
        let mut counters = self.counters.clone();
        counters.num_live_builds = self.builds.len();
        counters
    }
}

impl Handler<Build> for Builder {
    fn handle(&mut self, msg: Build, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let info = &msg.plan.produce[msg.prod_idx];
        let channels = msg.plan.channels.len() as u16;
        if !info.share_area {
            let data = PixelBuf::new_filled(
                info.footprint.width(),
                info.footprint.height(),
                channels,
                msg.plan.nodata,
            );
            self.counters.num_builds += 1;
            self.counters.num_nodata_fills += 1;
            ctx.send_message(
                &self.producer,
                ArrayBuilt {
                    query: msg.query,
                    prod_idx: msg.prod_idx,
                    data,
                },
            );
            return Ok(());
        }
        let sample_fp = info.sample_fp.expect("share_area implies a sample footprint");
        assert!(!msg.tiles.is_empty(), "a sampled array needs tiles");
        let state = BuildState {
            plan: msg.plan.clone(),
            sample_fp,
            sample_buf: PixelBuf::new_filled(
                sample_fp.width(),
                sample_fp.height(),
                channels,
                msg.plan.nodata,
            ),
            pending_tiles: msg.tiles.iter().map(|(tile, _)| *tile).collect(),
        };
        for (tile, path) in msg.tiles {
            let tile_footprint = self.layout.tile_footprint(tile);
            let rect = tile_footprint
                .intersection(&sample_fp)
                .expect("dependency tiles intersect the sample footprint");
            ctx.send_message(
                &self.sampler,
                SampleTile {
                    query: msg.query.clone(),
                    prod_idx: msg.prod_idx,
                    tile,
                    tile_footprint,
                    path,
                    rect,
                    channels: msg.plan.channels.clone(),
                },
            );
        }
        self.builds.insert((msg.query, msg.prod_idx), state);
        Ok(())
    }
}

impl Handler<TileSampled> for Builder {
    fn handle(&mut self, msg: TileSampled, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let key = (msg.query.clone(), msg.prod_idx);
        let Some(state) = self.builds.get_mut(&key) else {
            return Ok(());
        };
        if !state.pending_tiles.remove(&msg.tile) {
            return Ok(());
        }
        let (dst_col, dst_row) = msg.rect.slice_in(&state.sample_fp);
        state.sample_buf.copy_rect_from(
            &msg.data,
            0,
            0,
            dst_col,
            dst_row,
            msg.rect.width(),
            msg.rect.height(),
        );
        if state.pending_tiles.is_empty() {
            let state = self.builds.remove(&key).unwrap();
            self.finish_build(ctx, msg.query, msg.prod_idx, state);
        }
        Ok(())
    }
}

impl Handler<SampleFailed> for Builder {
    fn handle(&mut self, msg: SampleFailed, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        if self.builds.remove(&(msg.query.clone(), msg.prod_idx)).is_some() {
            ctx.send_message(
                &self.queries_handler,
                QueryFailed {
                    query: msg.query,
                    error: QueryError::Io(msg.error),
                },
            );
        }
        Ok(())
    }
}

impl Handler<ResampledArray> for Builder {
    fn handle(&mut self, msg: ResampledArray, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.counters.num_builds += 1;
        ctx.send_message(
            &self.producer,
            ArrayBuilt {
                query: msg.query,
                prod_idx: msg.prod_idx,
                data: msg.data,
            },
        );
        Ok(())
    }
}

impl Handler<ForgetQuery> for Builder {
    fn handle(&mut self, msg: ForgetQuery, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.builds.retain(|(query, _), _| query != &msg.query);
        Ok(())
    }
}

impl Handler<Die> for Builder {
    fn handle(&mut self, _msg: Die, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.builds.clear();
        Err(ActorExitStatus::Success)
    }
}
