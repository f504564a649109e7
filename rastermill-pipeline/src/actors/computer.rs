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
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use fnv::FnvHashMap;
use rastermill_actors::{Actor, ActorContext, ActorExitStatus, Handler, Mailbox, SchedulerClient};
use rastermill_common::{CancelToken, Footprint, PixelBuf, Pool, QueryUid, RasterUid, TileIndex};
use serde::Serialize;
use tracing::{debug, warn};

use crate::actors::accumulator::{AccumulatePartial, ComputeAccumulator, DropTile};
use crate::actors::bedrooms::{ComputationBedroom, RegisterTiles, ScheduleCompute};
use crate::actors::cache_handler::{CacheHandler, TileComputeFailed, TileOrphaned};
use crate::actors::queries_handler::{KillQuery, ParentLink, PostQuery, QueriesHandler};
use crate::actors::{Die, ForgetQuery};
use crate::error::QueryError;
use crate::models::{ComputeFn, ComputeInput, QueryPlan, QuerySpec, RasterLayout, SubArray, SubInput};

/// Start a computation phase: these tiles are missing and this query owns
/// their production.
#[derive(Debug)]
pub struct ComputeTiles {
    pub query: QueryUid,
    /// `(tile, first production index needing it)`, in need order.
    pub tiles: Vec<(TileIndex, usize)>,
    pub queue_capacity: usize,
}

/// Nobody is interested in this tile anymore: drop it wherever it is.
#[derive(Debug)]
pub struct CancelCompute {
    pub tile: TileIndex,
}

/// Identifies one collection sub-query posted against a primitive raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubQueryTag {
    pub collection: u64,
    pub primitive_idx: usize,
}

/// A collection sub-query delivered one more input array.
#[derive(Debug)]
pub struct SubQueryDelivered {
    pub tag: SubQueryTag,
}

/// A collection sub-query died before delivering everything.
#[derive(Debug)]
pub struct SubQueryFailed {
    pub tag: SubQueryTag,
    pub error: QueryError,
}

/// Completion of one compute job.
pub struct ComputeJobDone {
    pub tile: TileIndex,
    pub tile_footprint: Footprint,
    pub result: Result<Vec<(Footprint, PixelBuf)>, String>,
}

impl std::fmt::Debug for ComputeJobDone {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ComputeJobDone")
            .field("tile", &self.tile)
            .field("ok", &self.result.is_ok())
            .finish()
    }
}

/// A primitive raster resolved at registration time.
pub struct ResolvedPrimitive {
    pub name: String,
    pub queries_handler: Mailbox<QueriesHandler>,
    pub layout: RasterLayout,
    pub convert: Arc<dyn Fn(&Footprint) -> Footprint + Send + Sync>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ComputerCounters {
    pub num_tiles_computed: u64,
    pub num_compute_errors: u64,
    pub num_sub_queries: u64,
    pub num_live_collections: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TileDispatch {
    Waiting { released: bool },
    Dispatched,
    Cancelled,
}

struct SubCollection {
    queries_handler: Mailbox<QueriesHandler>,
    sub_query: QueryUid,
    output_rx: flume::Receiver<Result<SubArray, QueryError>>,
    /// Input arrays in tile order; `None` once consumed by a dispatch.
    collected: Vec<Option<SubArray>>,
    failed: Option<QueryError>,
}

struct Collection {
    query: QueryUid,
    tiles: Vec<(TileIndex, Footprint)>,
    dispatch: Vec<TileDispatch>,
    subs: Vec<SubCollection>,
}

impl Collection {
    fn is_drained(&self) -> bool {
        self.dispatch
            .iter()
            .all(|state| matches!(state, TileDispatch::Dispatched | TileDispatch::Cancelled))
    }
}

/// Dispatches tile computations to the compute pool, once the bedroom
/// released the tile and every primitive delivered its input array.
///
/// For recipes with primitives, each computation phase posts one internal
/// sub-query per primitive, covering the converted footprints of the phase's
/// tiles in order; the inputs stream back through ordinary bounded output
/// queues, so upstream production is itself throttled by how fast this
/// raster consumes.
pub struct Computer {
    raster: RasterUid,
    layout: RasterLayout,
    compute_fn: ComputeFn,
    primitives: Vec<ResolvedPrimitive>,
    sub_query_capacity: usize,
    compute_pool: Pool,
    client: SchedulerClient,
    self_mailbox: Mailbox<Computer>,
    computation_bedroom: Mailbox<ComputationBedroom>,
    accumulator: Mailbox<ComputeAccumulator>,
    cache_handler: Mailbox<CacheHandler>,
    collections: FnvHashMap<u64, Collection>,
    next_collection_id: u64,
    collection_of_tile: FnvHashMap<TileIndex, u64>,
    collections_of_query: FnvHashMap<QueryUid, Vec<u64>>,
    computing: FnvHashMap<TileIndex, CancelToken>,
    counters: ComputerCounters,
}

impl Computer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        raster: RasterUid,
        layout: RasterLayout,
        compute_fn: ComputeFn,
        primitives: Vec<ResolvedPrimitive>,
        sub_query_capacity: usize,
        compute_pool: Pool,
        client: SchedulerClient,
        self_mailbox: Mailbox<Computer>,
        computation_bedroom: Mailbox<ComputationBedroom>,
        accumulator: Mailbox<ComputeAccumulator>,
        cache_handler: Mailbox<CacheHandler>,
    ) -> Computer {
        Computer {
            raster,
            layout,
            compute_fn,
            primitives,
            sub_query_capacity,
            compute_pool,
            client,
            self_mailbox,
            computation_bedroom,
            accumulator,
            cache_handler,
            collections: FnvHashMap::default(),
            next_collection_id: 0,
            collection_of_tile: FnvHashMap::default(),
            collections_of_query: FnvHashMap::default(),
            computing: FnvHashMap::default(),
            counters: ComputerCounters::default(),
        }
    }

    /// Pulls everything currently available out of the sub-query queues.
    fn drain_sub_queues(&mut self, collection_id: u64) {
        let Some(collection) = self.collections.get_mut(&collection_id) else {
            return;
        };
        for sub in &mut collection.subs {
            while let Ok(item) = sub.output_rx.try_recv() {
                match item {
                    // Deliveries arrive in tile order by construction.
                    Ok(sub_array) => sub.collected.push(Some(sub_array)),
                    Err(error) => sub.failed = Some(error),
                }
            }
        }
    }

    fn fail_collection(&mut self, ctx: &mut ActorContext, collection_id: u64, error: QueryError) {
        let Some(collection) = self.collections.get_mut(&collection_id) else {
            return;
        };
        warn!(
            raster = %self.raster,
            query = %collection.query,
            error = %error,
            "input collection failed"
        );
        let mut failed_tiles = Vec::new();
        for ((tile, _), dispatch) in collection.tiles.iter().zip(&mut collection.dispatch) {
            if matches!(dispatch, TileDispatch::Waiting { .. }) {
                *dispatch = TileDispatch::Cancelled;
                failed_tiles.push(*tile);
            }
        }
        for tile in failed_tiles {
            self.collection_of_tile.remove(&tile);
            ctx.send_message(
                &self.cache_handler,
                TileComputeFailed {
                    tile,
                    error: error.to_string(),
                },
            );
        }
    }

    fn try_dispatch(&mut self, ctx: &mut ActorContext, collection_id: u64) {
        self.drain_sub_queues(collection_id);
        let Some(collection) = self.collections.get_mut(&collection_id) else {
            return;
        };
        if let Some(error) = collection
            .subs
            .iter()
            .find_map(|sub| sub.failed.clone())
        {
            self.fail_collection(ctx, collection_id, error);
            return;
        }
        let mut to_dispatch: Vec<(usize, TileIndex, Footprint, HashMap<String, SubInput>)> =
            Vec::new();
        for (tile_idx, ((tile, tile_footprint), dispatch)) in collection
            .tiles
            .iter()
            .zip(&mut collection.dispatch)
            .enumerate()
        {
            if *dispatch != (TileDispatch::Waiting { released: true }) {
                continue;
            }
            let inputs_ready = collection.subs.iter().all(|sub| {
                sub.collected
                    .get(tile_idx)
                    .map(|slot| slot.is_some())
                    .unwrap_or(false)
            });
            if !inputs_ready {
                continue;
            }
            let mut collected: HashMap<String, SubInput> = HashMap::new();
            for (sub, primitive) in collection.subs.iter_mut().zip(&self.primitives) {
                let sub_array = sub.collected[tile_idx].take().unwrap();
                collected.insert(
                    primitive.name.clone(),
                    SubInput {
                        footprint: sub_array.footprint,
                        data: sub_array.data,
                    },
                );
            }
            *dispatch = TileDispatch::Dispatched;
            to_dispatch.push((tile_idx, *tile, *tile_footprint, collected));
        }
        for (_tile_idx, tile, tile_footprint, collected) in to_dispatch {
            self.dispatch_tile(tile, tile_footprint, collected);
        }
    }

    fn dispatch_tile(
        &mut self,
        tile: TileIndex,
        tile_footprint: Footprint,
        collected: HashMap<String, SubInput>,
    ) {
        let cancel = CancelToken::new();
        self.computing.insert(tile, cancel.clone());
        let compute_fn = self.compute_fn.clone();
        let channels = self.layout.channels;
        debug!(raster = %self.raster, tile = %tile, "dispatching tile computation");
        self.client
            .submit_job(&self.compute_pool, &self.self_mailbox, &cancel, move || {
                let input = ComputeInput {
                    tile_footprint,
                    channels,
                    collected,
                };
                let result = catch_unwind(AssertUnwindSafe(|| compute_fn(&input)))
                    .unwrap_or_else(|_| Err("compute function panicked".to_string()));
                ComputeJobDone {
                    tile,
                    tile_footprint,
                    result,
                }
            });
    }

    /// Forgets a collection once every tile left it. Sub-queries that are
    /// still delivering (possible when tiles were cancelled) are killed;
    /// dropping their output receivers would starve them anyway.
    fn gc_collection(&mut self, ctx: &mut ActorContext, collection_id: u64) {
        let Some(collection) = self.collections.get(&collection_id) else {
            return;
        };
        if !collection.is_drained() {
            return;
        }
        let collection = self.collections.remove(&collection_id).unwrap();
        for sub in &collection.subs {
            ctx.send_message(
                &sub.queries_handler,
                KillQuery {
                    query: sub.sub_query.clone(),
                },
            );
        }
        if let Some(ids) = self.collections_of_query.get_mut(&collection.query) {
            ids.retain(|&id| id != collection_id);
            if ids.is_empty() {
                self.collections_of_query.remove(&collection.query);
            }
        }
        for (tile, _) in &collection.tiles {
            if self.collection_of_tile.get(tile) == Some(&collection_id) {
                self.collection_of_tile.remove(tile);
            }
        }
    }
}

impl Actor for Computer {
    type ObservableState = ComputerCounters;

    fn name(&self) -> String {
        "Computer".to_string()
    }

    fn observable_state(&self) -> ComputerCounters {
        let mut counters = self.counters.clone();
        counters.num_live_collections = self.collections.len();
        counters
    }

    fn wants_tick(&self) -> bool {
        true
    }

    /// Belt over the notification path: drain the collection queues and
    /// dispatch whatever became ready.
    fn on_tick(&mut self, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let collection_ids: Vec<u64> = self.collections.keys().copied().collect();
        for collection_id in collection_ids {
            self.try_dispatch(ctx, collection_id);
            self.gc_collection(ctx, collection_id);
        }
        Ok(())
    }
}

impl Handler<ComputeTiles> for Computer {
    fn handle(&mut self, msg: ComputeTiles, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let collection_id = self.next_collection_id;
        self.next_collection_id += 1;
        let tiles: Vec<(TileIndex, Footprint)> = msg
            .tiles
            .iter()
            .map(|(tile, _)| (*tile, self.layout.tile_footprint(*tile)))
            .collect();

        let mut subs = Vec::with_capacity(self.primitives.len());
        for (primitive_idx, primitive) in self.primitives.iter().enumerate() {
            let footprints: Vec<Footprint> = tiles
                .iter()
                .map(|(_, tile_footprint)| (primitive.convert)(tile_footprint))
                .collect();
            let spec = QuerySpec::new(footprints).with_queue_capacity(self.sub_query_capacity);
            let plan = QueryPlan::build(&primitive.layout, &spec)
                .expect("collection sub-query plan must be valid");
            let sub_query = QueryUid::new();
            let (output_tx, output_rx) = flume::bounded(self.sub_query_capacity + 1);
            self.counters.num_sub_queries += 1;
            ctx.send_message(
                &primitive.queries_handler,
                PostQuery {
                    query: sub_query.clone(),
                    plan: Arc::new(plan),
                    output_tx,
                    parent: Some(ParentLink {
                        computer: self.self_mailbox.clone(),
                        tag: SubQueryTag {
                            collection: collection_id,
                            primitive_idx,
                        },
                    }),
                },
            );
            subs.push(SubCollection {
                queries_handler: primitive.queries_handler.clone(),
                sub_query,
                output_rx,
                collected: Vec::new(),
                failed: None,
            });
        }

        for (tile, _) in &tiles {
            self.collection_of_tile.insert(*tile, collection_id);
        }
        self.collections_of_query
            .entry(msg.query.clone())
            .or_default()
            .push(collection_id);
        self.collections.insert(
            collection_id,
            Collection {
                query: msg.query.clone(),
                dispatch: vec![TileDispatch::Waiting { released: false }; tiles.len()],
                tiles,
                subs,
            },
        );
        ctx.send_message(
            &self.computation_bedroom,
            RegisterTiles {
                query: msg.query,
                tiles: msg.tiles,
                queue_capacity: msg.queue_capacity,
            },
        );
        Ok(())
    }
}

impl Handler<ScheduleCompute> for Computer {
    fn handle(&mut self, msg: ScheduleCompute, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let Some(&collection_id) = self.collection_of_tile.get(&msg.tile) else {
            return Ok(());
        };
        if let Some(collection) = self.collections.get_mut(&collection_id) {
            if let Some(tile_idx) = collection.tiles.iter().position(|(tile, _)| *tile == msg.tile) {
                if collection.dispatch[tile_idx] == (TileDispatch::Waiting { released: false }) {
                    collection.dispatch[tile_idx] = TileDispatch::Waiting { released: true };
                }
            }
        }
        self.try_dispatch(ctx, collection_id);
        self.gc_collection(ctx, collection_id);
        Ok(())
    }
}

impl Handler<SubQueryDelivered> for Computer {
    fn handle(&mut self, msg: SubQueryDelivered, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.try_dispatch(ctx, msg.tag.collection);
        self.gc_collection(ctx, msg.tag.collection);
        Ok(())
    }
}

impl Handler<SubQueryFailed> for Computer {
    fn handle(&mut self, msg: SubQueryFailed, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        if self.collections.contains_key(&msg.tag.collection) {
            self.fail_collection(ctx, msg.tag.collection, msg.error);
        }
        Ok(())
    }
}

impl Handler<ComputeJobDone> for Computer {
    fn handle(&mut self, msg: ComputeJobDone, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        if self.computing.remove(&msg.tile).is_none() {
            // Cancelled while the completion was in flight.
            return Ok(());
        }
        match msg.result {
            Ok(partials) => {
                self.counters.num_tiles_computed += 1;
                for (partial_footprint, data) in partials {
                    ctx.send_message(
                        &self.accumulator,
                        AccumulatePartial {
                            tile: msg.tile,
                            tile_footprint: msg.tile_footprint,
                            partial_footprint,
                            data,
                        },
                    );
                }
            }
            Err(error) => {
                self.counters.num_compute_errors += 1;
                ctx.send_message(&self.cache_handler, TileComputeFailed { tile: msg.tile, error });
            }
        }
        Ok(())
    }
}

impl Handler<CancelCompute> for Computer {
    fn handle(&mut self, msg: CancelCompute, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        if let Some(cancel) = self.computing.remove(&msg.tile) {
            cancel.cancel();
            ctx.send_message(&self.accumulator, DropTile { tile: msg.tile });
        }
        if let Some(collection_id) = self.collection_of_tile.remove(&msg.tile) {
            if let Some(collection) = self.collections.get_mut(&collection_id) {
                if let Some(tile_idx) =
                    collection.tiles.iter().position(|(tile, _)| *tile == msg.tile)
                {
                    if matches!(collection.dispatch[tile_idx], TileDispatch::Waiting { .. }) {
                        collection.dispatch[tile_idx] = TileDispatch::Cancelled;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Handler<ForgetQuery> for Computer {
    fn handle(&mut self, msg: ForgetQuery, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let Some(collection_ids) = self.collections_of_query.remove(&msg.query) else {
            return Ok(());
        };
        for collection_id in collection_ids {
            let Some(collection) = self.collections.remove(&collection_id) else {
                continue;
            };
            for sub in &collection.subs {
                ctx.send_message(
                    &sub.queries_handler,
                    KillQuery {
                        query: sub.sub_query.clone(),
                    },
                );
            }
            for ((tile, _), dispatch) in collection.tiles.iter().zip(&collection.dispatch) {
                if self.collection_of_tile.get(tile) == Some(&collection_id) {
                    self.collection_of_tile.remove(tile);
                }
                // Tiles another query still waits on get reassigned; the
                // cache handler already cancelled the others.
                if matches!(dispatch, TileDispatch::Waiting { .. }) {
                    ctx.send_message(&self.cache_handler, TileOrphaned { tile: *tile });
                }
            }
        }
        Ok(())
    }
}

impl Handler<Die> for Computer {
    fn handle(&mut self, _msg: Die, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        for (_tile, cancel) in self.computing.drain() {
            cancel.cancel();
        }
        for collection in self.collections.values() {
            for sub in &collection.subs {
                ctx.send_message(
                    &sub.queries_handler,
                    KillQuery {
                        query: sub.sub_query.clone(),
                    },
                );
            }
        }
        self.collections.clear();
        self.collection_of_tile.clear();
        self.collections_of_query.clear();
        Err(ActorExitStatus::Success)
    }
}
