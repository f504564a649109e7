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
use rastermill_common::{QueryUid, RasterUid, TileIndex};
use rastermill_storage::TileStore;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::actors::computer::{CancelCompute, Computer, ComputeTiles};
use crate::actors::file_hasher::{CheckOutcome, CheckTile, FileHasher};
use crate::actors::producer::{Producer, TileReadable};
use crate::actors::queries_handler::{QueriesHandler, QueryFailed};
use crate::actors::{Die, ForgetQuery};
use crate::error::QueryError;
use crate::models::{QueryPlan, RasterLayout};

/// A freshly posted query wants these cache tiles to exist. Triggers status
/// checks and computations as needed.
pub struct EnsureTiles {
    pub query: QueryUid,
    pub plan: Arc<QueryPlan>,
}

impl std::fmt::Debug for EnsureTiles {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EnsureTiles").field("query", &self.query).finish()
    }
}

/// Read-side subscription: answer `TileReadable` for each tile as it becomes
/// valid.
#[derive(Debug)]
pub struct MayIRead {
    pub query: QueryUid,
    pub prod_idx: usize,
    pub tiles: Vec<TileIndex>,
}

/// Validation verdict from the FileHasher.
#[derive(Debug)]
pub struct TileChecked {
    pub tile: TileIndex,
    pub outcome: CheckOutcome,
}

/// A tile entered its merge step.
#[derive(Debug)]
pub struct TileMerging {
    pub tile: TileIndex,
}

/// A tile entered its write step.
#[derive(Debug)]
pub struct TileWriting {
    pub tile: TileIndex,
}

/// A tile was durably published to the cache directory.
#[derive(Debug)]
pub struct TileWritten {
    pub tile: TileIndex,
    pub path: PathBuf,
}

/// Publishing a tile failed.
#[derive(Debug)]
pub struct WriteFailed {
    pub tile: TileIndex,
    pub error: String,
}

/// The compute function failed (or misbehaved) for a tile.
#[derive(Debug)]
pub struct TileComputeFailed {
    pub tile: TileIndex,
    pub error: String,
}

/// A pending tile lost the query that owned its computation; reassign it to
/// another interested query or forget it.
#[derive(Debug)]
pub struct TileOrphaned {
    pub tile: TileIndex,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
enum TileStatus {
    Unknown,
    Checking,
    Absent,
    Computing,
    Merging,
    Writing,
    Valid,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheHandlerCounters {
    pub num_checks_started: u64,
    pub num_tiles_validated: u64,
    pub num_corrupt_tiles: u64,
    pub num_computes_requested: u64,
    pub num_tiles_written: u64,
    pub num_write_failures: u64,
    pub num_live_subscriptions: usize,
}

struct TileStatusInner {
    status: TileStatus,
    path: Option<PathBuf>,
    failures: u32,
    /// Read-side subscribers still waiting for `Valid`.
    readers: Vec<(QueryUid, usize)>,
    /// Queries whose plan includes this tile and are still alive.
    interest: FnvHashSet<QueryUid>,
}

impl Default for TileStatusInner {
    fn default() -> Self {
        TileStatusInner {
            status: TileStatus::Unknown,
            path: None,
            failures: 0,
            readers: Vec::new(),
            interest: FnvHashSet::default(),
        }
    }
}

struct EnsureState {
    plan: Arc<QueryPlan>,
    /// Tiles awaiting a FileHasher verdict, with the first production index
    /// needing each.
    checking: FnvHashMap<TileIndex, usize>,
    to_compute: Vec<(TileIndex, usize)>,
}

/// Per-raster authority on cache-tile state.
///
/// Decides, for every requested tile, whether it can be read, must be
/// checked, must be computed, or is already on its way; and enforces the
/// at-most-one-concurrent-build rule: the first query to need an absent tile
/// owns its computation, later queries merely subscribe.
pub struct CacheHandler {
    raster: RasterUid,
    layout: RasterLayout,
    store: TileStore,
    overwrite: bool,
    io_retry_cap: u32,
    file_hasher: Mailbox<FileHasher>,
    computer: Mailbox<Computer>,
    producer: Mailbox<Producer>,
    queries_handler: Mailbox<QueriesHandler>,
    primed: bool,
    tiles: FnvHashMap<TileIndex, TileStatusInner>,
    plans: FnvHashMap<QueryUid, Arc<QueryPlan>>,
    ensures: FnvHashMap<QueryUid, EnsureState>,
    counters: CacheHandlerCounters,
}

impl CacheHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        raster: RasterUid,
        layout: RasterLayout,
        store: TileStore,
        overwrite: bool,
        io_retry_cap: u32,
        file_hasher: Mailbox<FileHasher>,
        computer: Mailbox<Computer>,
        producer: Mailbox<Producer>,
        queries_handler: Mailbox<QueriesHandler>,
    ) -> CacheHandler {
        CacheHandler {
            raster,
            layout,
            store,
            overwrite,
            io_retry_cap,
            file_hasher,
            computer,
            producer,
            queries_handler,
            primed: false,
            tiles: FnvHashMap::default(),
            plans: FnvHashMap::default(),
            ensures: FnvHashMap::default(),
            counters: CacheHandlerCounters::default(),
        }
    }

    /// First cache touch of the raster: make sure the directory exists and
    /// honor the overwrite flag.
    fn prime(&mut self) {
        if self.primed {
            return;
        }
        self.primed = true;
        if let Err(error) = self.store.ensure_dir() {
            warn!(raster = %self.raster, error = %error, "failed to create cache directory");
            return;
        }
        if self.overwrite {
            match self.store.purge() {
                Ok(num_removed) if num_removed > 0 => {
                    info!(raster = %self.raster, num_removed, "removed pre-existing cache files");
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(raster = %self.raster, error = %error, "failed to purge cache directory");
                }
            }
        }
    }

    fn notify_readers(&mut self, ctx: &mut ActorContext, tile: TileIndex) {
        let Some(state) = self.tiles.get_mut(&tile) else {
            return;
        };
        let path = state.path.clone().expect("valid tile without a path");
        for (query, prod_idx) in state.readers.drain(..) {
            ctx.send_message(
                &self.producer,
                TileReadable {
                    query,
                    prod_idx,
                    tile,
                    path: path.clone(),
                },
            );
        }
    }

    /// Terminal failure of a tile: every query interested in it dies.
    fn fail_interested_queries(&mut self, ctx: &mut ActorContext, tile: TileIndex, error: QueryError) {
        let Some(state) = self.tiles.get_mut(&tile) else {
            return;
        };
        let queries: Vec<QueryUid> = state.interest.iter().cloned().collect();
        for query in queries {
            ctx.send_message(
                &self.queries_handler,
                QueryFailed {
                    query,
                    error: error.clone(),
                },
            );
        }
    }

    /// Starts the computation phase of a query once none of its tiles is
    /// still being checked.
    fn maybe_start_compute(&mut self, ctx: &mut ActorContext, query: &QueryUid) {
        let Some(ensure) = self.ensures.get(query) else {
            return;
        };
        if !ensure.checking.is_empty() {
            return;
        }
        let ensure = self.ensures.remove(query).unwrap();
        // Another query's phase may have claimed some of these tiles while
        // we were still waiting on checks; this query stays subscribed to
        // those through `interest`, only unclaimed tiles start here.
        let mut tiles_to_compute = Vec::new();
        for (tile, min_prod_idx) in ensure.to_compute {
            let state = self.tiles.entry(tile).or_default();
            if state.status == TileStatus::Absent {
                state.status = TileStatus::Computing;
                tiles_to_compute.push((tile, min_prod_idx));
            }
        }
        if tiles_to_compute.is_empty() {
            return;
        }
        self.counters.num_computes_requested += tiles_to_compute.len() as u64;
        debug!(
            raster = %self.raster,
            query = %query,
            num_tiles = tiles_to_compute.len(),
            "requesting tile computations"
        );
        ctx.send_message(
            &self.computer,
            ComputeTiles {
                query: query.clone(),
                tiles: tiles_to_compute,
                queue_capacity: ensure.plan.queue_capacity,
            },
        );
    }

    /// Classifies one tile for an ensuring query; returns what the ensure
    /// state should record.
    fn classify_tile(
        &mut self,
        ctx: &mut ActorContext,
        query: &QueryUid,
        tile: TileIndex,
        min_prod_idx: usize,
        ensure: &mut EnsureState,
    ) {
        let state = self.tiles.entry(tile).or_default();
        state.interest.insert(query.clone());
        match state.status {
            TileStatus::Valid | TileStatus::Computing | TileStatus::Merging | TileStatus::Writing => {
                // Nothing to do: reads are answered through `MayIRead`, and a
                // build in flight already has this query attached as a
                // subscriber through `interest`.
            }
            TileStatus::Checking => {
                ensure.checking.insert(tile, min_prod_idx);
            }
            TileStatus::Absent => {
                ensure.to_compute.push((tile, min_prod_idx));
            }
            TileStatus::Unknown => {
                let candidates = match self.store.list_candidates(tile) {
                    Ok(candidates) => candidates,
                    Err(error) => {
                        warn!(raster = %self.raster, tile = %tile, error = %error, "failed to list cache candidates");
                        Vec::new()
                    }
                };
                if candidates.len() == 1 {
                    let path = candidates.into_iter().next().unwrap();
                    state.status = TileStatus::Checking;
                    state.path = Some(path.clone());
                    ensure.checking.insert(tile, min_prod_idx);
                    self.counters.num_checks_started += 1;
                    ctx.send_message(
                        &self.file_hasher,
                        CheckTile {
                            tile,
                            footprint: self.layout.tile_footprint(tile),
                            path,
                        },
                    );
                } else {
                    for path in candidates {
                        warn!(
                            raster = %self.raster,
                            tile = %tile,
                            path = %path.display(),
                            "removing conflicting cache candidate"
                        );
                        let _ = self.store.delete(&path);
                    }
                    state.status = TileStatus::Absent;
                    ensure.to_compute.push((tile, min_prod_idx));
                }
            }
        }
    }
}

impl Actor for CacheHandler {
    type ObservableState = CacheHandlerCounters;

    fn name(&self) -> String {
        "CacheHandler".to_string()
    }

    fn observable_state(&self) -> CacheHandlerCounters {
        let mut counters = self.counters.clone();
        counters.num_live_subscriptions = self
            .tiles
            .values()
            .map(|state| state.readers.len() + state.interest.len())
            .sum();
        counters
    }
}

impl Handler<EnsureTiles> for CacheHandler {
    fn handle(&mut self, msg: EnsureTiles, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.prime();
        let mut ensure = EnsureState {
            plan: msg.plan.clone(),
            checking: FnvHashMap::default(),
            to_compute: Vec::new(),
        };
        let tiles_in_need_order = msg.plan.tiles_in_need_order.clone();
        for (tile, min_prod_idx) in tiles_in_need_order {
            self.classify_tile(ctx, &msg.query, tile, min_prod_idx, &mut ensure);
        }
        self.plans.insert(msg.query.clone(), msg.plan);
        self.ensures.insert(msg.query.clone(), ensure);
        self.maybe_start_compute(ctx, &msg.query);
        Ok(())
    }
}

impl Handler<MayIRead> for CacheHandler {
    fn handle(&mut self, msg: MayIRead, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        for tile in msg.tiles {
            let state = self.tiles.entry(tile).or_default();
            if state.status == TileStatus::Valid {
                let path = state.path.clone().expect("valid tile without a path");
                ctx.send_message(
                    &self.producer,
                    TileReadable {
                        query: msg.query.clone(),
                        prod_idx: msg.prod_idx,
                        tile,
                        path,
                    },
                );
            } else {
                state.readers.push((msg.query.clone(), msg.prod_idx));
            }
        }
        Ok(())
    }
}

impl Handler<TileChecked> for CacheHandler {
    fn handle(&mut self, msg: TileChecked, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        if !self.tiles.contains_key(&msg.tile) {
            return Ok(());
        }
        let verdict_valid = match msg.outcome {
            CheckOutcome::Valid(path) => {
                let state = self.tiles.get_mut(&msg.tile).unwrap();
                debug_assert_eq!(state.status, TileStatus::Checking);
                state.status = TileStatus::Valid;
                state.path = Some(path);
                self.counters.num_tiles_validated += 1;
                self.notify_readers(ctx, msg.tile);
                true
            }
            CheckOutcome::Corrupt(path) => {
                warn!(raster = %self.raster, tile = %msg.tile, path = %path.display(), "corrupt cache tile, recomputing");
                self.counters.num_corrupt_tiles += 1;
                let _ = self.store.delete(&path);
                let state = self.tiles.get_mut(&msg.tile).unwrap();
                state.status = TileStatus::Absent;
                state.path = None;
                false
            }
            CheckOutcome::Io { path, error } => {
                let state = self.tiles.get_mut(&msg.tile).unwrap();
                state.failures += 1;
                let over_cap = state.failures > self.io_retry_cap;
                state.status = TileStatus::Absent;
                state.path = None;
                if over_cap {
                    self.fail_interested_queries(ctx, msg.tile, QueryError::Io(error));
                    return Ok(());
                }
                warn!(raster = %self.raster, tile = %msg.tile, path = %path.display(), error = %error, "cache check i/o error, recomputing");
                false
            }
        };

        let queries_with_tile: Vec<QueryUid> = self
            .ensures
            .iter_mut()
            .filter_map(|(query, ensure)| {
                let min_prod_idx = ensure.checking.remove(&msg.tile)?;
                if !verdict_valid {
                    ensure.to_compute.push((msg.tile, min_prod_idx));
                    ensure.to_compute.sort_by_key(|(_, idx)| *idx);
                }
                Some(query.clone())
            })
            .collect();
        for query in queries_with_tile {
            self.maybe_start_compute(ctx, &query);
        }
        Ok(())
    }
}

impl Handler<TileMerging> for CacheHandler {
    fn handle(&mut self, msg: TileMerging, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        if let Some(state) = self.tiles.get_mut(&msg.tile) {
            state.status = TileStatus::Merging;
        }
        Ok(())
    }
}

impl Handler<TileWriting> for CacheHandler {
    fn handle(&mut self, msg: TileWriting, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        if let Some(state) = self.tiles.get_mut(&msg.tile) {
            state.status = TileStatus::Writing;
        }
        Ok(())
    }
}

impl Handler<TileWritten> for CacheHandler {
    fn handle(&mut self, msg: TileWritten, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let state = self.tiles.entry(msg.tile).or_default();
        debug_assert_eq!(state.status, TileStatus::Writing);
        state.status = TileStatus::Valid;
        state.path = Some(msg.path);
        state.failures = 0;
        self.counters.num_tiles_written += 1;
        self.notify_readers(ctx, msg.tile);
        Ok(())
    }
}

impl Handler<WriteFailed> for CacheHandler {
    fn handle(&mut self, msg: WriteFailed, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        warn!(raster = %self.raster, tile = %msg.tile, error = %msg.error, "cache tile write failed");
        self.counters.num_write_failures += 1;
        if let Some(state) = self.tiles.get_mut(&msg.tile) {
            state.status = TileStatus::Absent;
            state.path = None;
            state.failures += 1;
        }
        // The tile itself is recoverable (recompute on next demand), but the
        // queries waiting on it are not.
        self.fail_interested_queries(ctx, msg.tile, QueryError::Io(msg.error));
        Ok(())
    }
}

impl Handler<TileComputeFailed> for CacheHandler {
    fn handle(&mut self, msg: TileComputeFailed, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        warn!(raster = %self.raster, tile = %msg.tile, error = %msg.error, "tile computation failed");
        if let Some(state) = self.tiles.get_mut(&msg.tile) {
            state.status = TileStatus::Absent;
            state.path = None;
        }
        self.fail_interested_queries(ctx, msg.tile, QueryError::Compute(msg.error));
        Ok(())
    }
}

impl Handler<TileOrphaned> for CacheHandler {
    fn handle(&mut self, msg: TileOrphaned, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let Some(state) = self.tiles.get_mut(&msg.tile) else {
            return Ok(());
        };
        let Some(new_owner) = state.interest.iter().min().cloned() else {
            state.status = TileStatus::Absent;
            return Ok(());
        };
        let Some(plan) = self.plans.get(&new_owner) else {
            state.status = TileStatus::Absent;
            return Ok(());
        };
        let min_prod_idx = plan.prod_idxs_per_tile[&msg.tile][0];
        debug!(raster = %self.raster, tile = %msg.tile, query = %new_owner, "reassigning orphaned tile");
        ctx.send_message(
            &self.computer,
            ComputeTiles {
                query: new_owner,
                tiles: vec![(msg.tile, min_prod_idx)],
                queue_capacity: plan.queue_capacity,
            },
        );
        Ok(())
    }
}

impl Handler<ForgetQuery> for CacheHandler {
    fn handle(&mut self, msg: ForgetQuery, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.plans.remove(&msg.query);
        self.ensures.remove(&msg.query);
        let mut to_cancel: Vec<TileIndex> = Vec::new();
        for (tile, state) in &mut self.tiles {
            state.readers.retain(|(query, _)| query != &msg.query);
            state.interest.remove(&msg.query);
            if state.status == TileStatus::Computing && state.interest.is_empty() {
                state.status = TileStatus::Absent;
                to_cancel.push(*tile);
            }
        }
        for tile in to_cancel {
            ctx.send_message(&self.computer, CancelCompute { tile });
        }
        Ok(())
    }
}

impl Handler<Die> for CacheHandler {
    fn handle(&mut self, _msg: Die, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.tiles.clear();
        self.plans.clear();
        self.ensures.clear();
        Err(ActorExitStatus::Success)
    }
}
