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
use rastermill_common::{PixelBuf, QueryUid, TileIndex};
use serde::Serialize;

use crate::actors::builder::{Build, Builder};
use crate::actors::cache_handler::{CacheHandler, MayIRead};
use crate::actors::queries_handler::{MadeArray, QueriesHandler};
use crate::actors::{Die, ForgetQuery, MakeArray, RegisterQuery};
use crate::models::QueryPlan;

/// One cache tile became readable for one production array.
#[derive(Debug)]
pub struct TileReadable {
    pub query: QueryUid,
    pub prod_idx: usize,
    pub tile: TileIndex,
    pub path: PathBuf,
}

/// A production array finished assembling.
#[derive(Debug)]
pub struct ArrayBuilt {
    pub query: QueryUid,
    pub prod_idx: usize,
    pub data: PixelBuf,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ProducerCounters {
    pub num_arrays_started: u64,
    pub num_arrays_built: u64,
    pub num_live_queries: usize,
}

struct ProdState {
    pending_tiles: FnvHashSet<TileIndex>,
    readable: Vec<(TileIndex, PathBuf)>,
}

struct QueryProd {
    plan: Arc<QueryPlan>,
    built_count: usize,
    prods: FnvHashMap<usize, ProdState>,
}

/// Per-raster orchestrator of individual production arrays: waits for the
/// cache tiles each released array depends on, then hands the array to the
/// Builder, and routes finished arrays back to the QueriesHandler.
pub struct Producer {
    cache_handler: Mailbox<CacheHandler>,
    builder: Mailbox<Builder>,
    queries_handler: Mailbox<QueriesHandler>,
    queries: FnvHashMap<QueryUid, QueryProd>,
    counters: ProducerCounters,
}

impl Producer {
    pub fn new(
        cache_handler: Mailbox<CacheHandler>,
        builder: Mailbox<Builder>,
        queries_handler: Mailbox<QueriesHandler>,
    ) -> Producer {
        Producer {
            cache_handler,
            builder,
            queries_handler,
            queries: FnvHashMap::default(),
            counters: ProducerCounters::default(),
        }
    }
}

impl Actor for Producer {
    type ObservableState = ProducerCounters;

    fn name(&self) -> String {
        "Producer".to_string()
    }

    fn observable_state(&self) -> ProducerCounters {
        let mut counters = self.counters.clone();
        counters.num_live_queries = self.queries.len();
        counters
    }
}

impl Handler<RegisterQuery> for Producer {
    fn handle(&mut self, msg: RegisterQuery, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.queries.insert(
            msg.query,
            QueryProd {
                plan: msg.plan,
                built_count: 0,
                prods: FnvHashMap::default(),
            },
        );
        Ok(())
    }
}

impl Handler<MakeArray> for Producer {
    fn handle(&mut self, msg: MakeArray, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let Some(query_prod) = self.queries.get_mut(&msg.query) else {
            return Ok(());
        };
        self.counters.num_arrays_started += 1;
        let info = &query_prod.plan.produce[msg.prod_idx];
        if info.cache_tiles.is_empty() {
            // Nothing to read: nodata fill or pure compute-free array.
            ctx.send_message(
                &self.builder,
                Build {
                    query: msg.query,
                    prod_idx: msg.prod_idx,
                    plan: query_prod.plan.clone(),
                    tiles: Vec::new(),
                },
            );
            return Ok(());
        }
        query_prod.prods.insert(
            msg.prod_idx,
            ProdState {
                pending_tiles: info.cache_tiles.iter().copied().collect(),
                readable: Vec::new(),
            },
        );
        ctx.send_message(
            &self.cache_handler,
            MayIRead {
                query: msg.query,
                prod_idx: msg.prod_idx,
                tiles: info.cache_tiles.clone(),
            },
        );
        Ok(())
    }
}

impl Handler<TileReadable> for Producer {
    fn handle(&mut self, msg: TileReadable, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let Some(query_prod) = self.queries.get_mut(&msg.query) else {
            return Ok(());
        };
        let Some(prod_state) = query_prod.prods.get_mut(&msg.prod_idx) else {
            return Ok(());
        };
        if !prod_state.pending_tiles.remove(&msg.tile) {
            return Ok(());
        }
        prod_state.readable.push((msg.tile, msg.path));
        if prod_state.pending_tiles.is_empty() {
            let prod_state = query_prod.prods.remove(&msg.prod_idx).unwrap();
            ctx.send_message(
                &self.builder,
                Build {
                    query: msg.query,
                    prod_idx: msg.prod_idx,
                    plan: query_prod.plan.clone(),
                    tiles: prod_state.readable,
                },
            );
        }
        Ok(())
    }
}

impl Handler<ArrayBuilt> for Producer {
    fn handle(&mut self, msg: ArrayBuilt, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let Some(query_prod) = self.queries.get_mut(&msg.query) else {
            return Ok(());
        };
        query_prod.built_count += 1;
        self.counters.num_arrays_built += 1;
        let done = query_prod.built_count == query_prod.plan.produce_count();
        ctx.send_message(
            &self.queries_handler,
            MadeArray {
                query: msg.query.clone(),
                prod_idx: msg.prod_idx,
                data: msg.data,
            },
        );
        if done {
            self.queries.remove(&msg.query);
        }
        Ok(())
    }
}

impl Handler<ForgetQuery> for Producer {
    fn handle(&mut self, msg: ForgetQuery, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.queries.remove(&msg.query);
        Ok(())
    }
}

impl Handler<Die> for Producer {
    fn handle(&mut self, _msg: Die, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.queries.clear();
        Err(ActorExitStatus::Success)
    }
}
