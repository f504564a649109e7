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
use std::sync::Arc;

use fnv::FnvHashMap;
use rastermill_actors::{Actor, ActorContext, ActorExitStatus, Handler, Mailbox};
use rastermill_common::{PixelBuf, QueryUid, RasterUid};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::actors::computer::{Computer, SubQueryDelivered, SubQueryFailed, SubQueryTag};
use crate::actors::rasters_handler::{RasterIdle, RastersHandler};
use crate::actors::{Die, EnsureTiles, ForgetQuery, OutputQueueUpdate, RasterMailboxes, RegisterQuery};
use crate::error::QueryError;
use crate::models::{QueryPlan, SubArray};

/// Link from a sub-query back to the Computer of the raster that posted it.
#[derive(Clone)]
pub struct ParentLink {
    pub computer: Mailbox<Computer>,
    pub tag: SubQueryTag,
}

/// A new query enters the pipeline. Sent by the dataset facade, or by a
/// Computer collecting inputs from a primitive raster.
pub struct PostQuery {
    pub query: QueryUid,
    pub plan: Arc<QueryPlan>,
    pub output_tx: flume::Sender<Result<SubArray, QueryError>>,
    pub parent: Option<ParentLink>,
}

impl fmt::Debug for PostQuery {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PostQuery").field("query", &self.query).finish()
    }
}

/// A production array is ready to be pushed to the output queue, in delivery
/// order only.
#[derive(Debug)]
pub struct MadeArray {
    pub query: QueryUid,
    pub prod_idx: usize,
    pub data: PixelBuf,
}

/// User-requested cancellation.
#[derive(Debug, Clone)]
pub struct KillQuery {
    pub query: QueryUid,
}

/// Terminal failure surfaced by the pipeline for one query.
#[derive(Debug, Clone)]
pub struct QueryFailed {
    pub query: QueryUid,
    pub error: QueryError,
}

/// The raster is closing; reply `RasterIdle` once no query remains.
#[derive(Debug)]
pub struct CloseWhenIdle;

#[derive(Clone, Debug, Default, Serialize)]
pub struct QueriesHandlerCounters {
    pub num_queries_posted: u64,
    pub num_arrays_delivered: u64,
    pub num_queries_finished: u64,
    pub num_queries_failed: u64,
    pub num_queries_dropped: u64,
    pub num_live_queries: usize,
}

struct QueryState {
    plan: Arc<QueryPlan>,
    output_tx: flume::Sender<Result<SubArray, QueryError>>,
    produced_count: usize,
    last_queue_len: usize,
    ready: FnvHashMap<usize, PixelBuf>,
    parent: Option<ParentLink>,
}

/// Per-raster authority on query lifetime: slices queries into production
/// arrays, enforces the delivery order, watches the output-queue watermarks,
/// and fans kills out to the rest of the actor set.
///
/// Every decision to start new work derives from the headroom it publishes
/// through `OutputQueueUpdate`; the bedrooms release work, they never decide
/// headroom themselves.
pub struct QueriesHandler {
    raster: RasterUid,
    mailboxes: RasterMailboxes,
    rasters_handler: Mailbox<RastersHandler>,
    queries: FnvHashMap<QueryUid, QueryState>,
    closing: bool,
    counters: QueriesHandlerCounters,
}

impl QueriesHandler {
    pub fn new(
        raster: RasterUid,
        mailboxes: RasterMailboxes,
        rasters_handler: Mailbox<RastersHandler>,
    ) -> QueriesHandler {
        QueriesHandler {
            raster,
            mailboxes,
            rasters_handler,
            queries: FnvHashMap::default(),
            closing: false,
            counters: QueriesHandlerCounters::default(),
        }
    }

    fn emit_queue_update(
        &mut self,
        ctx: &mut ActorContext,
        query: &QueryUid,
        produced: usize,
        queue_len: usize,
        finished: bool,
    ) {
        let update = OutputQueueUpdate {
            query: query.clone(),
            produced,
            queue_len,
            finished,
        };
        ctx.send_message(&self.mailboxes.builder_bedroom, update.clone());
        ctx.send_message(&self.mailboxes.computation_bedroom, update);
    }

    /// Ends a query: pushes the terminal error if any, releases every piece
    /// of state keyed to it across the actor set, and notifies a parent
    /// Computer when the query was an interrupted collection sub-query.
    /// The caller emits the final `OutputQueueUpdate`.
    fn end_query(
        &mut self,
        ctx: &mut ActorContext,
        query: &QueryUid,
        state: QueryState,
        error: Option<QueryError>,
    ) {
        if let Some(error) = &error {
            // One slot past the data capacity is reserved for the terminal
            // error, so this send cannot fail on a live channel.
            let _ = state.output_tx.try_send(Err(error.clone()));
        }
        let interrupted = state.produced_count < state.plan.produce_count();
        if interrupted {
            if let Some(parent) = &state.parent {
                ctx.send_message(
                    &parent.computer,
                    SubQueryFailed {
                        tag: parent.tag,
                        error: error.clone().unwrap_or(QueryError::Cancelled),
                    },
                );
            }
        }
        let forget = ForgetQuery { query: query.clone() };
        ctx.send_message(&self.mailboxes.producer, forget.clone());
        ctx.send_message(&self.mailboxes.builder, forget.clone());
        ctx.send_message(&self.mailboxes.sampler, forget.clone());
        ctx.send_message(&self.mailboxes.resampler, forget.clone());
        ctx.send_message(&self.mailboxes.cache_handler, forget.clone());
        ctx.send_message(&self.mailboxes.computer, forget);
        self.maybe_reply_idle(ctx);
    }

    fn maybe_reply_idle(&mut self, ctx: &mut ActorContext) {
        if self.closing && self.queries.is_empty() {
            ctx.send_message(
                &self.rasters_handler,
                RasterIdle {
                    raster: self.raster.clone(),
                },
            );
        }
    }

    fn kill_query(&mut self, ctx: &mut ActorContext, query: &QueryUid, error: Option<QueryError>) {
        let Some(state) = self.queries.remove(query) else {
            return;
        };
        warn!(
            raster = %self.raster,
            query = %query,
            produced = state.produced_count,
            total = state.plan.produce_count(),
            "dropping query"
        );
        match error {
            Some(QueryError::Cancelled) | None => self.counters.num_queries_dropped += 1,
            Some(_) => self.counters.num_queries_failed += 1,
        }
        self.counters.num_live_queries = self.queries.len();
        self.emit_queue_update(ctx, query, state.produced_count, state.last_queue_len, true);
        self.end_query(ctx, query, state, error);
    }
}

impl Actor for QueriesHandler {
    type ObservableState = QueriesHandlerCounters;

    fn name(&self) -> String {
        "QueriesHandler".to_string()
    }

    fn observable_state(&self) -> QueriesHandlerCounters {
        self.counters.clone()
    }

    fn wants_tick(&self) -> bool {
        true
    }

    /// The consumer drains its queue without calling into the scheduler:
    /// watermark moves and dropped handles are only observable by polling.
    fn on_tick(&mut self, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let mut updates: Vec<(QueryUid, usize, usize)> = Vec::new();
        let mut dropped: Vec<QueryUid> = Vec::new();
        for (query, state) in &mut self.queries {
            if state.output_tx.is_disconnected() {
                dropped.push(query.clone());
                continue;
            }
            let queue_len = state.output_tx.len();
            if queue_len != state.last_queue_len {
                debug_assert!(queue_len < state.last_queue_len, "nothing else feeds this queue");
                state.last_queue_len = queue_len;
                updates.push((query.clone(), state.produced_count, queue_len));
            }
        }
        for (query, produced, queue_len) in updates {
            self.emit_queue_update(ctx, &query, produced, queue_len, false);
        }
        for query in dropped {
            self.kill_query(ctx, &query, None);
        }
        Ok(())
    }
}

impl Handler<PostQuery> for QueriesHandler {
    fn handle(&mut self, msg: PostQuery, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        if self.closing {
            let _ = msg.output_tx.try_send(Err(QueryError::RasterClosed));
            return Ok(());
        }
        info!(
            raster = %self.raster,
            query = %msg.query,
            num_arrays = msg.plan.produce_count(),
            num_tiles = msg.plan.tiles_in_need_order.len(),
            "new query"
        );
        self.counters.num_queries_posted += 1;
        ctx.send_message(
            &self.mailboxes.producer,
            RegisterQuery {
                query: msg.query.clone(),
                plan: msg.plan.clone(),
            },
        );
        if !msg.plan.tiles_in_need_order.is_empty() {
            ctx.send_message(
                &self.mailboxes.cache_handler,
                EnsureTiles {
                    query: msg.query.clone(),
                    plan: msg.plan.clone(),
                },
            );
        }
        ctx.send_message(
            &self.mailboxes.builder_bedroom,
            RegisterQuery {
                query: msg.query.clone(),
                plan: msg.plan.clone(),
            },
        );
        self.queries.insert(
            msg.query,
            QueryState {
                plan: msg.plan,
                output_tx: msg.output_tx,
                produced_count: 0,
                last_queue_len: 0,
                ready: FnvHashMap::default(),
                parent: msg.parent,
            },
        );
        self.counters.num_live_queries = self.queries.len();
        Ok(())
    }
}

impl Handler<MadeArray> for QueriesHandler {
    fn handle(&mut self, msg: MadeArray, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let Some(mut state) = self.queries.remove(&msg.query) else {
            // The query was killed while the array was in flight.
            return Ok(());
        };
        assert!(
            msg.prod_idx >= state.produced_count && !state.ready.contains_key(&msg.prod_idx),
            "production array {} of {} was built twice",
            msg.prod_idx,
            msg.query,
        );
        state.ready.insert(msg.prod_idx, msg.data);

        let mut pushed = false;
        while let Some(data) = state.ready.remove(&state.produced_count) {
            let footprint = state.plan.produce[state.produced_count].footprint;
            state
                .output_tx
                .try_send(Ok(SubArray { footprint, data }))
                .expect("output queue overflowed: headroom accounting is broken");
            state.produced_count += 1;
            state.last_queue_len = state.output_tx.len();
            self.counters.num_arrays_delivered += 1;
            pushed = true;
            if let Some(parent) = &state.parent {
                ctx.send_message(&parent.computer, SubQueryDelivered { tag: parent.tag });
            }
        }

        if pushed {
            let finished = state.produced_count == state.plan.produce_count();
            self.emit_queue_update(
                ctx,
                &msg.query,
                state.produced_count,
                state.last_queue_len,
                finished,
            );
            if finished {
                info!(raster = %self.raster, query = %msg.query, "query complete");
                self.counters.num_queries_finished += 1;
                self.counters.num_live_queries = self.queries.len();
                self.end_query(ctx, &msg.query, state, None);
                return Ok(());
            }
        }
        self.queries.insert(msg.query, state);
        Ok(())
    }
}

impl Handler<KillQuery> for QueriesHandler {
    fn handle(&mut self, msg: KillQuery, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.kill_query(ctx, &msg.query, Some(QueryError::Cancelled));
        Ok(())
    }
}

impl Handler<QueryFailed> for QueriesHandler {
    fn handle(&mut self, msg: QueryFailed, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.kill_query(ctx, &msg.query, Some(msg.error));
        Ok(())
    }
}

impl Handler<CloseWhenIdle> for QueriesHandler {
    fn handle(&mut self, _msg: CloseWhenIdle, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.closing = true;
        self.maybe_reply_idle(ctx);
        Ok(())
    }
}

impl Handler<Die> for QueriesHandler {
    fn handle(&mut self, _msg: Die, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let queries: Vec<QueryUid> = self.queries.keys().cloned().collect();
        for query in queries {
            self.kill_query(ctx, &query, Some(QueryError::RasterClosed));
        }
        debug!(raster = %self.raster, "queries handler dying");
        Err(ActorExitStatus::Success)
    }
}
