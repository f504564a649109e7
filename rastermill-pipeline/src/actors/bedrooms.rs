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

//! The two bedrooms: queues that withhold work until output-queue headroom
//! is signalled.
//!
//! Centralizing "may this start now?" here keeps the backpressure policy in
//! two small, separately testable actors instead of scattering headroom
//! checks through the producers. A query with capacity `Q` whose consumer
//! pulled `p` arrays may have production started for indices `< p + Q`, and
//! a cache tile may only be computed once the first production index needing
//! it is within that window.
//!
//! Both actors are generic over their single downstream recipient so that
//! unit tests can plug a message recorder in; production code uses the
//! default type parameters.

use std::sync::Arc;

use fnv::FnvHashMap;
use rastermill_actors::{Actor, ActorContext, ActorExitStatus, Handler, Mailbox};
use rastermill_common::{QueryUid, TileIndex};
use serde::Serialize;

use crate::actors::computer::Computer;
use crate::actors::producer::Producer;
use crate::actors::{Die, ForgetQuery, OutputQueueUpdate};
use crate::models::QueryPlan;

/// Registration of a freshly posted query with the BuilderBedroom (and the
/// Producer, which shares the message).
pub struct RegisterQuery {
    pub query: QueryUid,
    pub plan: Arc<QueryPlan>,
}

impl std::fmt::Debug for RegisterQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RegisterQuery").field("query", &self.query).finish()
    }
}

/// Release of one production array towards the Producer.
#[derive(Debug, Clone)]
pub struct MakeArray {
    pub query: QueryUid,
    pub prod_idx: usize,
}

/// Tiles a query needs computed, with the first production index needing
/// each. Sent by the Computer when a computation phase starts.
#[derive(Debug, Clone)]
pub struct RegisterTiles {
    pub query: QueryUid,
    pub tiles: Vec<(TileIndex, usize)>,
    pub queue_capacity: usize,
}

/// Permission for the Computer to dispatch one tile.
#[derive(Debug, Clone)]
pub struct ScheduleCompute {
    pub query: QueryUid,
    pub tile: TileIndex,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BedroomCounters {
    pub num_released: u64,
    pub num_live_queries: usize,
}

struct BuildBedState {
    plan: Arc<QueryPlan>,
    allowed_count: usize,
    pulled_count: usize,
}

/// Withholds production-array starts until the owning query has output-queue
/// headroom. Guarantees that in-flight arrays plus undelivered ready arrays
/// never exceed the queue capacity.
pub struct BuilderBedroom<P: Handler<MakeArray> = Producer> {
    producer: Mailbox<P>,
    queries: FnvHashMap<QueryUid, BuildBedState>,
    counters: BedroomCounters,
}

impl<P: Handler<MakeArray>> BuilderBedroom<P> {
    pub fn new(producer: Mailbox<P>) -> BuilderBedroom<P> {
        BuilderBedroom {
            producer,
            queries: FnvHashMap::default(),
            counters: BedroomCounters::default(),
        }
    }

    fn allow(&mut self, ctx: &mut ActorContext, query: &QueryUid) {
        let Some(state) = self.queries.get_mut(query) else {
            return;
        };
        while state.allowed_count < state.plan.produce_count()
            && state.allowed_count < state.pulled_count + state.plan.queue_capacity
        {
            ctx.send_message(
                &self.producer,
                MakeArray {
                    query: query.clone(),
                    prod_idx: state.allowed_count,
                },
            );
            state.allowed_count += 1;
            self.counters.num_released += 1;
        }
    }
}

impl<P: Handler<MakeArray>> Actor for BuilderBedroom<P> {
    type ObservableState = BedroomCounters;

    fn name(&self) -> String {
        "BuilderBedroom".to_string()
    }

    fn observable_state(&self) -> BedroomCounters {
        let mut counters = self.counters.clone();
        counters.num_live_queries = self.queries.len();
        counters
    }
}

impl<P: Handler<MakeArray>> Handler<RegisterQuery> for BuilderBedroom<P> {
    fn handle(&mut self, msg: RegisterQuery, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.queries.insert(
            msg.query.clone(),
            BuildBedState {
                plan: msg.plan,
                allowed_count: 0,
                pulled_count: 0,
            },
        );
        self.allow(ctx, &msg.query);
        Ok(())
    }
}

impl<P: Handler<MakeArray>> Handler<OutputQueueUpdate> for BuilderBedroom<P> {
    fn handle(
        &mut self,
        msg: OutputQueueUpdate,
        ctx: &mut ActorContext,
    ) -> Result<(), ActorExitStatus> {
        if msg.finished {
            self.queries.remove(&msg.query);
            return Ok(());
        }
        if let Some(state) = self.queries.get_mut(&msg.query) {
            state.pulled_count = msg.produced - msg.queue_len;
        }
        self.allow(ctx, &msg.query);
        Ok(())
    }
}

impl<P: Handler<MakeArray>> Handler<ForgetQuery> for BuilderBedroom<P> {
    fn handle(&mut self, msg: ForgetQuery, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.queries.remove(&msg.query);
        Ok(())
    }
}

impl<P: Handler<MakeArray>> Handler<Die> for BuilderBedroom<P> {
    fn handle(&mut self, _msg: Die, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.queries.clear();
        Err(ActorExitStatus::Success)
    }
}

#[derive(Debug)]
struct SleepingTile {
    tile: TileIndex,
    min_prod_idx: usize,
    released: bool,
}

#[derive(Default)]
struct ComputeBedState {
    tiles: Vec<SleepingTile>,
    pulled_count: usize,
    queue_capacity: usize,
}

/// Withholds tile computations until some production array needing the tile
/// is itself within the output-queue window. This is the central
/// backpressure mechanism of the compute path: a slow consumer stalls
/// compute, not just delivery.
pub struct ComputationBedroom<C: Handler<ScheduleCompute> = Computer> {
    computer: Mailbox<C>,
    queries: FnvHashMap<QueryUid, ComputeBedState>,
    counters: BedroomCounters,
}

impl<C: Handler<ScheduleCompute>> ComputationBedroom<C> {
    pub fn new(computer: Mailbox<C>) -> ComputationBedroom<C> {
        ComputationBedroom {
            computer,
            queries: FnvHashMap::default(),
            counters: BedroomCounters::default(),
        }
    }

    fn allow(&mut self, ctx: &mut ActorContext, query: &QueryUid) {
        let Some(state) = self.queries.get_mut(query) else {
            return;
        };
        if state.queue_capacity == 0 {
            // Watermarks arrived before the tiles were registered.
            return;
        }
        let max_prod_idx_allowed = state.pulled_count + state.queue_capacity - 1;
        for sleeping in &mut state.tiles {
            if !sleeping.released && sleeping.min_prod_idx <= max_prod_idx_allowed {
                sleeping.released = true;
                self.counters.num_released += 1;
                ctx.send_message(
                    &self.computer,
                    ScheduleCompute {
                        query: query.clone(),
                        tile: sleeping.tile,
                    },
                );
            }
        }
    }
}

impl<C: Handler<ScheduleCompute>> Actor for ComputationBedroom<C> {
    type ObservableState = BedroomCounters;

    fn name(&self) -> String {
        "ComputationBedroom".to_string()
    }

    fn observable_state(&self) -> BedroomCounters {
        let mut counters = self.counters.clone();
        counters.num_live_queries = self.queries.len();
        counters
    }
}

impl<C: Handler<ScheduleCompute>> Handler<RegisterTiles> for ComputationBedroom<C> {
    fn handle(&mut self, msg: RegisterTiles, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let state = self.queries.entry(msg.query.clone()).or_default();
        state.queue_capacity = msg.queue_capacity;
        state
            .tiles
            .extend(msg.tiles.into_iter().map(|(tile, min_prod_idx)| SleepingTile {
                tile,
                min_prod_idx,
                released: false,
            }));
        self.allow(ctx, &msg.query);
        Ok(())
    }
}

impl<C: Handler<ScheduleCompute>> Handler<OutputQueueUpdate> for ComputationBedroom<C> {
    fn handle(
        &mut self,
        msg: OutputQueueUpdate,
        ctx: &mut ActorContext,
    ) -> Result<(), ActorExitStatus> {
        if msg.finished {
            self.queries.remove(&msg.query);
            return Ok(());
        }
        let state = self.queries.entry(msg.query.clone()).or_default();
        state.pulled_count = msg.produced - msg.queue_len;
        self.allow(ctx, &msg.query);
        Ok(())
    }
}

impl<C: Handler<ScheduleCompute>> Handler<ForgetQuery> for ComputationBedroom<C> {
    fn handle(&mut self, msg: ForgetQuery, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.queries.remove(&msg.query);
        Ok(())
    }
}

impl<C: Handler<ScheduleCompute>> Handler<Die> for ComputationBedroom<C> {
    fn handle(&mut self, _msg: Die, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.queries.clear();
        Err(ActorExitStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rastermill_actors::{EventLoop, EventLoopConfig, Recorder};
    use rastermill_common::{Footprint, QueryUid, TileIndex};

    use super::*;
    use crate::models::{QueryPlan, QuerySpec, RasterLayout};

    fn plan(num_arrays: u32, queue_capacity: usize) -> Arc<QueryPlan> {
        let layout = RasterLayout {
            footprint: Footprint::new(0.0, 0.0, 1.0, 1.0, 16 * num_arrays, 16),
            tile_width: 16,
            tile_height: 16,
            channels: 1,
        };
        let footprints = (0..num_arrays)
            .map(|i| Footprint::new(16.0 * i as f64, 0.0, 1.0, 1.0, 16, 16))
            .collect();
        let spec = QuerySpec::new(footprints).with_queue_capacity(queue_capacity);
        Arc::new(QueryPlan::build(&layout, &spec).unwrap())
    }

    #[test]
    fn test_builder_bedroom_releases_up_to_headroom() {
        let mut event_loop = EventLoop::new(EventLoopConfig::default());
        let client = event_loop.client();
        let recorder = Recorder::<MakeArray>::default();
        let records = recorder.handle();
        let producer_mailbox = event_loop.spawn_actor(recorder);
        let bedroom_mailbox = event_loop.spawn_actor(BuilderBedroom::new(producer_mailbox));
        let query = QueryUid::new();
        client
            .send_message(
                &bedroom_mailbox,
                RegisterQuery {
                    query: query.clone(),
                    plan: plan(8, 2),
                },
            )
            .unwrap();
        event_loop.run_until_idle();
        let released: Vec<usize> = records.drain().into_iter().map(|msg| msg.prod_idx).collect();
        assert_eq!(released, vec![0, 1]);

        // The consumer pulled one array: exactly one more release.
        client
            .send_message(
                &bedroom_mailbox,
                OutputQueueUpdate {
                    query: query.clone(),
                    produced: 2,
                    queue_len: 1,
                    finished: false,
                },
            )
            .unwrap();
        event_loop.run_until_idle();
        let released: Vec<usize> = records.drain().into_iter().map(|msg| msg.prod_idx).collect();
        assert_eq!(released, vec![2]);

        // Queue refilled: no further release.
        client
            .send_message(
                &bedroom_mailbox,
                OutputQueueUpdate {
                    query,
                    produced: 3,
                    queue_len: 2,
                    finished: false,
                },
            )
            .unwrap();
        event_loop.run_until_idle();
        assert!(records.is_empty());
    }

    #[test]
    fn test_computation_bedroom_gates_on_first_needing_index() {
        let mut event_loop = EventLoop::new(EventLoopConfig::default());
        let client = event_loop.client();
        let recorder = Recorder::<ScheduleCompute>::default();
        let records = recorder.handle();
        let computer_mailbox = event_loop.spawn_actor(recorder);
        let bedroom_mailbox = event_loop.spawn_actor(ComputationBedroom::new(computer_mailbox));
        let query = QueryUid::new();
        let near = TileIndex::new(0, 0);
        let far = TileIndex::new(5, 0);
        client
            .send_message(
                &bedroom_mailbox,
                RegisterTiles {
                    query: query.clone(),
                    tiles: vec![(near, 0), (far, 5)],
                    queue_capacity: 2,
                },
            )
            .unwrap();
        event_loop.run_until_idle();
        // Only the tile needed by production index 0 fits the window [0, 2).
        let released: Vec<TileIndex> = records.drain().into_iter().map(|msg| msg.tile).collect();
        assert_eq!(released, vec![near]);

        // Consumer pulled 4 arrays: index 5 enters the window.
        client
            .send_message(
                &bedroom_mailbox,
                OutputQueueUpdate {
                    query,
                    produced: 4,
                    queue_len: 0,
                    finished: false,
                },
            )
            .unwrap();
        event_loop.run_until_idle();
        let released: Vec<TileIndex> = records.drain().into_iter().map(|msg| msg.tile).collect();
        assert_eq!(released, vec![far]);
    }
}
