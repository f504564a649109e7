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
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rastermill_actors::{EventLoop, EventLoopConfig, Mailbox, SchedulerClient};
use rastermill_common::{Pool, QueryUid, RasterUid};
use rastermill_storage::{raster_fingerprint, TileStore};
use tracing::info;

use crate::actors::{
    Builder, BuilderBedroom, CacheHandler, CloseRaster, ComputationBedroom, ComputeAccumulator,
    Computer, FileHasher, KillQuery, Merger, PostQuery, Producer, QueriesHandler, RasterActors,
    RasterMailboxes, RastersHandler, Resampler, ResolvedPrimitive, Sampler, SpawnRaster, Writer,
};
use crate::error::{ConfigError, QueryError};
use crate::models::{QueryPlan, QuerySpec, RasterLayout, RasterSpec, SubArray};

/// Process-level knobs of one dataset. Everything here is policy, never
/// correctness: the pipeline behaves identically with one thread per pool.
#[derive(Clone, Debug)]
pub struct DatasetConfig {
    pub compute_threads: usize,
    pub merge_threads: usize,
    pub io_threads: usize,
    pub resample_threads: usize,
    /// Per-raster cap on concurrent cache reads.
    pub sampler_concurrency: usize,
    /// Per-raster cap on concurrent remaps.
    pub resampler_concurrency: usize,
    /// Transient I/O errors tolerated per tile before dependent queries fail.
    pub io_retry_cap: u32,
    /// Output-queue capacity of the internal sub-queries collecting recipe
    /// inputs.
    pub sub_query_capacity: usize,
    /// How long the scheduler thread parks when idle.
    pub idle_sleep: Duration,
}

impl Default for DatasetConfig {
    fn default() -> DatasetConfig {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        DatasetConfig {
            compute_threads: num_cpus,
            merge_threads: 2,
            io_threads: 4,
            resample_threads: (num_cpus / 2).max(2),
            sampler_concurrency: 4,
            resampler_concurrency: 2,
            io_retry_cap: 3,
            sub_query_capacity: 5,
            idle_sleep: Duration::from_millis(2),
        }
    }
}

#[derive(Clone)]
struct Pools {
    compute: Pool,
    merge: Pool,
    io: Pool,
    resample: Pool,
}

impl Pools {
    fn rayon(config: &DatasetConfig) -> Pools {
        Pools {
            compute: Pool::rayon("compute", config.compute_threads),
            merge: Pool::rayon("merge", config.merge_threads),
            io: Pool::rayon("io", config.io_threads),
            resample: Pool::rayon("resample", config.resample_threads),
        }
    }

    #[cfg(any(test, feature = "testsuite"))]
    fn inline() -> Pools {
        Pools {
            compute: Pool::inline(),
            merge: Pool::inline(),
            io: Pool::inline(),
            resample: Pool::inline(),
        }
    }
}

struct RegisteredRaster {
    mailboxes: RasterMailboxes,
    layout: RasterLayout,
    fingerprint: String,
}

/// The entry point of the scheduler: registers rasters, posts queries,
/// and owns the scheduler thread and the worker pools.
pub struct Dataset {
    client: SchedulerClient,
    rasters_handler: Mailbox<RastersHandler>,
    pools: Pools,
    config: DatasetConfig,
    registry: Mutex<HashMap<RasterUid, RegisteredRaster>>,
    scheduler_thread: Option<JoinHandle<()>>,
}

impl Dataset {
    /// Opens a dataset with its scheduler running on a dedicated thread and
    /// rayon-backed worker pools.
    pub fn open(config: DatasetConfig) -> Dataset {
        let mut event_loop = EventLoop::new(EventLoopConfig {
            idle_sleep: config.idle_sleep,
        });
        let client = event_loop.client();
        let rasters_handler = event_loop.spawn_actor(RastersHandler::new());
        let pools = Pools::rayon(&config);
        let scheduler_thread = Some(event_loop.spawn_thread());
        Dataset {
            client,
            rasters_handler,
            pools,
            config,
            registry: Mutex::new(HashMap::new()),
            scheduler_thread,
        }
    }

    /// Opens a dataset whose loop the caller drives by hand
    /// (`EventLoop::run_until_idle`), with inline pools: every submitted job
    /// completes synchronously. Single-threaded and fully deterministic.
    #[cfg(any(test, feature = "testsuite"))]
    pub fn open_manual() -> (Dataset, EventLoop) {
        let config = DatasetConfig::default();
        let mut event_loop = EventLoop::new(EventLoopConfig {
            idle_sleep: config.idle_sleep,
        });
        let client = event_loop.client();
        let rasters_handler = event_loop.spawn_actor(RastersHandler::new());
        let dataset = Dataset {
            client,
            rasters_handler,
            pools: Pools::inline(),
            config,
            registry: Mutex::new(HashMap::new()),
            scheduler_thread: None,
        };
        (dataset, event_loop)
    }

    pub fn client(&self) -> SchedulerClient {
        self.client.clone()
    }

    #[cfg(any(test, feature = "testsuite"))]
    pub fn raster_mailboxes(&self, raster: &RasterUid) -> Option<RasterMailboxes> {
        self.registry
            .lock()
            .unwrap()
            .get(raster)
            .map(|entry| entry.mailboxes.clone())
    }

    /// Registers a raster source and instantiates its actor set.
    ///
    /// Primitives must already be registered: the dependency DAG is acyclic
    /// by construction, and unknown references are rejected here.
    pub fn register_raster(&self, spec: RasterSpec) -> Result<RasterUid, ConfigError> {
        if spec.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        if spec.tile_width == 0 || spec.tile_height == 0 {
            return Err(ConfigError::ZeroTileSize);
        }
        let mut registry = self.registry.lock().unwrap();

        let mut seen_names: Vec<&str> = Vec::new();
        let mut resolved_primitives = Vec::with_capacity(spec.primitives.len());
        let mut upstream_fingerprints = Vec::with_capacity(spec.primitives.len());
        for (name, primitive) in &spec.primitives {
            if seen_names.contains(&name.as_str()) {
                return Err(ConfigError::DuplicatePrimitiveName(name.clone()));
            }
            seen_names.push(name);
            let upstream = registry
                .get(&primitive.raster)
                .ok_or_else(|| ConfigError::UnknownPrimitiveRaster(primitive.raster.to_string()))?;
            upstream_fingerprints.push(upstream.fingerprint.clone());
            resolved_primitives.push(ResolvedPrimitive {
                name: name.clone(),
                queries_handler: upstream.mailboxes.queries_handler.clone(),
                layout: upstream.layout.clone(),
                convert: primitive.convert.clone(),
            });
        }

        let raster = RasterUid::new();
        let layout = RasterLayout {
            footprint: spec.footprint,
            tile_width: spec.tile_width,
            tile_height: spec.tile_height,
            channels: spec.channels.len() as u16,
        };
        let fingerprint = raster_fingerprint(
            &spec.recipe_name,
            &spec.recipe_version,
            &spec.channels,
            &upstream_fingerprints,
        );
        let store = TileStore::new(
            &spec.cache_dir,
            fingerprint.clone(),
            layout.channels,
            &spec.recipe_version,
        );

        let (mailboxes, actors) = self.build_raster_actors(
            &raster,
            &spec,
            &layout,
            store,
            resolved_primitives,
        );
        registry.insert(
            raster.clone(),
            RegisteredRaster {
                mailboxes: mailboxes.clone(),
                layout,
                fingerprint,
            },
        );
        drop(registry);

        self.client
            .send_message(
                &self.rasters_handler,
                SpawnRaster {
                    raster: raster.clone(),
                    mailboxes,
                    actors: Box::new(actors),
                },
            )
            .map_err(|_| ConfigError::SchedulerStopped)?;
        info!(raster = %raster, recipe = %spec.recipe_name, "registering raster");
        Ok(raster)
    }

    fn build_raster_actors(
        &self,
        raster: &RasterUid,
        spec: &RasterSpec,
        layout: &RasterLayout,
        store: TileStore,
        primitives: Vec<ResolvedPrimitive>,
    ) -> (RasterMailboxes, RasterActors) {
        let client = &self.client;
        let mailboxes = RasterMailboxes {
            queries_handler: client.create_mailbox::<QueriesHandler>("queries-handler"),
            producer: client.create_mailbox::<Producer>("producer"),
            builder_bedroom: client.create_mailbox::<BuilderBedroom>("builder-bedroom"),
            computation_bedroom: client
                .create_mailbox::<ComputationBedroom>("computation-bedroom"),
            cache_handler: client.create_mailbox::<CacheHandler>("cache-handler"),
            file_hasher: client.create_mailbox::<FileHasher>("file-hasher"),
            computer: client.create_mailbox::<Computer>("computer"),
            accumulator: client.create_mailbox::<ComputeAccumulator>("accumulator"),
            merger: client.create_mailbox::<Merger>("merger"),
            writer: client.create_mailbox::<Writer>("writer"),
            builder: client.create_mailbox::<Builder>("builder"),
            sampler: client.create_mailbox::<Sampler>("sampler"),
            resampler: client.create_mailbox::<Resampler>("resampler"),
        };
        let actors = RasterActors {
            queries_handler: QueriesHandler::new(
                raster.clone(),
                mailboxes.clone(),
                self.rasters_handler.clone(),
            ),
            producer: Producer::new(
                mailboxes.cache_handler.clone(),
                mailboxes.builder.clone(),
                mailboxes.queries_handler.clone(),
            ),
            builder_bedroom: BuilderBedroom::new(mailboxes.producer.clone()),
            computation_bedroom: ComputationBedroom::new(mailboxes.computer.clone()),
            cache_handler: CacheHandler::new(
                raster.clone(),
                layout.clone(),
                store.clone(),
                spec.overwrite,
                self.config.io_retry_cap,
                mailboxes.file_hasher.clone(),
                mailboxes.computer.clone(),
                mailboxes.producer.clone(),
                mailboxes.queries_handler.clone(),
            ),
            file_hasher: FileHasher::new(
                self.pools.io.clone(),
                self.client.clone(),
                mailboxes.file_hasher.clone(),
                mailboxes.cache_handler.clone(),
                store.clone(),
            ),
            computer: Computer::new(
                raster.clone(),
                layout.clone(),
                spec.compute.clone(),
                primitives,
                self.config.sub_query_capacity,
                self.pools.compute.clone(),
                self.client.clone(),
                mailboxes.computer.clone(),
                mailboxes.computation_bedroom.clone(),
                mailboxes.accumulator.clone(),
                mailboxes.cache_handler.clone(),
            ),
            accumulator: ComputeAccumulator::new(mailboxes.merger.clone()),
            merger: Merger::new(
                self.pools.merge.clone(),
                self.client.clone(),
                mailboxes.merger.clone(),
                mailboxes.writer.clone(),
                mailboxes.cache_handler.clone(),
                layout.channels,
            ),
            writer: Writer::new(
                self.pools.io.clone(),
                self.client.clone(),
                mailboxes.writer.clone(),
                mailboxes.cache_handler.clone(),
                store.clone(),
            ),
            builder: Builder::new(
                layout.clone(),
                mailboxes.sampler.clone(),
                mailboxes.resampler.clone(),
                mailboxes.producer.clone(),
                mailboxes.queries_handler.clone(),
            ),
            sampler: Sampler::new(
                self.pools.io.clone(),
                self.client.clone(),
                mailboxes.sampler.clone(),
                mailboxes.builder.clone(),
                store,
                self.config.sampler_concurrency,
                self.config.io_retry_cap,
            ),
            resampler: Resampler::new(
                self.pools.resample.clone(),
                self.client.clone(),
                mailboxes.resampler.clone(),
                mailboxes.builder.clone(),
                self.config.resampler_concurrency,
            ),
        };
        (mailboxes, actors)
    }

    /// Begins closing a raster. New queries are rejected immediately;
    /// teardown happens once running queries drained.
    pub fn close_raster(&self, raster: &RasterUid) -> Result<(), ConfigError> {
        let removed = self.registry.lock().unwrap().remove(raster);
        if removed.is_none() {
            return Err(ConfigError::UnknownRaster(raster.to_string()));
        }
        self.client
            .send_message(
                &self.rasters_handler,
                CloseRaster {
                    raster: raster.clone(),
                },
            )
            .map_err(|_| ConfigError::SchedulerStopped)?;
        Ok(())
    }

    /// Posts a query against a registered raster.
    ///
    /// Validation is synchronous; everything after this call is pipelined
    /// and consumed through the returned handle.
    pub fn post_query(
        &self,
        raster: &RasterUid,
        spec: QuerySpec,
    ) -> Result<QueryHandle, ConfigError> {
        let registry = self.registry.lock().unwrap();
        let entry = registry
            .get(raster)
            .ok_or_else(|| ConfigError::UnknownRaster(raster.to_string()))?;
        let plan = QueryPlan::build(&entry.layout, &spec)?;
        let queries_handler = entry.mailboxes.queries_handler.clone();
        drop(registry);

        let query = QueryUid::new();
        // One slot past the data capacity is reserved for a terminal error.
        let (output_tx, output_rx) = flume::bounded(plan.queue_capacity + 1);
        let expected = plan.produce_count();
        self.client
            .send_message(
                &queries_handler,
                PostQuery {
                    query: query.clone(),
                    plan: Arc::new(plan),
                    output_tx,
                    parent: None,
                },
            )
            .map_err(|_| ConfigError::SchedulerStopped)?;
        Ok(QueryHandle {
            query,
            output_rx,
            client: self.client.clone(),
            queries_handler,
            expected,
            received: 0,
            terminated: false,
        })
    }

    /// Stops the scheduler thread. Called by `Drop`; explicit calls make the
    /// shutdown point obvious.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.client.stop();
        if let Some(scheduler_thread) = self.scheduler_thread.take() {
            let _ = scheduler_thread.join();
        }
    }
}

impl Drop for Dataset {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Consumer-side handle of one query.
///
/// Arrays arrive through a bounded queue in the query's delivery order; the
/// pipeline only starts work when the consumer leaves headroom, so a slow
/// `next` loop throttles everything upstream of it.
pub struct QueryHandle {
    query: QueryUid,
    output_rx: flume::Receiver<Result<SubArray, QueryError>>,
    client: SchedulerClient,
    queries_handler: Mailbox<QueriesHandler>,
    expected: usize,
    received: usize,
    terminated: bool,
}

impl QueryHandle {
    pub fn query_uid(&self) -> &QueryUid {
        &self.query
    }

    pub fn num_expected(&self) -> usize {
        self.expected
    }

    /// Blocks until the next sub-array, the end of the query, or a terminal
    /// error. `None` means every sub-array was delivered.
    pub fn next(&mut self) -> Option<Result<SubArray, QueryError>> {
        if self.terminated {
            return None;
        }
        match self.output_rx.recv() {
            Ok(Ok(sub_array)) => {
                self.received += 1;
                Some(Ok(sub_array))
            }
            Ok(Err(error)) => {
                self.terminated = true;
                Some(Err(error))
            }
            Err(flume::RecvError::Disconnected) => {
                self.terminated = true;
                if self.received < self.expected {
                    // The scheduler went away mid-query.
                    Some(Err(QueryError::RasterClosed))
                } else {
                    None
                }
            }
        }
    }

    /// Non-blocking flavor of [`QueryHandle::next`] for callers driving a
    /// manual loop. `None` means "nothing available right now".
    pub fn try_next(&mut self) -> Option<Result<SubArray, QueryError>> {
        if self.terminated {
            return None;
        }
        match self.output_rx.try_recv() {
            Ok(Ok(sub_array)) => {
                self.received += 1;
                Some(Ok(sub_array))
            }
            Ok(Err(error)) => {
                self.terminated = true;
                Some(Err(error))
            }
            Err(flume::TryRecvError::Empty) => None,
            Err(flume::TryRecvError::Disconnected) => {
                self.terminated = true;
                if self.received < self.expected {
                    Some(Err(QueryError::RasterClosed))
                } else {
                    None
                }
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.terminated || self.received == self.expected
    }

    /// Asks the scheduler to drop the query. Pending work is released and
    /// in-flight pool tasks are cancelled best-effort.
    pub fn cancel(&self) {
        let _ = self.client.send_message(
            &self.queries_handler,
            KillQuery {
                query: self.query.clone(),
            },
        );
    }
}
