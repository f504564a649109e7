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

use std::collections::VecDeque;
use std::path::PathBuf;

use rastermill_actors::{Actor, ActorContext, ActorExitStatus, Handler, Mailbox, SchedulerClient};
use rastermill_common::{CancelToken, Footprint, PixelBuf, Pool, QueryUid, TileIndex};
use rastermill_storage::{CacheError, TileStore};
use serde::Serialize;
use tracing::warn;

use crate::actors::builder::{Builder, SampleFailed, TileSampled};
use crate::actors::{Die, ForgetQuery};

/// Read one tile rectangle from cache for a production array.
#[derive(Debug)]
pub struct SampleTile {
    pub query: QueryUid,
    pub prod_idx: usize,
    pub tile: TileIndex,
    pub tile_footprint: Footprint,
    pub path: PathBuf,
    /// The rectangle to extract, on the raster grid, inside the tile.
    pub rect: Footprint,
    /// Channel selection applied at read time.
    pub channels: Vec<u16>,
}

#[derive(Debug)]
struct SampleDone {
    job: SampleTile,
    attempts: u32,
    result: Result<PixelBuf, CacheErrorKind>,
}

#[derive(Debug)]
enum CacheErrorKind {
    Io(String),
    Corrupt(String),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SamplerCounters {
    pub num_reads: u64,
    pub num_read_errors: u64,
    pub num_queued: usize,
    pub num_in_flight: usize,
}

/// Reads cache tiles on the I/O pool, fronted by a waiting room: requests
/// are dispatched FIFO, honoring a per-raster concurrency cap. Transient
/// read errors are retried up to the configured cap.
pub struct Sampler {
    io_pool: Pool,
    client: SchedulerClient,
    self_mailbox: Mailbox<Sampler>,
    builder: Mailbox<Builder>,
    store: TileStore,
    concurrency_cap: usize,
    retry_cap: u32,
    waiting_room: VecDeque<(SampleTile, u32)>,
    in_flight: usize,
    counters: SamplerCounters,
}

impl Sampler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        io_pool: Pool,
        client: SchedulerClient,
        self_mailbox: Mailbox<Sampler>,
        builder: Mailbox<Builder>,
        store: TileStore,
        concurrency_cap: usize,
        retry_cap: u32,
    ) -> Sampler {
        Sampler {
            io_pool,
            client,
            self_mailbox,
            builder,
            store,
            concurrency_cap: concurrency_cap.max(1),
            retry_cap,
            waiting_room: VecDeque::new(),
            in_flight: 0,
            counters: SamplerCounters::default(),
        }
    }

    fn pump(&mut self) {
        while self.in_flight < self.concurrency_cap {
            let Some((job, attempts)) = self.waiting_room.pop_front() else {
                break;
            };
            self.in_flight += 1;
            let store = self.store.clone();
            // No cancel token: the completion must always come back to keep
            // the in-flight accounting exact; stale results are dropped by
            // the Builder.
            self.client.submit_job(
                &self.io_pool,
                &self.self_mailbox,
                &CancelToken::new(),
                move || {
                    let result = read_rect(&store, &job);
                    SampleDone {
                        job,
                        attempts: attempts + 1,
                        result,
                    }
                },
            );
        }
    }
}

fn read_rect(store: &TileStore, job: &SampleTile) -> Result<PixelBuf, CacheErrorKind> {
    let tile_buf = store.read(&job.path).map_err(|error| match error {
        CacheError::Io(io_error) => CacheErrorKind::Io(io_error.to_string()),
        corrupt => CacheErrorKind::Corrupt(corrupt.to_string()),
    })?;
    let (col, row) = job.rect.slice_in(&job.tile_footprint);
    let crop = tile_buf.crop(col, row, job.rect.width(), job.rect.height());
    Ok(crop.select_channels(&job.channels))
}

impl Actor for Sampler {
    type ObservableState = SamplerCounters;

    fn name(&self) -> String {
        "Sampler".to_string()
    }

    fn observable_state(&self) -> SamplerCounters {
        let mut counters = self.counters.clone();
        counters.num_queued = self.waiting_room.len();
        counters.num_in_flight = self.in_flight;
        counters
    }
}

impl Handler<SampleTile> for Sampler {
    fn handle(&mut self, msg: SampleTile, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.waiting_room.push_back((msg, 0));
        self.pump();
        Ok(())
    }
}

impl Handler<SampleDone> for Sampler {
    fn handle(&mut self, msg: SampleDone, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.in_flight -= 1;
        match msg.result {
            Ok(data) => {
                self.counters.num_reads += 1;
                ctx.send_message(
                    &self.builder,
                    TileSampled {
                        query: msg.job.query.clone(),
                        prod_idx: msg.job.prod_idx,
                        tile: msg.job.tile,
                        rect: msg.job.rect,
                        data,
                    },
                );
            }
            Err(CacheErrorKind::Io(error)) if msg.attempts <= self.retry_cap => {
                warn!(
                    tile = %msg.job.tile,
                    attempts = msg.attempts,
                    error = %error,
                    "cache read failed, retrying"
                );
                self.waiting_room.push_front((msg.job, msg.attempts));
            }
            Err(CacheErrorKind::Io(error)) | Err(CacheErrorKind::Corrupt(error)) => {
                self.counters.num_read_errors += 1;
                ctx.send_message(
                    &self.builder,
                    SampleFailed {
                        query: msg.job.query.clone(),
                        prod_idx: msg.job.prod_idx,
                        error,
                    },
                );
            }
        }
        self.pump();
        Ok(())
    }
}

impl Handler<ForgetQuery> for Sampler {
    fn handle(&mut self, msg: ForgetQuery, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.waiting_room.retain(|(job, _)| job.query != msg.query);
        Ok(())
    }
}

impl Handler<Die> for Sampler {
    fn handle(&mut self, _msg: Die, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.waiting_room.clear();
        Err(ActorExitStatus::Success)
    }
}
