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

use fnv::FnvHashMap;
use rastermill_actors::{Actor, ActorContext, ActorExitStatus, Handler, Mailbox, SchedulerClient};
use rastermill_common::{CancelToken, Footprint, PixelBuf, Pool, TileIndex};
use rastermill_storage::TileStore;
use serde::Serialize;

use crate::actors::cache_handler::{CacheHandler, TileWriting, TileWritten, WriteFailed};
use crate::actors::Die;

/// Persist one merged tile to the cache directory.
#[derive(Debug)]
pub struct WriteTile {
    pub tile: TileIndex,
    pub tile_footprint: Footprint,
    pub data: PixelBuf,
}

#[derive(Debug)]
struct WriteDone {
    tile: TileIndex,
    result: Result<PathBuf, String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct WriterCounters {
    pub num_writes: u64,
    pub num_write_failures: u64,
    pub num_in_flight: usize,
}

/// Writes cache tiles on the I/O pool, atomically: temp file on the same
/// filesystem, fsync, rename to the canonical name, fsync of the directory.
pub struct Writer {
    io_pool: Pool,
    client: SchedulerClient,
    self_mailbox: Mailbox<Writer>,
    cache_handler: Mailbox<CacheHandler>,
    store: TileStore,
    in_flight: FnvHashMap<TileIndex, CancelToken>,
    counters: WriterCounters,
}

impl Writer {
    pub fn new(
        io_pool: Pool,
        client: SchedulerClient,
        self_mailbox: Mailbox<Writer>,
        cache_handler: Mailbox<CacheHandler>,
        store: TileStore,
    ) -> Writer {
        Writer {
            io_pool,
            client,
            self_mailbox,
            cache_handler,
            store,
            in_flight: FnvHashMap::default(),
            counters: WriterCounters::default(),
        }
    }
}

impl Actor for Writer {
    type ObservableState = WriterCounters;

    fn name(&self) -> String {
        "Writer".to_string()
    }

    fn observable_state(&self) -> WriterCounters {
        let mut counters = self.counters.clone();
        counters.num_in_flight = self.in_flight.len();
        counters
    }
}

impl Handler<WriteTile> for Writer {
    fn handle(&mut self, msg: WriteTile, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        assert!(
            !self.in_flight.contains_key(&msg.tile),
            "two concurrent writers for tile {}",
            msg.tile,
        );
        ctx.send_message(&self.cache_handler, TileWriting { tile: msg.tile });
        let cancel = CancelToken::new();
        self.in_flight.insert(msg.tile, cancel.clone());
        let store = self.store.clone();
        self.client
            .submit_job(&self.io_pool, &self.self_mailbox, &cancel, move || {
                let result = store
                    .publish(msg.tile, &msg.tile_footprint, &msg.data)
                    .map_err(|error| error.to_string());
                WriteDone {
                    tile: msg.tile,
                    result,
                }
            });
        Ok(())
    }
}

impl Handler<WriteDone> for Writer {
    fn handle(&mut self, msg: WriteDone, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        if self.in_flight.remove(&msg.tile).is_none() {
            return Ok(());
        }
        match msg.result {
            Ok(path) => {
                self.counters.num_writes += 1;
                ctx.send_message(&self.cache_handler, TileWritten { tile: msg.tile, path });
            }
            Err(error) => {
                self.counters.num_write_failures += 1;
                ctx.send_message(&self.cache_handler, WriteFailed { tile: msg.tile, error });
            }
        }
        Ok(())
    }
}

impl Handler<Die> for Writer {
    fn handle(&mut self, _msg: Die, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        for (_tile, cancel) in self.in_flight.drain() {
            cancel.cancel();
        }
        Err(ActorExitStatus::Success)
    }
}
