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
use rastermill_common::{CancelToken, Footprint, Pool, TileIndex};
use rastermill_storage::{CacheError, TileStore};
use serde::Serialize;

use crate::actors::cache_handler::{CacheHandler, TileChecked};
use crate::actors::Die;

/// Validate one cache-file candidate against its expected fingerprint.
#[derive(Debug)]
pub struct CheckTile {
    pub tile: TileIndex,
    pub footprint: Footprint,
    pub path: PathBuf,
}

/// Validation verdict.
#[derive(Debug)]
pub enum CheckOutcome {
    Valid(PathBuf),
    Corrupt(PathBuf),
    Io { path: PathBuf, error: String },
}

#[derive(Debug)]
struct CheckDone {
    tile: TileIndex,
    outcome: CheckOutcome,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct FileHasherCounters {
    pub num_checks: u64,
    pub num_in_flight: usize,
}

/// Validates existing cache tiles on the I/O pool: full decode, fingerprint
/// comparison against the file name, payload CRC.
pub struct FileHasher {
    io_pool: Pool,
    client: SchedulerClient,
    self_mailbox: Mailbox<FileHasher>,
    cache_handler: Mailbox<CacheHandler>,
    store: TileStore,
    in_flight: FnvHashMap<TileIndex, CancelToken>,
    counters: FileHasherCounters,
}

impl FileHasher {
    pub fn new(
        io_pool: Pool,
        client: SchedulerClient,
        self_mailbox: Mailbox<FileHasher>,
        cache_handler: Mailbox<CacheHandler>,
        store: TileStore,
    ) -> FileHasher {
        FileHasher {
            io_pool,
            client,
            self_mailbox,
            cache_handler,
            store,
            in_flight: FnvHashMap::default(),
            counters: FileHasherCounters::default(),
        }
    }
}

impl Actor for FileHasher {
    type ObservableState = FileHasherCounters;

    fn name(&self) -> String {
        "FileHasher".to_string()
    }

    fn observable_state(&self) -> FileHasherCounters {
        let mut counters = self.counters.clone();
        counters.num_in_flight = self.in_flight.len();
        counters
    }
}

impl Handler<CheckTile> for FileHasher {
    fn handle(&mut self, msg: CheckTile, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        let cancel = CancelToken::new();
        self.in_flight.insert(msg.tile, cancel.clone());
        self.counters.num_checks += 1;
        let store = self.store.clone();
        self.client.submit_job(&self.io_pool, &self.self_mailbox, &cancel, move || {
            let outcome = match store.validate(&msg.footprint, &msg.path) {
                Ok(()) => CheckOutcome::Valid(msg.path),
                Err(CacheError::Corrupt { .. }) => CheckOutcome::Corrupt(msg.path),
                Err(CacheError::Io(io_error)) => CheckOutcome::Io {
                    path: msg.path,
                    error: io_error.to_string(),
                },
            };
            CheckDone {
                tile: msg.tile,
                outcome,
            }
        });
        Ok(())
    }
}

impl Handler<CheckDone> for FileHasher {
    fn handle(&mut self, msg: CheckDone, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        if self.in_flight.remove(&msg.tile).is_none() {
            return Ok(());
        }
        ctx.send_message(
            &self.cache_handler,
            TileChecked {
                tile: msg.tile,
                outcome: msg.outcome,
            },
        );
        Ok(())
    }
}

impl Handler<Die> for FileHasher {
    fn handle(&mut self, _msg: Die, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        for (_tile, cancel) in self.in_flight.drain() {
            cancel.cancel();
        }
        Err(ActorExitStatus::Success)
    }
}
