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

use fnv::FnvHashMap;
use rastermill_actors::{Actor, ActorContext, ActorExitStatus, Handler, Mailbox, SchedulerClient};
use rastermill_common::{CancelToken, Footprint, PixelBuf, Pool, TileIndex};
use serde::Serialize;

use crate::actors::cache_handler::{CacheHandler, TileComputeFailed, TileMerging};
use crate::actors::writer::{Writer, WriteTile};
use crate::actors::Die;

/// All partials of one tile, ready to be combined into the cache array.
#[derive(Debug)]
pub struct MergeTile {
    pub tile: TileIndex,
    pub tile_footprint: Footprint,
    pub partials: Vec<(Footprint, PixelBuf)>,
}

#[derive(Debug)]
struct MergeDone {
    tile: TileIndex,
    tile_footprint: Footprint,
    result: Result<PixelBuf, String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MergerCounters {
    pub num_merges: u64,
    pub num_merge_errors: u64,
    pub num_in_flight: usize,
}

/// Combines the partial outputs of a tile computation into one tile array,
/// on the merge pool.
pub struct Merger {
    merge_pool: Pool,
    client: SchedulerClient,
    self_mailbox: Mailbox<Merger>,
    writer: Mailbox<Writer>,
    cache_handler: Mailbox<CacheHandler>,
    channels: u16,
    in_flight: FnvHashMap<TileIndex, CancelToken>,
    counters: MergerCounters,
}

impl Merger {
    pub fn new(
        merge_pool: Pool,
        client: SchedulerClient,
        self_mailbox: Mailbox<Merger>,
        writer: Mailbox<Writer>,
        cache_handler: Mailbox<CacheHandler>,
        channels: u16,
    ) -> Merger {
        Merger {
            merge_pool,
            client,
            self_mailbox,
            writer,
            cache_handler,
            channels,
            in_flight: FnvHashMap::default(),
            counters: MergerCounters::default(),
        }
    }
}

/// Copies each partial into its slot of the tile array. Partials must lie on
/// the tile's grid; anything sticking out of the tile is clipped.
fn merge_partials(
    tile_footprint: &Footprint,
    channels: u16,
    partials: &[(Footprint, PixelBuf)],
) -> Result<PixelBuf, String> {
    let mut tile_buf = PixelBuf::new_filled(
        tile_footprint.width(),
        tile_footprint.height(),
        channels,
        0.0,
    );
    for (partial_footprint, data) in partials {
        if !partial_footprint.same_grid(tile_footprint) {
            return Err("compute output is not on the tile grid".to_string());
        }
        if data.channels() != channels {
            return Err(format!(
                "compute output has {} channels, the raster has {channels}",
                data.channels()
            ));
        }
        if data.width() != partial_footprint.width() || data.height() != partial_footprint.height()
        {
            return Err("compute output shape does not match its footprint".to_string());
        }
        let Some(overlap) = partial_footprint.intersection(tile_footprint) else {
            continue;
        };
        let (src_col, src_row) = overlap.slice_in(partial_footprint);
        let (dst_col, dst_row) = overlap.slice_in(tile_footprint);
        tile_buf.copy_rect_from(
            data,
            src_col,
            src_row,
            dst_col,
            dst_row,
            overlap.width(),
            overlap.height(),
        );
    }
    Ok(tile_buf)
}

impl Actor for Merger {
    type ObservableState = MergerCounters;

    fn name(&self) -> String {
        "Merger".to_string()
    }

    fn observable_state(&self) -> MergerCounters {
        let mut counters = self.counters.clone();
        counters.num_in_flight = self.in_flight.len();
        counters
    }
}

impl Handler<MergeTile> for Merger {
    fn handle(&mut self, msg: MergeTile, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        ctx.send_message(&self.cache_handler, TileMerging { tile: msg.tile });
        let cancel = CancelToken::new();
        self.in_flight.insert(msg.tile, cancel.clone());
        let channels = self.channels;
        self.client
            .submit_job(&self.merge_pool, &self.self_mailbox, &cancel, move || {
                let result = merge_partials(&msg.tile_footprint, channels, &msg.partials);
                MergeDone {
                    tile: msg.tile,
                    tile_footprint: msg.tile_footprint,
                    result,
                }
            });
        Ok(())
    }
}

impl Handler<MergeDone> for Merger {
    fn handle(&mut self, msg: MergeDone, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        if self.in_flight.remove(&msg.tile).is_none() {
            return Ok(());
        }
        match msg.result {
            Ok(data) => {
                self.counters.num_merges += 1;
                ctx.send_message(
                    &self.writer,
                    WriteTile {
                        tile: msg.tile,
                        tile_footprint: msg.tile_footprint,
                        data,
                    },
                );
            }
            Err(error) => {
                self.counters.num_merge_errors += 1;
                ctx.send_message(&self.cache_handler, TileComputeFailed { tile: msg.tile, error });
            }
        }
        Ok(())
    }
}

impl Handler<Die> for Merger {
    fn handle(&mut self, _msg: Die, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        for (_tile, cancel) in self.in_flight.drain() {
            cancel.cancel();
        }
        Err(ActorExitStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use rastermill_common::{Footprint, PixelBuf};

    use super::merge_partials;

    #[test]
    fn test_merge_two_halves() {
        let tile_footprint = Footprint::new(0.0, 0.0, 1.0, 1.0, 4, 2);
        let left = Footprint::new(0.0, 0.0, 1.0, 1.0, 2, 2);
        let right = Footprint::new(2.0, 0.0, 1.0, 1.0, 2, 2);
        let partials = vec![
            (left, PixelBuf::new_filled(2, 2, 1, 1.0)),
            (right, PixelBuf::new_filled(2, 2, 1, 2.0)),
        ];
        let merged = merge_partials(&tile_footprint, 1, &partials).unwrap();
        assert_eq!(merged.get(0, 0, 0), 1.0);
        assert_eq!(merged.get(1, 1, 0), 1.0);
        assert_eq!(merged.get(2, 0, 0), 2.0);
        assert_eq!(merged.get(3, 1, 0), 2.0);
    }

    #[test]
    fn test_merge_clips_overhanging_partials() {
        let tile_footprint = Footprint::new(0.0, 0.0, 1.0, 1.0, 2, 2);
        let oversized = Footprint::new(-1.0, -1.0, 1.0, 1.0, 4, 4);
        let mut data = PixelBuf::new_filled(4, 4, 1, 0.0);
        data.set(1, 1, 0, 5.0);
        let merged = merge_partials(&tile_footprint, 1, &[(oversized, data)]).unwrap();
        assert_eq!(merged.get(0, 0, 0), 5.0);
    }

    #[test]
    fn test_merge_rejects_off_grid_partial() {
        let tile_footprint = Footprint::new(0.0, 0.0, 1.0, 1.0, 2, 2);
        let off_grid = Footprint::new(0.5, 0.0, 1.0, 1.0, 2, 2);
        let partials = vec![(off_grid, PixelBuf::new_filled(2, 2, 1, 0.0))];
        assert!(merge_partials(&tile_footprint, 1, &partials).is_err());
    }
}
