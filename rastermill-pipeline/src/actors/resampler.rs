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

use rastermill_actors::{Actor, ActorContext, ActorExitStatus, Handler, Mailbox, SchedulerClient};
use rastermill_common::{CancelToken, Footprint, PixelBuf, Pool, QueryUid};
use serde::Serialize;

use crate::actors::builder::{Builder, ResampledArray};
use crate::actors::{Die, ForgetQuery};

/// Remap a sampled array onto a production footprint that is not on the
/// raster's grid.
#[derive(Debug)]
pub struct ResampleArray {
    pub query: QueryUid,
    pub prod_idx: usize,
    pub src_footprint: Footprint,
    pub src: PixelBuf,
    pub dst_footprint: Footprint,
    pub nodata: f32,
}

#[derive(Debug)]
struct ResampleDone {
    query: QueryUid,
    prod_idx: usize,
    data: PixelBuf,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ResamplerCounters {
    pub num_resamples: u64,
    pub num_queued: usize,
    pub num_in_flight: usize,
}

/// Nearest-neighbour remap of `src` onto `dst_footprint`. Pixels whose
/// center falls outside `src` get `nodata`.
pub fn remap_nearest(
    src_footprint: &Footprint,
    src: &PixelBuf,
    dst_footprint: &Footprint,
    nodata: f32,
) -> PixelBuf {
    let channels = src.channels();
    let mut dst = PixelBuf::new_filled(
        dst_footprint.width(),
        dst_footprint.height(),
        channels,
        nodata,
    );
    for row in 0..dst_footprint.height() {
        for col in 0..dst_footprint.width() {
            let (world_x, world_y) = dst_footprint.pixel_center(col, row);
            if let Some((src_col, src_row)) = src_footprint.pixel_of(world_x, world_y) {
                for channel in 0..channels {
                    dst.set(col, row, channel, src.get(src_col, src_row, channel));
                }
            }
        }
    }
    dst
}

/// Remaps sampled arrays onto query footprints, on the resample pool, with
/// the same waiting-room front as the Sampler.
pub struct Resampler {
    resample_pool: Pool,
    client: SchedulerClient,
    self_mailbox: Mailbox<Resampler>,
    builder: Mailbox<Builder>,
    concurrency_cap: usize,
    waiting_room: VecDeque<ResampleArray>,
    in_flight: usize,
    counters: ResamplerCounters,
}

impl Resampler {
    pub fn new(
        resample_pool: Pool,
        client: SchedulerClient,
        self_mailbox: Mailbox<Resampler>,
        builder: Mailbox<Builder>,
        concurrency_cap: usize,
    ) -> Resampler {
        Resampler {
            resample_pool,
            client,
            self_mailbox,
            builder,
            concurrency_cap: concurrency_cap.max(1),
            waiting_room: VecDeque::new(),
            in_flight: 0,
            counters: ResamplerCounters::default(),
        }
    }

    fn pump(&mut self) {
        while self.in_flight < self.concurrency_cap {
            let Some(job) = self.waiting_room.pop_front() else {
                break;
            };
            self.in_flight += 1;
            self.client.submit_job(
                &self.resample_pool,
                &self.self_mailbox,
                &CancelToken::new(),
                move || {
                    let data =
                        remap_nearest(&job.src_footprint, &job.src, &job.dst_footprint, job.nodata);
                    ResampleDone {
                        query: job.query,
                        prod_idx: job.prod_idx,
                        data,
                    }
                },
            );
        }
    }
}

impl Actor for Resampler {
    type ObservableState = ResamplerCounters;

    fn name(&self) -> String {
        "Resampler".to_string()
    }

    fn observable_state(&self) -> ResamplerCounters {
        let mut counters = self.counters.clone();
        counters.num_queued = self.waiting_room.len();
        counters.num_in_flight = self.in_flight;
        counters
    }
}

impl Handler<ResampleArray> for Resampler {
    fn handle(&mut self, msg: ResampleArray, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.waiting_room.push_back(msg);
        self.pump();
        Ok(())
    }
}

impl Handler<ResampleDone> for Resampler {
    fn handle(&mut self, msg: ResampleDone, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.in_flight -= 1;
        self.counters.num_resamples += 1;
        ctx.send_message(
            &self.builder,
            ResampledArray {
                query: msg.query,
                prod_idx: msg.prod_idx,
                data: msg.data,
            },
        );
        self.pump();
        Ok(())
    }
}

impl Handler<ForgetQuery> for Resampler {
    fn handle(&mut self, msg: ForgetQuery, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.waiting_room.retain(|job| job.query != msg.query);
        Ok(())
    }
}

impl Handler<Die> for Resampler {
    fn handle(&mut self, _msg: Die, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.waiting_room.clear();
        Err(ActorExitStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use rastermill_common::{Footprint, PixelBuf};

    use super::remap_nearest;

    #[test]
    fn test_remap_identity_scale_half_pixel_shift() {
        let src_footprint = Footprint::new(0.0, 0.0, 1.0, 1.0, 2, 2);
        let src = PixelBuf::from_samples(2, 2, 1, vec![1.0, 2.0, 3.0, 4.0]);
        let dst_footprint = Footprint::new(0.5, 0.5, 1.0, 1.0, 2, 2);
        let dst = remap_nearest(&src_footprint, &src, &dst_footprint, -1.0);
        // Center of dst pixel (0, 0) is (1.0, 1.0): nearest src pixel (1, 1).
        assert_eq!(dst.get(0, 0, 0), 4.0);
        // The other centers fall outside src.
        assert_eq!(dst.get(1, 0, 0), -1.0);
        assert_eq!(dst.get(0, 1, 0), -1.0);
        assert_eq!(dst.get(1, 1, 0), -1.0);
    }

    #[test]
    fn test_remap_downscale_two_to_one() {
        let src_footprint = Footprint::new(0.0, 0.0, 1.0, 1.0, 4, 2);
        let samples: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let src = PixelBuf::from_samples(4, 2, 1, samples);
        let dst_footprint = Footprint::new(0.0, 0.0, 2.0, 2.0, 2, 1);
        let dst = remap_nearest(&src_footprint, &src, &dst_footprint, -1.0);
        // Dst centers (1.0, 1.0) and (3.0, 1.0) map to src pixels (1, 1) and
        // (3, 1).
        assert_eq!(dst.get(0, 0, 0), 5.0);
        assert_eq!(dst.get(1, 0, 0), 7.0);
    }
}
