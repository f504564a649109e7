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

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rastermill_actors::EventLoop;
use rastermill_common::{Footprint, PixelBuf};
use rastermill_pipeline::{
    ComputeFn, Dataset, DatasetConfig, DeliveryOrder, PrimitiveSpec, QueryError, QuerySpec,
    RasterSpec, SubArray,
};

const OBSERVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deterministic pixel function used by most rasters in this suite.
fn gradient_value(world_x: f64, world_y: f64, channel: u16) -> f32 {
    (world_x + 1000.0 * world_y) as f32 + channel as f32 * 0.5
}

fn gradient_tile(footprint: &Footprint, channels: u16) -> PixelBuf {
    let mut buf = PixelBuf::new_filled(footprint.width(), footprint.height(), channels, 0.0);
    for row in 0..footprint.height() {
        for col in 0..footprint.width() {
            let (world_x, world_y) = footprint.pixel_center(col, row);
            for channel in 0..channels {
                buf.set(col, row, channel, gradient_value(world_x, world_y, channel));
            }
        }
    }
    buf
}

/// A gradient recipe that counts its invocations.
fn counting_gradient(counter: Arc<AtomicUsize>) -> ComputeFn {
    Arc::new(move |input| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(vec![(
            input.tile_footprint,
            gradient_tile(&input.tile_footprint, input.channels),
        )])
    })
}

fn gradient_raster_spec(
    cache_dir: &Path,
    raster_fp: Footprint,
    tile: u32,
    channels: Vec<String>,
    counter: Arc<AtomicUsize>,
) -> RasterSpec {
    RasterSpec::new(
        raster_fp,
        channels,
        tile,
        tile,
        cache_dir,
        "gradient",
        "1.0",
        counting_gradient(counter),
    )
}

/// Expected content of a delivered sub-array, for a query selecting
/// `channels` of a gradient raster, `nodata` outside `raster_fp`. Works for
/// same-grid and off-grid (nearest-neighbour) footprints alike.
fn reference_array(
    raster_fp: &Footprint,
    prod_fp: &Footprint,
    channels: &[u16],
    nodata: f32,
) -> PixelBuf {
    let mut buf = PixelBuf::new_filled(
        prod_fp.width(),
        prod_fp.height(),
        channels.len() as u16,
        nodata,
    );
    for row in 0..prod_fp.height() {
        for col in 0..prod_fp.width() {
            let (world_x, world_y) = prod_fp.pixel_center(col, row);
            let Some((src_col, src_row)) = raster_fp.pixel_of(world_x, world_y) else {
                continue;
            };
            let (src_x, src_y) = raster_fp.pixel_center(src_col, src_row);
            for (out_channel, &channel) in channels.iter().enumerate() {
                buf.set(
                    col,
                    row,
                    out_channel as u16,
                    gradient_value(src_x, src_y, channel),
                );
            }
        }
    }
    buf
}

/// Drains a query in manual mode, alternating loop ticks and pulls.
fn drain_manual(
    event_loop: &mut EventLoop,
    handle: &mut rastermill_pipeline::QueryHandle,
) -> Result<Vec<SubArray>, QueryError> {
    let mut collected = Vec::new();
    let mut idle_rounds = 0;
    loop {
        event_loop.run_until_idle();
        match handle.try_next() {
            Some(Ok(sub_array)) => {
                collected.push(sub_array);
                idle_rounds = 0;
            }
            Some(Err(error)) => return Err(error),
            None => {
                if handle.is_done() {
                    return Ok(collected);
                }
                idle_rounds += 1;
                assert!(idle_rounds < 3, "pipeline stalled with a pending query");
            }
        }
    }
}

fn cache_files(cache_dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(cache_dir)
        .map(|entries| {
            entries
                .map(|entry| entry.unwrap().path())
                .filter(|path| path.extension().map(|ext| ext == "rmt").unwrap_or(false))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

#[test]
fn test_s1_single_tile_cold_cache() {
    let tempdir = tempfile::tempdir().unwrap();
    let compute_count = Arc::new(AtomicUsize::new(0));
    let (dataset, mut event_loop) = Dataset::open_manual();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 256, 256);
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            256,
            vec!["v".to_string()],
            compute_count.clone(),
        ))
        .unwrap();

    let mut handle = dataset
        .post_query(&raster, QuerySpec::new(vec![raster_fp]).with_queue_capacity(1))
        .unwrap();
    let collected = drain_manual(&mut event_loop, &mut handle).unwrap();

    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].footprint, raster_fp);
    assert_eq!(collected[0].data, reference_array(&raster_fp, &raster_fp, &[0], 0.0));

    // Exactly one compute, one write, one read, one delivery.
    assert_eq!(compute_count.load(Ordering::SeqCst), 1);
    let mailboxes = dataset.raster_mailboxes(&raster).unwrap();
    let client = dataset.client();
    let writer_rx = client.observe(&mailboxes.writer);
    let sampler_rx = client.observe(&mailboxes.sampler);
    let queries_rx = client.observe(&mailboxes.queries_handler);
    event_loop.run_until_idle();
    let writer_counters = writer_rx.try_recv().unwrap();
    assert_eq!(writer_counters.num_writes, 1);
    assert_eq!(writer_counters.num_write_failures, 0);
    assert_eq!(sampler_rx.try_recv().unwrap().num_reads, 1);
    let queries_counters = queries_rx.try_recv().unwrap();
    assert_eq!(queries_counters.num_arrays_delivered, 1);
    assert_eq!(queries_counters.num_live_queries, 0);

    // One canonical tile file, fingerprint embedded in its name, no temp
    // residue.
    let files = cache_files(tempdir.path());
    assert_eq!(files.len(), 1);
    let file_name = files[0].file_name().unwrap().to_str().unwrap();
    let fingerprint = file_name.split('.').nth(1).unwrap();
    assert_eq!(fingerprint.len(), 32);
    assert!(fingerprint.chars().all(|ch| ch.is_ascii_hexdigit()));
    assert_eq!(std::fs::read_dir(tempdir.path()).unwrap().count(), 1);
}

#[test]
fn test_s2_warm_cache_validates_without_recompute() {
    let tempdir = tempfile::tempdir().unwrap();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 256, 256);

    // First run populates the cache.
    let first_count = Arc::new(AtomicUsize::new(0));
    {
        let (dataset, mut event_loop) = Dataset::open_manual();
        let raster = dataset
            .register_raster(gradient_raster_spec(
                tempdir.path(),
                raster_fp,
                256,
                vec!["v".to_string()],
                first_count.clone(),
            ))
            .unwrap();
        let mut handle = dataset
            .post_query(&raster, QuerySpec::new(vec![raster_fp]).with_queue_capacity(1))
            .unwrap();
        drain_manual(&mut event_loop, &mut handle).unwrap();
    }
    assert_eq!(first_count.load(Ordering::SeqCst), 1);

    // Second run validates and reads, no compute.
    let second_count = Arc::new(AtomicUsize::new(0));
    let (dataset, mut event_loop) = Dataset::open_manual();
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            256,
            vec!["v".to_string()],
            second_count.clone(),
        ))
        .unwrap();
    let mut handle = dataset
        .post_query(&raster, QuerySpec::new(vec![raster_fp]).with_queue_capacity(1))
        .unwrap();
    let collected = drain_manual(&mut event_loop, &mut handle).unwrap();

    assert_eq!(second_count.load(Ordering::SeqCst), 0);
    assert_eq!(collected[0].data, reference_array(&raster_fp, &raster_fp, &[0], 0.0));
    let mailboxes = dataset.raster_mailboxes(&raster).unwrap();
    let cache_rx = dataset.client().observe(&mailboxes.cache_handler);
    event_loop.run_until_idle();
    let cache_counters = cache_rx.try_recv().unwrap();
    assert_eq!(cache_counters.num_tiles_validated, 1);
    assert_eq!(cache_counters.num_computes_requested, 0);
}

#[test]
fn test_s3_corrupt_cache_is_recomputed() {
    let tempdir = tempfile::tempdir().unwrap();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 256, 256);
    let compute_count = Arc::new(AtomicUsize::new(0));

    {
        let (dataset, mut event_loop) = Dataset::open_manual();
        let raster = dataset
            .register_raster(gradient_raster_spec(
                tempdir.path(),
                raster_fp,
                256,
                vec!["v".to_string()],
                compute_count.clone(),
            ))
            .unwrap();
        let mut handle = dataset
            .post_query(&raster, QuerySpec::new(vec![raster_fp]).with_queue_capacity(1))
            .unwrap();
        drain_manual(&mut event_loop, &mut handle).unwrap();
    }
    let files = cache_files(tempdir.path());
    assert_eq!(files.len(), 1);
    let pristine_bytes = std::fs::read(&files[0]).unwrap();

    // Truncate the tile by one byte.
    std::fs::write(&files[0], &pristine_bytes[..pristine_bytes.len() - 1]).unwrap();

    let (dataset, mut event_loop) = Dataset::open_manual();
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            256,
            vec!["v".to_string()],
            compute_count.clone(),
        ))
        .unwrap();
    let mut handle = dataset
        .post_query(&raster, QuerySpec::new(vec![raster_fp]).with_queue_capacity(1))
        .unwrap();
    let collected = drain_manual(&mut event_loop, &mut handle).unwrap();

    assert_eq!(collected[0].data, reference_array(&raster_fp, &raster_fp, &[0], 0.0));
    assert_eq!(compute_count.load(Ordering::SeqCst), 2, "one recompute");
    let mailboxes = dataset.raster_mailboxes(&raster).unwrap();
    let cache_rx = dataset.client().observe(&mailboxes.cache_handler);
    event_loop.run_until_idle();
    assert_eq!(cache_rx.try_recv().unwrap().num_corrupt_tiles, 1);

    // The recomputed cache is byte-identical to the pristine one.
    let files = cache_files(tempdir.path());
    assert_eq!(files.len(), 1);
    assert_eq!(std::fs::read(&files[0]).unwrap(), pristine_bytes);
}

#[test]
fn test_s4_backpressure_with_slow_consumer() {
    let tempdir = tempfile::tempdir().unwrap();
    let compute_count = Arc::new(AtomicUsize::new(0));
    let dataset = Dataset::open(DatasetConfig::default());
    // 16 tiles in a row; each production array covers exactly one tile.
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 256, 16);
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            16,
            vec!["v".to_string()],
            compute_count.clone(),
        ))
        .unwrap();
    let footprints: Vec<Footprint> = (0..16)
        .map(|i| Footprint::new(16.0 * i as f64, 0.0, 1.0, 1.0, 16, 16))
        .collect();
    let queue_capacity = 2;
    let mut handle = dataset
        .post_query(
            &raster,
            QuerySpec::new(footprints.clone()).with_queue_capacity(queue_capacity),
        )
        .unwrap();

    let mailboxes = dataset.raster_mailboxes(&raster).unwrap();
    let client = dataset.client();
    let mut received = 0;
    while let Some(sub_array) = handle.next() {
        let sub_array = sub_array.unwrap();
        assert_eq!(sub_array.footprint, footprints[received]);
        received += 1;
        std::thread::sleep(Duration::from_millis(20));
        let build_released = client
            .observe_blocking(&mailboxes.builder_bedroom, OBSERVE_TIMEOUT)
            .unwrap()
            .num_released;
        assert!(
            build_released as usize <= received + queue_capacity,
            "more production arrays started ({build_released}) than headroom allows"
        );
        let compute_released = client
            .observe_blocking(&mailboxes.computation_bedroom, OBSERVE_TIMEOUT)
            .unwrap()
            .num_released;
        assert!(
            compute_released as usize <= received + queue_capacity,
            "more tiles computing ({compute_released}) than headroom allows"
        );
    }
    assert_eq!(received, 16);
    assert_eq!(compute_count.load(Ordering::SeqCst), 16);
}

#[test]
fn test_s5_cancel_mid_flight_releases_everything() {
    let tempdir = tempfile::tempdir().unwrap();
    let compute_count = Arc::new(AtomicUsize::new(0));
    let (dataset, mut event_loop) = Dataset::open_manual();
    // A long strip of 64 single-tile production arrays.
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 1024, 16);
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            16,
            vec!["v".to_string()],
            compute_count.clone(),
        ))
        .unwrap();
    let footprints: Vec<Footprint> = (0..64)
        .map(|i| Footprint::new(16.0 * i as f64, 0.0, 1.0, 1.0, 16, 16))
        .collect();

    // A second query keeps a few tiles shared with the first one alive.
    let mut shared_handle = dataset
        .post_query(
            &raster,
            QuerySpec::new(footprints[..4].to_vec()).with_queue_capacity(4),
        )
        .unwrap();

    let mut handle = dataset
        .post_query(&raster, QuerySpec::new(footprints).with_queue_capacity(2))
        .unwrap();
    event_loop.run_until_idle();
    let first = handle.try_next().unwrap().unwrap();
    assert_eq!(first.footprint, Footprint::new(0.0, 0.0, 1.0, 1.0, 16, 16));

    handle.cancel();
    event_loop.run_until_idle();

    // Lazy scheduling means the cancelled query never computed most of its
    // 64 tiles.
    assert!(compute_count.load(Ordering::SeqCst) < 16);

    // No actor holds any state keyed to a query anymore: the cancelled one
    // was released everywhere, and the small shared query already finished
    // producing (its arrays sit in its output queue).
    let mailboxes = dataset.raster_mailboxes(&raster).unwrap();
    let client = dataset.client();
    let queries_rx = client.observe(&mailboxes.queries_handler);
    let producer_rx = client.observe(&mailboxes.producer);
    let builder_rx = client.observe(&mailboxes.builder);
    let builder_bedroom_rx = client.observe(&mailboxes.builder_bedroom);
    let computation_bedroom_rx = client.observe(&mailboxes.computation_bedroom);
    let computer_rx = client.observe(&mailboxes.computer);
    event_loop.run_until_idle();
    assert_eq!(queries_rx.try_recv().unwrap().num_live_queries, 0);
    assert_eq!(producer_rx.try_recv().unwrap().num_live_queries, 0);
    assert_eq!(builder_rx.try_recv().unwrap().num_live_builds, 0);
    assert_eq!(builder_bedroom_rx.try_recv().unwrap().num_live_queries, 0);
    assert_eq!(computation_bedroom_rx.try_recv().unwrap().num_live_queries, 0);
    assert_eq!(computer_rx.try_recv().unwrap().num_live_collections, 0);

    let shared = drain_manual(&mut event_loop, &mut shared_handle).unwrap();
    assert_eq!(shared.len(), 4);
    for (sub_array, footprint) in shared.iter().zip(&[
        Footprint::new(0.0, 0.0, 1.0, 1.0, 16, 16),
        Footprint::new(16.0, 0.0, 1.0, 1.0, 16, 16),
        Footprint::new(32.0, 0.0, 1.0, 1.0, 16, 16),
        Footprint::new(48.0, 0.0, 1.0, 1.0, 16, 16),
    ]) {
        assert_eq!(sub_array.data, reference_array(&raster_fp, footprint, &[0], 0.0));
    }
}

#[test]
fn test_lazy_progression_under_small_queue() {
    // Deterministic flavor of the backpressure property: with Q=2, work is
    // released strictly in lockstep with consumption.
    let tempdir = tempfile::tempdir().unwrap();
    let compute_count = Arc::new(AtomicUsize::new(0));
    let (dataset, mut event_loop) = Dataset::open_manual();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 128, 16);
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            16,
            vec!["v".to_string()],
            compute_count.clone(),
        ))
        .unwrap();
    let footprints: Vec<Footprint> = (0..8)
        .map(|i| Footprint::new(16.0 * i as f64, 0.0, 1.0, 1.0, 16, 16))
        .collect();
    let mut handle = dataset
        .post_query(
            &raster,
            QuerySpec::new(footprints.clone()).with_queue_capacity(2),
        )
        .unwrap();
    let mailboxes = dataset.raster_mailboxes(&raster).unwrap();
    let client = dataset.client();

    let mut received = 0;
    while received < 8 {
        event_loop.run_until_idle();
        // At most Q tiles ahead of the consumer, ever.
        assert!(compute_count.load(Ordering::SeqCst) <= received + 2);
        let released = client.observe(&mailboxes.builder_bedroom);
        event_loop.run_until_idle();
        assert!(released.try_recv().unwrap().num_released as usize <= received + 2);
        let sub_array = handle.try_next().expect("an array should be ready").unwrap();
        assert_eq!(sub_array.footprint, footprints[received]);
        received += 1;
    }
    assert_eq!(compute_count.load(Ordering::SeqCst), 8);
}

#[test]
fn test_s6_shared_tiles_computed_once() {
    let tempdir = tempfile::tempdir().unwrap();
    let compute_count = Arc::new(AtomicUsize::new(0));
    let (dataset, mut event_loop) = Dataset::open_manual();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 64, 64);
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            32,
            vec!["v".to_string()],
            compute_count.clone(),
        ))
        .unwrap();
    // Both queries need all 4 tiles, with overlapping footprints.
    let query_fp_a = Footprint::new(0.0, 0.0, 1.0, 1.0, 64, 64);
    let query_fp_b = Footprint::new(16.0, 16.0, 1.0, 1.0, 48, 48);
    let mut handle_a = dataset
        .post_query(&raster, QuerySpec::new(vec![query_fp_a]).with_queue_capacity(1))
        .unwrap();
    let mut handle_b = dataset
        .post_query(&raster, QuerySpec::new(vec![query_fp_b]).with_queue_capacity(1))
        .unwrap();

    let collected_a = drain_manual(&mut event_loop, &mut handle_a).unwrap();
    let collected_b = drain_manual(&mut event_loop, &mut handle_b).unwrap();

    // Each of the 4 tiles computed exactly once despite two subscribers.
    assert_eq!(compute_count.load(Ordering::SeqCst), 4);

    // Overlap regions carry identical bytes.
    assert_eq!(
        collected_a[0].data,
        reference_array(&raster_fp, &query_fp_a, &[0], 0.0)
    );
    assert_eq!(
        collected_b[0].data,
        reference_array(&raster_fp, &query_fp_b, &[0], 0.0)
    );
    let a = &collected_a[0].data;
    let b = &collected_b[0].data;
    for row in 0..48 {
        for col in 0..48 {
            assert_eq!(a.get(col + 16, row + 16, 0), b.get(col, row, 0));
        }
    }
}

#[test]
fn test_round_trip_stitching_with_padding_and_outside_arrays() {
    let tempdir = tempfile::tempdir().unwrap();
    let compute_count = Arc::new(AtomicUsize::new(0));
    let (dataset, mut event_loop) = Dataset::open_manual();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 48, 48);
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            32,
            vec!["v".to_string()],
            compute_count.clone(),
        ))
        .unwrap();
    let footprints = vec![
        // Interior, same grid.
        Footprint::new(8.0, 8.0, 1.0, 1.0, 16, 16),
        // Hangs off the south-east edge: padded with nodata.
        Footprint::new(40.0, 40.0, 1.0, 1.0, 16, 16),
        // Entirely outside: pure nodata, no tile touched.
        Footprint::new(500.0, 500.0, 1.0, 1.0, 8, 8),
    ];
    let nodata = -7.5;
    let mut handle = dataset
        .post_query(
            &raster,
            QuerySpec::new(footprints.clone())
                .with_queue_capacity(3)
                .with_nodata(nodata),
        )
        .unwrap();
    let collected = drain_manual(&mut event_loop, &mut handle).unwrap();
    assert_eq!(collected.len(), 3);
    for (sub_array, footprint) in collected.iter().zip(&footprints) {
        assert_eq!(sub_array.footprint, *footprint);
        assert_eq!(
            sub_array.data,
            reference_array(&raster_fp, footprint, &[0], nodata)
        );
    }
}

#[test]
fn test_off_grid_query_is_resampled() {
    let tempdir = tempfile::tempdir().unwrap();
    let compute_count = Arc::new(AtomicUsize::new(0));
    let (dataset, mut event_loop) = Dataset::open_manual();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 32, 32);
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            32,
            vec!["v".to_string()],
            compute_count.clone(),
        ))
        .unwrap();
    // Half-pixel scale, quarter-pixel shift: not on the raster grid.
    let query_fp = Footprint::new(3.25, 3.25, 0.5, 0.5, 20, 20);
    let mut handle = dataset
        .post_query(&raster, QuerySpec::new(vec![query_fp]).with_queue_capacity(1))
        .unwrap();
    let collected = drain_manual(&mut event_loop, &mut handle).unwrap();
    assert_eq!(
        collected[0].data,
        reference_array(&raster_fp, &query_fp, &[0], 0.0)
    );
    let mailboxes = dataset.raster_mailboxes(&raster).unwrap();
    let resampler_rx = dataset.client().observe(&mailboxes.resampler);
    event_loop.run_until_idle();
    assert_eq!(resampler_rx.try_recv().unwrap().num_resamples, 1);
}

#[test]
fn test_channel_selection_and_reordering() {
    let tempdir = tempfile::tempdir().unwrap();
    let compute_count = Arc::new(AtomicUsize::new(0));
    let (dataset, mut event_loop) = Dataset::open_manual();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 16, 16);
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            16,
            vec!["r".to_string(), "g".to_string()],
            compute_count.clone(),
        ))
        .unwrap();
    let mut handle = dataset
        .post_query(
            &raster,
            QuerySpec::new(vec![raster_fp])
                .with_queue_capacity(1)
                .with_channels(vec![1, 0]),
        )
        .unwrap();
    let collected = drain_manual(&mut event_loop, &mut handle).unwrap();
    assert_eq!(
        collected[0].data,
        reference_array(&raster_fp, &raster_fp, &[1, 0], 0.0)
    );
}

#[test]
fn test_delivery_orders() {
    let tempdir = tempfile::tempdir().unwrap();
    let compute_count = Arc::new(AtomicUsize::new(0));
    let (dataset, mut event_loop) = Dataset::open_manual();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 64, 64);
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            32,
            vec!["v".to_string()],
            compute_count.clone(),
        ))
        .unwrap();
    let tiles_2x2: Vec<Footprint> = (0..4)
        .map(|i| {
            Footprint::new(
                32.0 * (i % 2) as f64,
                32.0 * (i / 2) as f64,
                1.0,
                1.0,
                32,
                32,
            )
        })
        .collect();
    // Shuffled user order.
    let shuffled = vec![tiles_2x2[3], tiles_2x2[0], tiles_2x2[2], tiles_2x2[1]];
    let mut handle = dataset
        .post_query(
            &raster,
            QuerySpec::new(shuffled.clone())
                .with_queue_capacity(4)
                .with_order(DeliveryOrder::RowMajor),
        )
        .unwrap();
    let collected = drain_manual(&mut event_loop, &mut handle).unwrap();
    let delivered: Vec<Footprint> = collected.iter().map(|sub_array| sub_array.footprint).collect();
    assert_eq!(delivered, tiles_2x2, "row-major north-to-south, west-to-east");

    let mut handle = dataset
        .post_query(
            &raster,
            QuerySpec::new(shuffled.clone()).with_queue_capacity(4),
        )
        .unwrap();
    let collected = drain_manual(&mut event_loop, &mut handle).unwrap();
    let delivered: Vec<Footprint> = collected.iter().map(|sub_array| sub_array.footprint).collect();
    assert_eq!(delivered, shuffled, "user order is preserved");
}

#[test]
fn test_idempotent_requeries_and_thread_mode_equivalence() {
    let tempdir = tempfile::tempdir().unwrap();
    let compute_count = Arc::new(AtomicUsize::new(0));
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 64, 64);
    let query_fp = Footprint::new(5.0, 9.0, 1.0, 1.0, 40, 40);

    let manual_results = {
        let (dataset, mut event_loop) = Dataset::open_manual();
        let raster = dataset
            .register_raster(gradient_raster_spec(
                tempdir.path(),
                raster_fp,
                32,
                vec!["v".to_string()],
                compute_count.clone(),
            ))
            .unwrap();
        let mut first = dataset
            .post_query(&raster, QuerySpec::new(vec![query_fp]).with_queue_capacity(1))
            .unwrap();
        let first_result = drain_manual(&mut event_loop, &mut first).unwrap();
        let mut second = dataset
            .post_query(&raster, QuerySpec::new(vec![query_fp]).with_queue_capacity(1))
            .unwrap();
        let second_result = drain_manual(&mut event_loop, &mut second).unwrap();
        assert_eq!(first_result, second_result, "posting twice delivers the same arrays");
        first_result
    };

    // Same query against a threaded dataset over the same warm cache.
    let dataset = Dataset::open(DatasetConfig::default());
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            32,
            vec!["v".to_string()],
            compute_count.clone(),
        ))
        .unwrap();
    let mut handle = dataset
        .post_query(&raster, QuerySpec::new(vec![query_fp]).with_queue_capacity(1))
        .unwrap();
    let mut threaded_results = Vec::new();
    while let Some(sub_array) = handle.next() {
        threaded_results.push(sub_array.unwrap());
    }
    assert_eq!(
        manual_results, threaded_results,
        "delivered bytes are independent of scheduling"
    );
}

#[test]
fn test_recipe_with_primitive_raster() {
    let tempdir = tempfile::tempdir().unwrap();
    let dsm_count = Arc::new(AtomicUsize::new(0));
    let (dataset, mut event_loop) = Dataset::open_manual();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 64, 64);
    let dsm = dataset
        .register_raster(gradient_raster_spec(
            &tempdir.path().join("dsm"),
            raster_fp,
            32,
            vec!["elevation".to_string()],
            dsm_count.clone(),
        ))
        .unwrap();

    // A recipe doubling its primitive's values.
    let doubled_count = Arc::new(AtomicUsize::new(0));
    let doubled_count_clone = doubled_count.clone();
    let mut doubled_spec = RasterSpec::new(
        raster_fp,
        vec!["doubled".to_string()],
        32,
        32,
        tempdir.path().join("doubled"),
        "doubled",
        "1.0",
        Arc::new(move |input| {
            doubled_count_clone.fetch_add(1, Ordering::SeqCst);
            let dsm_input = input
                .collected
                .get("dsm")
                .ok_or_else(|| "missing dsm input".to_string())?;
            assert_eq!(dsm_input.footprint, input.tile_footprint);
            let samples: Vec<f32> = dsm_input.data.samples().iter().map(|v| v * 2.0).collect();
            let data = PixelBuf::from_samples(
                input.tile_footprint.width(),
                input.tile_footprint.height(),
                1,
                samples,
            );
            Ok(vec![(input.tile_footprint, data)])
        }),
    );
    doubled_spec
        .primitives
        .push(("dsm".to_string(), PrimitiveSpec::same_footprint(dsm.clone())));
    let doubled = dataset.register_raster(doubled_spec).unwrap();

    let mut handle = dataset
        .post_query(&doubled, QuerySpec::new(vec![raster_fp]).with_queue_capacity(1))
        .unwrap();
    let collected = drain_manual(&mut event_loop, &mut handle).unwrap();

    assert_eq!(doubled_count.load(Ordering::SeqCst), 4);
    assert_eq!(dsm_count.load(Ordering::SeqCst), 4, "each dsm tile computed once");
    let expected = reference_array(&raster_fp, &raster_fp, &[0], 0.0);
    let delivered = &collected[0].data;
    for row in 0..64 {
        for col in 0..64 {
            assert_eq!(delivered.get(col, row, 0), expected.get(col, row, 0) * 2.0);
        }
    }

    // The two rasters cache under distinct fingerprints.
    assert_eq!(cache_files(&tempdir.path().join("dsm")).len(), 4);
    assert_eq!(cache_files(&tempdir.path().join("doubled")).len(), 4);
}

#[test]
fn test_compute_error_fails_the_query_only() {
    let tempdir = tempfile::tempdir().unwrap();
    let (dataset, mut event_loop) = Dataset::open_manual();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 16, 16);
    let failing: ComputeFn = Arc::new(|_input| Err("sensor on fire".to_string()));
    let raster = dataset
        .register_raster(RasterSpec::new(
            raster_fp,
            vec!["v".to_string()],
            16,
            16,
            tempdir.path(),
            "broken",
            "1.0",
            failing,
        ))
        .unwrap();
    let mut handle = dataset
        .post_query(&raster, QuerySpec::new(vec![raster_fp]).with_queue_capacity(1))
        .unwrap();
    event_loop.run_until_idle();
    match handle.try_next() {
        Some(Err(QueryError::Compute(message))) => assert!(message.contains("sensor on fire")),
        other => panic!("expected a compute error, got {other:?}"),
    }
    // The scheduler survives and serves later queries on other rasters.
    let ok_count = Arc::new(AtomicUsize::new(0));
    let ok_raster = dataset
        .register_raster(gradient_raster_spec(
            &tempdir.path().join("ok"),
            raster_fp,
            16,
            vec!["v".to_string()],
            ok_count,
        ))
        .unwrap();
    let mut ok_handle = dataset
        .post_query(&ok_raster, QuerySpec::new(vec![raster_fp]).with_queue_capacity(1))
        .unwrap();
    let collected = drain_manual(&mut event_loop, &mut ok_handle).unwrap();
    assert_eq!(collected.len(), 1);
}

#[test]
fn test_config_errors_are_synchronous() {
    let tempdir = tempfile::tempdir().unwrap();
    let (dataset, _event_loop) = Dataset::open_manual();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 16, 16);
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            16,
            vec!["v".to_string()],
            Arc::new(AtomicUsize::new(0)),
        ))
        .unwrap();

    assert!(dataset
        .post_query(&raster, QuerySpec::new(vec![]))
        .is_err());
    assert!(dataset
        .post_query(&raster, QuerySpec::new(vec![raster_fp]).with_queue_capacity(0))
        .is_err());
    assert!(dataset
        .post_query(&raster, QuerySpec::new(vec![raster_fp]).with_channels(vec![3]))
        .is_err());
    let unknown = rastermill_common::RasterUid::new();
    assert!(dataset
        .post_query(&unknown, QuerySpec::new(vec![raster_fp]))
        .is_err());
}

#[test]
fn test_close_raster_tears_actors_down() {
    let tempdir = tempfile::tempdir().unwrap();
    let (dataset, mut event_loop) = Dataset::open_manual();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 16, 16);
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            16,
            vec!["v".to_string()],
            Arc::new(AtomicUsize::new(0)),
        ))
        .unwrap();
    let mut handle = dataset
        .post_query(&raster, QuerySpec::new(vec![raster_fp]).with_queue_capacity(1))
        .unwrap();
    drain_manual(&mut event_loop, &mut handle).unwrap();

    event_loop.run_until_idle();
    let actors_before = event_loop.num_actors();
    dataset.close_raster(&raster).unwrap();
    event_loop.run_until_idle();
    // The 13-actor set is gone.
    assert_eq!(event_loop.num_actors(), actors_before - 13);
    assert!(dataset
        .post_query(&raster, QuerySpec::new(vec![raster_fp]))
        .is_err());
}

#[test]
fn test_dropped_handle_cancels_the_query() {
    let tempdir = tempfile::tempdir().unwrap();
    let compute_count = Arc::new(AtomicUsize::new(0));
    let (dataset, mut event_loop) = Dataset::open_manual();
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 512, 16);
    let raster = dataset
        .register_raster(gradient_raster_spec(
            tempdir.path(),
            raster_fp,
            16,
            vec!["v".to_string()],
            compute_count,
        ))
        .unwrap();
    let footprints: Vec<Footprint> = (0..32)
        .map(|i| Footprint::new(16.0 * i as f64, 0.0, 1.0, 1.0, 16, 16))
        .collect();
    let handle = dataset
        .post_query(&raster, QuerySpec::new(footprints).with_queue_capacity(2))
        .unwrap();
    event_loop.run_until_idle();
    drop(handle);
    event_loop.run_until_idle();

    let mailboxes = dataset.raster_mailboxes(&raster).unwrap();
    let queries_rx = dataset.client().observe(&mailboxes.queries_handler);
    event_loop.run_until_idle();
    let counters = queries_rx.try_recv().unwrap();
    assert_eq!(counters.num_live_queries, 0);
    assert_eq!(counters.num_queries_dropped, 1);
}

#[test]
fn test_warm_cache_threaded_end_to_end() {
    // The threaded flavor of S1+S2 under real pools, with a deadline-polled
    // drain instead of manual ticks.
    let tempdir = tempfile::tempdir().unwrap();
    let compute_count = Arc::new(AtomicUsize::new(0));
    let raster_fp = Footprint::new(0.0, 0.0, 1.0, 1.0, 128, 128);
    for round in 0..2 {
        let dataset = Dataset::open(DatasetConfig::default());
        let raster = dataset
            .register_raster(gradient_raster_spec(
                tempdir.path(),
                raster_fp,
                64,
                vec!["v".to_string()],
                compute_count.clone(),
            ))
            .unwrap();
        let mut handle = dataset
            .post_query(&raster, QuerySpec::new(vec![raster_fp]).with_queue_capacity(1))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut collected = Vec::new();
        while let Some(sub_array) = handle.next() {
            collected.push(sub_array.unwrap());
            assert!(Instant::now() < deadline, "query did not finish in time");
        }
        assert_eq!(collected.len(), 1);
        assert_eq!(
            collected[0].data,
            reference_array(&raster_fp, &raster_fp, &[0], 0.0)
        );
        assert_eq!(
            compute_count.load(Ordering::SeqCst),
            4,
            "4 tiles computed in round 0, none in round {round}"
        );
        dataset.stop();
    }
}
