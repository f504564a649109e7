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
use itertools::Itertools;
use rastermill_common::{Footprint, TileIndex};

use crate::error::ConfigError;
use crate::models::{DeliveryOrder, QuerySpec, RasterLayout};

/// Everything known about one production array at planning time.
#[derive(Debug, Clone)]
pub struct ProduceInfo {
    pub footprint: Footprint,
    /// The production footprint lies on the raster's grid: the sampled array
    /// is the delivered array, no remap.
    pub same_grid: bool,
    /// The production footprint overlaps the raster at all. When `false` the
    /// array is pure nodata and touches no tile.
    pub share_area: bool,
    /// Grid-aligned footprint that must be read from cache tiles; `None`
    /// when `share_area` is `false`.
    pub sample_fp: Option<Footprint>,
    /// Cache tiles the sample depends on, row-major.
    pub cache_tiles: Vec<TileIndex>,
}

/// The immutable decomposition of a query, computed once at post time and
/// shared by every actor touching the query.
///
/// Production indices are positions in `produce`; everything downstream of
/// the planner works on indices, never on footprints.
pub struct QueryPlan {
    pub produce: Vec<ProduceInfo>,
    pub channels: Vec<u16>,
    pub queue_capacity: usize,
    pub nodata: f32,
    /// Every needed tile exactly once, ordered by the first production index
    /// needing it, paired with that index.
    pub tiles_in_need_order: Vec<(TileIndex, usize)>,
    /// Reverse map: which production indices wait on each tile.
    pub prod_idxs_per_tile: FnvHashMap<TileIndex, Vec<usize>>,
}

impl QueryPlan {
    pub fn build(layout: &RasterLayout, spec: &QuerySpec) -> Result<QueryPlan, ConfigError> {
        if spec.footprints.is_empty() {
            return Err(ConfigError::NoFootprints);
        }
        if spec.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        let channels = if spec.channels.is_empty() {
            (0..layout.channels).collect()
        } else {
            for &channel in &spec.channels {
                if channel >= layout.channels {
                    return Err(ConfigError::UnknownChannel(channel));
                }
            }
            spec.channels.clone()
        };

        let footprints = ordered_footprints(&spec.footprints, spec.order);

        let mut produce = Vec::with_capacity(footprints.len());
        for footprint in footprints {
            let share_area = layout.footprint.share_area(&footprint);
            let same_grid = layout.footprint.same_grid(&footprint);
            let sample_fp = if share_area {
                if same_grid {
                    layout.footprint.intersection(&footprint)
                } else {
                    layout.footprint.aligned_cover(&footprint)
                }
            } else {
                None
            };
            let cache_tiles = match &sample_fp {
                Some(sample_fp) => layout.footprint.tiles_intersecting(
                    sample_fp,
                    layout.tile_width,
                    layout.tile_height,
                ),
                None => Vec::new(),
            };
            produce.push(ProduceInfo {
                footprint,
                same_grid,
                share_area: sample_fp.is_some(),
                sample_fp,
                cache_tiles,
            });
        }

        let mut tiles_in_need_order = Vec::new();
        let mut prod_idxs_per_tile: FnvHashMap<TileIndex, Vec<usize>> = FnvHashMap::default();
        for (prod_idx, info) in produce.iter().enumerate() {
            for &tile in &info.cache_tiles {
                let prod_idxs = prod_idxs_per_tile.entry(tile).or_default();
                if prod_idxs.is_empty() {
                    tiles_in_need_order.push((tile, prod_idx));
                }
                prod_idxs.push(prod_idx);
            }
        }

        Ok(QueryPlan {
            produce,
            channels,
            queue_capacity: spec.queue_capacity,
            nodata: spec.nodata,
            tiles_in_need_order,
            prod_idxs_per_tile,
        })
    }

    pub fn produce_count(&self) -> usize {
        self.produce.len()
    }
}

fn ordered_footprints(footprints: &[Footprint], order: DeliveryOrder) -> Vec<Footprint> {
    match order {
        DeliveryOrder::UserOrder => footprints.to_vec(),
        DeliveryOrder::RowMajor => footprints
            .iter()
            .copied()
            .sorted_by(|a, b| {
                let (ax, ay) = a.center();
                let (bx, by) = b.center();
                (ay, ax).partial_cmp(&(by, bx)).expect("non-finite footprint center")
            })
            .collect(),
        DeliveryOrder::CenterOut => {
            let centers: Vec<(f64, f64)> = footprints.iter().map(Footprint::center).collect();
            let global_x = centers.iter().map(|(x, _)| x).sum::<f64>() / centers.len() as f64;
            let global_y = centers.iter().map(|(_, y)| y).sum::<f64>() / centers.len() as f64;
            footprints
                .iter()
                .copied()
                .sorted_by(|a, b| {
                    let da = distance2(a.center(), (global_x, global_y));
                    let db = distance2(b.center(), (global_x, global_y));
                    da.partial_cmp(&db).expect("non-finite footprint center")
                })
                .collect()
        }
    }
}

fn distance2((ax, ay): (f64, f64), (bx, by): (f64, f64)) -> f64 {
    (ax - bx) * (ax - bx) + (ay - by) * (ay - by)
}

#[cfg(test)]
mod tests {
    use rastermill_common::{Footprint, TileIndex};

    use super::QueryPlan;
    use crate::models::{DeliveryOrder, QuerySpec, RasterLayout};

    fn layout() -> RasterLayout {
        RasterLayout {
            footprint: Footprint::new(0.0, 0.0, 1.0, 1.0, 16, 16),
            tile_width: 8,
            tile_height: 8,
            channels: 2,
        }
    }

    #[test]
    fn test_plan_same_grid_single_tile() {
        let spec = QuerySpec::new(vec![Footprint::new(0.0, 0.0, 1.0, 1.0, 8, 8)]);
        let plan = QueryPlan::build(&layout(), &spec).unwrap();
        assert_eq!(plan.produce_count(), 1);
        let info = &plan.produce[0];
        assert!(info.same_grid && info.share_area);
        assert_eq!(info.cache_tiles, vec![TileIndex::new(0, 0)]);
        assert_eq!(info.sample_fp.unwrap(), info.footprint);
        assert_eq!(plan.channels, vec![0, 1]);
        assert_eq!(plan.tiles_in_need_order, vec![(TileIndex::new(0, 0), 0)]);
    }

    #[test]
    fn test_plan_outside_raster_needs_no_tiles() {
        let spec = QuerySpec::new(vec![Footprint::new(100.0, 100.0, 1.0, 1.0, 4, 4)]);
        let plan = QueryPlan::build(&layout(), &spec).unwrap();
        let info = &plan.produce[0];
        assert!(!info.share_area);
        assert!(info.sample_fp.is_none());
        assert!(info.cache_tiles.is_empty());
        assert!(plan.tiles_in_need_order.is_empty());
    }

    #[test]
    fn test_plan_off_grid_straddles_tiles() {
        let spec = QuerySpec::new(vec![Footprint::new(5.25, 5.25, 0.5, 0.5, 10, 10)]);
        let plan = QueryPlan::build(&layout(), &spec).unwrap();
        let info = &plan.produce[0];
        assert!(!info.same_grid && info.share_area);
        let sample_fp = info.sample_fp.unwrap();
        assert!(layout().footprint.same_grid(&sample_fp));
        assert_eq!(
            info.cache_tiles,
            vec![
                TileIndex::new(0, 0),
                TileIndex::new(1, 0),
                TileIndex::new(0, 1),
                TileIndex::new(1, 1),
            ]
        );
    }

    #[test]
    fn test_tile_need_order_follows_delivery_order() {
        let spec = QuerySpec::new(vec![
            Footprint::new(8.0, 8.0, 1.0, 1.0, 8, 8),
            Footprint::new(0.0, 0.0, 1.0, 1.0, 8, 8),
            Footprint::new(0.0, 0.0, 1.0, 1.0, 16, 16),
        ]);
        let plan = QueryPlan::build(&layout(), &spec).unwrap();
        assert_eq!(
            plan.tiles_in_need_order,
            vec![
                (TileIndex::new(1, 1), 0),
                (TileIndex::new(0, 0), 1),
                (TileIndex::new(1, 0), 2),
                (TileIndex::new(0, 1), 2),
            ]
        );
        assert_eq!(
            plan.prod_idxs_per_tile[&TileIndex::new(0, 0)],
            vec![1, 2]
        );
    }

    #[test]
    fn test_row_major_order() {
        let north = Footprint::new(0.0, 0.0, 1.0, 1.0, 4, 4);
        let south_west = Footprint::new(0.0, 10.0, 1.0, 1.0, 4, 4);
        let south_east = Footprint::new(10.0, 10.0, 1.0, 1.0, 4, 4);
        let spec = QuerySpec::new(vec![south_east, north, south_west])
            .with_order(DeliveryOrder::RowMajor);
        let plan = QueryPlan::build(&layout(), &spec).unwrap();
        let ordered: Vec<Footprint> = plan.produce.iter().map(|info| info.footprint).collect();
        assert_eq!(ordered, vec![north, south_west, south_east]);
    }

    #[test]
    fn test_center_out_order() {
        let center = Footprint::new(6.0, 6.0, 1.0, 1.0, 4, 4);
        let near = Footprint::new(4.0, 6.0, 1.0, 1.0, 4, 4);
        let far = Footprint::new(0.0, 0.0, 1.0, 1.0, 4, 4);
        let spec =
            QuerySpec::new(vec![far, center, near]).with_order(DeliveryOrder::CenterOut);
        let plan = QueryPlan::build(&layout(), &spec).unwrap();
        let ordered: Vec<Footprint> = plan.produce.iter().map(|info| info.footprint).collect();
        assert_eq!(ordered[2], far, "farthest footprint delivered last");
    }

    #[test]
    fn test_invalid_specs_are_rejected() {
        let no_footprints = QuerySpec::new(vec![]);
        assert!(QueryPlan::build(&layout(), &no_footprints).is_err());
        let zero_capacity =
            QuerySpec::new(vec![Footprint::new(0.0, 0.0, 1.0, 1.0, 4, 4)]).with_queue_capacity(0);
        assert!(QueryPlan::build(&layout(), &zero_capacity).is_err());
        let bad_channel =
            QuerySpec::new(vec![Footprint::new(0.0, 0.0, 1.0, 1.0, 4, 4)]).with_channels(vec![7]);
        assert!(QueryPlan::build(&layout(), &bad_channel).is_err());
    }
}
