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

use serde::{Deserialize, Serialize};

/// Tolerance used when deciding whether two grids are phase-aligned.
const GRID_EPS: f64 = 1e-9;

/// An axis-aligned pixel grid over the plane: top-left corner in world
/// coordinates, pixel size, pixel counts.
///
/// World `y` grows southward, matching the row order of [`crate::PixelBuf`].
/// The footprint owns no samples; it is pure geometry.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    tl_x: f64,
    tl_y: f64,
    px_w: f64,
    px_h: f64,
    w: u32,
    h: u32,
}

impl Footprint {
    /// Builds a footprint. `px_w`/`px_h` must be strictly positive and
    /// `w`/`h` non-zero.
    pub fn new(tl_x: f64, tl_y: f64, px_w: f64, px_h: f64, w: u32, h: u32) -> Footprint {
        assert!(px_w > 0.0 && px_h > 0.0, "pixel size must be positive");
        assert!(w > 0 && h > 0, "pixel counts must be non-zero");
        Footprint {
            tl_x,
            tl_y,
            px_w,
            px_h,
            w,
            h,
        }
    }

    pub fn width(&self) -> u32 {
        self.w
    }

    pub fn height(&self) -> u32 {
        self.h
    }

    pub fn px_width(&self) -> f64 {
        self.px_w
    }

    pub fn px_height(&self) -> f64 {
        self.px_h
    }

    /// `(left, top, right, bottom)` in world coordinates.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        (
            self.tl_x,
            self.tl_y,
            self.tl_x + self.w as f64 * self.px_w,
            self.tl_y + self.h as f64 * self.px_h,
        )
    }

    pub fn center(&self) -> (f64, f64) {
        let (left, top, right, bottom) = self.bounds();
        ((left + right) / 2.0, (top + bottom) / 2.0)
    }

    pub fn num_pixels(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    /// World coordinates of the center of pixel `(col, row)`.
    pub fn pixel_center(&self, col: u32, row: u32) -> (f64, f64) {
        (
            self.tl_x + (col as f64 + 0.5) * self.px_w,
            self.tl_y + (row as f64 + 0.5) * self.px_h,
        )
    }

    /// Pixel containing the world point, if any.
    pub fn pixel_of(&self, wx: f64, wy: f64) -> Option<(u32, u32)> {
        let col = ((wx - self.tl_x) / self.px_w).floor();
        let row = ((wy - self.tl_y) / self.px_h).floor();
        if col < 0.0 || row < 0.0 || col >= self.w as f64 || row >= self.h as f64 {
            return None;
        }
        Some((col as u32, row as u32))
    }

    /// True when both footprints lie on the same grid: equal pixel sizes and
    /// an integer phase offset between origins.
    pub fn same_grid(&self, other: &Footprint) -> bool {
        if (self.px_w - other.px_w).abs() > GRID_EPS || (self.px_h - other.px_h).abs() > GRID_EPS {
            return false;
        }
        let offset_x = (other.tl_x - self.tl_x) / self.px_w;
        let offset_y = (other.tl_y - self.tl_y) / self.px_h;
        (offset_x - offset_x.round()).abs() < GRID_EPS
            && (offset_y - offset_y.round()).abs() < GRID_EPS
    }

    /// True when the world rectangles of both footprints overlap with a
    /// non-empty interior.
    pub fn share_area(&self, other: &Footprint) -> bool {
        let (al, at, ar, ab) = self.bounds();
        let (bl, bt, br, bb) = other.bounds();
        al < br - GRID_EPS && bl < ar - GRID_EPS && at < bb - GRID_EPS && bt < ab - GRID_EPS
    }

    /// Grid-aligned intersection. Both footprints must satisfy
    /// [`Footprint::same_grid`].
    pub fn intersection(&self, other: &Footprint) -> Option<Footprint> {
        assert!(self.same_grid(other), "intersection requires aligned grids");
        if !self.share_area(other) {
            return None;
        }
        let (al, at, ar, ab) = self.bounds();
        let (bl, bt, br, bb) = other.bounds();
        let left = al.max(bl);
        let top = at.max(bt);
        let right = ar.min(br);
        let bottom = ab.min(bb);
        let w = ((right - left) / self.px_w).round() as u32;
        let h = ((bottom - top) / self.px_h).round() as u32;
        if w == 0 || h == 0 {
            return None;
        }
        Some(Footprint::new(left, top, self.px_w, self.px_h, w, h))
    }

    /// Pixel offset of `self` within `outer`. Both must be on the same grid
    /// and `self` must be contained in `outer`.
    pub fn slice_in(&self, outer: &Footprint) -> (u32, u32) {
        assert!(outer.same_grid(self), "slice_in requires aligned grids");
        let col = ((self.tl_x - outer.tl_x) / self.px_w).round();
        let row = ((self.tl_y - outer.tl_y) / self.px_h).round();
        assert!(
            col >= 0.0
                && row >= 0.0
                && col as u32 + self.w <= outer.w
                && row as u32 + self.h <= outer.h,
            "footprint does not fit in outer footprint"
        );
        (col as u32, row as u32)
    }

    /// The footprint of tile `idx` in a `tile_w`×`tile_h` tiling of `self`.
    /// Border tiles shrink to the raster edge.
    pub fn tile(&self, idx: TileIndex, tile_w: u32, tile_h: u32) -> Footprint {
        let col0 = idx.x * tile_w;
        let row0 = idx.y * tile_h;
        assert!(col0 < self.w && row0 < self.h, "tile index out of bounds");
        let w = tile_w.min(self.w - col0);
        let h = tile_h.min(self.h - row0);
        Footprint::new(
            self.tl_x + col0 as f64 * self.px_w,
            self.tl_y + row0 as f64 * self.px_h,
            self.px_w,
            self.px_h,
            w,
            h,
        )
    }

    /// Number of tile columns and rows of a `tile_w`×`tile_h` tiling.
    pub fn tile_counts(&self, tile_w: u32, tile_h: u32) -> (u32, u32) {
        ((self.w + tile_w - 1) / tile_w, (self.h + tile_h - 1) / tile_h)
    }

    /// All tiles of the tiling, row-major.
    pub fn tiles(&self, tile_w: u32, tile_h: u32) -> Vec<TileIndex> {
        let (cols, rows) = self.tile_counts(tile_w, tile_h);
        let mut out = Vec::with_capacity(cols as usize * rows as usize);
        for y in 0..rows {
            for x in 0..cols {
                out.push(TileIndex { x, y });
            }
        }
        out
    }

    /// Pixel rectangle `[col_min, col_max] × [row_min, row_max]` of `self`
    /// overlapped by `area`'s world bounds. Caller checked `share_area`.
    fn overlapped_pixel_rect(&self, area: &Footprint) -> (u32, u32, u32, u32) {
        let (left, top, right, bottom) = area.bounds();
        let col_min_f = ((left - self.tl_x) / self.px_w + GRID_EPS).floor().max(0.0);
        let row_min_f = ((top - self.tl_y) / self.px_h + GRID_EPS).floor().max(0.0);
        let col_end_f = ((right - self.tl_x) / self.px_w - GRID_EPS).ceil();
        let row_end_f = ((bottom - self.tl_y) / self.px_h - GRID_EPS).ceil();
        let col_min = col_min_f as u32;
        let row_min = row_min_f as u32;
        let col_end = (col_end_f as u32).min(self.w).max(col_min + 1);
        let row_end = (row_end_f as u32).min(self.h).max(row_min + 1);
        (col_min, row_min, col_end - 1, row_end - 1)
    }

    /// Tiles of the tiling whose footprints overlap `area` (row-major).
    /// `area` does not need to be on the same grid.
    pub fn tiles_intersecting(&self, area: &Footprint, tile_w: u32, tile_h: u32) -> Vec<TileIndex> {
        if !self.share_area(area) {
            return Vec::new();
        }
        let (col_min, row_min, col_max, row_max) = self.overlapped_pixel_rect(area);
        let mut out = Vec::new();
        for ty in row_min / tile_h..=row_max / tile_h {
            for tx in col_min / tile_w..=col_max / tile_w {
                out.push(TileIndex { x: tx, y: ty });
            }
        }
        out
    }

    /// Smallest footprint on `self`'s grid covering the overlap between
    /// `self` and `area`. `None` when they do not overlap.
    pub fn aligned_cover(&self, area: &Footprint) -> Option<Footprint> {
        if !self.share_area(area) {
            return None;
        }
        let (col_min, row_min, col_max, row_max) = self.overlapped_pixel_rect(area);
        Some(Footprint::new(
            self.tl_x + col_min as f64 * self.px_w,
            self.tl_y + row_min as f64 * self.px_h,
            self.px_w,
            self.px_h,
            col_max - col_min + 1,
            row_max - row_min + 1,
        ))
    }
}

/// Index of a cache tile within a raster's native tiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileIndex {
    pub y: u32,
    pub x: u32,
}

impl TileIndex {
    pub fn new(x: u32, y: u32) -> TileIndex {
        TileIndex { x, y }
    }
}

impl fmt::Display for TileIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}_{}", self.x, self.y)
    }
}
