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

/// A dense block of raster samples: row-major, channel-minor `f32`.
///
/// Sample `(col, row, channel)` lives at `(row * width + col) * channels +
/// channel`. This is the only array type that crosses actor boundaries.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelBuf {
    w: u32,
    h: u32,
    channels: u16,
    samples: Vec<f32>,
}

impl PixelBuf {
    pub fn new_filled(w: u32, h: u32, channels: u16, value: f32) -> PixelBuf {
        let len = w as usize * h as usize * channels as usize;
        PixelBuf {
            w,
            h,
            channels,
            samples: vec![value; len],
        }
    }

    pub fn from_samples(w: u32, h: u32, channels: u16, samples: Vec<f32>) -> PixelBuf {
        assert_eq!(
            samples.len(),
            w as usize * h as usize * channels as usize,
            "sample count does not match dimensions"
        );
        PixelBuf {
            w,
            h,
            channels,
            samples,
        }
    }

    pub fn width(&self) -> u32 {
        self.w
    }

    pub fn height(&self) -> u32 {
        self.h
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    #[inline]
    fn offset(&self, col: u32, row: u32) -> usize {
        debug_assert!(col < self.w && row < self.h);
        (row as usize * self.w as usize + col as usize) * self.channels as usize
    }

    pub fn get(&self, col: u32, row: u32, channel: u16) -> f32 {
        self.samples[self.offset(col, row) + channel as usize]
    }

    pub fn set(&mut self, col: u32, row: u32, channel: u16, value: f32) {
        let idx = self.offset(col, row) + channel as usize;
        self.samples[idx] = value;
    }

    /// Copies a `rw`×`rh` rectangle of `src` (all channels) into `self`.
    pub fn copy_rect_from(
        &mut self,
        src: &PixelBuf,
        src_col: u32,
        src_row: u32,
        dst_col: u32,
        dst_row: u32,
        rw: u32,
        rh: u32,
    ) {
        assert_eq!(self.channels, src.channels, "channel counts differ");
        assert!(src_col + rw <= src.w && src_row + rh <= src.h, "source rect out of bounds");
        assert!(dst_col + rw <= self.w && dst_row + rh <= self.h, "target rect out of bounds");
        let row_len = rw as usize * self.channels as usize;
        for dy in 0..rh {
            let src_off = src.offset(src_col, src_row + dy);
            let dst_off = self.offset(dst_col, dst_row + dy);
            self.samples[dst_off..dst_off + row_len]
                .copy_from_slice(&src.samples[src_off..src_off + row_len]);
        }
    }

    /// Returns a new buffer holding the listed channels, in order.
    pub fn select_channels(&self, channel_ids: &[u16]) -> PixelBuf {
        for &ch in channel_ids {
            assert!(ch < self.channels, "unknown channel {ch}");
        }
        let mut out = PixelBuf::new_filled(self.w, self.h, channel_ids.len() as u16, 0.0);
        for row in 0..self.h {
            for col in 0..self.w {
                let src_off = self.offset(col, row);
                let dst_off = out.offset(col, row);
                for (i, &ch) in channel_ids.iter().enumerate() {
                    out.samples[dst_off + i] = self.samples[src_off + ch as usize];
                }
            }
        }
        out
    }

    /// Returns the rectangle `[col0, col0+rw) × [row0, row0+rh)` as a new
    /// buffer.
    pub fn crop(&self, col0: u32, row0: u32, rw: u32, rh: u32) -> PixelBuf {
        let mut out = PixelBuf::new_filled(rw, rh, self.channels, 0.0);
        out.copy_rect_from(self, col0, row0, 0, 0, rw, rh);
        out
    }
}
