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

use rastermill_common::{Footprint, PixelBuf};
use serde::{Deserialize, Serialize};

/// Order in which the production arrays of a query are delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOrder {
    /// The footprint list exactly as given.
    #[default]
    UserOrder,
    /// North to south, then west to east, on footprint centers.
    RowMajor,
    /// By distance from the overall center of the query, closest first.
    CenterOut,
}

/// Parameters of a query, immutable once posted.
#[derive(Clone)]
pub struct QuerySpec {
    /// Target grids of the production arrays. They may lie anywhere relative
    /// to the raster, on or off its grid.
    pub footprints: Vec<Footprint>,
    /// Channel indices to deliver. Empty means every channel of the raster.
    pub channels: Vec<u16>,
    pub order: DeliveryOrder,
    /// Capacity `Q` of the output queue; bounds how much of the query may be
    /// in flight at any time.
    pub queue_capacity: usize,
    /// Value used for pixels outside the raster.
    pub nodata: f32,
}

impl QuerySpec {
    pub fn new(footprints: Vec<Footprint>) -> QuerySpec {
        QuerySpec {
            footprints,
            channels: Vec::new(),
            order: DeliveryOrder::UserOrder,
            queue_capacity: 2,
            nodata: 0.0,
        }
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> QuerySpec {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_order(mut self, order: DeliveryOrder) -> QuerySpec {
        self.order = order;
        self
    }

    pub fn with_channels(mut self, channels: Vec<u16>) -> QuerySpec {
        self.channels = channels;
        self
    }

    pub fn with_nodata(mut self, nodata: f32) -> QuerySpec {
        self.nodata = nodata;
        self
    }
}

/// One delivered unit: a sub-array of the query's footprint.
#[derive(Clone, Debug, PartialEq)]
pub struct SubArray {
    pub footprint: Footprint,
    pub data: PixelBuf,
}
