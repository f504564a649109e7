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

//! Types shared by the rastermill crates.
//!
//! Everything here is scheduler-agnostic: footprints and pixel buffers are
//! plain data, worker pools are thin wrappers over rayon, and the kill switch
//! is a hierarchical boolean. The actor machinery lives in
//! `rastermill-actors`.

mod buffer;
mod coolid;
mod footprint;
mod ids;
mod kill_switch;
mod pool;

pub use buffer::PixelBuf;
pub use coolid::new_coolid;
pub use footprint::{Footprint, TileIndex};
pub use ids::{QueryUid, RasterUid};
pub use kill_switch::KillSwitch;
pub use pool::{CancelToken, Pool};
