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

use crate::new_coolid;

/// Stable identifier of a registered raster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RasterUid(String);

impl RasterUid {
    pub fn new() -> RasterUid {
        RasterUid(new_coolid("raster"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RasterUid {
    fn default() -> Self {
        RasterUid::new()
    }
}

impl fmt::Display for RasterUid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a posted query, unique within a dataset.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryUid(String);

impl QueryUid {
    pub fn new() -> QueryUid {
        QueryUid(new_coolid("query"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for QueryUid {
    fn default() -> Self {
        QueryUid::new()
    }
}

impl fmt::Display for QueryUid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}
