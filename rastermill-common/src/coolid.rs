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

use rand::distributions::Alphanumeric;
use rand::Rng;

const COOLID_CHARS_LEN: usize = 8;

/// Returns a randomized unique identifier of the form `<name>-<suffix>`.
pub fn new_coolid(name: &str) -> String {
    let rand_suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(COOLID_CHARS_LEN)
        .map(|ch| char::from(ch.to_ascii_lowercase()))
        .collect();
    format!("{name}-{rand_suffix}")
}
