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

use rastermill_common::Footprint;
use sha2::{Digest, Sha256};

/// Version of the on-disk tile encoding. Bumping it invalidates every cache.
pub const FORMAT_VERSION: u32 = 1;

/// Number of lower-hex characters kept from the SHA-256 digest (128 bits).
const FINGERPRINT_LEN: usize = 32;

fn finish_hex(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(FINGERPRINT_LEN);
    for byte in digest.iter().take(FINGERPRINT_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn hash_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn hash_footprint(hasher: &mut Sha256, footprint: &Footprint) {
    let (left, top, _, _) = footprint.bounds();
    hasher.update(left.to_bits().to_le_bytes());
    hasher.update(top.to_bits().to_le_bytes());
    hasher.update(footprint.px_width().to_bits().to_le_bytes());
    hasher.update(footprint.px_height().to_bits().to_le_bytes());
    hasher.update(footprint.width().to_le_bytes());
    hasher.update(footprint.height().to_le_bytes());
}

/// Identity of a whole raster: everything that determines the bytes its
/// tiles may contain, except the tile extent itself.
///
/// `upstream_fingerprints` are the raster fingerprints of the recipe's
/// primitives, in declaration order, so a change anywhere in the dependency
/// DAG invalidates downstream caches.
pub fn raster_fingerprint(
    recipe_name: &str,
    recipe_version: &str,
    channels: &[String],
    upstream_fingerprints: &[String],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"rastermill-raster\0");
    hasher.update(FORMAT_VERSION.to_le_bytes());
    hash_str(&mut hasher, recipe_name);
    hash_str(&mut hasher, recipe_version);
    hasher.update((channels.len() as u64).to_le_bytes());
    for channel in channels {
        hash_str(&mut hasher, channel);
    }
    hasher.update((upstream_fingerprints.len() as u64).to_le_bytes());
    for upstream in upstream_fingerprints {
        hash_str(&mut hasher, upstream);
    }
    finish_hex(hasher)
}

/// The fingerprint `H` embedded in a cache file name.
pub fn tile_fingerprint(raster_fingerprint: &str, tile_footprint: &Footprint) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"rastermill-tile\0");
    hasher.update(FORMAT_VERSION.to_le_bytes());
    hash_str(&mut hasher, raster_fingerprint);
    hash_footprint(&mut hasher, tile_footprint);
    finish_hex(hasher)
}

#[cfg(test)]
mod tests {
    use rastermill_common::Footprint;

    use super::{raster_fingerprint, tile_fingerprint};

    #[test]
    fn test_fingerprint_is_deterministic_and_sensitive() {
        let channels = vec!["elevation".to_string()];
        let raster_fp = raster_fingerprint("dsm", "1.0", &channels, &[]);
        assert_eq!(
            raster_fp,
            raster_fingerprint("dsm", "1.0", &channels, &[])
        );
        assert_ne!(
            raster_fp,
            raster_fingerprint("dsm", "1.1", &channels, &[])
        );
        assert_ne!(
            raster_fp,
            raster_fingerprint("dsm", "1.0", &channels, &[raster_fp.clone()])
        );

        let tile = Footprint::new(0.0, 0.0, 1.0, 1.0, 256, 256);
        let shifted = Footprint::new(256.0, 0.0, 1.0, 1.0, 256, 256);
        let h = tile_fingerprint(&raster_fp, &tile);
        assert_eq!(h.len(), 32);
        assert_eq!(h, tile_fingerprint(&raster_fp, &tile));
        assert_ne!(h, tile_fingerprint(&raster_fp, &shifted));
    }
}
