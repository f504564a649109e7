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

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use rastermill_common::{Footprint, PixelBuf, TileIndex};
use tracing::{debug, warn};

use crate::codec::{decode_tile, encode_tile, TileHeader};
use crate::error::CacheError;
use crate::fingerprint::tile_fingerprint;

const TILE_EXT: &str = "rmt";

/// The cache directory of one raster.
///
/// File layout: `<x>_<y>.<H>.rmt`, where `H` pins the raster identity and
/// the tile extent. Publication goes through a same-directory temp file and
/// a rename so that a reader can never observe a partial tile under the
/// canonical name.
///
/// The store is cheap to clone and carries no open file state; all methods
/// are blocking and meant to run on the I/O worker pool.
#[derive(Clone)]
pub struct TileStore {
    dir: PathBuf,
    raster_fingerprint: String,
    channels: u16,
    recipe_version: String,
}

impl TileStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        raster_fingerprint: impl Into<String>,
        channels: u16,
        recipe_version: impl Into<String>,
    ) -> TileStore {
        TileStore {
            dir: dir.into(),
            raster_fingerprint: raster_fingerprint.into(),
            channels,
            recipe_version: recipe_version.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tile_fingerprint(&self, tile_footprint: &Footprint) -> String {
        tile_fingerprint(&self.raster_fingerprint, tile_footprint)
    }

    pub fn canonical_path(&self, tile: TileIndex, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{tile}.{fingerprint}.{TILE_EXT}"))
    }

    pub fn ensure_dir(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Removes every tile file of this raster. Returns how many were removed.
    pub fn purge(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for entry in read_dir_or_empty(&self.dir)? {
            let path = entry.path();
            if path.extension().map(|ext| ext == TILE_EXT).unwrap_or(false) {
                self.delete(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Lists the on-disk candidates for a tile, whatever their fingerprint.
    ///
    /// A healthy cache yields zero or one candidate; more than one means an
    /// interrupted upgrade left conflicting fingerprints behind.
    pub fn list_candidates(&self, tile: TileIndex) -> Result<Vec<PathBuf>, CacheError> {
        let prefix = format!("{tile}.");
        let mut candidates = Vec::new();
        for entry in read_dir_or_empty(&self.dir)? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if file_name.starts_with(&prefix) && file_name.ends_with(&format!(".{TILE_EXT}")) {
                candidates.push(path);
            }
        }
        candidates.sort();
        Ok(candidates)
    }

    /// Full validation of a candidate file against the expected fingerprint:
    /// name, header identity, payload length and CRC.
    pub fn validate(&self, tile_footprint: &Footprint, path: &Path) -> Result<(), CacheError> {
        let expected_fingerprint = self.tile_fingerprint(tile_footprint);
        let name_fingerprint = fingerprint_of_path(path)
            .ok_or_else(|| CacheError::corrupt(path, "unparsable file name"))?;
        if name_fingerprint != expected_fingerprint {
            return Err(CacheError::corrupt(path, "fingerprint mismatch in name"));
        }
        let bytes = fs::read(path)?;
        let (header, _buf) = decode_tile(path, &bytes)?;
        if header.footprint != *tile_footprint {
            return Err(CacheError::corrupt(path, "footprint mismatch in header"));
        }
        if header.channels != self.channels {
            return Err(CacheError::corrupt(path, "channel count mismatch"));
        }
        if header.recipe_version != self.recipe_version {
            return Err(CacheError::corrupt(path, "recipe version mismatch"));
        }
        Ok(())
    }

    /// Reads a published tile. CRC is re-verified on every read.
    pub fn read(&self, path: &Path) -> Result<PixelBuf, CacheError> {
        let bytes = fs::read(path)?;
        let (_header, buf) = decode_tile(path, &bytes)?;
        Ok(buf)
    }

    /// Atomically publishes a tile and returns its canonical path.
    ///
    /// Write tmp → fsync tmp → rename → fsync dir. Two processes publishing
    /// the same fingerprint race harmlessly: both write the same bytes and
    /// the last rename wins.
    pub fn publish(
        &self,
        tile: TileIndex,
        tile_footprint: &Footprint,
        buf: &PixelBuf,
    ) -> Result<PathBuf, CacheError> {
        self.ensure_dir()?;
        let fingerprint = self.tile_fingerprint(tile_footprint);
        let final_path = self.canonical_path(tile, &fingerprint);
        let tmp_path = self.dir.join(format!(
            "{}.tmp.{}.{}",
            final_path.file_name().unwrap().to_str().unwrap(),
            std::process::id(),
            nonce(),
        ));
        let header = TileHeader {
            footprint: *tile_footprint,
            channels: self.channels,
            recipe_version: self.recipe_version.clone(),
        };
        let bytes = encode_tile(&header, buf);
        let write_result = (|| {
            let mut tmp_file = fs::File::create(&tmp_path)?;
            tmp_file.write_all(&bytes)?;
            tmp_file.sync_all()?;
            fs::rename(&tmp_path, &final_path)?;
            fs::File::open(&self.dir)?.sync_all()?;
            Ok(())
        })();
        if let Err(io_error) = write_result {
            if let Err(cleanup_error) = remove_file_if_exists(&tmp_path) {
                warn!(path = %tmp_path.display(), error = %cleanup_error, "failed to remove temp tile");
            }
            return Err(CacheError::Io(io_error));
        }
        debug!(path = %final_path.display(), "published cache tile");
        Ok(final_path)
    }

    /// NotFound-tolerant deletion.
    pub fn delete(&self, path: &Path) -> Result<(), CacheError> {
        remove_file_if_exists(path)?;
        Ok(())
    }
}

fn fingerprint_of_path(path: &Path) -> Option<&str> {
    let file_name = path.file_name()?.to_str()?;
    let mut parts = file_name.split('.');
    let _tile = parts.next()?;
    let fingerprint = parts.next()?;
    let ext = parts.next()?;
    if ext != TILE_EXT || parts.next().is_some() {
        return None;
    }
    Some(fingerprint)
}

fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(io_error) if io_error.kind() == ErrorKind::NotFound => Ok(()),
        Err(io_error) => Err(io_error),
    }
}

fn read_dir_or_empty(dir: &Path) -> Result<Vec<fs::DirEntry>, CacheError> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(entries.collect::<std::io::Result<Vec<_>>>()?),
        Err(io_error) if io_error.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(io_error) => Err(CacheError::Io(io_error)),
    }
}

fn nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|ch| char::from(ch.to_ascii_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use rastermill_common::{Footprint, PixelBuf, TileIndex};

    use super::TileStore;

    fn store(dir: &std::path::Path) -> TileStore {
        TileStore::new(dir.join("cache"), "deadbeef", 1, "1.0")
    }

    fn tile_buf() -> PixelBuf {
        PixelBuf::from_samples(2, 2, 1, vec![1.0, 2.0, 3.0, 4.0])
    }

    #[test]
    fn test_publish_validate_read_roundtrip() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = store(tempdir.path());
        let tile = TileIndex::new(0, 0);
        let footprint = Footprint::new(0.0, 0.0, 1.0, 1.0, 2, 2);
        let path = store.publish(tile, &footprint, &tile_buf()).unwrap();
        assert_eq!(store.list_candidates(tile).unwrap(), vec![path.clone()]);
        store.validate(&footprint, &path).unwrap();
        assert_eq!(store.read(&path).unwrap(), tile_buf());
        // The name embeds the fingerprint.
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .contains(&store.tile_fingerprint(&footprint)));
        // No temp file left behind.
        assert_eq!(
            std::fs::read_dir(store.dir()).unwrap().count(),
            1,
            "only the canonical file remains"
        );
    }

    #[test]
    fn test_truncated_file_fails_validation() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = store(tempdir.path());
        let tile = TileIndex::new(1, 2);
        let footprint = Footprint::new(2.0, 4.0, 1.0, 1.0, 2, 2);
        let path = store.publish(tile, &footprint, &tile_buf()).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();
        let err = store.validate(&footprint, &path).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_foreign_fingerprint_fails_validation() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = store(tempdir.path());
        let other_store = TileStore::new(store.dir(), "0badf00d", 1, "1.0");
        let tile = TileIndex::new(0, 0);
        let footprint = Footprint::new(0.0, 0.0, 1.0, 1.0, 2, 2);
        let path = other_store.publish(tile, &footprint, &tile_buf()).unwrap();
        let err = store.validate(&footprint, &path).unwrap_err();
        assert!(err.is_corrupt());
        // Both candidates show up for hygiene handling.
        store.publish(tile, &footprint, &tile_buf()).unwrap();
        assert_eq!(store.list_candidates(tile).unwrap().len(), 2);
    }

    #[test]
    fn test_purge_and_missing_dir() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = store(tempdir.path());
        let tile = TileIndex::new(0, 0);
        assert!(store.list_candidates(tile).unwrap().is_empty());
        assert_eq!(store.purge().unwrap(), 0);
        let footprint = Footprint::new(0.0, 0.0, 1.0, 1.0, 2, 2);
        store.publish(tile, &footprint, &tile_buf()).unwrap();
        assert_eq!(store.purge().unwrap(), 1);
        assert!(store.list_candidates(tile).unwrap().is_empty());
    }
}
