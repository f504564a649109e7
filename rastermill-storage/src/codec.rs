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

use rastermill_common::{Footprint, PixelBuf};

use crate::error::CacheError;
use crate::fingerprint::FORMAT_VERSION;

const MAGIC: &[u8; 4] = b"RMT1";

/// Identity fields carried inside a cache tile file.
///
/// They duplicate what the file name's fingerprint already pins down; the
/// duplication is what makes a file self-describing enough to be validated
/// against the name without any sidecar.
#[derive(Debug, Clone, PartialEq)]
pub struct TileHeader {
    pub footprint: Footprint,
    pub channels: u16,
    pub recipe_version: String,
}

/// Encodes a tile: header then CRC-guarded little-endian f32 payload.
pub fn encode_tile(header: &TileHeader, buf: &PixelBuf) -> Vec<u8> {
    assert_eq!(buf.width(), header.footprint.width());
    assert_eq!(buf.height(), header.footprint.height());
    assert_eq!(buf.channels(), header.channels);

    let payload_len = buf.samples().len() * 4;
    let mut bytes = Vec::with_capacity(64 + header.recipe_version.len() + payload_len);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    let (left, top, _, _) = header.footprint.bounds();
    bytes.extend_from_slice(&left.to_bits().to_le_bytes());
    bytes.extend_from_slice(&top.to_bits().to_le_bytes());
    bytes.extend_from_slice(&header.footprint.px_width().to_bits().to_le_bytes());
    bytes.extend_from_slice(&header.footprint.px_height().to_bits().to_le_bytes());
    bytes.extend_from_slice(&header.footprint.width().to_le_bytes());
    bytes.extend_from_slice(&header.footprint.height().to_le_bytes());
    bytes.extend_from_slice(&header.channels.to_le_bytes());
    bytes.extend_from_slice(&(header.recipe_version.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.recipe_version.as_bytes());

    let mut payload = Vec::with_capacity(payload_len);
    for sample in buf.samples() {
        payload.extend_from_slice(&sample.to_le_bytes());
    }
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    bytes.extend_from_slice(&payload);
    bytes
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CacheError> {
        if self.pos + len > self.bytes.len() {
            return Err(CacheError::corrupt(self.path, "unexpected end of file"));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, CacheError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, CacheError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CacheError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, CacheError> {
        Ok(f64::from_bits(self.u64()?))
    }
}

/// Decodes a tile file, verifying structure and payload CRC. Identity checks
/// against the expected fingerprint are the caller's business
/// ([`crate::TileStore::validate`]).
pub fn decode_tile(path: &Path, bytes: &[u8]) -> Result<(TileHeader, PixelBuf), CacheError> {
    let mut reader = Reader {
        bytes,
        pos: 0,
        path,
    };
    if reader.take(4)? != MAGIC.as_slice() {
        return Err(CacheError::corrupt(path, "bad magic"));
    }
    let version = reader.u32()?;
    if version != FORMAT_VERSION {
        return Err(CacheError::corrupt(
            path,
            format!("format version {version} (expected {FORMAT_VERSION})"),
        ));
    }
    let left = reader.f64()?;
    let top = reader.f64()?;
    let px_w = reader.f64()?;
    let px_h = reader.f64()?;
    let w = reader.u32()?;
    let h = reader.u32()?;
    if px_w <= 0.0 || px_h <= 0.0 || w == 0 || h == 0 {
        return Err(CacheError::corrupt(path, "degenerate footprint"));
    }
    let channels = reader.u16()?;
    let version_len = reader.u16()? as usize;
    let recipe_version = String::from_utf8(reader.take(version_len)?.to_vec())
        .map_err(|_| CacheError::corrupt(path, "recipe version is not utf-8"))?;
    let payload_len = reader.u64()? as usize;
    let expected_crc = reader.u32()?;
    let payload = reader.take(payload_len)?;
    if reader.pos != bytes.len() {
        return Err(CacheError::corrupt(path, "trailing bytes"));
    }
    if crc32fast::hash(payload) != expected_crc {
        return Err(CacheError::corrupt(path, "payload crc mismatch"));
    }
    let expected_samples = w as usize * h as usize * channels as usize;
    if payload_len != expected_samples * 4 {
        return Err(CacheError::corrupt(path, "payload length mismatch"));
    }
    let samples: Vec<f32> = payload
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect();
    let header = TileHeader {
        footprint: Footprint::new(left, top, px_w, px_h, w, h),
        channels,
        recipe_version,
    };
    Ok((header, PixelBuf::from_samples(w, h, channels, samples)))
}
