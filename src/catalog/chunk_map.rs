// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use serde::{Deserialize, Serialize};

/// One bit per chunk, most significant bit first. Persisted as a hex string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ChunkMapRepr", into = "ChunkMapRepr")]
pub struct ChunkMap {
    bits: Vec<u8>,
    len: u64,
    present: u64,
}

#[derive(Serialize, Deserialize)]
struct ChunkMapRepr {
    len: u64,
    bits: String,
}

impl From<ChunkMap> for ChunkMapRepr {
    fn from(map: ChunkMap) -> Self {
        ChunkMapRepr {
            len: map.len,
            bits: hex::encode(&map.bits),
        }
    }
}

impl TryFrom<ChunkMapRepr> for ChunkMap {
    type Error = String;

    fn try_from(repr: ChunkMapRepr) -> Result<Self, Self::Error> {
        let bits = hex::decode(&repr.bits).map_err(|e| e.to_string())?;
        if bits.len() as u64 != repr.len.div_ceil(8) {
            return Err(format!(
                "chunk map of {} chunks needs {} bytes, found {}",
                repr.len,
                repr.len.div_ceil(8),
                bits.len()
            ));
        }
        let mut map = ChunkMap {
            bits,
            len: repr.len,
            present: 0,
        };
        map.clear_trailing_bits();
        map.present = map.bits.iter().map(|b| b.count_ones() as u64).sum();
        Ok(map)
    }
}

impl ChunkMap {
    pub fn empty(len: u64) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8) as usize],
            len,
            present: 0,
        }
    }

    pub fn full(len: u64) -> Self {
        let mut map = Self {
            bits: vec![0xff; len.div_ceil(8) as usize],
            len,
            present: len,
        };
        map.clear_trailing_bits();
        map
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count(&self) -> u64 {
        self.present
    }

    pub fn is_complete(&self) -> bool {
        self.present == self.len
    }

    pub fn is_set(&self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        let (byte, mask) = Self::locate(index);
        self.bits[byte] & mask != 0
    }

    /// Sets the bit. Returns `Some(true)` if it was newly set, `Some(false)`
    /// if it already was, and `None` for an index past the end.
    pub fn set(&mut self, index: u64) -> Option<bool> {
        if index >= self.len {
            return None;
        }
        let (byte, mask) = Self::locate(index);
        if self.bits[byte] & mask != 0 {
            return Some(false);
        }
        self.bits[byte] |= mask;
        self.present += 1;
        Some(true)
    }

    pub fn missing(&self) -> Vec<u64> {
        (0..self.len).filter(|&i| !self.is_set(i)).collect()
    }

    pub fn progress(&self) -> f64 {
        if self.len == 0 {
            return 1.0;
        }
        self.present as f64 / self.len as f64
    }

    fn locate(index: u64) -> (usize, u8) {
        ((index / 8) as usize, 0x80 >> (index % 8))
    }

    fn clear_trailing_bits(&mut self) {
        let used = (self.len % 8) as u32;
        if used != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xffu8 << (8 - used);
            }
        }
    }
}
