// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! 16-byte opaque object identifiers.
//!
//! Keys compare by raw bytes; the all-zero value is the invalid sentinel.
//! Partitioned GPUs reuse the parent key with the partition index encoded
//! big-endian into bytes 4..8, e.g.
//!
//! ```text
//! parent GPU - 1eff74a1-0000-1000-807e-1746627a9cd7
//! child GPUs - 1eff74a1-0000-0000-807e-1746627a9cd7
//!              1eff74a1-0000-0001-807e-1746627a9cd7
//!              1eff74a1-0000-0002-807e-1746627a9cd7
//! ```
//!
//! Clients depend on this encoding to relate child keys back to their parent,
//! so the layout is part of the public discovery contract and must stay
//! bit-exact.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Byte range of the key that carries the partition index for child GPUs.
const PARTITION_BYTES: std::ops::Range<usize> = 4..8;

/// 16-byte opaque identifier for every API object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectKey([u8; 16]);

impl ObjectKey {
    /// The all-zero invalid sentinel.
    pub const INVALID: ObjectKey = ObjectKey([0u8; 16]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        ObjectKey(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Generate a fresh random key (v4 UUID bytes).
    pub fn generate() -> Self {
        ObjectKey(*Uuid::new_v4().as_bytes())
    }

    /// True unless this is the all-zero sentinel.
    pub fn valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Reset to the invalid sentinel.
    pub fn reset(&mut self) {
        self.0 = [0u8; 16];
    }

    /// Derive a child GPU key: the parent key with bytes 4..8 replaced by the
    /// big-endian partition index.
    pub fn child_of(parent: ObjectKey, partition_id: u32) -> Self {
        let mut bytes = parent.0;
        bytes[PARTITION_BYTES].copy_from_slice(&partition_id.to_be_bytes());
        ObjectKey(bytes)
    }

    /// Partition index encoded in bytes 4..8 (big-endian). Only meaningful
    /// for keys produced by [`ObjectKey::child_of`].
    pub fn partition_index(&self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.0[PARTITION_BYTES]);
        u32::from_be_bytes(raw)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Uuid::from_bytes(self.0).fmt(f)
    }
}

impl FromStr for ObjectKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ObjectKey(*Uuid::from_str(s)?.as_bytes()))
    }
}

impl From<Uuid> for ObjectKey {
    fn from(uuid: Uuid) -> Self {
        ObjectKey(*uuid.as_bytes())
    }
}

impl Serialize for ObjectKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        ObjectKey::from_str(&text).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(text: &str) -> ObjectKey {
        text.parse().expect("valid uuid")
    }

    #[test]
    fn test_invalid_sentinel() {
        assert!(!ObjectKey::INVALID.valid());
        assert!(ObjectKey::generate().valid());

        let mut k = ObjectKey::generate();
        k.reset();
        assert!(!k.valid());
    }

    #[test]
    fn test_child_key_encoding_is_bit_exact() {
        let parent = key("1eff74a1-0000-1000-807e-1746627a9cd7");
        assert_eq!(
            ObjectKey::child_of(parent, 0),
            key("1eff74a1-0000-0000-807e-1746627a9cd7")
        );
        assert_eq!(
            ObjectKey::child_of(parent, 2),
            key("1eff74a1-0000-0002-807e-1746627a9cd7")
        );
        // big-endian across the full 4 bytes
        assert_eq!(
            ObjectKey::child_of(parent, 0x0102_0304),
            key("1eff74a1-0102-0304-807e-1746627a9cd7")
        );
    }

    #[test]
    fn test_partition_index_roundtrip() {
        let parent = ObjectKey::generate();
        for pid in [0u32, 1, 7, 0xFFFF_FFFE] {
            assert_eq!(ObjectKey::child_of(parent, pid).partition_index(), pid);
        }
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let k = ObjectKey::generate();
        let text = k.to_string();
        assert_eq!(text.parse::<ObjectKey>().unwrap(), k);
    }

    #[test]
    fn test_serde_as_uuid_string() {
        let k = key("1eff74a1-0000-1000-807e-1746627a9cd7");
        let json = serde_json::to_string(&k).unwrap();
        assert_eq!(json, "\"1eff74a1-0000-1000-807e-1746627a9cd7\"");
        let back: ObjectKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, k);
    }
}
