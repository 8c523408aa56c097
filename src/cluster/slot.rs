//! Redis Cluster slot calculation.
//!
//! Redis Cluster uses CRC16 to map keys to slots (0-16383).
//! This module provides utilities for calculating slot numbers from keys
//! and for folding the slots of several keys into a single routing hint.

use crc::{Crc, CRC_16_XMODEM};

/// Number of hash slots in Redis Cluster.
pub const SLOT_COUNT: u16 = 16384;

/// CRC-16/XMODEM algorithm used by Redis.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the Redis Cluster slot for a given key.
///
/// If the key contains `{...}` with a non-empty body, only the content
/// inside the first pair of braces is hashed (hash tags).
///
/// # Arguments
///
/// * `key` - The raw key bytes
///
/// # Returns
///
/// The slot number (0-16383)
///
/// # Examples
///
/// ```
/// use muxplex::cluster::hash_slot;
///
/// assert_eq!(hash_slot(b"foo"), 12182);
/// assert_eq!(hash_slot(b"{user1000}.following"), hash_slot(b"{user1000}.followers"));
/// ```
pub fn hash_slot(key: &[u8]) -> u16 {
    CRC16.checksum(extract_hash_tag(key)) % SLOT_COUNT
}

/// Calculates the slot of a UTF-8 key.
#[inline]
pub fn key_slot(key: &str) -> u16 {
    hash_slot(key.as_bytes())
}

/// Extracts the hash tag from a key.
///
/// - `{user1000}.following` → `user1000`
/// - `foo{bar}baz` → `bar`
/// - `foo{}{bar}` → first braces are empty, use whole key
/// - `foo` → no hash tag, use whole key
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[start + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[start + 1..start + 1 + len];
            }
        }
    }
    key
}

/// Routing slot of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotHint {
    /// The operation touches no key.
    #[default]
    NoSlot,
    /// Every key hashes to this slot.
    Slot(u16),
    /// Keys hash to different slots.
    Multiple,
}

impl SlotHint {
    /// Returns the slot, if there is exactly one.
    #[inline]
    pub fn slot(self) -> Option<u16> {
        match self {
            SlotHint::Slot(slot) => Some(slot),
            _ => None,
        }
    }

    /// Folds another hint into this one.
    pub fn merge(self, other: SlotHint) -> SlotHint {
        match (self, other) {
            (SlotHint::NoSlot, hint) | (hint, SlotHint::NoSlot) => hint,
            (SlotHint::Slot(a), SlotHint::Slot(b)) if a == b => SlotHint::Slot(a),
            _ => SlotHint::Multiple,
        }
    }
}

/// Folds the slot of `key` into `hint`.
///
/// `NoSlot` becomes `Slot(s)`; a second key in a different slot yields
/// `Multiple`, which is sticky.
#[inline]
pub fn combine_slot(hint: SlotHint, key: &[u8]) -> SlotHint {
    hint.merge(SlotHint::Slot(hash_slot(key)))
}

/// Computes the combined hint for a set of keys.
pub fn slot_of_keys<'a>(keys: impl IntoIterator<Item = &'a [u8]>) -> SlotHint {
    keys.into_iter().fold(SlotHint::NoSlot, combine_slot)
}
