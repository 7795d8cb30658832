//! Redis Cluster slot calculation.
//!
//! Keys map to one of 16384 slots through CRC-16/XMODEM. Only the hash tag is
//! hashed when a key contains one, which lets related keys share a slot.

use crc::{Crc, CRC_16_XMODEM};

use crate::{Error, Result};

/// Number of hash slots in Redis Cluster.
pub const SLOT_COUNT: u16 = 16384;

/// CRC-16/XMODEM (poly 0x1021, init 0), the variant Redis uses.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the Redis Cluster slot for a key.
///
/// # Examples
///
/// ```
/// use slotwise::key_slot;
///
/// assert_eq!(key_slot("mykey"), 14687);
/// assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
/// ```
pub fn key_slot(key: impl AsRef<[u8]>) -> u16 {
    let hashed = hash_tag(key.as_ref());
    CRC16.checksum(hashed) % SLOT_COUNT
}

/// Returns the bytes that decide a key's slot.
///
/// - `{user1000}.following` → `user1000`
/// - `foo{bar}{baz}` → `bar` (first `{`, then the next `}`)
/// - `foo{}{bar}` → whole key (the first tag is empty)
/// - `foo{bar` → whole key
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

/// Checks that every key hashes to the same slot and returns that slot.
///
/// Multi-key commands must be rejected client-side when this fails: the
/// cluster cannot execute them atomically across nodes.
///
/// # Errors
///
/// - `CrossSlot` naming the first two disagreeing slots
/// - `InvalidArgument` for an empty key list
pub fn validate_same_slot<I, K>(keys: I) -> Result<u16>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    let mut keys = keys.into_iter();
    let first = keys
        .next()
        .map(key_slot)
        .ok_or_else(|| Error::InvalidArgument {
            message: "no keys to hash".to_string(),
        })?;

    for key in keys {
        let slot = key_slot(key);
        if slot != first {
            return Err(Error::CrossSlot {
                slots: Some((first, slot)),
            });
        }
    }
    Ok(first)
}
