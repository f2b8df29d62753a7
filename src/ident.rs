//! The 256-bit opaque [`Identifier`] used for node ids, user ids and block
//! digests (spec §3 "Identifier"), plus the XOR metric the overlay and DHT
//! route on.

use std::cmp::Ordering;
use std::fmt;

pub const IDENTIFIER_LEN: usize = 32;

/// A 256-bit opaque byte string. Total order is lexicographic; the overlay
/// metric is bitwise XOR distance (`Identifier::distance`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier(pub [u8; IDENTIFIER_LEN]);

impl Identifier {
    pub const ZERO: Identifier = Identifier([0u8; IDENTIFIER_LEN]);

    pub fn from_bytes(bytes: [u8; IDENTIFIER_LEN]) -> Self {
        Identifier(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != IDENTIFIER_LEN {
            return None;
        }
        let mut out = [0u8; IDENTIFIER_LEN];
        out.copy_from_slice(bytes);
        Some(Identifier(out))
    }

    pub fn as_bytes(&self) -> &[u8; IDENTIFIER_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// XOR distance to `other`, interpreted as a 256-bit big-endian integer.
    /// This is the overlay's routing metric (spec §4.4).
    pub fn distance(&self, other: &Identifier) -> Identifier {
        let mut out = [0u8; IDENTIFIER_LEN];
        for i in 0..IDENTIFIER_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        Identifier(out)
    }

    /// Index (0 = most significant) of the highest set bit, or `None` if the
    /// identifier is all-zero. Used for Kademlia-style bucket placement.
    pub fn highest_bit(&self) -> Option<usize> {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit_in_byte = 7 - byte.leading_zeros() as usize;
                return Some(byte_idx * 8 + (7 - bit_in_byte));
            }
        }
        None
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({}…)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl serde::Serialize for Identifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Identifier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Identifier::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Sort `ids` by ascending XOR distance from `target`.
pub fn sort_by_distance(ids: &mut [Identifier], target: &Identifier) {
    ids.sort_by_key(|id| id.distance(target));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric() {
        let a = Identifier([1u8; 32]);
        let b = Identifier([2u8; 32]);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn distance_to_self_is_zero() {
        let a = Identifier([7u8; 32]);
        assert_eq!(a.distance(&a), Identifier::ZERO);
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = Identifier::from_hex(&"00".repeat(32)).unwrap();
        let b = Identifier::from_hex(&format!("{}{}", "00".repeat(31), "01")).unwrap();
        assert!(a < b);
    }

    #[test]
    fn hex_roundtrip() {
        let a = Identifier([9u8; 32]);
        assert_eq!(Identifier::from_hex(&a.to_hex()).unwrap(), a);
    }

    #[test]
    fn sort_by_distance_orders_closest_first() {
        let target = Identifier::ZERO;
        let mut ids = vec![
            Identifier([0xff; 32]),
            Identifier([0x01; 32]),
            Identifier([0x10; 32]),
        ];
        sort_by_distance(&mut ids, &target);
        assert_eq!(ids[0], Identifier([0x01; 32]));
    }
}
