//! Kademlia node Id or a lookup target
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The number of Id bits, also the maximum bucket distance between two Ids.
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id([u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidIdSize> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// The content key for a value: SHA-1 over the payload bytes.
    pub fn hash(value: &[u8]) -> Id {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(value);

        Id(hasher.digest().bytes())
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Full-width XOR of this Id and another, interpreted as an unsigned
    /// magnitude. This is the ordering metric of the key space: `a` is closer
    /// to `t` than `b` iff `a.xor(t) < b.xor(t)`.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Simplified XOR distance between this Id and a target Id, used as the
    /// routing table bucket index.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn distance(&self, other: &Id) -> u8 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = (i as u32 * 8 + (a ^ b).leading_zeros()) as u8;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }

    /// Random Id whose [distance](Id::distance) to `self` is exactly
    /// `distance`, used as a lookup target when refreshing that bucket.
    ///
    /// `distance` must be in `1..=MAX_DISTANCE`.
    pub fn random_at_distance(&self, distance: u8) -> Id {
        let distance = distance.clamp(1, MAX_DISTANCE);

        // Index of the first differing bit, from the most significant bit.
        let first_diff = (MAX_DISTANCE - distance) as usize;
        let byte = first_diff / 8;
        let bit = first_diff % 8;

        let mut rng = rand::thread_rng();
        let mut bytes = self.0;

        let keep_mask: u8 = if bit == 0 { 0 } else { 0xff << (8 - bit) };
        let flip_mask: u8 = 0x80 >> bit;
        let rand_mask: u8 = !(keep_mask | flip_mask);

        bytes[byte] = (self.0[byte] & keep_mask)
            | ((self.0[byte] ^ flip_mask) & flip_mask)
            | (rng.gen::<u8>() & rand_mask);

        for b in bytes.iter_mut().skip(byte + 1) {
            *b = rng.gen();
        }

        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = DecodeIdError;

    fn from_str(s: &str) -> Result<Id, Self::Err> {
        if s.len() != ID_SIZE * 2 {
            return Err(DecodeIdError::InvalidIdSize(InvalidIdSize(s.len() / 2)));
        }

        let mut bytes = [0_u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| DecodeIdError::InvalidHexCharacter)?;
        }

        Ok(Id(bytes))
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Invalid Id size {0}, expected {size}", size = ID_SIZE)]
pub struct InvalidIdSize(pub usize);

#[derive(thiserror::Error, Debug)]
pub enum DecodeIdError {
    #[error(transparent)]
    InvalidIdSize(#[from] InvalidIdSize),

    #[error("Hex encoding contains invalid character")]
    InvalidHexCharacter,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        let id = Id::random();
        assert_eq!(id.distance(&id), 0);
        assert_eq!(id.xor(&id), Id([0; ID_SIZE]));
    }

    #[test]
    fn distance_is_symmetric() {
        for _ in 0..10 {
            let a = Id::random();
            let b = Id::random();

            assert_eq!(a.distance(&b), b.distance(&a));
            assert_eq!(a.xor(&b), b.xor(&a));
        }
    }

    #[test]
    fn distance_of_first_bit_flip_is_max() {
        let a = Id([0; ID_SIZE]);
        let mut flipped = [0; ID_SIZE];
        flipped[0] = 0x80;

        assert_eq!(a.distance(&Id(flipped)), MAX_DISTANCE);
    }

    #[test]
    fn xor_ordering_is_consistent() {
        // If a is closer to t than b by xor, a also has more shared prefix
        // bits (or equal) with t than b.
        let t = Id::random();
        let a = Id::random();
        let b = Id::random();

        if a.xor(&t) < b.xor(&t) {
            assert!(t.distance(&a) <= t.distance(&b));
        } else {
            assert!(t.distance(&b) <= t.distance(&a));
        }
    }

    #[test]
    fn random_at_distance() {
        let id = Id::random();

        for distance in [1, 7, 8, 42, 159, 160] {
            let target = id.random_at_distance(distance);
            assert_eq!(
                id.distance(&target),
                distance,
                "expected distance {}",
                distance
            );
        }
    }

    #[test]
    fn hex_roundtrip() {
        let id = Id::random();
        let parsed: Id = id.to_string().parse().expect("valid hex");

        assert_eq!(parsed, id);
    }

    #[test]
    fn from_str_rejects_bad_input() {
        assert!("abcd".parse::<Id>().is_err());
        assert!("zz".repeat(ID_SIZE).parse::<Id>().is_err());
    }

    #[test]
    fn invalid_size_error_names_both_sizes() {
        let error = Id::from_bytes([0_u8; 4]).expect_err("wrong size");

        assert_eq!(error.to_string(), "Invalid Id size 4, expected 20");
    }

    #[test]
    fn content_key_is_stable() {
        let key = Id::hash(b"hello world");

        assert_eq!(key, Id::hash(b"hello world"));
        assert_ne!(key, Id::hash(b"hello world!"));
    }
}
