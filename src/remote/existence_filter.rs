use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{invalid_argument, EngineResult};

pub const MAX_HASH_COUNT: u32 = 13;

/// Wire form of a bloom filter: raw bitmap, trailing padding bits in the last
/// byte, and the number of hash functions to apply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BloomFilterPayload {
    pub bitmap: Vec<u8>,
    pub padding: u32,
    pub hash_count: u32,
}

/// Membership probe over the full document names the server still considers
/// part of a target.
///
/// Uses double hashing over a SHA-256 digest: the digest's first two 64-bit
/// words seed `h_i = h1 + i * h2`, each reduced modulo the bit count. False
/// positives are possible and harmless (a present key is simply kept); false
/// negatives cannot occur.
pub struct BloomFilter {
    bitmap: Vec<u8>,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilter {
    pub fn from_payload(payload: &BloomFilterPayload) -> EngineResult<Self> {
        if payload.padding >= 8 {
            return Err(invalid_argument(format!(
                "invalid bloom filter padding: {}",
                payload.padding
            )));
        }
        if payload.bitmap.is_empty() && payload.padding != 0 {
            return Err(invalid_argument("padding on an empty bloom filter"));
        }
        let bit_count = (payload.bitmap.len() as u64) * 8 - u64::from(payload.padding);
        if !payload.bitmap.is_empty()
            && (payload.hash_count == 0 || payload.hash_count > MAX_HASH_COUNT)
        {
            return Err(invalid_argument(format!(
                "invalid bloom filter hash count: {}",
                payload.hash_count
            )));
        }
        Ok(Self {
            bitmap: payload.bitmap.clone(),
            bit_count,
            hash_count: payload.hash_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let digest = Sha256::digest(value.as_bytes());
        let h1 = u64::from_le_bytes(digest[0..8].try_into().unwrap_or_default());
        let h2 = u64::from_le_bytes(digest[8..16].try_into().unwrap_or_default());

        for i in 0..u64::from(self.hash_count) {
            let combined = h1.wrapping_add(i.wrapping_mul(h2));
            let index = combined % self.bit_count;
            if !self.bit_is_set(index) {
                return false;
            }
        }
        true
    }

    fn bit_is_set(&self, index: u64) -> bool {
        let byte = (index / 8) as usize;
        let bit = index % 8;
        (self.bitmap[byte] >> bit) & 1 == 1
    }
}

/// Builder used by the in-process fake backend and by tests that need a
/// filter covering a known key set.
pub struct BloomFilterBuilder {
    bitmap: Vec<u8>,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilterBuilder {
    pub fn new(bit_count: u64, hash_count: u32) -> Self {
        let byte_count = bit_count.div_ceil(8) as usize;
        Self {
            bitmap: vec![0; byte_count],
            bit_count,
            hash_count,
        }
    }

    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let digest = Sha256::digest(value.as_bytes());
        let h1 = u64::from_le_bytes(digest[0..8].try_into().unwrap_or_default());
        let h2 = u64::from_le_bytes(digest[8..16].try_into().unwrap_or_default());
        for i in 0..u64::from(self.hash_count) {
            let combined = h1.wrapping_add(i.wrapping_mul(h2));
            let index = combined % self.bit_count;
            let byte = (index / 8) as usize;
            let bit = index % 8;
            self.bitmap[byte] |= 1 << bit;
        }
    }

    pub fn build(self) -> BloomFilterPayload {
        let padding = (self.bitmap.len() as u64 * 8 - self.bit_count) as u32;
        BloomFilterPayload {
            bitmap: self.bitmap,
            padding,
            hash_count: self.hash_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_keys_are_contained() {
        let mut builder = BloomFilterBuilder::new(128, 7);
        builder.insert("projects/p/documents/cities/sf");
        builder.insert("projects/p/documents/cities/nyc");
        let filter = BloomFilter::from_payload(&builder.build()).unwrap();

        assert!(filter.might_contain("projects/p/documents/cities/sf"));
        assert!(filter.might_contain("projects/p/documents/cities/nyc"));
    }

    #[test]
    fn absent_key_is_usually_rejected() {
        let mut builder = BloomFilterBuilder::new(1024, 7);
        builder.insert("projects/p/documents/cities/sf");
        let filter = BloomFilter::from_payload(&builder.build()).unwrap();

        // With 1024 bits and a single entry the false positive rate is
        // negligible for a fixed probe.
        assert!(!filter.might_contain("projects/p/documents/cities/la"));
    }

    #[test]
    fn rejects_bad_parameters() {
        let payload = BloomFilterPayload {
            bitmap: vec![0xFF],
            padding: 8,
            hash_count: 7,
        };
        assert!(BloomFilter::from_payload(&payload).is_err());

        let payload = BloomFilterPayload {
            bitmap: vec![0xFF],
            padding: 0,
            hash_count: 0,
        };
        assert!(BloomFilter::from_payload(&payload).is_err());

        let payload = BloomFilterPayload {
            bitmap: vec![0xFF],
            padding: 0,
            hash_count: MAX_HASH_COUNT + 1,
        };
        assert!(BloomFilter::from_payload(&payload).is_err());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let payload = BloomFilterPayload {
            bitmap: Vec::new(),
            padding: 0,
            hash_count: 0,
        };
        let filter = BloomFilter::from_payload(&payload).unwrap();
        assert!(!filter.might_contain("projects/p/documents/cities/sf"));
    }
}
