//! Probabilistic pre-filter for RPI store lookups.
//!
//! Matching a batch of diagnosis keys expands into tens of thousands of
//! candidate RPIs, almost none of which were ever observed. The query
//! filter is a bloom filter seeded from every RPI currently persisted;
//! consulting it before the store turns the overwhelmingly common miss
//! into a couple of in-memory bit probes.
//!
//! The contract is the usual bloom guarantee: no false negatives, a
//! false-positive rate governed by the buffer size and hash count. The
//! hash family folds the two 64-bit halves of the RPI with a per-filter
//! random salt, so filter contents reveal nothing useful about stored
//! RPIs outside this process. Salts live for the filter's lifetime only
//! and must never be persisted.

use rand::RngCore;
use thiserror::Error;

use crate::crypto::RPI_LEN;

/// Errors produced when constructing a query filter.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FilterError {
    /// Buffer size or hash count was zero.
    #[error("invalid filter parameters: buffer_size={buffer_size}, hash_count={hash_count}")]
    InvalidParameters {
        /// Requested bitmap size in bytes.
        buffer_size: usize,
        /// Requested number of hashes per RPI.
        hash_count: usize,
    },
}

/// Bloom filter over 128-bit Rolling Proximity Identifiers.
pub struct QueryFilter {
    bits: Vec<u8>,
    salts: Vec<u64>,
}

impl QueryFilter {
    /// Creates an empty filter with a `buffer_size * 8`-bit bitmap and
    /// `hash_count` salted hash functions.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidParameters`] if either parameter is
    /// zero.
    pub fn new(buffer_size: usize, hash_count: usize) -> Result<Self, FilterError> {
        if buffer_size == 0 || hash_count == 0 {
            return Err(FilterError::InvalidParameters {
                buffer_size,
                hash_count,
            });
        }
        let mut rng = rand::thread_rng();
        let salts = (0..hash_count).map(|_| rng.next_u64()).collect();
        Ok(Self {
            bits: vec![0u8; buffer_size],
            salts,
        })
    }

    /// Size of the underlying bitmap in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.bits.len()
    }

    /// Number of bits set per inserted RPI.
    #[must_use]
    pub fn hash_count(&self) -> usize {
        self.salts.len()
    }

    fn bit_index(&self, rpi: &[u8; RPI_LEN], salt: u64) -> usize {
        let lo = u64::from_le_bytes(rpi[..8].try_into().unwrap_or_default());
        let hi = u64::from_le_bytes(rpi[8..].try_into().unwrap_or_default());
        let total_bits = (self.bits.len() * 8) as u64;
        #[allow(clippy::cast_possible_truncation)]
        let index = ((lo ^ hi ^ salt) % total_bits) as usize;
        index
    }

    /// Records a stored RPI in the filter.
    pub fn insert(&mut self, rpi: &[u8; RPI_LEN]) {
        for i in 0..self.salts.len() {
            let bit = self.bit_index(rpi, self.salts[i]);
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// Returns true if `rpi` may have been inserted.
    ///
    /// A `false` answer is definitive; a `true` answer may be a false
    /// positive.
    #[must_use]
    pub fn maybe_present(&self, rpi: &[u8; RPI_LEN]) -> bool {
        self.salts.iter().all(|&salt| {
            let bit = self.bit_index(rpi, salt);
            self.bits[bit / 8] & (1 << (bit % 8)) != 0
        })
    }

    /// Returns true if `rpi` is definitely absent from the backing store
    /// and the lookup can be skipped.
    #[must_use]
    pub fn should_ignore(&self, rpi: &[u8; RPI_LEN]) -> bool {
        !self.maybe_present(rpi)
    }
}

impl std::fmt::Debug for QueryFilter {
    // Salts stay out of Debug output; they are process-local secrets.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryFilter")
            .field("buffer_size", &self.bits.len())
            .field("hash_count", &self.salts.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{batch_rpi, RPI_LEN};

    fn rpis(count: usize) -> Vec<[u8; RPI_LEN]> {
        let batch = batch_rpi(&[7u8; 16], 1000).unwrap();
        batch
            .chunks_exact(RPI_LEN)
            .take(count)
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    #[test]
    fn test_rejects_zero_parameters() {
        assert!(matches!(
            QueryFilter::new(0, 3),
            Err(FilterError::InvalidParameters { .. })
        ));
        assert!(QueryFilter::new(1024, 0).is_err());
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = QueryFilter::new(4096, 4).unwrap();
        let inserted = rpis(144);
        for rpi in &inserted {
            filter.insert(rpi);
        }
        for rpi in &inserted {
            assert!(filter.maybe_present(rpi));
            assert!(!filter.should_ignore(rpi));
        }
    }

    #[test]
    fn test_culls_most_absent_rpis() {
        let mut filter = QueryFilter::new(64 * 1024, 4).unwrap();
        for rpi in rpis(144) {
            filter.insert(&rpi);
        }
        let absent = batch_rpi(&[9u8; 16], 500_000).unwrap();
        let passed = absent
            .chunks_exact(RPI_LEN)
            .filter(|c| filter.maybe_present(&(*c).try_into().unwrap()))
            .count();
        // 144 entries in a 512 Kbit bitmap: false positives should be rare.
        assert!(passed < 8, "{passed} of 144 absent RPIs passed the filter");
    }

    #[test]
    fn test_empty_filter_ignores_everything() {
        let filter = QueryFilter::new(256, 3).unwrap();
        for rpi in rpis(16) {
            assert!(filter.should_ignore(&rpi));
        }
    }
}
