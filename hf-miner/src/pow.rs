//! Proof-of-work checks for nonces returned by the dies.
//!
//! Test jobs are random block headers. Each one is reduced to a [`HashJob`]
//! (midstate plus the header tail) for the hardware, and kept whole on the
//! host so a returned nonce can be rehashed and graded.

use bitcoin::hashes::{sha256, sha256d, Hash, HashEngine};
use rand::Rng;

use crate::asic::gn::HashJob;

/// Serialized block header size.
pub const HEADER_LEN: usize = 80;

/// Host-side description of the header a core is searching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestJob {
    pub version: u32,
    pub prev_block_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub timestamp: u32,
    pub bits: u32,
    pub starting_nonce: u32,
    pub nonce_loops: u32,
    pub ntime_loops: u16,
}

impl TestJob {
    /// A version 2 header with random hashes, timestamp and bits.
    pub fn random(rng: &mut impl Rng) -> Self {
        Self {
            version: 2,
            prev_block_hash: rng.gen(),
            merkle_root: rng.gen(),
            timestamp: rng.gen(),
            bits: rng.gen(),
            starting_nonce: 0,
            nonce_loops: 0,
            ntime_loops: 0,
        }
    }

    /// The 80-byte header with `nonce` in its last four bytes.
    pub fn header_bytes(&self, nonce: u32) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&self.version.to_le_bytes());
        header[4..36].copy_from_slice(&self.prev_block_hash);
        header[36..68].copy_from_slice(&self.merkle_root);
        header[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        header[72..76].copy_from_slice(&self.bits.to_le_bytes());
        header[76..80].copy_from_slice(&nonce.to_le_bytes());
        header
    }

    /// SHA-256 state after the first 64 header bytes, as eight
    /// little-endian words.
    pub fn midstate(&self) -> [u8; 32] {
        let header = self.header_bytes(0);
        let mut engine = sha256::HashEngine::default();
        engine.input(&header[..64]);

        let mut midstate = engine.midstate().to_byte_array();
        for word in midstate.chunks_exact_mut(4) {
            word.reverse();
        }
        midstate
    }

    /// Hardware form of this job, searching for `search_difficulty` zero bits.
    pub fn to_hash_job(&self, search_difficulty: u8) -> HashJob {
        let mut merkle_residual = [0u8; 4];
        merkle_residual.copy_from_slice(&self.merkle_root[28..32]);

        HashJob {
            midstate: self.midstate(),
            merkle_residual,
            timestamp: self.timestamp,
            bits: self.bits,
            starting_nonce: self.starting_nonce,
            nonce_loops: self.nonce_loops,
            ntime_loops: self.ntime_loops,
            search_difficulty,
            option: 0,
            group: 0,
            spare: [0; 3],
        }
    }
}

/// Double SHA-256 of a serialized header.
pub fn regen_hash(header: &[u8; HEADER_LEN]) -> [u8; 32] {
    sha256d::Hash::hash(header).to_byte_array()
}

/// Rehash `job` with `nonce`, returning the zero-bit count and the digest.
pub fn verify(job: &TestJob, nonce: u32) -> (u32, [u8; 32]) {
    verify_with(job, nonce, regen_hash)
}

/// As [`verify`], with a caller-supplied hash function.
pub fn verify_with<F>(job: &TestJob, nonce: u32, hash: F) -> (u32, [u8; 32])
where
    F: FnOnce(&[u8; HEADER_LEN]) -> [u8; 32],
{
    let digest = hash(&job.header_bytes(nonce));
    (count_leading_zero_bits(&digest), digest)
}

/// Leading zero bits of a digest read as a little-endian 256-bit integer.
///
/// Bytes are scanned from index 31 down; the count stops inside the first
/// nonzero byte. An all-zero digest counts 256.
pub fn count_leading_zero_bits(digest: &[u8; 32]) -> u32 {
    let mut zero_bits = 0;
    for &byte in digest.iter().rev() {
        zero_bits += byte.leading_zeros();
        if byte != 0 {
            break;
        }
    }
    zero_bits
}

/// Whether a zero-bit count meets a job's search difficulty.
pub fn is_good(zero_bits: u32, search_difficulty: u8) -> bool {
    zero_bits >= u32::from(search_difficulty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use test_case::test_case;

    fn hex32(s: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).unwrap();
        }
        out
    }

    fn genesis() -> TestJob {
        // Merkle root in display order; headers carry it reversed.
        let mut merkle_root =
            hex32("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b");
        merkle_root.reverse();

        TestJob {
            version: 1,
            prev_block_hash: [0; 32],
            merkle_root,
            timestamp: 1_231_006_505,
            bits: 0x1d00_ffff,
            starting_nonce: 0,
            nonce_loops: 0,
            ntime_loops: 0,
        }
    }

    const GENESIS_NONCE: u32 = 2_083_236_893;

    #[test]
    fn genesis_block_hash() {
        let (zero_bits, digest) = verify(&genesis(), GENESIS_NONCE);

        let mut expected =
            hex32("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f");
        expected.reverse();
        assert_eq!(digest, expected);
        assert_eq!(zero_bits, 43);
        assert!(is_good(zero_bits, 34));
        assert!(!is_good(zero_bits, 44));
    }

    #[test]
    fn wrong_nonce_is_not_good() {
        let (zero_bits, _) = verify(&genesis(), GENESIS_NONCE + 1);
        assert!(!is_good(zero_bits, 34));
    }

    #[test]
    fn header_layout() {
        let header = genesis().header_bytes(GENESIS_NONCE);
        assert_eq!(&header[0..4], &[0x01, 0x00, 0x00, 0x00]);
        assert_eq!(&header[4..36], &[0; 32]);
        assert_eq!(header[36], 0x3b);
        assert_eq!(&header[68..72], &1_231_006_505u32.to_le_bytes());
        assert_eq!(&header[72..76], &[0xff, 0xff, 0x00, 0x1d]);
        assert_eq!(&header[76..80], &GENESIS_NONCE.to_le_bytes());
    }

    #[test]
    fn verify_with_uses_supplied_hash() {
        let job = genesis();
        let (zero_bits, digest) = verify_with(&job, 7, |header| {
            assert_eq!(&header[76..80], &[7, 0, 0, 0]);
            let mut digest = [0u8; 32];
            digest[31] = 0x01;
            digest
        });
        assert_eq!(zero_bits, 7);
        assert_eq!(digest[31], 0x01);
    }

    #[test]
    fn genesis_midstate() {
        assert_eq!(
            genesis().midstate(),
            hex32("339a90bcf0bf58637daccc90a8ca591ee9d8c8c3c803014f3687b1961bf91947")
        );
    }

    #[test]
    fn hash_job_from_test_job() {
        let job = genesis();
        let hash_job = job.to_hash_job(34);

        assert_eq!(hash_job.midstate, job.midstate());
        assert_eq!(hash_job.merkle_residual, [0x4b, 0x1e, 0x5e, 0x4a]);
        assert_eq!(hash_job.timestamp, job.timestamp);
        assert_eq!(hash_job.bits, 0x1d00_ffff);
        assert_eq!(hash_job.search_difficulty, 34);
        assert_eq!(hash_job.starting_nonce, 0);
        assert_eq!(hash_job.nonce_loops, 0);
        assert_eq!(hash_job.ntime_loops, 0);
    }

    #[test]
    fn random_jobs_differ() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = TestJob::random(&mut rng);
        let b = TestJob::random(&mut rng);
        assert_eq!(a.version, 2);
        assert_eq!(a.starting_nonce, 0);
        assert_ne!(a, b);
    }

    fn digest_with(bytes: &[(usize, u8)]) -> [u8; 32] {
        let mut digest = [0u8; 32];
        for &(index, value) in bytes {
            digest[index] = value;
        }
        digest
    }

    #[test_case(&[], 256; "all_zero")]
    #[test_case(&[(31, 0x01)], 7; "top_byte_one")]
    #[test_case(&[(0, 0x01)], 255; "lowest_byte_one")]
    #[test_case(&[(31, 0x80)], 0; "top_bit_set")]
    #[test_case(&[(30, 0x0f)], 12; "second_byte")]
    #[test_case(&[(30, 0x0f), (0, 0xff)], 12; "stops_at_first_nonzero")]
    fn leading_zero_bits(bytes: &[(usize, u8)], expected: u32) {
        assert_eq!(count_leading_zero_bits(&digest_with(bytes)), expected);
    }
}
