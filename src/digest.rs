//! Streaming hash computation.
//!
//! Dispatches on the receipt's algorithm name and produces lowercase hex
//! digests. Reads are chunked so arbitrarily large artifacts can be hashed
//! without buffering them in memory.

use sha2::{Digest, Sha256, Sha512};
use std::io::Read;

/// Chunk size for streamed reads.
pub const CHUNK_SIZE: usize = 65536;

/// The algorithm name is not one this build can compute.
#[derive(Debug, thiserror::Error)]
#[error("unsupported hash algorithm: {algo}")]
pub struct UnsupportedAlgorithm {
    /// The algorithm name that was requested.
    pub algo: String,
}

/// A running digest for one of the supported algorithms.
///
/// # Examples
///
/// ```
/// use seampack::digest::Hasher;
///
/// let mut hasher = Hasher::new("sha256").unwrap();
/// hasher.update(b"chunk1");
/// let hex = hasher.finish();
/// assert_eq!(hex.len(), 64);
/// assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
/// ```
#[derive(Debug, Clone)]
pub enum Hasher {
    /// SHA-256 state.
    Sha256(Sha256),
    /// SHA-512 state.
    Sha512(Sha512),
}

impl Hasher {
    /// Create a hasher for the named algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`UnsupportedAlgorithm`] when `algo` is not `sha256` or
    /// `sha512`.
    pub fn new(algo: &str) -> Result<Self, UnsupportedAlgorithm> {
        match algo {
            "sha256" => Ok(Self::Sha256(Sha256::new())),
            "sha512" => Ok(Self::Sha512(Sha512::new())),
            other => Err(UnsupportedAlgorithm {
                algo: other.to_owned(),
            }),
        }
    }

    /// Feed bytes into the digest.
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(state) => state.update(bytes),
            Self::Sha512(state) => state.update(bytes),
        }
    }

    /// Consume the hasher and return the lowercase hex digest.
    #[must_use]
    pub fn finish(self) -> String {
        match self {
            Self::Sha256(state) => format!("{:x}", state.finalize()),
            Self::Sha512(state) => format!("{:x}", state.finalize()),
        }
    }
}

/// Hash everything from `reader`, returning the byte count consumed.
///
/// # Errors
///
/// Returns any I/O error from the underlying reader.
pub fn hash_reader(reader: &mut dyn Read, hasher: &mut Hasher) -> std::io::Result<u64> {
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn sha256_digest_matches_known_vector() {
        let mut hasher = Hasher::new("sha256").expect("sha256 is supported");
        hasher.update(b"chunk1");
        assert_eq!(
            hasher.finish(),
            "412cb322137d81a561102174568c4f9c84e5db95f51dcc3e298078e0ece8c774"
        );
    }

    #[rstest]
    #[case::sha256("sha256", 64)]
    #[case::sha512("sha512", 128)]
    fn digest_length_matches_algorithm(#[case] algo: &str, #[case] hex_len: usize) {
        let hasher = Hasher::new(algo).expect("supported algorithm");
        assert_eq!(hasher.finish().len(), hex_len);
    }

    #[test]
    fn unknown_algorithm_is_rejected_by_name() {
        let err = Hasher::new("md5").expect_err("md5 is not supported");
        assert!(err.to_string().contains("md5"));
    }

    #[test]
    fn hash_reader_consumes_whole_stream() {
        let data = vec![0xabu8; CHUNK_SIZE + 17];
        let mut hasher = Hasher::new("sha256").expect("sha256 is supported");
        let total =
            hash_reader(&mut data.as_slice(), &mut hasher).expect("in-memory read cannot fail");
        assert_eq!(total, data.len() as u64);

        let mut whole = Hasher::new("sha256").expect("sha256 is supported");
        whole.update(&data);
        assert_eq!(hasher.finish(), whole.finish());
    }
}
