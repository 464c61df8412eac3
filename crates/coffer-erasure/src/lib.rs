//! Coffer Erasure - Reed-Solomon encoder/decoder
//!
//! Splits a block of data into `k` equal-sized data shards plus `m` parity
//! shards; any `k` of the `k + m` shards reconstruct the block. The object
//! layer stores one shard per disk per block.

use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

/// Errors specific to erasure coding operations.
#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("shard size mismatch")]
    ShardSizeMismatch,
}

/// Reed-Solomon codec over a fixed data/parity split.
pub struct ErasureCodec {
    data_shards: usize,
    parity_shards: usize,
    rs: ReedSolomon,
}

impl ErasureCodec {
    /// Create a new codec with `data_shards` + `parity_shards` total shards.
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, ErasureError> {
        if data_shards == 0 {
            return Err(ErasureError::InvalidConfig("data_shards must be > 0".into()));
        }
        if parity_shards == 0 {
            return Err(ErasureError::InvalidConfig(
                "parity_shards must be > 0".into(),
            ));
        }
        let rs = ReedSolomon::new(data_shards, parity_shards)
            .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            data_shards,
            parity_shards,
            rs,
        })
    }

    #[must_use]
    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    #[must_use]
    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    #[must_use]
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Size of each shard produced for a block of `block_len` bytes.
    #[must_use]
    pub fn shard_size(&self, block_len: usize) -> usize {
        block_len.div_ceil(self.data_shards)
    }

    /// Encode a non-empty block into `k + m` equal-sized shards. The tail of
    /// the last data shard is zero-padded.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
        if data.is_empty() {
            return Err(ErasureError::EncodingFailed("empty input block".into()));
        }
        let shard_size = self.shard_size(data.len());
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.total_shards());
        for i in 0..self.data_shards {
            let start = i * shard_size;
            let end = ((i + 1) * shard_size).min(data.len());
            let mut shard = if start < data.len() {
                data[start..end].to_vec()
            } else {
                Vec::new()
            };
            shard.resize(shard_size, 0);
            shards.push(shard);
        }
        for _ in 0..self.parity_shards {
            shards.push(vec![0u8; shard_size]);
        }
        self.rs
            .encode(&mut shards)
            .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
        Ok(shards)
    }

    /// Decode a block of `original_size` bytes from its shards; `None` marks
    /// a missing shard. At least `k` shards must be present.
    pub fn decode(
        &self,
        shards: &mut [Option<Vec<u8>>],
        original_size: usize,
    ) -> Result<Vec<u8>, ErasureError> {
        if shards.len() != self.total_shards() {
            return Err(ErasureError::ShardSizeMismatch);
        }
        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data_shards {
            return Err(ErasureError::InsufficientShards {
                available,
                required: self.data_shards,
            });
        }

        if shards[..self.data_shards].iter().any(Option::is_none) {
            self.rs
                .reconstruct_data(shards)
                .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
        }

        let mut out = Vec::with_capacity(original_size);
        for shard in shards.iter().take(self.data_shards) {
            match shard {
                Some(data) => out.extend_from_slice(data),
                None => return Err(ErasureError::DecodingFailed("data shard missing".into())),
            }
        }
        out.truncate(original_size);
        Ok(out)
    }

    /// Re-check parity consistency of a full shard set.
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool, ErasureError> {
        if shards.len() != self.total_shards() {
            return Ok(false);
        }
        if let Some(first) = shards.first().map(Vec::len) {
            if !shards.iter().all(|s| s.len() == first) {
                return Ok(false);
            }
        }
        self.rs
            .verify(shards)
            .map_err(|e| ErasureError::EncodingFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_all_present() {
        let codec = ErasureCodec::new(4, 2).unwrap();
        let data = b"Hello, World! This is a test of erasure coding.";

        let shards = codec.encode(data).unwrap();
        assert_eq!(shards.len(), 6);
        let shard_size = shards[0].len();
        assert!(shards.iter().all(|s| s.len() == shard_size));

        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        let decoded = codec.decode(&mut opts, data.len()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn decode_with_missing_shards() {
        let codec = ErasureCodec::new(4, 2).unwrap();
        let data = b"Hello, World! This is a test of erasure coding with recovery.";

        let shards = codec.encode(data).unwrap();
        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        opts[1] = None; // one data shard
        opts[4] = None; // one parity shard

        let decoded = codec.decode(&mut opts, data.len()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn insufficient_shards() {
        let codec = ErasureCodec::new(4, 2).unwrap();
        let data = vec![7u8; 256];
        let shards = codec.encode(&data).unwrap();
        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        opts[0] = None;
        opts[1] = None;
        opts[4] = None;

        match codec.decode(&mut opts, data.len()) {
            Err(ErasureError::InsufficientShards {
                available,
                required,
            }) => {
                assert_eq!(available, 3);
                assert_eq!(required, 4);
            }
            other => panic!("expected InsufficientShards, got {other:?}"),
        }
    }

    #[test]
    fn verify_detects_corruption() {
        let codec = ErasureCodec::new(4, 2).unwrap();
        let data = b"Data to verify with erasure coding.";

        let shards = codec.encode(data).unwrap();
        assert!(codec.verify(&shards).unwrap());

        let mut corrupted = shards.clone();
        corrupted[0][0] ^= 0xFF;
        assert!(!codec.verify(&corrupted).unwrap());
    }

    #[test]
    fn uneven_block_sizes() {
        let codec = ErasureCodec::new(3, 3).unwrap();
        for len in [1usize, 2, 3, 10, 100, 1021] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let shards = codec.encode(&data).unwrap();
            assert_eq!(shards[0].len(), codec.shard_size(len));
            let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
            opts[0] = None;
            opts[3] = None;
            opts[5] = None;
            let decoded = codec.decode(&mut opts, len).unwrap();
            assert_eq!(decoded, data);
        }
    }

    #[test]
    fn rejects_bad_config() {
        assert!(ErasureCodec::new(0, 2).is_err());
        assert!(ErasureCodec::new(4, 0).is_err());
    }
}
