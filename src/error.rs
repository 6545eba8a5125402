//! Error types.

use std::io;

use thiserror::Error;

/// Result type alias for fallible transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Invalid configuration. Fatal before any connection opens.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("fec redundancy {0} outside [0.05, 0.20]")]
    RedundancyOutOfRange(f64),

    #[error("unknown congestion control algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("unknown network profile: {0}")]
    UnknownProfile(String),

    #[error("invalid fec group size {0}")]
    InvalidGroupSize(u32),

    #[error("group of {k} data and {r} redundancy packets exceeds 256 blocks")]
    TooManyBlocks { k: u32, r: u32 },

    #[error("{name} = {value} is not a probability")]
    InvalidProbability { name: &'static str, value: f64 },

    #[error("loss ({loss}) + duplication ({dup}) probabilities exceed 1")]
    ProbabilitySumExceeded { loss: f64, dup: f64 },

    #[error("invalid {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// A datagram the decoder could not accept. Counted and dropped, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated packet: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("missing redundancy marker")]
    BadMarker,

    #[error("invalid group shape: k={k}, r={r}")]
    InvalidGroupShape { k: u8, r: u8 },

    #[error("parity index {index} out of range for r={r}")]
    ParityIndexOutOfRange { index: u8, r: u8 },

    #[error("data index {index} out of range for k={k}")]
    DataIndexOutOfRange { index: u16, k: u16 },

    #[error("length mismatch: expected {expected} bytes, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("redundancy header for group {group_id} disagrees with an earlier one")]
    InconsistentGroup { group_id: u64 },
}
