//! Token-based routing: mapping a partition token to the server shard
//! that owns it, and choosing source ports which land a connection on
//! a desired shard.

mod sharding;

pub use sharding::{
    ConnectionShardingInfo, Shard, ShardAwarePortRange, ShardCount, ShardPortCalculator,
    ShardingInfo,
};

/// The partitioner hash of a partition key, deciding which shard of which
/// replica owns a row.
///
/// The server keeps `i64::MIN` out of its token ring and reserves it as an
/// "infinity" marker for range scans, so no row ever hashes to it.
/// `Token::new` maps that one value to `i64::MAX`; every other `i64` is
/// stored as-is.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub struct Token {
    value: i64,
}

impl Token {
    /// Wraps a raw hash value, replacing the reserved `i64::MIN`.
    #[inline]
    pub fn new(value: i64) -> Self {
        Self {
            value: if value == i64::MIN { i64::MAX } else { value },
        }
    }

    #[inline]
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl std::str::FromStr for Token {
    type Err = std::num::ParseIntError;
    #[inline]
    fn from_str(s: &str) -> Result<Token, std::num::ParseIntError> {
        Ok(Token::new(s.parse()?))
    }
}
