use std::collections::{HashMap, HashSet};
use std::num::NonZeroU16;
use std::ops::RangeInclusive;
use std::sync::Mutex;

use rand::Rng as _;

use crate::errors::{InvalidShardAwarePortRange, ShardingError};

use super::Token;

pub type Shard = u32;
pub type ShardCount = NonZeroU16;

/// A range of local ports that can be used for shard-aware connections.
///
/// The range is inclusive and has to be a sub-range of [1024, 65535].
#[derive(Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub struct ShardAwarePortRange(RangeInclusive<u16>);

impl ShardAwarePortRange {
    /// The default shard-aware local port range - [49152, 65535].
    pub const EPHEMERAL_PORT_RANGE: Self = Self(49152..=65535);

    /// Creates a new `ShardAwarePortRange` with the given range.
    ///
    /// The error is returned in two cases:
    /// 1. Provided range is empty (`end` < `start`).
    /// 2. Provided range starts at a port lower than 1024. Ports 0-1023 are
    ///    reserved and should not be used by application.
    #[inline]
    pub fn new(range: impl Into<RangeInclusive<u16>>) -> Result<Self, InvalidShardAwarePortRange> {
        let range = range.into();
        if range.is_empty() || range.start() < &1024 {
            return Err(InvalidShardAwarePortRange);
        }
        Ok(Self(range))
    }

    fn start(&self) -> u16 {
        *self.0.start()
    }

    fn end(&self) -> u16 {
        *self.0.end()
    }
}

impl Default for ShardAwarePortRange {
    #[inline]
    fn default() -> Self {
        Self::EPHEMERAL_PORT_RANGE
    }
}

const PARTITIONER_ENTRY: &str = "SCYLLA_PARTITIONER";
const SHARD_ENTRY: &str = "SCYLLA_SHARD";
const NR_SHARDS_ENTRY: &str = "SCYLLA_NR_SHARDS";
const ALGORITHM_ENTRY: &str = "SCYLLA_SHARDING_ALGORITHM";
const MSB_IGNORE_ENTRY: &str = "SCYLLA_SHARDING_IGNORE_MSB";
const SHARD_AWARE_PORT_ENTRY: &str = "SCYLLA_SHARD_AWARE_PORT";
const SHARD_AWARE_PORT_SSL_ENTRY: &str = "SCYLLA_SHARD_AWARE_PORT_SSL";

const SUPPORTED_PARTITIONER: &str = "org.apache.cassandra.dht.Murmur3Partitioner";
const SUPPORTED_ALGORITHM: &str = "biased-token-round-robin";

/// A node's shard layout, learned from the SUPPORTED frame of any connection
/// to that node.
///
/// The descriptor is all-or-nothing: either every required parameter was
/// present and recognized, or the node is treated as having no shards at all.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct ShardingInfo {
    nr_shards: ShardCount,
    msb_ignore: u8,
    shard_aware_port: Option<u16>,
    shard_aware_port_ssl: Option<u16>,
}

/// [`ShardingInfo`] of a node together with the shard which the server chose
/// for the particular connection that carried the SUPPORTED frame.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct ConnectionShardingInfo {
    pub shard: u16,
    pub sharding_info: ShardingInfo,
}

impl ShardingInfo {
    pub fn new(
        nr_shards: ShardCount,
        msb_ignore: u8,
        shard_aware_port: Option<u16>,
        shard_aware_port_ssl: Option<u16>,
    ) -> Self {
        ShardingInfo {
            nr_shards,
            msb_ignore,
            shard_aware_port,
            shard_aware_port_ssl,
        }
    }

    #[inline]
    pub fn nr_shards(&self) -> ShardCount {
        self.nr_shards
    }

    #[inline]
    pub fn msb_ignore(&self) -> u8 {
        self.msb_ignore
    }

    #[inline]
    pub fn shard_aware_port(&self) -> Option<u16> {
        self.shard_aware_port
    }

    #[inline]
    pub fn shard_aware_port_ssl(&self) -> Option<u16> {
        self.shard_aware_port_ssl
    }

    /// True if the node advertises any port on which it routes incoming
    /// connections to `source_port % nr_shards`.
    #[inline]
    pub fn has_shard_aware_port(&self) -> bool {
        self.shard_aware_port.is_some() || self.shard_aware_port_ssl.is_some()
    }

    /// Computes the shard which owns the given token.
    ///
    /// This must stay bit-identical with the server's own calculation;
    /// any deviation sends requests to a shard which does not own the data.
    #[inline]
    pub fn shard_of(&self, token: Token) -> Shard {
        let mut biased_token = (token.value() as u64).wrapping_add(1u64 << 63);
        biased_token <<= self.msb_ignore;
        (((biased_token as u128) * (self.nr_shards.get() as u128)) >> 64) as Shard
    }

    /// If we connect using the node's shard-aware port, the server assigns
    /// a shard to the connection based on the source port. This calculates
    /// the assigned shard.
    #[inline]
    pub fn shard_of_source_port(&self, source_port: u16) -> Shard {
        (source_port % self.nr_shards.get()) as Shard
    }

    /// Extracts sharding parameters from the options sent in a SUPPORTED frame.
    ///
    /// Nothing here is fatal for the connection: on any error the caller logs
    /// and proceeds treating the node as un-sharded.
    pub(crate) fn parse_from_supported(
        options: &HashMap<String, Vec<String>>,
    ) -> Result<ConnectionShardingInfo, ShardingError> {
        let entries = [
            options.get(SHARD_ENTRY),
            options.get(NR_SHARDS_ENTRY),
            options.get(PARTITIONER_ENTRY),
            options.get(ALGORITHM_ENTRY),
            options.get(MSB_IGNORE_ENTRY),
        ];

        if entries.iter().all(Option::is_none) {
            // All parameters are missing - most likely a Cassandra cluster.
            return Err(ShardingError::NoShardInfo);
        }
        if entries.iter().any(Option::is_none) {
            return Err(ShardingError::MissingSomeShardInfoParameters);
        }

        // Every required parameter must carry exactly one value.
        let [Some(shard), Some(nr_shards), Some(partitioner), Some(algorithm), Some(msb_ignore)] =
            entries.map(|e| e.and_then(singleton))
        else {
            return Err(ShardingError::MissingShardInfoParameterValues);
        };

        if partitioner != SUPPORTED_PARTITIONER {
            return Err(ShardingError::UnsupportedPartitioner(
                partitioner.to_owned(),
            ));
        }
        if algorithm != SUPPORTED_ALGORITHM {
            return Err(ShardingError::UnsupportedShardingAlgorithm(
                algorithm.to_owned(),
            ));
        }

        let shard = u16::try_from(parse_int_prefix(shard))
            .map_err(|_| ShardingError::ShardInfoParameterOutOfRange(SHARD_ENTRY))?;
        let nr_shards = u16::try_from(parse_int_prefix(nr_shards))
            .ok()
            .and_then(ShardCount::new)
            .ok_or(ShardingError::ZeroShards)?;
        let msb_ignore = u8::try_from(parse_int_prefix(msb_ignore))
            .map_err(|_| ShardingError::ShardInfoParameterOutOfRange(MSB_IGNORE_ENTRY))?;

        // The ports are best-effort: their absence or malformation does not
        // invalidate the rest of the descriptor.
        let shard_aware_port = parse_optional_port(options, SHARD_AWARE_PORT_ENTRY);
        let shard_aware_port_ssl = parse_optional_port(options, SHARD_AWARE_PORT_SSL_ENTRY);

        Ok(ConnectionShardingInfo {
            shard,
            sharding_info: ShardingInfo::new(
                nr_shards,
                msb_ignore,
                shard_aware_port,
                shard_aware_port_ssl,
            ),
        })
    }
}

fn singleton(values: &Vec<String>) -> Option<&str> {
    match values.as_slice() {
        [single] => Some(single.as_str()),
        _ => None,
    }
}

fn parse_optional_port(options: &HashMap<String, Vec<String>>, key: &str) -> Option<u16> {
    let value = options.get(key).and_then(singleton)?;
    u16::try_from(parse_int_prefix(value))
        .ok()
        .filter(|port| *port != 0)
}

/// Parses the decimal prefix of a string the way C's `atoi` does: leading
/// whitespace is skipped, an optional `+`/`-` sign is consumed, and digits
/// are read until the first non-digit. A string without any digit prefix
/// parses to 0. Servers are known to emit such values with minor formatting
/// quirks, and rejecting them outright would disable shard awareness.
fn parse_int_prefix(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    let mut value: i64 = 0;
    for c in digits.chars() {
        let Some(digit) = c.to_digit(10) else { break };
        value = value.saturating_mul(10).saturating_add(digit as i64);
    }

    if negative { -value } else { value }
}

/// Chooses outgoing port numbers for connections targeted at a specific shard
/// through a shard-aware port. One instance is shared by all pools of
/// a cluster.
///
/// The calculator remembers which ports it has recently handed out, so that
/// concurrent connect attempts do not race for the same local port. It is NOT
/// guaranteed that a returned port is actually free - the bookkeeping only
/// saves us from self-inflicted bind collisions.
#[derive(Debug)]
pub struct ShardPortCalculator {
    port_range: ShardAwarePortRange,
    in_use: Mutex<HashSet<u16>>,
}

impl ShardPortCalculator {
    pub fn new(port_range: ShardAwarePortRange) -> Self {
        Self {
            port_range,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Picks a port `p` from the configured range such that
    /// `p % nr_shards == desired_shard` and `p` is not currently handed out.
    ///
    /// Returns `None` when no such port exists; the caller then binds to an
    /// OS-chosen ephemeral port and accepts whatever shard the server assigns.
    pub fn outgoing_port(&self, nr_shards: ShardCount, desired_shard: Shard) -> Option<u16> {
        assert!(desired_shard < nr_shards.get() as u32);
        let nr_shards = nr_shards.get() as u32;
        let (range_start, range_end) = (
            self.port_range.start() as u32,
            self.port_range.end() as u32,
        );

        // Smallest port in range which maps to the desired shard.
        let first_valid_port = range_start.div_ceil(nr_shards) * nr_shards + desired_shard;
        if first_valid_port > range_end {
            return None;
        }
        let candidates = (range_end - first_valid_port) / nr_shards + 1;

        // Start the scan at a random candidate so that independent pools
        // do not all contend for the bottom of the range.
        let start = rand::rng().random_range(0..candidates);

        let mut in_use = self.in_use.lock().unwrap();
        for i in 0..candidates {
            let candidate = first_valid_port + ((start + i) % candidates) * nr_shards;
            let port = candidate as u16;
            if in_use.insert(port) {
                return Some(port);
            }
        }
        None
    }

    /// Returns a port previously obtained from [`Self::outgoing_port`] to the
    /// free set. Called once the connect attempt using it has resolved,
    /// successfully or not.
    pub fn release_port(&self, port: u16) {
        self.in_use.lock().unwrap().remove(&port);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use crate::errors::ShardingError;
    use crate::utils::test_utils::setup_tracing;

    use super::{
        parse_int_prefix, ConnectionShardingInfo, Shard, ShardAwarePortRange, ShardCount,
        ShardPortCalculator, ShardingInfo, Token,
    };

    fn sharding_info(nr_shards: u16, msb_ignore: u8) -> ShardingInfo {
        ShardingInfo::new(ShardCount::new(nr_shards).unwrap(), msb_ignore, None, None)
    }

    // Independent rendition of the shard computation, splitting the biased
    // token into 32-bit halves the way the server's reference code does.
    fn shard_of_reference(token: i64, nr_shards: u16, msb_ignore: u8) -> u32 {
        let mut biased = (token as u64).wrapping_add(1u64 << 63);
        biased <<= msb_ignore;
        let lo = biased & 0xffff_ffff;
        let hi = biased >> 32;
        let mul1 = lo * nr_shards as u64;
        let mul2 = hi * nr_shards as u64;
        (((mul1 >> 32) + mul2) >> 32) as u32
    }

    #[test]
    fn test_shard_aware_port_range_constructor() {
        setup_tracing();

        let range = ShardAwarePortRange::new(49152..=65535).unwrap();
        assert_eq!(range, ShardAwarePortRange::EPHEMERAL_PORT_RANGE);

        #[allow(clippy::reversed_empty_ranges)]
        {
            assert!(ShardAwarePortRange::new(49152..=49151).is_err());
        }
        assert!(ShardAwarePortRange::new(0..=65535).is_err());
    }

    #[test]
    fn test_shard_of() {
        setup_tracing();
        /* Test values taken from the gocql driver. */
        let info = sharding_info(4, 12);
        assert_eq!(info.shard_of(Token::new(-9219783007514621794)), 3);
        assert_eq!(info.shard_of(Token::new(9222582454147032830)), 3);

        // Ignoring 12 most significant bits shifts the whole bias out of
        // token 0, which therefore lands on shard 0.
        assert_eq!(info.shard_of(Token::new(0)), 0);
    }

    #[test]
    fn test_shard_of_is_in_range_and_matches_reference() {
        setup_tracing();
        use rand::Rng as _;
        let mut rng = rand::rng();

        let boundary_tokens = [i64::MIN, -1, 0, 1, i64::MAX];

        for _ in 0..64 {
            let nr_shards = rng.random_range(1..=256u32) as u16;
            let msb_ignore = rng.random_range(0..=12u8);
            let info = sharding_info(nr_shards, msb_ignore);

            let tokens = boundary_tokens
                .into_iter()
                .chain((0..10_000).map(|_| rng.random::<i64>()));
            for raw in tokens {
                let token = Token::new(raw);
                let shard = info.shard_of(token);
                assert!(shard < nr_shards as u32);
                assert_eq!(
                    shard,
                    shard_of_reference(token.value(), nr_shards, msb_ignore),
                    "shard mismatch for token {} (nr_shards={}, msb_ignore={})",
                    token.value(),
                    nr_shards,
                    msb_ignore,
                );
            }
        }
    }

    #[test]
    fn test_parse_int_prefix_is_lenient() {
        setup_tracing();
        assert_eq!(parse_int_prefix("42"), 42);
        assert_eq!(parse_int_prefix("  42"), 42);
        assert_eq!(parse_int_prefix("+42"), 42);
        assert_eq!(parse_int_prefix("-42"), -42);
        assert_eq!(parse_int_prefix("42abc"), 42);
        assert_eq!(parse_int_prefix("19042\n"), 19042);
        assert_eq!(parse_int_prefix("abc"), 0);
        assert_eq!(parse_int_prefix(""), 0);
        assert_eq!(parse_int_prefix("+"), 0);
    }

    fn options_with(entries: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    fn full_options() -> HashMap<String, Vec<String>> {
        options_with(&[
            ("SCYLLA_SHARD", &["1"]),
            ("SCYLLA_NR_SHARDS", &["4"]),
            (
                "SCYLLA_PARTITIONER",
                &["org.apache.cassandra.dht.Murmur3Partitioner"],
            ),
            ("SCYLLA_SHARDING_ALGORITHM", &["biased-token-round-robin"]),
            ("SCYLLA_SHARDING_IGNORE_MSB", &["12"]),
            ("SCYLLA_SHARD_AWARE_PORT", &["19042"]),
        ])
    }

    #[test]
    fn test_parse_from_supported() {
        setup_tracing();

        let parsed = ShardingInfo::parse_from_supported(&full_options()).unwrap();
        assert_eq!(
            parsed,
            ConnectionShardingInfo {
                shard: 1,
                sharding_info: ShardingInfo::new(
                    ShardCount::new(4).unwrap(),
                    12,
                    Some(19042),
                    None
                ),
            }
        );

        // No sharding parameters at all - a Cassandra node.
        let err = ShardingInfo::parse_from_supported(&HashMap::new()).unwrap_err();
        assert!(matches!(err, ShardingError::NoShardInfo));

        // A parameter missing entirely.
        let mut options = full_options();
        options.remove("SCYLLA_SHARDING_IGNORE_MSB");
        let err = ShardingInfo::parse_from_supported(&options).unwrap_err();
        assert!(matches!(err, ShardingError::MissingSomeShardInfoParameters));

        // A parameter present but with no value.
        let mut options = full_options();
        options.insert("SCYLLA_NR_SHARDS".to_string(), Vec::new());
        let err = ShardingInfo::parse_from_supported(&options).unwrap_err();
        assert!(matches!(
            err,
            ShardingError::MissingShardInfoParameterValues
        ));

        // An unrecognized partitioner poisons the whole descriptor.
        let mut options = full_options();
        options.insert(
            "SCYLLA_PARTITIONER".to_string(),
            vec!["org.apache.cassandra.dht.RandomPartitioner".to_string()],
        );
        let err = ShardingInfo::parse_from_supported(&options).unwrap_err();
        assert!(matches!(err, ShardingError::UnsupportedPartitioner(_)));

        // So does an unrecognized algorithm.
        let mut options = full_options();
        options.insert(
            "SCYLLA_SHARDING_ALGORITHM".to_string(),
            vec!["round-robin".to_string()],
        );
        let err = ShardingInfo::parse_from_supported(&options).unwrap_err();
        assert!(matches!(
            err,
            ShardingError::UnsupportedShardingAlgorithm(_)
        ));

        // Zero shards (including garbage parsed to 0) is rejected.
        let mut options = full_options();
        options.insert("SCYLLA_NR_SHARDS".to_string(), vec!["bogus".to_string()]);
        let err = ShardingInfo::parse_from_supported(&options).unwrap_err();
        assert!(matches!(err, ShardingError::ZeroShards));

        // A malformed optional port is dropped without rejecting the rest.
        let mut options = full_options();
        options.insert(
            "SCYLLA_SHARD_AWARE_PORT".to_string(),
            vec!["nope".to_string()],
        );
        let parsed = ShardingInfo::parse_from_supported(&options).unwrap();
        assert_eq!(parsed.sharding_info.shard_aware_port(), None);
    }

    #[test]
    fn test_outgoing_port_congruence() {
        setup_tracing();

        for nr_shards in 1..=64u16 {
            let calculator =
                ShardPortCalculator::new(ShardAwarePortRange::EPHEMERAL_PORT_RANGE);
            let nr_shards = ShardCount::new(nr_shards).unwrap();
            for desired in 0..nr_shards.get() as Shard {
                let port = calculator.outgoing_port(nr_shards, desired).unwrap();
                assert!((49152..=65535).contains(&port));
                assert_eq!(port % nr_shards.get(), desired as u16);
            }
        }
    }

    #[test]
    fn test_outgoing_port_no_repeats_while_in_use() {
        setup_tracing();

        let calculator =
            ShardPortCalculator::new(ShardAwarePortRange::new(10000..=10099).unwrap());
        let nr_shards = ShardCount::new(8).unwrap();

        let mut seen = HashSet::new();
        while let Some(port) = calculator.outgoing_port(nr_shards, 3) {
            assert!(seen.insert(port), "port {port} handed out twice");
            assert_eq!(port % 8, 3);
            assert!((10000..10100).contains(&port));
        }
        // Every port congruent to 3 mod 8 in [10000, 10100) was handed
        // out exactly once, then the calculator reported exhaustion.
        let expected: HashSet<u16> = (10000..10100u16).filter(|p| p % 8 == 3).collect();
        assert_eq!(seen, expected);

        // Releasing a port makes it available again.
        calculator.release_port(10019);
        assert_eq!(calculator.outgoing_port(nr_shards, 3), Some(10019));
    }

    #[test]
    fn test_outgoing_port_empty_intersection() {
        setup_tracing();

        // A range narrower than the step leaves some shards without any
        // candidate port at all.
        let calculator =
            ShardPortCalculator::new(ShardAwarePortRange::new(65532..=65535).unwrap());
        let nr_shards = ShardCount::new(7).unwrap();
        let reachable: Vec<Shard> = (0..7)
            .filter(|&s| calculator.outgoing_port(nr_shards, s).is_some())
            .collect();
        // Exactly the residues of 65532..=65535 mod 7 are reachable.
        let expected: Vec<Shard> = (0..7)
            .filter(|&s| (65532..=65535u32).any(|p| p % 7 == s))
            .collect();
        assert_eq!(reachable, expected);
    }
}
