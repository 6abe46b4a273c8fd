//! Sharding key domains. Each sharding type carries one comparator, one
//! bound codec, and an upper-bound walker; HASH additionally wraps around
//! the 16-byte md5 ring.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::Error;
use crate::sql::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardingType {
    Range,
    Hash,
    RangeString,
    RangeDatetime,
}

impl ShardingType {
    pub fn parse(s: &str) -> Result<Self, Error> {
        use ShardingType::*;
        match s.to_ascii_uppercase().as_str() {
            "RANGE" => Ok(Range),
            "HASH" => Ok(Hash),
            "RANGE_STRING" => Ok(RangeString),
            "RANGE_DATETIME" => Ok(RangeDatetime),
            other => Err(Error::InvalidType(other.into())),
        }
    }

    /// Map a user key into the type's comparable domain. For HASH the
    /// comparable is the md5 of the key, for RANGE* the parsed key itself.
    pub fn key_bound(&self, key: &str) -> Result<Bound, Error> {
        match self {
            ShardingType::Hash => Ok(Bound::Hash(md5_bytes(key))),
            _ => self.parse_bound(key),
        }
    }

    /// Parse a caller-supplied lower bound or split value. HASH bounds are
    /// never supplied by callers.
    pub fn parse_bound(&self, raw: &str) -> Result<Bound, Error> {
        match self {
            ShardingType::Range => raw
                .trim()
                .parse::<i64>()
                .map(Bound::Int)
                .map_err(|_| Error::InvalidLowerBound(raw.into())),
            ShardingType::RangeString => {
                if raw.is_empty() || !raw.chars().all(|c| !c.is_control()) {
                    Err(Error::InvalidLowerBound(raw.into()))
                } else {
                    Ok(Bound::Str(raw.into()))
                }
            }
            ShardingType::RangeDatetime => parse_datetime(raw)
                .map(Bound::DateTime)
                .ok_or_else(|| Error::InvalidLowerBound(raw.into())),
            ShardingType::Hash => Err(Error::LowerBoundAutoGenerated),
        }
    }

    /// The lower bound a HASH shard gets at creation: the md5 of the
    /// hosting group's id.
    pub fn hashed_bound(&self, seed: &str) -> Bound {
        Bound::Hash(md5_bytes(seed))
    }

    pub fn is_hash(&self) -> bool {
        matches!(self, ShardingType::Hash)
    }
}

impl std::fmt::Display for ShardingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ShardingType::*;
        match self {
            Range => write!(f, "RANGE"),
            Hash => write!(f, "HASH"),
            RangeString => write!(f, "RANGE_STRING"),
            RangeDatetime => write!(f, "RANGE_DATETIME"),
        }
    }
}

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

pub fn md5_bytes(key: &str) -> [u8; 16] {
    md5::compute(key.as_bytes()).0
}

/// A shard boundary in one type's domain. Entries of one mapping always
/// hold the same variant, so the derived ordering compares within the
/// variant's own comparator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bound {
    Int(i64),
    Str(String),
    DateTime(NaiveDateTime),
    Hash([u8; 16]),
}

impl Bound {
    /// Storage encoding: md5 bytes for HASH, canonical text otherwise.
    pub fn encode(&self) -> Value {
        match self {
            Bound::Int(i) => Value::Text(i.to_string()),
            Bound::Str(s) => Value::Text(s.clone()),
            Bound::DateTime(dt) => Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            Bound::Hash(h) => Value::Bytes(h.to_vec()),
        }
    }

    pub fn decode(kind: ShardingType, value: &Value) -> Result<Self, Error> {
        match kind {
            ShardingType::Hash => {
                let bytes = value
                    .as_bytes()
                    .ok_or_else(|| Error::InvalidLowerBound(value.to_string()))?;
                let hash: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| Error::InvalidLowerBound(value.to_string()))?;
                Ok(Bound::Hash(hash))
            }
            _ => {
                let text = value
                    .as_str()
                    .ok_or_else(|| Error::InvalidLowerBound(value.to_string()))?;
                kind.parse_bound(text)
            }
        }
    }

    /// Midpoint between two bounds of the same type, used by split. On the
    /// HASH ring the distance wraps when `self` is the last shard.
    pub fn midpoint(&self, upper: &Bound) -> Option<Bound> {
        match (self, upper) {
            (Bound::Hash(lower), Bound::Hash(upper)) => {
                let lower = u128::from_be_bytes(*lower);
                let upper = u128::from_be_bytes(*upper);
                let distance = upper.wrapping_sub(lower);
                if distance < 2 {
                    return None;
                }
                let mid = lower.wrapping_add(distance / 2);
                Some(Bound::Hash(mid.to_be_bytes()))
            }
            (Bound::Int(lower), Bound::Int(upper)) if upper > lower => {
                Some(Bound::Int(lower + (upper - lower) / 2))
            }
            _ => None,
        }
    }

    /// The value used in prune DELETE statements on backends.
    pub fn sql_param(&self) -> Value {
        self.encode()
    }
}

impl std::fmt::Display for Bound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bound::Int(i) => write!(f, "{}", i),
            Bound::Str(s) => write!(f, "{}", s),
            Bound::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            Bound::Hash(h) => {
                for byte in h {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_bounds() {
        assert_eq!(
            ShardingType::Range.parse_bound("42").unwrap(),
            Bound::Int(42)
        );
        assert!(ShardingType::Range.parse_bound("x").is_err());
        assert!(ShardingType::Hash.parse_bound("1").is_err());
        assert!(matches!(
            ShardingType::RangeDatetime
                .parse_bound("2024-05-01 10:00:00")
                .unwrap(),
            Bound::DateTime(_)
        ));
        assert!(matches!(
            ShardingType::RangeDatetime.parse_bound("2024-05-01").unwrap(),
            Bound::DateTime(_)
        ));
    }

    #[test]
    fn test_ordering_within_type() {
        assert!(Bound::Int(1) < Bound::Int(100));
        assert!(Bound::Str("a".into()) < Bound::Str("b".into()));
        let a = ShardingType::Hash.hashed_bound("group-a");
        let b = ShardingType::Hash.hashed_bound("group-b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_encode_round_trip() {
        for (kind, bound) in [
            (ShardingType::Range, Bound::Int(-7)),
            (ShardingType::RangeString, Bound::Str("pq".into())),
            (ShardingType::Hash, Bound::Hash(md5_bytes("g1"))),
        ] {
            let encoded = bound.encode();
            assert_eq!(Bound::decode(kind, &encoded).unwrap(), bound);
        }
    }

    #[test]
    fn test_hash_midpoint_wraps() {
        let low = Bound::Hash([0xff; 16]);
        let high = Bound::Hash([0x01; 16]);
        // Wrapping distance is small but positive; midpoint lands past 0xff...
        let mid = low.midpoint(&high).unwrap();
        if let Bound::Hash(bytes) = mid {
            let value = u128::from_be_bytes(bytes);
            let lower = u128::from_be_bytes([0xff; 16]);
            assert!(value > lower || value < u128::from_be_bytes([0x01; 16]));
        } else {
            unreachable!();
        }
    }

    #[test]
    fn test_int_midpoint() {
        assert_eq!(
            Bound::Int(1).midpoint(&Bound::Int(101)).unwrap(),
            Bound::Int(51)
        );
        assert!(Bound::Int(5).midpoint(&Bound::Int(5)).is_none());
    }
}
