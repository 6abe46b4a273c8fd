//! MySQL GTID sets: `uuid:1-5:7,uuid:1-3`. Interval lists are kept merged
//! and sorted, so containment and diff counting are linear scans.

use std::collections::BTreeMap;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("malformed gtid interval: {0}")]
    Interval(String),

    #[error("malformed source id: {0}")]
    SourceId(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    // Source uuid -> sorted, non-overlapping, inclusive intervals.
    sets: BTreeMap<Uuid, Vec<(u64, u64)>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a GTID set as reported by `@@GLOBAL.gtid_executed` or
    /// `SHOW SLAVE STATUS`. Whitespace and empty segments are tolerated.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let mut set = GtidSet::new();

        for part in raw.split(',') {
            let part = part.trim().trim_matches(|c| c == '\n' || c == '\r');
            if part.is_empty() {
                continue;
            }

            let mut pieces = part.split(':');
            let source = pieces
                .next()
                .ok_or_else(|| ParseError::SourceId(part.into()))?;
            let source =
                Uuid::parse_str(source.trim()).map_err(|_| ParseError::SourceId(source.into()))?;

            let mut any = false;
            for interval in pieces {
                any = true;
                let (start, end) = match interval.split_once('-') {
                    Some((start, end)) => {
                        let start = start
                            .trim()
                            .parse::<u64>()
                            .map_err(|_| ParseError::Interval(interval.into()))?;
                        let end = end
                            .trim()
                            .parse::<u64>()
                            .map_err(|_| ParseError::Interval(interval.into()))?;
                        (start, end)
                    }
                    None => {
                        let single = interval
                            .trim()
                            .parse::<u64>()
                            .map_err(|_| ParseError::Interval(interval.into()))?;
                        (single, single)
                    }
                };

                if start == 0 || end < start {
                    return Err(ParseError::Interval(interval.into()));
                }

                set.add_interval(source, start, end);
            }

            if !any {
                return Err(ParseError::Interval(part.into()));
            }
        }

        Ok(set)
    }

    /// Record transactions [start, end] from `source`, merging adjacent
    /// and overlapping intervals.
    pub fn add_interval(&mut self, source: Uuid, start: u64, end: u64) {
        let intervals = self.sets.entry(source).or_default();
        intervals.push((start, end));
        intervals.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
        for &(start, end) in intervals.iter() {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => {
                    last.1 = last.1.max(end);
                }
                _ => merged.push((start, end)),
            }
        }
        *intervals = merged;
    }

    /// Record a single transaction; used when simulating a master
    /// committing a write.
    pub fn add(&mut self, source: Uuid, transaction: u64) {
        self.add_interval(source, transaction, transaction);
    }

    /// Next unused transaction number for a source.
    pub fn next_transaction(&self, source: &Uuid) -> u64 {
        self.sets
            .get(source)
            .and_then(|intervals| intervals.last())
            .map(|(_, end)| end + 1)
            .unwrap_or(1)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Total number of transactions in the set.
    pub fn count(&self) -> u64 {
        self.sets
            .values()
            .flatten()
            .map(|(start, end)| end - start + 1)
            .sum()
    }

    /// Every transaction of `other` is contained in `self`.
    pub fn contains(&self, other: &GtidSet) -> bool {
        other.sets.iter().all(|(source, intervals)| {
            let ours = match self.sets.get(source) {
                Some(ours) => ours,
                None => return intervals.is_empty(),
            };
            intervals.iter().all(|&(start, end)| {
                ours.iter().any(|&(s, e)| s <= start && end <= e)
            })
        })
    }

    /// Absorb every transaction of `other`.
    pub fn merge(&mut self, other: &GtidSet) {
        for (source, intervals) in &other.sets {
            for &(start, end) in intervals {
                self.add_interval(*source, start, end);
            }
        }
    }

    /// Number of transactions present in `self` but missing from `other`.
    /// `diff(master, slave)` is how far the slave is behind.
    pub fn diff(&self, other: &GtidSet) -> u64 {
        let mut behind = 0;

        for (source, intervals) in &self.sets {
            let theirs = other.sets.get(source).map(Vec::as_slice).unwrap_or(&[]);
            for &(start, end) in intervals {
                let mut missing = end - start + 1;
                for &(s, e) in theirs {
                    let overlap_start = s.max(start);
                    let overlap_end = e.min(end);
                    if overlap_start <= overlap_end {
                        missing -= overlap_end - overlap_start + 1;
                    }
                }
                behind += missing;
            }
        }

        behind
    }
}

impl std::fmt::Display for GtidSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (source, intervals) in &self.sets {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", source)?;
            for (start, end) in intervals {
                if start == end {
                    write!(f, ":{}", start)?;
                } else {
                    write!(f, ":{}-{}", start, end)?;
                }
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for GtidSet {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GtidSet::parse(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn test_parse_and_display() {
        let raw = format!("{}:1-5:7,{}:3", uuid(1), uuid(2));
        let set = GtidSet::parse(&raw).unwrap();
        assert_eq!(set.to_string(), raw);
        assert_eq!(set.count(), 6);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(GtidSet::parse("not-a-uuid:1-5").is_err());
        assert!(GtidSet::parse(&format!("{}:5-1", uuid(1))).is_err());
        assert!(GtidSet::parse(&format!("{}", uuid(1))).is_err());
        assert!(GtidSet::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_merge_adjacent_intervals() {
        let mut set = GtidSet::new();
        set.add_interval(uuid(1), 1, 3);
        set.add_interval(uuid(1), 4, 6);
        set.add_interval(uuid(1), 10, 12);
        assert_eq!(set.to_string(), format!("{}:1-6:10-12", uuid(1)));
    }

    #[test]
    fn test_contains() {
        let big = GtidSet::parse(&format!("{}:1-10", uuid(1))).unwrap();
        let small = GtidSet::parse(&format!("{}:2-5", uuid(1))).unwrap();
        assert!(big.contains(&small));
        assert!(!small.contains(&big));
        assert!(big.contains(&GtidSet::new()));
    }

    #[test]
    fn test_diff_counts_missing() {
        let master = GtidSet::parse(&format!("{}:1-10", uuid(1))).unwrap();
        let slave = GtidSet::parse(&format!("{}:1-5", uuid(1))).unwrap();
        assert_eq!(master.diff(&slave), 5);
        assert_eq!(slave.diff(&master), 0);

        let other_source = GtidSet::parse(&format!("{}:1-4", uuid(2))).unwrap();
        assert_eq!(master.diff(&other_source), 10);
    }

    #[test]
    fn test_next_transaction() {
        let mut set = GtidSet::new();
        assert_eq!(set.next_transaction(&uuid(1)), 1);
        set.add(uuid(1), 1);
        set.add(uuid(1), 2);
        assert_eq!(set.next_transaction(&uuid(1)), 3);
    }
}
