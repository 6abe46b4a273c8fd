//! In-memory shard index operations over one mapping's range entries.
//! Bounds are unique within a mapping, so max/min selections are stable.

use super::key::{Bound, ShardingType};
use super::RangeEntry;

/// Find the entry responsible for a key already mapped into the comparable
/// domain. RANGE* picks the largest lower bound <= key; HASH wraps to the
/// largest lower bound when the key hashes below every bound.
pub fn locate<'a>(
    kind: ShardingType,
    entries: &'a [RangeEntry],
    key: &Bound,
) -> Option<&'a RangeEntry> {
    let below = entries
        .iter()
        .filter(|e| e.lower_bound <= *key)
        .max_by(|a, b| a.lower_bound.cmp(&b.lower_bound));

    match below {
        Some(entry) => Some(entry),
        None if kind.is_hash() => entries.iter().max_by(|a, b| a.lower_bound.cmp(&b.lower_bound)),
        None => None,
    }
}

/// The next lower bound after `lower`, i.e. the exclusive upper bound of
/// the shard that starts at `lower`. None when `lower` is the last bound.
pub fn upper_bound_of<'a>(entries: &'a [RangeEntry], lower: &Bound) -> Option<&'a Bound> {
    entries
        .iter()
        .filter(|e| e.lower_bound > *lower)
        .min_by(|a, b| a.lower_bound.cmp(&b.lower_bound))
        .map(|e| &e.lower_bound)
}

/// The half-open window a shard is responsible for, used to delete
/// out-of-range rows during prune.
#[derive(Debug, Clone, PartialEq)]
pub struct PruneWindow {
    pub lower: Bound,
    /// None: the window is unbounded above (last RANGE shard).
    pub upper: Option<Bound>,
    /// The window wraps through zero on the HASH ring: rows to keep
    /// satisfy key >= lower OR key < upper.
    pub wrap: bool,
}

/// Compute the prune window of the shard whose entry is `entry`. Returns
/// None when the shard owns the entire domain and nothing can be pruned
/// (a HASH mapping with a single shard).
pub fn prune_window(
    kind: ShardingType,
    entries: &[RangeEntry],
    entry: &RangeEntry,
) -> Option<PruneWindow> {
    match upper_bound_of(entries, &entry.lower_bound) {
        Some(upper) => Some(PruneWindow {
            lower: entry.lower_bound.clone(),
            upper: Some(upper.clone()),
            wrap: false,
        }),
        None if kind.is_hash() => {
            // Last shard on the ring wraps to the smallest bound.
            let first = entries
                .iter()
                .min_by(|a, b| a.lower_bound.cmp(&b.lower_bound))?;
            if first.lower_bound == entry.lower_bound {
                // Only shard in the mapping.
                return None;
            }
            Some(PruneWindow {
                lower: entry.lower_bound.clone(),
                upper: Some(first.lower_bound.clone()),
                wrap: true,
            })
        }
        None => Some(PruneWindow {
            lower: entry.lower_bound.clone(),
            upper: None,
            wrap: false,
        }),
    }
}

impl PruneWindow {
    /// A key (already mapped into the comparable domain) the shard is
    /// responsible for.
    pub fn contains(&self, key: &Bound) -> bool {
        match (&self.upper, self.wrap) {
            (Some(upper), false) => *key >= self.lower && key < upper,
            (Some(upper), true) => *key >= self.lower || key < upper,
            (None, _) => *key >= self.lower,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sharding::key::md5_bytes;

    fn range_entries() -> Vec<RangeEntry> {
        [1, 101, 1001, 10001]
            .into_iter()
            .enumerate()
            .map(|(i, lb)| RangeEntry {
                mapping_id: 1,
                lower_bound: Bound::Int(lb),
                shard_id: i as u64 + 1,
            })
            .collect()
    }

    #[test]
    fn test_range_lookup_boundaries() {
        let entries = range_entries();
        let locate = |k: i64| {
            super::locate(ShardingType::Range, &entries, &Bound::Int(k)).map(|e| e.shard_id)
        };

        assert_eq!(locate(1), Some(1));
        assert_eq!(locate(100), Some(1));
        assert_eq!(locate(101), Some(2));
        assert_eq!(locate(10_000), Some(3));
        assert_eq!(locate(999_999), Some(4));
        assert_eq!(locate(0), None);
    }

    #[test]
    fn test_lookup_idempotent() {
        let entries = range_entries();
        let a = super::locate(ShardingType::Range, &entries, &Bound::Int(500)).unwrap();
        let b = super::locate(ShardingType::Range, &entries, &Bound::Int(500)).unwrap();
        assert_eq!(a.shard_id, b.shard_id);
    }

    #[test]
    fn test_hash_wraps() {
        let groups = ["g1", "g2", "g3"];
        let entries: Vec<_> = groups
            .iter()
            .enumerate()
            .map(|(i, g)| RangeEntry {
                mapping_id: 1,
                lower_bound: Bound::Hash(md5_bytes(g)),
                shard_id: i as u64 + 1,
            })
            .collect();

        let max = entries
            .iter()
            .max_by(|a, b| a.lower_bound.cmp(&b.lower_bound))
            .unwrap();

        // A key below every bound lands on the largest bound.
        let low = Bound::Hash([0u8; 16]);
        assert_eq!(
            super::locate(ShardingType::Hash, &entries, &low).unwrap().shard_id,
            max.shard_id
        );

        // Insertion order does not matter.
        let mut reversed = entries.clone();
        reversed.reverse();
        assert_eq!(
            super::locate(ShardingType::Hash, &reversed, &low).unwrap().shard_id,
            max.shard_id
        );
    }

    #[test]
    fn test_prune_windows() {
        let entries = range_entries();

        let first = prune_window(ShardingType::Range, &entries, &entries[0]).unwrap();
        assert_eq!(first.upper, Some(Bound::Int(101)));
        assert!(!first.wrap);
        assert!(first.contains(&Bound::Int(50)));
        assert!(!first.contains(&Bound::Int(101)));

        let last = prune_window(ShardingType::Range, &entries, &entries[3]).unwrap();
        assert_eq!(last.upper, None);
        assert!(last.contains(&Bound::Int(1_000_000)));
    }

    #[test]
    fn test_hash_prune_wraps() {
        let entries: Vec<_> = ["g1", "g2", "g3"]
            .iter()
            .enumerate()
            .map(|(i, g)| RangeEntry {
                mapping_id: 1,
                lower_bound: Bound::Hash(md5_bytes(g)),
                shard_id: i as u64 + 1,
            })
            .collect();

        let max = entries
            .iter()
            .max_by(|a, b| a.lower_bound.cmp(&b.lower_bound))
            .unwrap();
        let min = entries
            .iter()
            .min_by(|a, b| a.lower_bound.cmp(&b.lower_bound))
            .unwrap();

        let window = prune_window(ShardingType::Hash, &entries, max).unwrap();
        assert!(window.wrap);
        assert_eq!(window.upper.as_ref(), Some(&min.lower_bound));
        // Wrapped window keeps keys above the max bound and below the min.
        assert!(window.contains(&Bound::Hash([0xff; 16])));
        assert!(window.contains(&Bound::Hash([0u8; 16])));

        // Single-shard mapping owns the whole ring.
        let single = vec![entries[0].clone()];
        assert!(prune_window(ShardingType::Hash, &single, &single[0]).is_none());
    }
}
