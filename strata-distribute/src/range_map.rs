//! An interval map over the keyspace that always tiles its domain: every key
//! maps to exactly one value, with uncovered keyspace mapping to `V::default()`.
//!
//! Modeled on the split-on-insert `KeyRangeMap` that the relocation queue
//! uses to track both queued relocations and in-flight move tasks. Insertion
//! never leaves gaps — the tail range always extends to "the end of the
//! keyspace" (`end: None`), so `range_containing` never returns `None`.

use std::collections::BTreeMap;

use crate::types::{Key, KeyRange};

/// Maps every key in the keyspace to a `V`, defaulting uncovered keyspace to
/// `V::default()`.
#[derive(Debug, Clone)]
pub struct RangeMap<V> {
    /// Keyed by range start; each entry's end is either the next entry's
    /// start or `None` for the final, unbounded tile.
    entries: BTreeMap<Key, (Option<Key>, V)>,
}

impl<V: Clone + Default> Default for RangeMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Default> RangeMap<V> {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(Vec::new(), (None, V::default()));
        Self { entries }
    }

    /// The single tile containing `key`.
    pub fn range_containing(&self, key: &[u8]) -> (KeyRange, &V) {
        let (start, (end, value)) = self
            .entries
            .range::<[u8], _>(..=key)
            .next_back()
            .expect("RangeMap always has a tile covering every key");
        (KeyRange::new(start.clone(), end.clone()), value)
    }

    /// Every tile that intersects `range`, in key order.
    pub fn intersecting_ranges(&self, range: &KeyRange) -> Vec<(KeyRange, &V)> {
        self.entries
            .iter()
            .map(|(s, (e, v))| (KeyRange::new(s.clone(), e.clone()), v))
            .filter(|(tile, _)| tile.intersects(range))
            .collect()
    }

    /// Every tile fully contained within `range`.
    pub fn contained_ranges(&self, range: &KeyRange) -> Vec<(KeyRange, &V)> {
        self.intersecting_ranges(range)
            .into_iter()
            .filter(|(tile, _)| range.contains_range(tile))
            .collect()
    }

    /// Computes the tiles that would need to change to insert `value` over
    /// `range`, without mutating the map. Each returned tile is the portion
    /// of an existing tile that survives outside `range` (retaining its old
    /// value) plus `range` itself mapped to the new value — exactly the set
    /// an in-flight task tracker needs in order to know which existing
    /// entries it must preserve versus overwrite.
    pub fn affected_ranges_after_insertion(&self, range: &KeyRange) -> Vec<KeyRange> {
        let mut out = Vec::new();
        for (tile, _) in self.intersecting_ranges(range) {
            if tile.start < range.start {
                out.push(KeyRange::new(tile.start.clone(), Some(range.start.clone())));
            }
            if let (Some(tile_end), Some(range_end)) = (&tile.end, &range.end) {
                if tile_end > range_end {
                    out.push(KeyRange::new(range_end.clone(), Some(tile_end.clone())));
                }
            } else if tile.end.is_none() && range.end.is_some() {
                out.push(KeyRange::new(range.end.clone().unwrap(), None));
            }
        }
        out.push(range.clone());
        out.sort_by(|a, b| a.start.cmp(&b.start));
        out
    }

    /// Inserts `value` over `range`, splitting any overlapping tiles so the
    /// portions outside `range` retain their previous values.
    pub fn insert(&mut self, range: &KeyRange, value: V) {
        if range.is_empty() {
            return;
        }
        let overlapping: Vec<(Key, Option<Key>, V)> = self
            .entries
            .range::<[u8], _>(..)
            .filter(|(s, (e, _))| {
                let tile = KeyRange::new((*s).clone(), e.clone());
                tile.intersects(range)
            })
            .map(|(s, (e, v))| (s.clone(), e.clone(), v.clone()))
            .collect();

        for (start, _, _) in &overlapping {
            self.entries.remove(start);
        }

        for (start, end, value) in overlapping {
            let tile = KeyRange::new(start.clone(), end.clone());
            if tile.start < range.start {
                self.entries
                    .insert(tile.start.clone(), (Some(range.start.clone()), value.clone()));
            }
            match (&tile.end, &range.end) {
                (Some(tile_end), Some(range_end)) if tile_end > range_end => {
                    self.entries.insert(range_end.clone(), (Some(tile_end.clone()), value));
                }
                (None, Some(range_end)) => {
                    self.entries.insert(range_end.clone(), (None, value));
                }
                _ => {}
            }
        }

        self.entries.insert(range.start.clone(), (range.end.clone(), value));
    }

    /// All tiles, in key order, including the unbounded tail.
    pub fn iter(&self) -> impl Iterator<Item = (KeyRange, &V)> {
        self.entries
            .iter()
            .map(|(s, (e, v))| (KeyRange::new(s.clone(), e.clone()), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        false // the sentinel tail tile always exists
    }

    /// Debug-only consistency check: tiles must tile the keyspace with no
    /// gaps or overlaps, and exactly one tile must be unbounded.
    pub fn validate(&self) -> Result<(), String> {
        let mut prev_end: Option<Key> = None;
        let mut unbounded_count = 0;
        for (start, (end, _)) in &self.entries {
            if let Some(pe) = &prev_end {
                if pe != start {
                    return Err(format!("gap or overlap between {:?} and {:?}", pe, start));
                }
            } else if !start.is_empty() {
                return Err(format!("first tile does not start at the empty key: {:?}", start));
            }
            match end {
                Some(e) => prev_end = Some(e.clone()),
                None => {
                    unbounded_count += 1;
                    prev_end = None;
                }
            }
        }
        if unbounded_count != 1 {
            return Err(format!("expected exactly one unbounded tile, found {unbounded_count}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: &[u8]) -> Key {
        b.to_vec()
    }

    fn range(s: &[u8], e: Option<&[u8]>) -> KeyRange {
        KeyRange::new(key(s), e.map(key))
    }

    #[test]
    fn new_map_covers_whole_keyspace_with_default() {
        let m: RangeMap<i32> = RangeMap::new();
        assert_eq!(*m.range_containing(b"anything").1, 0);
        m.validate().unwrap();
    }

    #[test]
    fn exact_range_reinsert_replaces_single_tile() {
        let mut m: RangeMap<i32> = RangeMap::new();
        m.insert(&range(b"a", Some(b"z")), 1);
        m.validate().unwrap();
        m.insert(&range(b"a", Some(b"z")), 2);
        m.validate().unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(*m.range_containing(b"m").1, 2);
    }

    #[test]
    fn strictly_interior_insert_splits_surrounding_tile() {
        let mut m: RangeMap<i32> = RangeMap::new();
        m.insert(&range(b"c", Some(b"k")), 9);
        m.validate().unwrap();
        assert_eq!(*m.range_containing(b"a").1, 0);
        assert_eq!(*m.range_containing(b"e").1, 9);
        assert_eq!(*m.range_containing(b"z").1, 0);
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn insert_spanning_many_small_ranges_absorbs_them_all() {
        let mut m: RangeMap<i32> = RangeMap::new();
        m.insert(&range(b"a", Some(b"b")), 1);
        m.insert(&range(b"b", Some(b"c")), 2);
        m.insert(&range(b"c", Some(b"d")), 3);
        m.validate().unwrap();
        assert_eq!(m.len(), 4);

        m.insert(&range(b"a", Some(b"d")), 99);
        m.validate().unwrap();
        assert_eq!(*m.range_containing(b"a").1, 99);
        assert_eq!(*m.range_containing(b"b").1, 99);
        assert_eq!(*m.range_containing(b"c").1, 99);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn insert_over_unbounded_tail_preserves_remainder_as_new_tail() {
        let mut m: RangeMap<i32> = RangeMap::new();
        m.insert(&range(b"m", Some(b"p")), 7);
        m.validate().unwrap();
        assert!(m.range_containing(b"z").1 == &0);
        assert!(matches!(m.range_containing(b"z").0.end, None));
    }

    #[test]
    fn affected_ranges_after_insertion_does_not_mutate() {
        let mut m: RangeMap<i32> = RangeMap::new();
        m.insert(&range(b"a", Some(b"z")), 1);
        let before = m.len();
        let affected = m.affected_ranges_after_insertion(&range(b"c", Some(b"d")));
        assert_eq!(m.len(), before);
        assert_eq!(affected.len(), 3); // [a,c) old, [c,d) new, [d,z) old
    }

    #[test]
    fn intersecting_ranges_excludes_merely_adjacent_tiles() {
        let mut m: RangeMap<i32> = RangeMap::new();
        m.insert(&range(b"a", Some(b"m")), 1);
        m.insert(&range(b"m", Some(b"z")), 2);
        let hits = m.intersecting_ranges(&range(b"a", Some(b"m")));
        assert_eq!(hits.len(), 1);
    }
}
