use rustc_hash::FxHashMap;

use crate::api::registry::IdRegistry;
use crate::dialect::{MavMessage, MessageDescriptor};

/// A sparse table keyed by numeric message ID. Used both as a routing table
///  (ID to handler) and as a metrics table (ID to counter).
///
/// An absent slot is distinguishable from a present-but-default one, which the
///  `or_else` combinator relies on.
#[derive(Debug, Clone)]
pub struct IdIndexed<T> {
    index: FxHashMap<u32, T>,
}

impl<T> IdIndexed<T> {
    pub fn new() -> IdIndexed<T> {
        IdIndexed {
            index: FxHashMap::default(),
        }
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.index.get(&id)
    }

    pub fn get_or<'a>(&'a self, id: u32, fallback: &'a T) -> &'a T {
        self.index.get(&id).unwrap_or(fallback)
    }

    pub fn get_or_insert_with(&mut self, id: u32, fallback: impl FnOnce() -> T) -> &mut T {
        self.index.entry(id).or_insert_with(fallback)
    }

    pub fn insert(&mut self, id: u32, value: T) -> Option<T> {
        self.index.insert(id, value)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.index.remove(&id)
    }

    pub fn get_of<M: MavMessage>(&self) -> Option<&T> {
        self.get(M::ID)
    }

    pub fn insert_of<M: MavMessage>(&mut self, value: T) -> Option<T> {
        self.insert(M::ID, value)
    }

    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.index.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.index.iter().map(|(id, value)| (*id, value))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// the catalog descriptor behind a slot's ID, if the ID is known
    pub fn descriptor(&self, id: u32) -> Option<&'static MessageDescriptor> {
        IdRegistry::global().by_id(id)
    }
}

impl<T: Clone> IdIndexed<T> {
    /// Per-ID union of two tables: slots present on both sides go through
    ///  `combine`, slots present on one side are carried over unchanged.
    pub fn merge(&self, other: &IdIndexed<T>, combine: impl Fn(&T, &T) -> T) -> IdIndexed<T> {
        let mut merged = self.clone();
        for (id, right) in other.iter() {
            let value = match merged.index.get(&id) {
                Some(left) => combine(left, right),
                None => right.clone(),
            };
            merged.index.insert(id, value);
        }
        merged
    }
}

impl<T> Default for IdIndexed<T> {
    fn default() -> Self {
        IdIndexed::new()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::dialect::Heartbeat;

    use super::*;

    #[test]
    fn test_absent_vs_present_default() {
        let mut table: IdIndexed<u64> = IdIndexed::new();
        assert_eq!(table.get(0), None);

        table.insert(0, 0);
        assert_eq!(table.get(0), Some(&0));
        assert_eq!(table.get(1), None);
    }

    #[test]
    fn test_get_or_insert_with() {
        let mut table: IdIndexed<u64> = IdIndexed::new();
        *table.get_or_insert_with(5, || 10) += 1;
        *table.get_or_insert_with(5, || 10) += 1;
        assert_eq!(table.get(5), Some(&12));
    }

    #[test]
    fn test_typed_accessors() {
        let mut table: IdIndexed<&str> = IdIndexed::new();
        table.insert_of::<Heartbeat>("hb");
        assert_eq!(table.get_of::<Heartbeat>(), Some(&"hb"));
        assert_eq!(table.get(Heartbeat::ID), Some(&"hb"));
    }

    #[rstest]
    #[case::disjoint(vec![(1, 1)], vec![(2, 10)], vec![(1, 1), (2, 10)])]
    #[case::overlap(vec![(1, 1), (2, 2)], vec![(2, 10)], vec![(1, 1), (2, 12)])]
    #[case::empty_left(vec![], vec![(7, 7)], vec![(7, 7)])]
    fn test_merge(
        #[case] left: Vec<(u32, u64)>,
        #[case] right: Vec<(u32, u64)>,
        #[case] expected: Vec<(u32, u64)>,
    ) {
        let mut l = IdIndexed::new();
        for (id, v) in left { l.insert(id, v); }
        let mut r = IdIndexed::new();
        for (id, v) in right { r.insert(id, v); }

        let merged = l.merge(&r, |a, b| a + b);

        let mut actual: Vec<_> = merged.iter().map(|(id, v)| (id, *v)).collect();
        actual.sort();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_descriptor_lookup() {
        let table: IdIndexed<u64> = IdIndexed::new();
        assert_eq!(table.descriptor(0).unwrap().crc_extra, 50);
        assert!(table.descriptor(9999).is_none());
    }
}
