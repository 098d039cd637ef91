//! The ordered tree container and its iterators.
//!
//! Non-frozen iterators never hold a position into the tree: every
//! advance is a fresh bound search from the remembered last-returned key,
//! so concurrent mutation can neither skip nor repeat elements. Freezing
//! materializes the remaining visible sequence, fixing it against all
//! later mutation.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use kestrel_common::error::IndexError;

use crate::key_def::{FieldValue, KeyDef};
use crate::tuple::Tuple;

type TreeKey = Vec<FieldValue>;
type TreeMap = BTreeMap<TreeKey, Tuple>;

/// Iterator types, in wire-code order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorType {
    Eq = 0,
    Req = 1,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
}

impl IteratorType {
    pub fn from_code(code: u32) -> Option<IteratorType> {
        match code {
            0 => Some(IteratorType::Eq),
            1 => Some(IteratorType::Req),
            2 => Some(IteratorType::All),
            3 => Some(IteratorType::Lt),
            4 => Some(IteratorType::Le),
            5 => Some(IteratorType::Ge),
            6 => Some(IteratorType::Gt),
            _ => None,
        }
    }

    pub fn is_reverse(&self) -> bool {
        matches!(self, IteratorType::Req | IteratorType::Lt | IteratorType::Le)
    }
}

/// Duplicate handling mode for `TreeIndex::insert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupPolicy {
    /// Fail if an entry with the same key exists (INSERT).
    InsertOnly,
    /// Fail unless an entry with the same key exists (UPDATE path).
    ReplaceOnly,
    /// Displace any existing entry (REPLACE).
    ReplaceOrInsert,
}

/// An ordered index over tuples, keyed by a comparator definition.
pub struct TreeIndex {
    space_name: String,
    name: String,
    key_def: KeyDef,
    cmp_def: KeyDef,
    unique: bool,
    inner: Arc<RwLock<TreeMap>>,
    version: Arc<AtomicU64>,
    build_buf: Mutex<Option<Vec<Tuple>>>,
}

impl TreeIndex {
    /// Create an index. Non-unique definitions require the primary key
    /// definition so the comparator can be extended to a total order.
    pub fn new(
        space_name: impl Into<String>,
        name: impl Into<String>,
        key_def: KeyDef,
        primary_def: Option<&KeyDef>,
    ) -> TreeIndex {
        let cmp_def = if key_def.unique {
            key_def.clone()
        } else {
            let primary = primary_def.expect("non-unique index requires a primary key def");
            key_def.merge(primary)
        };
        TreeIndex {
            space_name: space_name.into(),
            name: name.into(),
            unique: key_def.unique,
            key_def,
            cmp_def,
            inner: Arc::new(RwLock::new(TreeMap::new())),
            version: Arc::new(AtomicU64::new(0)),
            build_buf: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_def(&self) -> &KeyDef {
        &self.key_def
    }

    pub fn cmp_def(&self) -> &KeyDef {
        &self.cmp_def
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Mutation counter; bumped on every successful change.
    pub fn version(&self) -> u64 {
        self.version.load(AtomicOrdering::Relaxed)
    }

    fn duplicate_error(&self) -> IndexError {
        IndexError::Duplicate {
            space: self.space_name.clone(),
            index: self.name.clone(),
        }
    }

    /// Insert a tuple, optimistically, then validate against `policy`.
    /// On a policy violation the optimistic insert is undone (any displaced
    /// entry is reinstated) before the error surfaces, so no partial state
    /// is ever visible. Returns the displaced tuple, if any.
    pub fn insert(&self, tuple: &Tuple, policy: DupPolicy) -> Result<Option<Tuple>, IndexError> {
        let key = self.cmp_def.extract_key(tuple)?;
        let mut map = self.inner.write();
        let old = map.insert(key.clone(), tuple.clone());
        match (policy, old) {
            (DupPolicy::InsertOnly, Some(prev)) => {
                map.insert(key, prev);
                Err(self.duplicate_error())
            }
            (DupPolicy::ReplaceOnly, None) => {
                map.remove(&key);
                Err(IndexError::NotFound)
            }
            (_, old) => {
                self.version.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(old)
            }
        }
    }

    /// Remove the entry holding this tuple's key. Returns the removed
    /// tuple, if the key was present.
    pub fn remove_tuple(&self, tuple: &Tuple) -> Result<Option<Tuple>, IndexError> {
        let key = self.cmp_def.extract_key(tuple)?;
        let mut map = self.inner.write();
        let removed = map.remove(&key);
        if removed.is_some() {
            self.version.fetch_add(1, AtomicOrdering::Relaxed);
        }
        Ok(removed)
    }

    /// Exact-match lookup. Only defined for unique indexes, with a full key.
    pub fn find(&self, key: &[FieldValue]) -> Result<Option<Tuple>, IndexError> {
        if !self.unique {
            return Err(IndexError::NonUniqueFind);
        }
        if key.len() != self.cmp_def.part_count() {
            return Err(IndexError::MissingField {
                have: key.len(),
                need: self.cmp_def.part_count(),
            });
        }
        Ok(self.inner.read().get(key).cloned())
    }

    /// Remove by full key (unique indexes). Returns the removed tuple.
    pub fn take_by_key(&self, key: &[FieldValue]) -> Result<Option<Tuple>, IndexError> {
        if !self.unique {
            return Err(IndexError::NonUniqueFind);
        }
        if key.len() != self.cmp_def.part_count() {
            return Err(IndexError::MissingField {
                have: key.len(),
                need: self.cmp_def.part_count(),
            });
        }
        let removed = self.inner.write().remove(key);
        if removed.is_some() {
            self.version.fetch_add(1, AtomicOrdering::Relaxed);
        }
        Ok(removed)
    }

    /// Open an iterator. An empty key downgrades Eq-family types to the
    /// corresponding open range over the whole index (deliberate policy,
    /// not an error).
    pub fn iterate(&self, itype: IteratorType, key: Vec<FieldValue>) -> TreeIterator {
        let itype = if key.is_empty() {
            if itype.is_reverse() {
                IteratorType::Le
            } else {
                IteratorType::All
            }
        } else {
            itype
        };
        TreeIterator {
            inner: Arc::clone(&self.inner),
            itype,
            key,
            last_key: None,
            done: false,
            frozen: None,
        }
    }

    // ── Bulk build ───────────────────────────────────────────────────────

    /// Start a bulk build; tuples go to a growable buffer until
    /// `build_end` sorts and loads them in one pass.
    pub fn build_begin(&self) {
        *self.build_buf.lock() = Some(Vec::new());
    }

    pub fn build_add(&self, tuple: Tuple) -> Result<(), IndexError> {
        self.cmp_def.validate_tuple(&tuple)?;
        self.build_buf
            .lock()
            .get_or_insert_with(Vec::new)
            .push(tuple);
        Ok(())
    }

    /// Sort the collected tuples with the index comparator and bulk-load
    /// the tree. A duplicate pair aborts the build and leaves the index
    /// empty; the caller discards the index and the space is unaffected.
    pub fn build_end(&self) -> Result<(), IndexError> {
        let tuples = self.build_buf.lock().take().unwrap_or_default();
        let mut keyed: Vec<(TreeKey, Tuple)> = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            keyed.push((self.cmp_def.extract_key(&tuple)?, tuple));
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        for pair in keyed.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(self.duplicate_error());
            }
        }
        let mut map = TreeMap::new();
        map.extend(keyed);
        *self.inner.write() = map;
        self.version.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }
}

fn prefix_matches(full: &[FieldValue], prefix: &[FieldValue]) -> bool {
    full.len() >= prefix.len() && full[..prefix.len()] == prefix[..]
}

/// A cursor over a `TreeIndex`.
pub struct TreeIterator {
    inner: Arc<RwLock<TreeMap>>,
    itype: IteratorType,
    key: TreeKey,
    last_key: Option<TreeKey>,
    done: bool,
    frozen: Option<VecDeque<(TreeKey, Tuple)>>,
}

impl TreeIterator {
    /// Advance and return the next visible tuple.
    pub fn next(&mut self) -> Option<Tuple> {
        if self.done {
            return None;
        }
        if let Some(view) = &mut self.frozen {
            return match view.pop_front() {
                Some((key, tuple)) => {
                    self.last_key = Some(key);
                    Some(tuple)
                }
                None => {
                    self.done = true;
                    None
                }
            };
        }
        let map = self.inner.read();
        match self.seek(&map, self.last_key.as_ref()) {
            Some((key, tuple)) => {
                self.last_key = Some(key);
                Some(tuple)
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Convert into a read view: the remaining visible sequence is fixed
    /// now and immune to later mutation.
    pub fn freeze(&mut self) {
        if self.frozen.is_some() || self.done {
            return;
        }
        let map = self.inner.read();
        let mut view = VecDeque::new();
        let mut from = self.last_key.clone();
        while let Some((key, tuple)) = self.seek(&map, from.as_ref()) {
            from = Some(key.clone());
            view.push_back((key, tuple));
        }
        self.frozen = Some(view);
    }

    /// Drop the read view and continue live from the last returned
    /// position.
    pub fn unfreeze(&mut self) {
        self.frozen = None;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    /// One bound search: either the start position or the successor of
    /// `from`, direction and prefix filtering per the iterator type.
    fn seek(&self, map: &TreeMap, from: Option<&TreeKey>) -> Option<(TreeKey, Tuple)> {
        let candidate = if self.itype.is_reverse() {
            match from {
                Some(last) => map
                    .range::<TreeKey, _>((Bound::Unbounded, Bound::Excluded(last)))
                    .next_back(),
                None => self.reverse_start(map),
            }
        } else {
            match from {
                Some(last) => map
                    .range::<TreeKey, _>((Bound::Excluded(last), Bound::Unbounded))
                    .next(),
                None => self.forward_start(map),
            }
        };
        let candidate = match self.itype {
            IteratorType::Eq | IteratorType::Req => {
                candidate.filter(|(k, _)| prefix_matches(k, &self.key))
            }
            _ => candidate,
        };
        candidate.map(|(k, t)| (k.clone(), t.clone()))
    }

    fn forward_start<'a>(&self, map: &'a TreeMap) -> Option<(&'a TreeKey, &'a Tuple)> {
        match self.itype {
            IteratorType::Eq | IteratorType::Ge | IteratorType::All => {
                map.range(self.key.clone()..).next()
            }
            // First entry past the whole prefix-equal region.
            IteratorType::Gt => map
                .range(self.key.clone()..)
                .find(|(k, _)| !prefix_matches(k, &self.key)),
            _ => None,
        }
    }

    fn reverse_start<'a>(&self, map: &'a TreeMap) -> Option<(&'a TreeKey, &'a Tuple)> {
        match self.itype {
            IteratorType::Req | IteratorType::Le => {
                // Last entry at or before the prefix-equal region.
                match map
                    .range(self.key.clone()..)
                    .find(|(k, _)| !prefix_matches(k, &self.key))
                {
                    Some((end, _)) => map.range::<TreeKey, _>(..end).next_back(),
                    None => map.iter().next_back(),
                }
            }
            IteratorType::Lt => match map.range(self.key.clone()..).next() {
                Some((end, _)) => map.range::<TreeKey, _>(..end).next_back(),
                None => map.iter().next_back(),
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_def::{FieldType, KeyPart};
    use rmpv::Value;

    fn unsigned_index(unique: bool) -> TreeIndex {
        let def = KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)], unique);
        if unique {
            TreeIndex::new("test", "primary", def, None)
        } else {
            let primary = KeyDef::new(vec![KeyPart::new(1, FieldType::Unsigned)], true);
            TreeIndex::new("test", "secondary", def, Some(&primary))
        }
    }

    fn tup(k: u64) -> Tuple {
        Tuple::new(vec![Value::from(k), Value::from(k * 100)])
    }

    fn key(k: u64) -> Vec<FieldValue> {
        vec![FieldValue::Unsigned(k)]
    }

    fn collect(mut it: TreeIterator) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(t) = it.next() {
            out.push(t.field(0).unwrap().as_u64().unwrap());
        }
        out
    }

    #[test]
    fn insert_find_delete() {
        let idx = unsigned_index(true);
        idx.insert(&tup(5), DupPolicy::InsertOnly).unwrap();
        idx.insert(&tup(3), DupPolicy::InsertOnly).unwrap();
        assert_eq!(idx.len(), 2);
        let found = idx.find(&key(5)).unwrap().unwrap();
        assert_eq!(found, tup(5));
        assert!(idx.find(&key(9)).unwrap().is_none());
        assert_eq!(idx.take_by_key(&key(3)).unwrap(), Some(tup(3)));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn duplicate_insert_is_undone() {
        let idx = unsigned_index(true);
        idx.insert(&tup(5), DupPolicy::InsertOnly).unwrap();
        let other = Tuple::new(vec![Value::from(5u64), Value::from("other")]);
        let err = idx.insert(&other, DupPolicy::InsertOnly).unwrap_err();
        assert!(matches!(err, IndexError::Duplicate { .. }));
        // The original tuple must still be in place, not the rejected one.
        assert_eq!(idx.find(&key(5)).unwrap().unwrap(), tup(5));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn replace_only_requires_existing() {
        let idx = unsigned_index(true);
        let err = idx.insert(&tup(5), DupPolicy::ReplaceOnly).unwrap_err();
        assert!(matches!(err, IndexError::NotFound));
        assert!(idx.is_empty());

        idx.insert(&tup(5), DupPolicy::InsertOnly).unwrap();
        let newer = Tuple::new(vec![Value::from(5u64), Value::from("v2")]);
        let old = idx.insert(&newer, DupPolicy::ReplaceOnly).unwrap();
        assert_eq!(old, Some(tup(5)));
        assert_eq!(idx.find(&key(5)).unwrap().unwrap(), newer);
    }

    #[test]
    fn iteration_is_strictly_ascending() {
        let idx = unsigned_index(true);
        for k in [9u64, 2, 7, 4, 1, 8, 3] {
            idx.insert(&tup(k), DupPolicy::InsertOnly).unwrap();
        }
        idx.take_by_key(&key(4)).unwrap();
        let keys = collect(idx.iterate(IteratorType::All, vec![]));
        assert_eq!(keys, vec![1, 2, 3, 7, 8, 9]);
        let ge = collect(idx.iterate(IteratorType::Ge, key(3)));
        assert_eq!(ge, vec![3, 7, 8, 9]);
    }

    #[test]
    fn eq_with_empty_key_downgrades_to_ge() {
        let idx = unsigned_index(true);
        for k in 1..=3u64 {
            idx.insert(&tup(k), DupPolicy::InsertOnly).unwrap();
        }
        let eq_all = collect(idx.iterate(IteratorType::Eq, vec![]));
        let ge_all = collect(idx.iterate(IteratorType::Ge, vec![]));
        assert_eq!(eq_all, ge_all);
        assert_eq!(eq_all, vec![1, 2, 3]);

        let req_all = collect(idx.iterate(IteratorType::Req, vec![]));
        assert_eq!(req_all, vec![3, 2, 1]);
    }

    #[test]
    fn eq_with_unmatched_key_is_empty() {
        let idx = unsigned_index(true);
        idx.insert(&tup(1), DupPolicy::InsertOnly).unwrap();
        let mut it = idx.iterate(IteratorType::Eq, key(9));
        assert!(it.next().is_none());
    }

    #[test]
    fn reverse_iterators() {
        let idx = unsigned_index(true);
        for k in [1u64, 3, 5, 7] {
            idx.insert(&tup(k), DupPolicy::InsertOnly).unwrap();
        }
        assert_eq!(collect(idx.iterate(IteratorType::Le, key(5))), vec![5, 3, 1]);
        assert_eq!(collect(idx.iterate(IteratorType::Lt, key(5))), vec![3, 1]);
        assert_eq!(collect(idx.iterate(IteratorType::Gt, key(5))), vec![7]);
        assert_eq!(collect(idx.iterate(IteratorType::Le, key(4))), vec![3, 1]);
        assert_eq!(collect(idx.iterate(IteratorType::Ge, key(8))), Vec::<u64>::new());
    }

    #[test]
    fn non_unique_secondary_orders_by_primary_extension() {
        let idx = unsigned_index(false);
        // Same secondary key 7, different primary keys in field 1.
        let a = Tuple::new(vec![Value::from(7u64), Value::from(2u64)]);
        let b = Tuple::new(vec![Value::from(7u64), Value::from(1u64)]);
        idx.insert(&a, DupPolicy::InsertOnly).unwrap();
        idx.insert(&b, DupPolicy::InsertOnly).unwrap();
        assert_eq!(idx.len(), 2);
        let mut it = idx.iterate(IteratorType::Eq, key(7));
        assert_eq!(it.next().unwrap(), b);
        assert_eq!(it.next().unwrap(), a);
        assert!(it.next().is_none());
    }

    #[test]
    fn frozen_iterator_keeps_pre_freeze_visibility() {
        let idx = unsigned_index(true);
        for k in 1..=3u64 {
            idx.insert(&tup(k), DupPolicy::InsertOnly).unwrap();
        }
        let mut it = idx.iterate(IteratorType::All, vec![]);
        assert_eq!(it.next().unwrap(), tup(1));
        it.freeze();
        idx.take_by_key(&key(1)).unwrap();
        idx.insert(&tup(4), DupPolicy::InsertOnly).unwrap();
        assert_eq!(it.next().unwrap(), tup(2));
        assert_eq!(it.next().unwrap(), tup(3));
        assert!(it.next().is_none());
    }

    #[test]
    fn unfrozen_iterator_sees_live_tree_again() {
        let idx = unsigned_index(true);
        for k in 1..=4u64 {
            idx.insert(&tup(k), DupPolicy::InsertOnly).unwrap();
        }
        let mut it = idx.iterate(IteratorType::All, vec![]);
        assert_eq!(it.next().unwrap(), tup(1));
        it.freeze();
        assert!(it.is_frozen());
        it.unfreeze();
        idx.insert(&tup(5), DupPolicy::InsertOnly).unwrap();
        let rest = {
            let mut out = Vec::new();
            while let Some(t) = it.next() {
                out.push(t.field(0).unwrap().as_u64().unwrap());
            }
            out
        };
        assert_eq!(rest, vec![2, 3, 4, 5]);
    }

    #[test]
    fn live_iterator_survives_concurrent_mutation() {
        let idx = unsigned_index(true);
        for k in [1u64, 2, 3, 4, 5] {
            idx.insert(&tup(k), DupPolicy::InsertOnly).unwrap();
        }
        let mut it = idx.iterate(IteratorType::All, vec![]);
        assert_eq!(it.next().unwrap(), tup(1));
        assert_eq!(it.next().unwrap(), tup(2));
        // Remove the element the iterator just returned and the next one.
        idx.take_by_key(&key(2)).unwrap();
        idx.take_by_key(&key(3)).unwrap();
        assert_eq!(it.next().unwrap(), tup(4));
        assert_eq!(it.next().unwrap(), tup(5));
        assert!(it.next().is_none());
    }

    #[test]
    fn bulk_build_sorts_and_loads() {
        let idx = unsigned_index(true);
        idx.build_begin();
        for k in [5u64, 1, 9, 3] {
            idx.build_add(tup(k)).unwrap();
        }
        idx.build_end().unwrap();
        assert_eq!(collect(idx.iterate(IteratorType::All, vec![])), vec![1, 3, 5, 9]);
    }

    #[test]
    fn bulk_build_rejects_duplicates_for_unique() {
        let idx = unsigned_index(true);
        idx.build_begin();
        idx.build_add(tup(5)).unwrap();
        idx.build_add(tup(5)).unwrap();
        let err = idx.build_end().unwrap_err();
        assert!(matches!(err, IndexError::Duplicate { .. }));
        assert!(idx.is_empty());
    }

    #[test]
    fn find_on_non_unique_is_error() {
        let idx = unsigned_index(false);
        assert!(matches!(
            idx.find(&key(1)),
            Err(IndexError::NonUniqueFind)
        ));
    }

    #[test]
    fn version_bumps_on_mutation() {
        let idx = unsigned_index(true);
        let v0 = idx.version();
        idx.insert(&tup(1), DupPolicy::InsertOnly).unwrap();
        assert!(idx.version() > v0);
        let v1 = idx.version();
        // Failed insert leaves the version unchanged.
        let other = Tuple::new(vec![Value::from(1u64), Value::from(0u64)]);
        let _ = idx.insert(&other, DupPolicy::InsertOnly);
        assert_eq!(idx.version(), v1);
    }
}
