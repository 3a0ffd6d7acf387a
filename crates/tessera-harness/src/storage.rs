//! In-memory b-trees.
//!
//! A rowid table maps rowids to encoded records; an index is an ordered set
//! of decoded keys. Cursor positions are remembered as keys rather than
//! slots, so a cursor stays meaningful after the row under it is deleted:
//! the next step simply moves to the first key past the old one.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use tessera_types::SqliteValue;

/// An index entry, ordered field by field with SQLite's value ordering.
#[derive(Debug, Clone)]
pub struct IndexKey(pub Vec<SqliteValue>);

impl IndexKey {
    /// Whether the first `prefix.len()` fields equal `prefix`.
    pub fn starts_with(&self, prefix: &[SqliteValue]) -> bool {
        self.0.len() >= prefix.len()
            && self
                .0
                .iter()
                .zip(prefix)
                .all(|(a, b)| compare_values(a, b) == Ordering::Equal)
    }
}

/// Total order over values: the partial order with incomparable pairs
/// (NaN) treated as equal.
pub fn compare_values(a: &SqliteValue, b: &SqliteValue) -> Ordering {
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

/// Lexicographic comparison of value tuples.
pub fn compare_rows(a: &[SqliteValue], b: &[SqliteValue]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| compare_values(x, y))
        .find(|o| o.is_ne())
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_rows(&self.0, &other.0)
    }
}

/// One b-tree.
#[derive(Debug, Clone)]
pub enum Tree {
    Table(BTreeMap<i64, Vec<u8>>),
    Index(BTreeSet<IndexKey>),
}

/// Where a cursor sits within a tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Position {
    Rowid(i64),
    Key(IndexKey),
}

impl Tree {
    pub fn table() -> Self {
        Self::Table(BTreeMap::new())
    }

    pub fn index() -> Self {
        Self::Index(BTreeSet::new())
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Table(rows) => rows.len(),
            Self::Index(keys) => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match self {
            Self::Table(rows) => rows.clear(),
            Self::Index(keys) => keys.clear(),
        }
    }

    pub fn first(&self) -> Option<Position> {
        match self {
            Self::Table(rows) => rows.keys().next().copied().map(Position::Rowid),
            Self::Index(keys) => keys.first().cloned().map(Position::Key),
        }
    }

    pub fn last(&self) -> Option<Position> {
        match self {
            Self::Table(rows) => rows.keys().next_back().copied().map(Position::Rowid),
            Self::Index(keys) => keys.last().cloned().map(Position::Key),
        }
    }

    /// First entry strictly after `from`.
    pub fn after(&self, from: &Position) -> Option<Position> {
        match (self, from) {
            (Self::Table(rows), Position::Rowid(rowid)) => rows
                .range((Bound::Excluded(*rowid), Bound::Unbounded))
                .next()
                .map(|(k, _)| Position::Rowid(*k)),
            (Self::Index(keys), Position::Key(key)) => keys
                .range((Bound::Excluded(key), Bound::Unbounded))
                .next()
                .cloned()
                .map(Position::Key),
            _ => None,
        }
    }

    /// Last entry strictly before `from`.
    pub fn before(&self, from: &Position) -> Option<Position> {
        match (self, from) {
            (Self::Table(rows), Position::Rowid(rowid)) => rows
                .range(..*rowid)
                .next_back()
                .map(|(k, _)| Position::Rowid(*k)),
            (Self::Index(keys), Position::Key(key)) => keys
                .range(..key.clone())
                .next_back()
                .cloned()
                .map(Position::Key),
            _ => None,
        }
    }

    /// One past the largest rowid, or 1 for an empty table.
    pub fn next_rowid(&self) -> i64 {
        match self {
            Self::Table(rows) => rows
                .keys()
                .next_back()
                .map_or(1, |max| max.saturating_add(1)),
            Self::Index(_) => 1,
        }
    }

    /// Whether some index entry begins with `prefix`.
    pub fn contains_prefix(&self, prefix: &[SqliteValue]) -> bool {
        match self {
            Self::Table(_) => false,
            Self::Index(keys) => keys
                .range(IndexKey(prefix.to_vec())..)
                .next()
                .is_some_and(|k| k.starts_with(prefix)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(values: &[i64]) -> IndexKey {
        IndexKey(values.iter().map(|v| SqliteValue::Integer(*v)).collect())
    }

    #[test]
    fn cursor_survives_deletion_of_its_row() {
        let mut tree = Tree::table();
        if let Tree::Table(rows) = &mut tree {
            for rowid in [1, 2, 3] {
                rows.insert(rowid, Vec::new());
            }
            rows.remove(&2);
        }
        assert_eq!(
            tree.after(&Position::Rowid(2)),
            Some(Position::Rowid(3))
        );
        assert_eq!(tree.before(&Position::Rowid(2)), Some(Position::Rowid(1)));
        assert_eq!(tree.next_rowid(), 4);
    }

    #[test]
    fn index_keys_order_by_value_class() {
        let mut keys = BTreeSet::new();
        keys.insert(IndexKey(vec![SqliteValue::Text("a".to_owned())]));
        keys.insert(IndexKey(vec![SqliteValue::Integer(5)]));
        keys.insert(IndexKey(vec![SqliteValue::Null]));
        keys.insert(IndexKey(vec![SqliteValue::Float(5.0)]));
        let ordered: Vec<_> = keys.into_iter().map(|k| k.0[0].typeof_str()).collect();
        assert_eq!(ordered, vec!["null", "integer", "text"]);
    }

    #[test]
    fn prefix_lookup() {
        let mut tree = Tree::index();
        if let Tree::Index(keys) = &mut tree {
            keys.insert(key(&[7, 100]));
            keys.insert(key(&[9, 101]));
        }
        assert!(tree.contains_prefix(&[SqliteValue::Integer(7)]));
        assert!(tree.contains_prefix(&[SqliteValue::Integer(9), SqliteValue::Integer(101)]));
        assert!(!tree.contains_prefix(&[SqliteValue::Integer(8)]));
        assert_eq!(tree.len(), 2);
    }
}
