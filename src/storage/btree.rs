//! B+ Tree Index for SnapDB
//!
//! This module implements an in-memory B+ tree mapping composite keys to
//! tuple locations. Entries are ordered by `(key, location)`, which keeps
//! duplicate keys in a deterministic order and makes every entry unique.
//! Inserts split full nodes; deletes borrow from or merge with a sibling.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use super::heap::TupleLocation;
use super::value::Value;

/// Smallest accepted node capacity
pub const MIN_ORDER: usize = 3;

/// A key in the B+ tree (wraps values for comparison)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexKey(pub Vec<Value>);

impl IndexKey {
    /// Create a new index key from a single value
    pub fn new(value: Value) -> Self {
        Self(vec![value])
    }

    /// Create a new composite index key
    pub fn composite(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn has_null(&self) -> bool {
        self.0.iter().any(Value::is_null)
    }

    /// Compare two index keys column by column, NULL first
    pub fn compare(&self, other: &IndexKey) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.compare(b) {
                Some(Ordering::Equal) => continue,
                Some(ord) => return ord,
                None => return Ordering::Equal,
            }
        }
        self.0.len().cmp(&other.0.len())
    }

    /// Compare only the leading columns present in `bound`
    pub fn compare_prefix(&self, bound: &IndexKey) -> Ordering {
        for (a, b) in self.0.iter().zip(bound.0.iter()) {
            match a.compare(b) {
                Some(Ordering::Equal) => continue,
                Some(ord) => return ord,
                None => return Ordering::Equal,
            }
        }
        Ordering::Equal
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Entry {
    key: IndexKey,
    loc: TupleLocation,
}

/// B+ Tree Node
#[derive(Debug, Clone, Serialize, Deserialize)]
enum BPlusNode {
    /// `children[i]` holds entries below `separators[i]`; `children[i + 1]`
    /// holds entries at or above it
    Internal {
        separators: Vec<Entry>,
        children: Vec<Box<BPlusNode>>,
    },
    Leaf { entries: Vec<Entry> },
}

impl BPlusNode {
    fn empty_leaf() -> Box<BPlusNode> {
        Box::new(BPlusNode::Leaf {
            entries: Vec::new(),
        })
    }

    fn key_count(&self) -> usize {
        match self {
            BPlusNode::Internal { separators, .. } => separators.len(),
            BPlusNode::Leaf { entries } => entries.len(),
        }
    }
}

/// Range bounds over (a prefix of) the key columns
struct KeyRange<'a> {
    lower: Bound<&'a IndexKey>,
    upper: Bound<&'a IndexKey>,
}

impl KeyRange<'_> {
    fn below_lower(&self, key: &IndexKey) -> bool {
        match self.lower {
            Bound::Unbounded => false,
            Bound::Included(b) => key.compare_prefix(b) == Ordering::Less,
            Bound::Excluded(b) => key.compare_prefix(b) != Ordering::Greater,
        }
    }

    fn above_upper(&self, key: &IndexKey) -> bool {
        match self.upper {
            Bound::Unbounded => false,
            Bound::Included(b) => key.compare_prefix(b) == Ordering::Greater,
            Bound::Excluded(b) => key.compare_prefix(b) != Ordering::Less,
        }
    }
}

/// B+ Tree Index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BPlusTree {
    root: Box<BPlusNode>,
    /// Maximum keys per node
    order: usize,
    /// Number of entries
    size: usize,
}

impl BPlusTree {
    /// Create a new empty B+ tree holding at most `order` keys per node
    pub fn new(order: usize) -> Self {
        Self {
            root: BPlusNode::empty_leaf(),
            order: order.max(MIN_ORDER),
            size: 0,
        }
    }

    fn min_keys(&self) -> usize {
        self.order / 2
    }

    /// Insert an entry. Returns false if the exact entry already exists.
    pub fn insert(&mut self, key: IndexKey, loc: TupleLocation) -> bool {
        let entry = Entry { key, loc };
        let order = self.order;
        let mut inserted = false;
        let split = Self::insert_recursive(&mut self.root, entry, order, &mut inserted);

        if let Some((separator, right)) = split {
            let left = std::mem::replace(&mut self.root, BPlusNode::empty_leaf());
            self.root = Box::new(BPlusNode::Internal {
                separators: vec![separator],
                children: vec![left, right],
            });
        }
        if inserted {
            self.size += 1;
        }
        inserted
    }

    fn insert_recursive(
        node: &mut BPlusNode,
        entry: Entry,
        order: usize,
        inserted: &mut bool,
    ) -> Option<(Entry, Box<BPlusNode>)> {
        match node {
            BPlusNode::Leaf { entries } => {
                let pos = match entries.binary_search(&entry) {
                    Ok(_) => return None,
                    Err(pos) => pos,
                };
                entries.insert(pos, entry);
                *inserted = true;

                if entries.len() > order {
                    let right = entries.split_off(entries.len() / 2);
                    let separator = right[0].clone();
                    return Some((separator, Box::new(BPlusNode::Leaf { entries: right })));
                }
                None
            }
            BPlusNode::Internal {
                separators,
                children,
            } => {
                let pos = separators.partition_point(|s| *s <= entry);
                let (separator, right) =
                    Self::insert_recursive(&mut children[pos], entry, order, inserted)?;
                separators.insert(pos, separator);
                children.insert(pos + 1, right);

                if separators.len() > order {
                    let mid = separators.len() / 2;
                    let right_separators = separators.split_off(mid + 1);
                    let up = separators.pop()?;
                    let right_children = children.split_off(mid + 1);
                    return Some((
                        up,
                        Box::new(BPlusNode::Internal {
                            separators: right_separators,
                            children: right_children,
                        }),
                    ));
                }
                None
            }
        }
    }

    /// Remove an entry. Returns false if it was not present.
    pub fn delete(&mut self, key: &IndexKey, loc: TupleLocation) -> bool {
        let entry = Entry {
            key: key.clone(),
            loc,
        };
        let min = self.min_keys();
        let removed = Self::delete_recursive(&mut self.root, &entry, min);

        let collapse = matches!(
            self.root.as_ref(),
            BPlusNode::Internal { separators, .. } if separators.is_empty()
        );
        if collapse {
            let old = std::mem::replace(&mut self.root, BPlusNode::empty_leaf());
            if let BPlusNode::Internal { mut children, .. } = *old {
                if let Some(only) = children.pop() {
                    self.root = only;
                }
            }
        }

        if removed {
            self.size -= 1;
        }
        removed
    }

    fn delete_recursive(node: &mut BPlusNode, entry: &Entry, min: usize) -> bool {
        match node {
            BPlusNode::Leaf { entries } => match entries.binary_search(entry) {
                Ok(pos) => {
                    entries.remove(pos);
                    true
                }
                Err(_) => false,
            },
            BPlusNode::Internal {
                separators,
                children,
            } => {
                let pos = separators.partition_point(|s| s <= entry);
                let removed = Self::delete_recursive(&mut children[pos], entry, min);
                if removed && children[pos].key_count() < min {
                    Self::rebalance(separators, children, pos, min);
                }
                removed
            }
        }
    }

    /// Fix an underfull child by borrowing from a sibling or merging
    fn rebalance(
        separators: &mut Vec<Entry>,
        children: &mut Vec<Box<BPlusNode>>,
        pos: usize,
        min: usize,
    ) {
        if pos > 0 && children[pos - 1].key_count() > min {
            let (left, right) = children.split_at_mut(pos);
            let left = left[pos - 1].as_mut();
            let child = right[0].as_mut();
            match (left, child) {
                (BPlusNode::Leaf { entries: l }, BPlusNode::Leaf { entries: c }) => {
                    if let Some(moved) = l.pop() {
                        separators[pos - 1] = moved.clone();
                        c.insert(0, moved);
                    }
                }
                (
                    BPlusNode::Internal {
                        separators: ls,
                        children: lc,
                    },
                    BPlusNode::Internal {
                        separators: cs,
                        children: cc,
                    },
                ) => {
                    if let (Some(up), Some(moved)) = (ls.pop(), lc.pop()) {
                        let down = std::mem::replace(&mut separators[pos - 1], up);
                        cs.insert(0, down);
                        cc.insert(0, moved);
                    }
                }
                _ => {}
            }
            return;
        }

        if pos + 1 < children.len() && children[pos + 1].key_count() > min {
            let (left, right) = children.split_at_mut(pos + 1);
            let child = left[pos].as_mut();
            let sibling = right[0].as_mut();
            match (child, sibling) {
                (BPlusNode::Leaf { entries: c }, BPlusNode::Leaf { entries: r }) => {
                    if !r.is_empty() {
                        c.push(r.remove(0));
                        if let Some(first) = r.first() {
                            separators[pos] = first.clone();
                        }
                    }
                }
                (
                    BPlusNode::Internal {
                        separators: cs,
                        children: cc,
                    },
                    BPlusNode::Internal {
                        separators: rs,
                        children: rc,
                    },
                ) => {
                    if !rs.is_empty() {
                        let up = rs.remove(0);
                        let down = std::mem::replace(&mut separators[pos], up);
                        cs.push(down);
                        cc.push(rc.remove(0));
                    }
                }
                _ => {}
            }
            return;
        }

        let left_pos = if pos > 0 { pos - 1 } else { pos };
        if left_pos + 1 >= children.len() {
            return;
        }
        let separator = separators.remove(left_pos);
        let right = children.remove(left_pos + 1);
        match (children[left_pos].as_mut(), *right) {
            (BPlusNode::Leaf { entries: l }, BPlusNode::Leaf { entries: r }) => {
                l.extend(r);
            }
            (
                BPlusNode::Internal {
                    separators: ls,
                    children: lc,
                },
                BPlusNode::Internal {
                    separators: rs,
                    children: rc,
                },
            ) => {
                ls.push(separator);
                ls.extend(rs);
                lc.extend(rc);
            }
            _ => {}
        }
    }

    /// Locations whose key has `key` as its leading columns, in key order
    pub fn lookup_equal(&self, key: &IndexKey) -> Vec<TupleLocation> {
        self.range(Bound::Included(key), Bound::Included(key))
            .into_iter()
            .map(|(_, loc)| loc)
            .collect()
    }

    /// Entries within the bounds, in key order. Bounds shorter than the
    /// key compare against the key's leading columns.
    pub fn range(
        &self,
        lower: Bound<&IndexKey>,
        upper: Bound<&IndexKey>,
    ) -> Vec<(IndexKey, TupleLocation)> {
        let range = KeyRange { lower, upper };
        let mut result = Vec::new();
        Self::range_recursive(&self.root, &range, &mut result);
        result
    }

    fn range_recursive(
        node: &BPlusNode,
        range: &KeyRange<'_>,
        result: &mut Vec<(IndexKey, TupleLocation)>,
    ) {
        match node {
            BPlusNode::Leaf { entries } => {
                for e in entries {
                    if range.below_lower(&e.key) {
                        continue;
                    }
                    if range.above_upper(&e.key) {
                        break;
                    }
                    result.push((e.key.clone(), e.loc));
                }
            }
            BPlusNode::Internal {
                separators,
                children,
            } => {
                for (i, child) in children.iter().enumerate() {
                    if i > 0 && range.above_upper(&separators[i - 1].key) {
                        break;
                    }
                    if i < separators.len() && range.below_lower(&separators[i].key) {
                        continue;
                    }
                    Self::range_recursive(child, range, result);
                }
            }
        }
    }

    /// Get all entries in the tree (sorted)
    pub fn scan_all(&self) -> Vec<(IndexKey, TupleLocation)> {
        self.range(Bound::Unbounded, Bound::Unbounded)
    }

    /// Number of entries in the tree
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Levels from root to leaves
    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut node = self.root.as_ref();
        while let BPlusNode::Internal { children, .. } = node {
            height += 1;
            match children.first() {
                Some(child) => node = child,
                None => break,
            }
        }
        height
    }

    /// Check ordering, fill and uniform depth
    #[cfg(test)]
    fn check_invariants(&self) {
        fn walk(
            node: &BPlusNode,
            lo: Option<&Entry>,
            hi: Option<&Entry>,
            depth: usize,
            is_root: bool,
            min: usize,
            order: usize,
            leaf_depth: &mut Option<usize>,
        ) {
            if !is_root {
                assert!(node.key_count() >= min, "underfull node");
            }
            assert!(node.key_count() <= order, "overfull node");
            match node {
                BPlusNode::Leaf { entries } => {
                    assert!(entries.windows(2).all(|w| w[0] < w[1]));
                    for e in entries {
                        assert!(lo.map_or(true, |lo| e >= lo));
                        assert!(hi.map_or(true, |hi| e < hi));
                    }
                    match leaf_depth {
                        Some(d) => assert_eq!(*d, depth, "leaves at different depths"),
                        None => *leaf_depth = Some(depth),
                    }
                }
                BPlusNode::Internal {
                    separators,
                    children,
                } => {
                    assert_eq!(children.len(), separators.len() + 1);
                    for (i, child) in children.iter().enumerate() {
                        let clo = if i == 0 { lo } else { Some(&separators[i - 1]) };
                        let chi = if i == separators.len() { hi } else { Some(&separators[i]) };
                        walk(child, clo, chi, depth + 1, false, min, order, leaf_depth);
                    }
                }
            }
        }
        let mut leaf_depth = None;
        walk(
            &self.root,
            None,
            None,
            0,
            true,
            self.min_keys(),
            self.order,
            &mut leaf_depth,
        );
        assert_eq!(self.scan_all().len(), self.size);
    }
}
