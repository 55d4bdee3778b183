//! Range iteration over committed and pending state

use crate::model::{Hash, Node};
use crate::node_db::NodeDb;
use crate::Result;
use std::cmp::Ordering;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::ops::Bound;
use std::sync::Arc;

enum Frame {
    Loaded(Arc<Node>),
    Unloaded(Hash),
}

/// Lazy in-order iterator over the keys of a committed tree within
/// `[start, end)`. Nodes are loaded only when the walk reaches them and
/// subtrees entirely outside the range are skipped.
pub struct RangeIter {
    ndb: Arc<NodeDb>,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    ascending: bool,
    stack: Vec<Frame>,
}

impl RangeIter {
    pub(crate) fn new(
        ndb: Arc<NodeDb>,
        root: Option<Arc<Node>>,
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        ascending: bool,
    ) -> Self {
        let empty_range = matches!((&start, &end), (Some(s), Some(e)) if s >= e);
        let stack = match root {
            Some(root) if !empty_range => vec![Frame::Loaded(root)],
            _ => Vec::new(),
        };
        RangeIter {
            ndb,
            start,
            end,
            ascending,
            stack,
        }
    }

    fn in_range(&self, key: &[u8]) -> bool {
        self.start.as_deref().map_or(true, |s| key >= s)
            && self.end.as_deref().map_or(true, |e| key < e)
    }
}

impl Iterator for RangeIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(frame) = self.stack.pop() {
            let node = match frame {
                Frame::Loaded(node) => node,
                Frame::Unloaded(hash) => match self.ndb.get_node(&hash) {
                    Ok(node) => node,
                    Err(e) => {
                        self.stack.clear();
                        return Some(Err(e));
                    }
                },
            };

            let Some((left, right)) = node.children() else {
                if self.in_range(node.key()) {
                    if let Some(value) = node.value() {
                        return Some(Ok((node.key().to_vec(), value.to_vec())));
                    }
                }
                continue;
            };

            // Left holds keys below the split key, right the split key and above
            let want_left = self.start.as_deref().map_or(true, |s| s < node.key());
            let want_right = self.end.as_deref().map_or(true, |e| node.key() < e);
            let (first, second) = if self.ascending {
                (want_left.then_some(left), want_right.then_some(right))
            } else {
                (want_right.then_some(right), want_left.then_some(left))
            };
            if let Some(hash) = second {
                self.stack.push(Frame::Unloaded(hash));
            }
            if let Some(hash) = first {
                self.stack.push(Frame::Unloaded(hash));
            }
        }
        None
    }
}

/// Committed entries under a [`MergedIter`]: a tree walk, or the fast
/// index when the tree is at its latest version
pub(crate) enum SavedIter {
    Tree(RangeIter),
    Fast(std::vec::IntoIter<Result<(Vec<u8>, Vec<u8>)>>),
}

impl SavedIter {
    pub(crate) fn fast(
        ndb: &NodeDb,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Self {
        let mut entries: Vec<_> = match ndb.fast_nodes(start, end) {
            Ok(nodes) => nodes
                .into_iter()
                .map(|(key, node)| Ok((key, node.value)))
                .collect(),
            Err(e) => vec![Err(e)],
        };
        if !ascending {
            entries.reverse();
        }
        SavedIter::Fast(entries.into_iter())
    }
}

impl Iterator for SavedIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            SavedIter::Tree(iter) => iter.next(),
            SavedIter::Fast(iter) => iter.next(),
        }
    }
}

type PendingIter<'a> = Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)> + 'a>;

/// Iterator over a tree with uncommitted writes: pending sets shadow
/// committed values and pending removals hide committed keys
pub struct MergedIter<'a> {
    saved: Peekable<SavedIter>,
    pending: Peekable<PendingIter<'a>>,
    ascending: bool,
}

enum Next {
    Saved,
    Pending,
    Both,
    Done,
}

impl<'a> MergedIter<'a> {
    pub(crate) fn new(
        saved: SavedIter,
        pending: &'a BTreeMap<Vec<u8>, Option<Vec<u8>>>,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Self {
        let pending: PendingIter<'a> = match (start, end) {
            (Some(s), Some(e)) if s >= e => Box::new(std::iter::empty()),
            _ => {
                let lower = start.map_or(Bound::Unbounded, Bound::Included);
                let upper = end.map_or(Bound::Unbounded, Bound::Excluded);
                let range: btree_map::Range<'a, Vec<u8>, Option<Vec<u8>>> =
                    pending.range::<[u8], _>((lower, upper));
                if ascending {
                    Box::new(range)
                } else {
                    Box::new(range.rev())
                }
            }
        };
        MergedIter {
            saved: saved.peekable(),
            pending: pending.peekable(),
            ascending,
        }
    }

    fn choose(&mut self) -> Next {
        let pending_key = self.pending.peek().map(|(k, _)| k.as_slice());
        let saved_key = match self.saved.peek() {
            Some(Ok((k, _))) => Some(k.as_slice()),
            // surface the error on the next call
            Some(Err(_)) => return Next::Saved,
            None => None,
        };
        match (saved_key, pending_key) {
            (None, None) => Next::Done,
            (Some(_), None) => Next::Saved,
            (None, Some(_)) => Next::Pending,
            (Some(s), Some(p)) => {
                let order = if self.ascending { s.cmp(p) } else { p.cmp(s) };
                match order {
                    Ordering::Less => Next::Saved,
                    Ordering::Greater => Next::Pending,
                    Ordering::Equal => Next::Both,
                }
            }
        }
    }
}

impl Iterator for MergedIter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next = self.choose();
            match next {
                Next::Done => return None,
                Next::Saved => return self.saved.next(),
                Next::Both | Next::Pending => {
                    if matches!(next, Next::Both) {
                        self.saved.next();
                    }
                    match self.pending.next() {
                        Some((key, Some(value))) => return Some(Ok((key.clone(), value.clone()))),
                        // pending removal
                        Some((_, None)) => continue,
                        None => return None,
                    }
                }
            }
        }
    }
}
