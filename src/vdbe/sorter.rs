//! ORDER BY sorter runtime
//!
//! Rows destined for an ORDER BY are buffered as (key, record) pairs
//! and merge-sorted when the scan finishes: entries trickle into a row
//! of bins, each bin holding a sorted run twice the size of the one
//! before it, and a final cascade merges the bins. Ties keep the run
//! that arrived first, so the sort is stable.

use crate::vdbe::record::sort_key_compare;

/// Bins used by the bottom-up merge.
const NSORT: usize = 30;

/// One buffered row.
#[derive(Debug, Clone)]
pub struct SortEntry {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

/// The sorter attached to a running program.
#[derive(Default)]
pub struct Sorter {
    /// Entries accumulated since the last reset, in arrival order
    pending: Vec<SortEntry>,
    /// Sorted output being drained by SortNext
    sorted: Vec<SortEntry>,
    /// Drain position
    pos: usize,
}

fn merge(left: Vec<SortEntry>, right: Vec<SortEntry>) -> Vec<SortEntry> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut li = left.into_iter().peekable();
    let mut ri = right.into_iter().peekable();
    loop {
        match (li.peek(), ri.peek()) {
            (Some(l), Some(r)) => {
                if sort_key_compare(&l.key, &r.key) != std::cmp::Ordering::Greater {
                    out.push(li.next().expect("peeked"));
                } else {
                    out.push(ri.next().expect("peeked"));
                }
            }
            (Some(_), None) => out.push(li.next().expect("peeked")),
            (None, Some(_)) => out.push(ri.next().expect("peeked")),
            (None, None) => break,
        }
    }
    out
}

impl Sorter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one row.
    pub fn put(&mut self, key: Vec<u8>, data: Vec<u8>) {
        self.pending.push(SortEntry { key, data });
    }

    /// Merge-sort everything buffered so far; afterwards `next()`
    /// drains rows in order.
    pub fn sort(&mut self) {
        let mut bins: Vec<Option<Vec<SortEntry>>> = (0..NSORT).map(|_| None).collect();
        for entry in self.pending.drain(..) {
            let mut run = vec![entry];
            let mut i = 0;
            let mut placed = false;
            while i < NSORT - 1 {
                match bins[i].take() {
                    None => {
                        bins[i] = Some(std::mem::take(&mut run));
                        placed = true;
                        break;
                    }
                    Some(other) => {
                        run = merge(other, run);
                        i += 1;
                    }
                }
            }
            if !placed {
                let last = bins[NSORT - 1].take().unwrap_or_default();
                bins[NSORT - 1] = Some(merge(last, run));
            }
        }
        let mut out = Vec::new();
        for bin in bins.into_iter().flatten() {
            out = merge(out, bin);
        }
        self.sorted = out;
        self.pos = 0;
    }

    /// Next sorted row, or None when drained.
    pub fn next(&mut self) -> Option<SortEntry> {
        if self.pos < self.sorted.len() {
            let e = std::mem::replace(
                &mut self.sorted[self.pos],
                SortEntry {
                    key: Vec::new(),
                    data: Vec::new(),
                },
            );
            self.pos += 1;
            Some(e)
        } else {
            None
        }
    }

    /// Discard all state.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.sorted.clear();
        self.pos = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.pos >= self.sorted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdbe::mem::Mem;
    use crate::vdbe::record::make_sort_key;

    fn drain(s: &mut Sorter) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(e) = s.next() {
            out.push(e.data);
        }
        out
    }

    #[test]
    fn test_sorts_numerically() {
        let mut s = Sorter::new();
        for v in [5i64, 1, 9, 3, 7] {
            let key = make_sort_key(&mut [Mem::int(v)], "+");
            s.put(key, v.to_string().into_bytes());
        }
        s.sort();
        assert_eq!(
            drain(&mut s),
            vec![b"1".to_vec(), b"3".to_vec(), b"5".to_vec(), b"7".to_vec(), b"9".to_vec()]
        );
    }

    #[test]
    fn test_descending() {
        let mut s = Sorter::new();
        for v in [2i64, 10, 6] {
            let key = make_sort_key(&mut [Mem::int(v)], "-");
            s.put(key, v.to_string().into_bytes());
        }
        s.sort();
        assert_eq!(
            drain(&mut s),
            vec![b"10".to_vec(), b"6".to_vec(), b"2".to_vec()]
        );
    }

    #[test]
    fn test_stability_on_ties() {
        let mut s = Sorter::new();
        for (k, d) in [(1i64, "a"), (1, "b"), (1, "c")] {
            let key = make_sort_key(&mut [Mem::int(k)], "+");
            s.put(key, d.as_bytes().to_vec());
        }
        s.sort();
        assert_eq!(
            drain(&mut s),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn test_large_input_exercises_bins() {
        let mut s = Sorter::new();
        for v in (0..1000).rev() {
            let key = make_sort_key(&mut [Mem::int(v)], "+");
            s.put(key, v.to_string().into_bytes());
        }
        s.sort();
        let out = drain(&mut s);
        assert_eq!(out.len(), 1000);
        assert_eq!(out[0], b"0".to_vec());
        assert_eq!(out[999], b"999".to_vec());
    }
}
