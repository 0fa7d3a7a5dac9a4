//! Leafset comparison for incremental sync planning.

use mweb_primitives::mmr::LeafIdx;
use mweb_primitives::{Leafset, MAX_UTXOS_PER_QUERY};

/// A contiguous run of newly unspent leaves, fetched in one query.
///
/// "Contiguous" is relative to the scan: a span may skip over leaves
/// that are unset in both bitmaps, but it is closed by any leaf that is
/// set in the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddedSpan {
    /// First added leaf index of the run.
    pub start: u64,
    /// Number of added leaves, at most [`MAX_UTXOS_PER_QUERY`].
    pub count: u16,
}

/// Difference between the persisted leafset and an incoming one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafsetDiff {
    /// Runs of leaves set in the new bitmap but not in the old.
    pub added: Vec<AddedSpan>,
    /// Leaves set in the old bitmap but cleared in the new.
    pub removed: Vec<u64>,
}

/// Compares two leafsets, producing the additive spans and removed
/// leaves that transform `old` into `new`.
pub fn diff_leafsets(old: &Leafset, old_count: u64, new: &Leafset, new_count: u64) -> LeafsetDiff {
    // Skip over the common byte prefix.
    let (old_bytes, new_bytes) = (old.as_bytes(), new.as_bytes());
    let mut byte_idx = 0;
    while byte_idx < old_bytes.len()
        && byte_idx < new_bytes.len()
        && old_bytes[byte_idx] == new_bytes[byte_idx]
    {
        byte_idx += 1;
    }

    let mut diff = LeafsetDiff::default();
    let mut open_span: Option<AddedSpan> = None;

    let mut i = byte_idx as u64 * 8;
    while i < old_count || i < new_count {
        if old.contains(LeafIdx(i)) {
            if let Some(span) = open_span.take() {
                diff.added.push(span);
            }
            if !new.contains(LeafIdx(i)) {
                diff.removed.push(i);
            }
        } else if new.contains(LeafIdx(i)) {
            let span = open_span.get_or_insert(AddedSpan { start: i, count: 0 });
            span.count += 1;
            if span.count == MAX_UTXOS_PER_QUERY {
                diff.added
                    .push(open_span.take().expect("span was just opened; qed"));
            }
        }
        i += 1;
    }
    if let Some(span) = open_span {
        diff.added.push(span);
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leafset_with(bits: &[u64]) -> Leafset {
        let mut leafset = Leafset::default();
        for &bit in bits {
            leafset.insert(LeafIdx(bit));
        }
        leafset
    }

    #[test]
    fn identical_leafsets_produce_an_empty_diff() {
        let leafset = leafset_with(&[0, 3, 17, 200]);
        let diff = diff_leafsets(&leafset, 201, &leafset, 201);
        assert_eq!(diff, LeafsetDiff::default());
    }

    #[test]
    fn splits_spans_on_previously_set_leaves() {
        let old = leafset_with(&[5]);
        let new = leafset_with(&[2, 3, 5, 6, 7]);
        let diff = diff_leafsets(&old, 6, &new, 8);

        assert_eq!(
            diff.added,
            vec![
                AddedSpan { start: 2, count: 2 },
                AddedSpan { start: 6, count: 2 },
            ]
        );
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn reports_cleared_leaves_as_removed() {
        let old = leafset_with(&[1, 2, 9]);
        let new = leafset_with(&[2, 10]);
        let diff = diff_leafsets(&old, 10, &new, 11);

        assert_eq!(diff.added, vec![AddedSpan { start: 10, count: 1 }]);
        assert_eq!(diff.removed, vec![1, 9]);
    }

    #[test]
    fn caps_spans_at_the_query_limit() {
        let old = Leafset::default();
        let mut new = Leafset::default();
        let total = u64::from(MAX_UTXOS_PER_QUERY) + 10;
        for i in 0..total {
            new.insert(LeafIdx(i));
        }
        let diff = diff_leafsets(&old, 0, &new, total);

        assert_eq!(
            diff.added,
            vec![
                AddedSpan {
                    start: 0,
                    count: MAX_UTXOS_PER_QUERY
                },
                AddedSpan {
                    start: u64::from(MAX_UTXOS_PER_QUERY),
                    count: 10
                },
            ]
        );
    }

    #[test]
    fn applying_the_diff_reproduces_the_new_leafset() {
        for _ in 0..50 {
            let count = fastrand::u64(1..600);
            let mut old = Leafset::default();
            let mut new = Leafset::default();
            for i in 0..count {
                if fastrand::bool() {
                    old.insert(LeafIdx(i));
                }
                if fastrand::bool() {
                    new.insert(LeafIdx(i));
                }
            }

            let diff = diff_leafsets(&old, count, &new, count);

            let mut rebuilt = old.clone();
            for span in &diff.added {
                let mut applied = 0;
                let mut i = span.start;
                while applied < span.count {
                    if new.contains(LeafIdx(i)) && !old.contains(LeafIdx(i)) {
                        rebuilt.insert(LeafIdx(i));
                        applied += 1;
                    }
                    i += 1;
                }
            }
            for &removed in &diff.removed {
                rebuilt.remove(LeafIdx(removed));
            }

            for i in 0..count {
                assert_eq!(
                    rebuilt.contains(LeafIdx(i)),
                    new.contains(LeafIdx(i)),
                    "bit {i} of {count}",
                );
            }
        }
    }
}
