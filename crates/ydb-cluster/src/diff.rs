//! Incremental topology update: compare two endpoint lists sorted by
//! address and classify every address as kept, added or removed.

use ydb_core::Endpoint;

/// One entry of a diff. `Equal` pairs let the caller refresh metadata of a
/// node whose address did not change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Change<'a> {
    Equal {
        curr: &'a Endpoint,
        next: &'a Endpoint,
    },
    Added {
        next: &'a Endpoint,
    },
    Removed {
        curr: &'a Endpoint,
    },
}

/// Two-pointer merge over `curr` and `next`.
///
/// Both inputs must already be sorted by address; the differ does not
/// sort. Every address of `curr ∪ next` appears in exactly one change.
pub fn diff_endpoints<'a>(curr: &'a [Endpoint], next: &'a [Endpoint]) -> Vec<Change<'a>> {
    let mut changes = Vec::with_capacity(curr.len().max(next.len()));
    let (mut i, mut j) = (0, 0);

    while i < curr.len() && j < next.len() {
        let (c, n) = (&curr[i], &next[j]);
        match c.address().cmp(n.address()) {
            std::cmp::Ordering::Equal => {
                changes.push(Change::Equal { curr: c, next: n });
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                changes.push(Change::Removed { curr: c });
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                changes.push(Change::Added { next: n });
                j += 1;
            }
        }
    }
    changes.extend(curr[i..].iter().map(|c| Change::Removed { curr: c }));
    changes.extend(next[j..].iter().map(|n| Change::Added { next: n }));
    changes
}
