//! Matcher passes. Each pass reads immutable snapshots of the blocks and of
//! what is still unmatched, and returns the pairings it found. The driver in
//! `sync::sync_at` threads the shrinking unmatched sets from one pass to the
//! next: exact key, then split/merge, then positional.

use super::{Score, SyncConfig, SyncWarning, WarningKind};
use crate::hash::ContentHash;
use crate::markdown::BlockContent;
use crate::model::{Block, BlockId, Span};
use std::collections::{HashMap, HashSet, VecDeque};

/// A block of the previous container.
#[derive(Debug)]
pub(crate) struct OldEntry<'a> {
    pub block: &'a Block,
    /// Index of the owning list entry, for list items.
    pub parent: Option<usize>,
    /// Exact-match identity: the span hash, except for list items (text
    /// after the marker) and lists (their item keys, in any order).
    pub key: ContentHash,
    pub plain: String,
    pub stripped: String,
}

/// A block parsed from the edited text.
#[derive(Debug)]
pub(crate) struct NewEntry {
    pub content: BlockContent,
    pub span: Span,
    pub hash: ContentHash,
    pub key: ContentHash,
    pub stripped: String,
}

pub(crate) fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PairKind {
    Exact,
    Positional,
    Structural,
    /// Stand-in for a split or merge when aligning the blocks around it.
    Regrouped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pair {
    pub old: usize,
    pub new: usize,
    pub kind: PairKind,
}

/// Indices not claimed by any earlier pass, ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Unmatched {
    pub old: Vec<usize>,
    pub new: Vec<usize>,
}

impl Unmatched {
    pub fn all(old_len: usize, new_len: usize) -> Self {
        Self {
            old: (0..old_len).collect(),
            new: (0..new_len).collect(),
        }
    }

    pub fn without(&self, pairs: &[Pair]) -> Self {
        let old: HashSet<usize> = pairs.iter().map(|p| p.old).collect();
        let new: HashSet<usize> = pairs.iter().map(|p| p.new).collect();
        Self {
            old: self.old.iter().copied().filter(|o| !old.contains(o)).collect(),
            new: self.new.iter().copied().filter(|n| !new.contains(n)).collect(),
        }
    }
}

/// Binds candidates to unused old blocks with the same type and key.
/// Position-independent; duplicates pair up in document order.
pub(crate) fn exact_hash_pass(old: &[OldEntry<'_>], new: &[NewEntry], unmatched: &Unmatched) -> Vec<Pair> {
    let mut by_hash: HashMap<(&str, &ContentHash), VecDeque<usize>> = HashMap::new();
    for &o in &unmatched.old {
        let entry = &old[o];
        by_hash
            .entry((entry.block.kind.type_name(), &entry.key))
            .or_default()
            .push_back(o);
    }

    unmatched
        .new
        .iter()
        .filter_map(|&n| {
            let key = (new[n].content.kind.type_name(), &new[n].key);
            let o = by_hash.get_mut(&key)?.pop_front()?;
            Some(Pair {
                old: o,
                new: n,
                kind: PairKind::Exact,
            })
        })
        .collect()
}

#[derive(Debug, Default)]
pub(crate) struct PositionalOutcome {
    pub pairs: Vec<Pair>,
    pub warnings: Vec<SyncWarning>,
}

/// Pairs leftover candidates with leftover old blocks in relative order.
///
/// First by identical shape, nearest expected position first. Then, for
/// top-level text blocks whose type or level changed, by token similarity
/// at or above `structural_threshold`. The expected old position of a
/// candidate is its own position shifted by the offset of the closest
/// preceding exact or regrouped match, and only old blocks within `window` of it are
/// considered.
pub(crate) fn positional_pass(
    old: &[OldEntry<'_>],
    new: &[NewEntry],
    unmatched: &Unmatched,
    anchors: &[Pair],
    config: &SyncConfig,
) -> PositionalOutcome {
    let offsets = anchor_offsets(new.len(), anchors);
    let mut outcome = PositionalOutcome::default();

    pair_in_order(
        old,
        new,
        unmatched,
        &offsets,
        config.window,
        PairKind::Positional,
        |o, n| o.block.kind.same_shape(&n.content.kind).then_some(Score::MAX),
        &mut outcome,
    );

    let remaining = unmatched.without(&outcome.pairs);
    pair_in_order(
        old,
        new,
        &remaining,
        &offsets,
        config.window,
        PairKind::Structural,
        |o, n| {
            let (old_kind, new_kind) = (&o.block.kind, &n.content.kind);
            let eligible = old_kind.is_text_leaf()
                && new_kind.is_text_leaf()
                && !o.block.is_child()
                && n.content.parent.is_none()
                && !old_kind.same_shape(new_kind);
            if !eligible {
                return None;
            }
            let score = token_similarity(&o.plain, &n.content.plain);
            (score >= config.structural_threshold).then_some(score)
        },
        &mut outcome,
    );

    outcome
}

/// `old - new` offset of the closest anchor at or before each new index.
/// When several anchors share a new index the last one wins.
fn anchor_offsets(new_len: usize, anchors: &[Pair]) -> Vec<i64> {
    let by_new: HashMap<usize, usize> = anchors.iter().map(|p| (p.new, p.old)).collect();
    let mut offsets = Vec::with_capacity(new_len);
    let mut current = 0i64;
    for n in 0..new_len {
        if let Some(&o) = by_new.get(&n) {
            current = o as i64 - n as i64;
        }
        offsets.push(current);
    }
    offsets
}

#[allow(clippy::too_many_arguments)]
fn pair_in_order(
    old: &[OldEntry<'_>],
    new: &[NewEntry],
    unmatched: &Unmatched,
    offsets: &[i64],
    window: usize,
    kind: PairKind,
    accept: impl Fn(&OldEntry<'_>, &NewEntry) -> Option<Score>,
    outcome: &mut PositionalOutcome,
) {
    let window = i64::try_from(window).unwrap_or(i64::MAX);
    let mut cursor = 0usize;

    for &n in &unmatched.new {
        let expected = n as i64 + offsets[n];
        let low = unmatched.old.partition_point(|&o| (o as i64) < expected.saturating_sub(window));
        let mut candidates: Vec<(Score, u64, usize, usize)> = Vec::new();
        for (pos, &o) in unmatched.old.iter().enumerate().skip(low.max(cursor)) {
            if o as i64 > expected.saturating_add(window) {
                break;
            }
            if let Some(score) = accept(&old[o], &new[n]) {
                candidates.push((score, (o as i64 - expected).unsigned_abs(), o, pos));
            }
        }
        let Some(best) = candidates
            .iter()
            .min_by(|a, b| {
                b.0.cmp(&a.0)
                    .then(a.1.cmp(&b.1))
                    .then_with(|| old[a.2].block.id.cmp(&old[b.2].block.id))
            })
            .copied()
        else {
            continue;
        };

        let tied: Vec<&BlockId> = candidates
            .iter()
            .filter(|c| c.0 == best.0 && c.1 == best.1 && c.2 != best.2)
            .map(|c| &old[c.2].block.id)
            .collect();
        if !tied.is_empty() {
            let chosen = &old[best.2].block.id;
            let others: Vec<String> = tied.iter().map(|id| id.to_string()).collect();
            outcome.warnings.push(SyncWarning {
                kind: WarningKind::Ambiguity,
                block_id: chosen.clone(),
                offset: new[n].span.start,
                detail: format!(
                    "block at offset {} matches {chosen} and {} equally well; chose {chosen}",
                    new[n].span.start,
                    others.join(", ")
                ),
            });
        }

        outcome.pairs.push(Pair {
            old: best.2,
            new: n,
            kind,
        });
        cursor = best.3 + 1;
    }
}

/// Jaccard similarity of the whitespace-separated token sets, out of 10000.
pub(crate) fn token_similarity(a: &str, b: &str) -> Score {
    fn tokens(text: &str) -> Vec<&str> {
        let mut tokens: Vec<&str> = text.split_whitespace().collect();
        tokens.sort_unstable();
        tokens.dedup();
        tokens
    }
    let (a, b) = (tokens(a), tokens(b));
    if a.is_empty() && b.is_empty() {
        return Score::MAX;
    }
    let (mut i, mut j) = (0usize, 0usize);
    let (mut intersection, mut union) = (0u32, 0u32);
    while i < a.len() && j < b.len() {
        match a[i].cmp(b[j]) {
            std::cmp::Ordering::Equal => {
                intersection += 1;
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
        }
        union += 1;
    }
    union += (a.len() - i + b.len() - j) as u32;
    Score(intersection * 10000 / union.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Split {
    pub old: usize,
    pub first: usize,
    pub second: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Merge {
    pub first: usize,
    pub second: usize,
    pub new: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Regrouping {
    pub splits: Vec<Split>,
    pub merges: Vec<Merge>,
}

impl Regrouping {
    /// Pairs covering every block taking part, ordered so that the last pair
    /// for a new index points at the last old block involved.
    pub fn anchors(&self) -> Vec<Pair> {
        let pair = |old, new| Pair {
            old,
            new,
            kind: PairKind::Regrouped,
        };
        let mut anchors = Vec::with_capacity(2 * (self.splits.len() + self.merges.len()));
        for split in &self.splits {
            anchors.push(pair(split.old, split.first));
            anchors.push(pair(split.old, split.second));
        }
        for merge in &self.merges {
            anchors.push(pair(merge.first, merge.new));
            anchors.push(pair(merge.second, merge.new));
        }
        anchors
    }
}

/// Finds one old block whose text equals two adjacent candidates joined
/// (ignoring whitespace), and the reverse. Only blocks the exact pass left
/// over take part.
pub(crate) fn split_merge_pass(
    old: &[OldEntry<'_>],
    new: &[NewEntry],
    unmatched: &Unmatched,
) -> Regrouping {
    let deleted: HashSet<usize> = unmatched.old.iter().copied().collect();
    let inserted: HashSet<usize> = unmatched.new.iter().copied().collect();
    let mut used_old: HashSet<usize> = HashSet::new();
    let mut used_new: HashSet<usize> = HashSet::new();
    let mut out = Regrouping::default();

    let mut old_by_text: HashMap<&str, Vec<usize>> = HashMap::new();
    for &o in &unmatched.old {
        let entry = &old[o];
        if entry.block.kind.is_text_leaf() && !entry.stripped.is_empty() {
            old_by_text.entry(entry.stripped.as_str()).or_default().push(o);
        }
    }

    for first in 0..new.len().saturating_sub(1) {
        let second = first + 1;
        let (a, b) = (&new[first], &new[second]);
        if !(a.content.kind.is_text_leaf() && b.content.kind.is_text_leaf())
            || a.content.parent != b.content.parent
            || !inserted.contains(&first)
            || !inserted.contains(&second)
            || used_new.contains(&first)
        {
            continue;
        }
        let joined = format!("{}{}", a.stripped, b.stripped);
        let Some(sources) = old_by_text.get(joined.as_str()) else {
            continue;
        };
        let is_item = a.content.parent.is_some();
        let found = sources
            .iter()
            .copied()
            .find(|&o| !used_old.contains(&o) && old[o].block.is_child() == is_item);
        if let Some(o) = found {
            used_old.insert(o);
            used_new.insert(first);
            used_new.insert(second);
            out.splits.push(Split { old: o, first, second });
        }
    }

    let mut new_by_text: HashMap<&str, Vec<usize>> = HashMap::new();
    for &n in &unmatched.new {
        let entry = &new[n];
        if !used_new.contains(&n) && entry.content.kind.is_text_leaf() && !entry.stripped.is_empty() {
            new_by_text.entry(entry.stripped.as_str()).or_default().push(n);
        }
    }

    for first in 0..old.len().saturating_sub(1) {
        let second = first + 1;
        let (x, y) = (&old[first], &old[second]);
        if !(x.block.kind.is_text_leaf() && y.block.kind.is_text_leaf())
            || x.parent != y.parent
            || !deleted.contains(&first)
            || !deleted.contains(&second)
            || used_old.contains(&first)
            || used_old.contains(&second)
        {
            continue;
        }
        let joined = format!("{}{}", x.stripped, y.stripped);
        let Some(targets) = new_by_text.get(joined.as_str()) else {
            continue;
        };
        let is_item = x.block.is_child();
        let found = targets
            .iter()
            .copied()
            .find(|&n| !used_new.contains(&n) && new[n].content.parent.is_some() == is_item);
        if let Some(n) = found {
            used_old.insert(first);
            used_old.insert(second);
            used_new.insert(n);
            out.merges.push(Merge { first, second, new: n });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_similarity_scores() {
        assert_eq!(token_similarity("Project Title", "Project Title"), Score::MAX);
        assert_eq!(token_similarity("a b", "c d"), Score(0));
        assert_eq!(token_similarity("a b c", "a b d"), Score(5000));
        assert_eq!(token_similarity("", ""), Score::MAX);
        assert_eq!(token_similarity("a", ""), Score(0));
    }

    #[test]
    fn test_anchor_offsets_follow_exact_matches() {
        let exact = vec![
            Pair {
                old: 0,
                new: 2,
                kind: PairKind::Exact,
            },
            Pair {
                old: 5,
                new: 4,
                kind: PairKind::Exact,
            },
        ];
        assert_eq!(anchor_offsets(6, &exact), vec![0, 0, -2, -2, 1, 1]);
    }

    #[test]
    fn test_regrouping_anchors_shift_alignment() {
        let regrouping = Regrouping {
            splits: vec![Split {
                old: 1,
                first: 1,
                second: 2,
            }],
            merges: vec![Merge {
                first: 4,
                second: 5,
                new: 4,
            }],
        };
        // split: blocks after it line up one old block earlier
        // merge: blocks after it line up one old block later
        assert_eq!(
            anchor_offsets(6, &regrouping.anchors()),
            vec![0, 0, -1, -1, 1, 1]
        );
    }

    #[test]
    fn test_unmatched_without_removes_both_sides() {
        let all = Unmatched::all(3, 4);
        let rest = all.without(&[Pair {
            old: 1,
            new: 3,
            kind: PairKind::Positional,
        }]);
        assert_eq!(rest.old, vec![0, 2]);
        assert_eq!(rest.new, vec![0, 1, 2]);
    }
}
