//! Line diff between an original file and its draft.
//!
//! Only what the gate needs: added/deleted counts, the added lines for the
//! safety scan, and a unified rendering for reviewers.

use serde::{Deserialize, Serialize};

/// Middle sections larger than this (old × new lines) are not aligned and
/// count as fully replaced. Overstating deletions only makes the gate stricter.
const MAX_LCS_CELLS: usize = 4_000_000;

const CONTEXT_LINES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DiffSummary {
    pub lines_added: usize,
    pub lines_deleted: usize,
    pub original_lines: usize,
    /// `lines_deleted / original_lines`, 0 for an empty original.
    pub deletion_ratio: f64,
}

impl DiffSummary {
    pub fn new(lines_added: usize, lines_deleted: usize, original_lines: usize) -> Self {
        let deletion_ratio = if original_lines == 0 {
            0.0
        } else {
            lines_deleted as f64 / original_lines as f64
        };
        Self {
            lines_added,
            lines_deleted,
            original_lines,
            deletion_ratio,
        }
    }

    pub fn changed_lines(&self) -> usize {
        self.lines_added + self.lines_deleted
    }

    /// Combine the summaries of several drafts.
    pub fn merge(&self, other: &DiffSummary) -> DiffSummary {
        DiffSummary::new(
            self.lines_added + other.lines_added,
            self.lines_deleted + other.lines_deleted,
            self.original_lines + other.original_lines,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp<'a> {
    Equal(&'a str),
    Delete(&'a str),
    Insert(&'a str),
}

/// Aligned line operations turning `old` into `new`.
#[derive(Debug, Clone)]
pub struct LineDiff<'a> {
    ops: Vec<DiffOp<'a>>,
    original_lines: usize,
}

impl<'a> LineDiff<'a> {
    pub fn compute(old: &'a str, new: &'a str) -> Self {
        let a: Vec<&str> = old.lines().collect();
        let b: Vec<&str> = new.lines().collect();

        let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
        let suffix = a[prefix..]
            .iter()
            .rev()
            .zip(b[prefix..].iter().rev())
            .take_while(|(x, y)| x == y)
            .count();

        let mut ops = Vec::with_capacity(a.len().max(b.len()));
        ops.extend(a[..prefix].iter().map(|l| DiffOp::Equal(*l)));
        align(
            &a[prefix..a.len() - suffix],
            &b[prefix..b.len() - suffix],
            &mut ops,
        );
        ops.extend(a[a.len() - suffix..].iter().map(|l| DiffOp::Equal(*l)));

        Self {
            ops,
            original_lines: a.len(),
        }
    }

    pub fn ops(&self) -> &[DiffOp<'a>] {
        &self.ops
    }

    pub fn summary(&self) -> DiffSummary {
        let added = self
            .ops
            .iter()
            .filter(|op| matches!(op, DiffOp::Insert(_)))
            .count();
        let deleted = self
            .ops
            .iter()
            .filter(|op| matches!(op, DiffOp::Delete(_)))
            .count();
        DiffSummary::new(added, deleted, self.original_lines)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, DiffOp::Equal(_)))
    }

    /// Added lines with their 1-based line number in the new file.
    pub fn added_lines(&self) -> Vec<(usize, &'a str)> {
        let mut new_no = 0;
        let mut out = Vec::new();
        for op in &self.ops {
            match op {
                DiffOp::Equal(_) => new_no += 1,
                DiffOp::Insert(line) => {
                    new_no += 1;
                    out.push((new_no, *line));
                }
                DiffOp::Delete(_) => {}
            }
        }
        out
    }

    /// Unified diff with three lines of context.
    pub fn unified(&self, path: &str) -> String {
        if self.is_empty() {
            return String::new();
        }

        // Line counts preceding each op.
        let mut old_pos = Vec::with_capacity(self.ops.len() + 1);
        let mut new_pos = Vec::with_capacity(self.ops.len() + 1);
        let (mut o, mut n) = (0usize, 0usize);
        for op in &self.ops {
            old_pos.push(o);
            new_pos.push(n);
            match op {
                DiffOp::Equal(_) => {
                    o += 1;
                    n += 1;
                }
                DiffOp::Delete(_) => o += 1,
                DiffOp::Insert(_) => n += 1,
            }
        }
        old_pos.push(o);
        new_pos.push(n);

        let mut hunks: Vec<(usize, usize)> = Vec::new();
        for (i, op) in self.ops.iter().enumerate() {
            if matches!(op, DiffOp::Equal(_)) {
                continue;
            }
            let start = i.saturating_sub(CONTEXT_LINES);
            let end = (i + 1 + CONTEXT_LINES).min(self.ops.len());
            match hunks.last_mut() {
                Some((_, last_end)) if start <= *last_end => *last_end = end.max(*last_end),
                _ => hunks.push((start, end)),
            }
        }

        let mut out = format!("--- a/{path}\n+++ b/{path}\n");
        for (start, end) in hunks {
            let old_len = old_pos[end] - old_pos[start];
            let new_len = new_pos[end] - new_pos[start];
            let old_start = if old_len == 0 { old_pos[start] } else { old_pos[start] + 1 };
            let new_start = if new_len == 0 { new_pos[start] } else { new_pos[start] + 1 };
            out.push_str(&format!(
                "@@ -{old_start},{old_len} +{new_start},{new_len} @@\n"
            ));
            for op in &self.ops[start..end] {
                let (marker, line) = match op {
                    DiffOp::Equal(l) => (' ', l),
                    DiffOp::Delete(l) => ('-', l),
                    DiffOp::Insert(l) => ('+', l),
                };
                out.push(marker);
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

/// Longest-common-subsequence alignment of the differing middle.
fn align<'a>(a: &[&'a str], b: &[&'a str], ops: &mut Vec<DiffOp<'a>>) {
    if a.is_empty() || b.is_empty() || a.len().saturating_mul(b.len()) > MAX_LCS_CELLS {
        ops.extend(a.iter().map(|l| DiffOp::Delete(*l)));
        ops.extend(b.iter().map(|l| DiffOp::Insert(*l)));
        return;
    }

    let (n, m) = (a.len(), b.len());
    // lcs[i][j] = LCS length of a[i..] and b[j..]
    let mut lcs = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[idx(i, j)] = if a[i] == b[j] {
                lcs[idx(i + 1, j + 1)] + 1
            } else {
                lcs[idx(i + 1, j)].max(lcs[idx(i, j + 1)])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            ops.push(DiffOp::Equal(a[i]));
            i += 1;
            j += 1;
        } else if lcs[idx(i + 1, j)] >= lcs[idx(i, j + 1)] {
            ops.push(DiffOp::Delete(a[i]));
            i += 1;
        } else {
            ops.push(DiffOp::Insert(b[j]));
            j += 1;
        }
    }
    ops.extend(a[i..].iter().map(|l| DiffOp::Delete(*l)));
    ops.extend(b[j..].iter().map(|l| DiffOp::Insert(*l)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> String {
        (1..=n).map(|i| format!("line {i}\n")).collect()
    }

    #[test]
    fn test_identical_is_empty() {
        let text = numbered(5);
        let diff = LineDiff::compute(&text, &text);
        assert!(diff.is_empty());
        assert_eq!(diff.summary(), DiffSummary::new(0, 0, 5));
        assert_eq!(diff.unified("a.rs"), "");
    }

    #[test]
    fn test_single_replacement() {
        let old = "a\nb\nc\n";
        let new = "a\nB\nc\n";
        let diff = LineDiff::compute(old, new);
        let summary = diff.summary();
        assert_eq!(summary.lines_added, 1);
        assert_eq!(summary.lines_deleted, 1);
        assert_eq!(diff.added_lines(), vec![(2, "B")]);
        assert_eq!(
            diff.unified("x.txt"),
            "--- a/x.txt\n+++ b/x.txt\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n"
        );
    }

    #[test]
    fn test_deletion_ratio() {
        let old = numbered(100);
        let new: String = (61..=100).map(|i| format!("line {i}\n")).collect();
        let summary = LineDiff::compute(&old, &new).summary();
        assert_eq!(summary.lines_deleted, 60);
        assert_eq!(summary.lines_added, 0);
        assert!((summary.deletion_ratio - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_interleaved_edits_align() {
        let old = "fn a() {}\nfn b() {}\nfn c() {}\nfn d() {}\n";
        let new = "fn a() {}\nfn b2() {}\nfn c() {}\nfn e() {}\nfn d() {}\n";
        let summary = LineDiff::compute(old, new).summary();
        assert_eq!(summary.lines_added, 2);
        assert_eq!(summary.lines_deleted, 1);
    }

    #[test]
    fn test_separate_hunks() {
        let old = numbered(20);
        let new = old.replace("line 2\n", "line two\n").replace("line 19\n", "line nineteen\n");
        let unified = LineDiff::compute(&old, &new).unified("n.txt");
        assert_eq!(unified.matches("@@ -").count(), 2);
    }

    #[test]
    fn test_empty_original() {
        let diff = LineDiff::compute("", "new\n");
        let summary = diff.summary();
        assert_eq!(summary.deletion_ratio, 0.0);
        assert_eq!(summary.lines_added, 1);
        assert!(diff.unified("f").contains("@@ -0,0 +1,1 @@"));
    }

    #[test]
    fn test_merge_recomputes_ratio() {
        let merged = DiffSummary::new(1, 10, 20).merge(&DiffSummary::new(0, 0, 80));
        assert_eq!(merged.lines_deleted, 10);
        assert!((merged.deletion_ratio - 0.1).abs() < f64::EPSILON);
    }
}
