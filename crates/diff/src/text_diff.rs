//! Line-oriented diff over canonical YAML.

use similar::{Algorithm, ChangeTag};

/// Sides longer than this are diffed with the anchored (patience) algorithm.
pub const ANCHORED_THRESHOLD_LINES: usize = 500;

const CONTEXT_LINES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTag {
    Equal,
    Insert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffLine {
    pub tag: LineTag,
    /// 1-based line numbers on each side.
    pub old_line: Option<usize>,
    pub new_line: Option<usize>,
    pub text: String,
}

impl DiffLine {
    fn render(&self) -> String {
        let num = |n: Option<usize>| n.map(|n| n.to_string()).unwrap_or_default();
        let sign = match self.tag {
            LineTag::Equal => ' ',
            LineTag::Insert => '+',
            LineTag::Delete => '-',
        };
        format!("{:>4},{:>4} {} {}", num(self.old_line), num(self.new_line), sign, self.text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextDiff {
    /// Changed lines with surrounding context; hunks separated by `None`.
    minimal: Vec<Option<DiffLine>>,
    full: Vec<DiffLine>,
    has_changes: bool,
}

impl TextDiff {
    pub fn new(left: &str, right: &str) -> Self {
        let anchored = left.lines().count() > ANCHORED_THRESHOLD_LINES || right.lines().count() > ANCHORED_THRESHOLD_LINES;
        let algorithm = if anchored { Algorithm::Patience } else { Algorithm::Myers };
        let diff = similar::TextDiff::configure().algorithm(algorithm).diff_lines(left, right);

        let to_line = |c: similar::Change<&str>| DiffLine {
            tag: match c.tag() {
                ChangeTag::Equal => LineTag::Equal,
                ChangeTag::Insert => LineTag::Insert,
                ChangeTag::Delete => LineTag::Delete,
            },
            old_line: c.old_index().map(|i| i + 1),
            new_line: c.new_index().map(|i| i + 1),
            text: c.value().trim_end_matches('\n').to_string(),
        };

        let full: Vec<DiffLine> = diff.iter_all_changes().map(to_line).collect();
        let has_changes = full.iter().any(|l| l.tag != LineTag::Equal);

        let mut minimal = Vec::new();
        for (i, group) in diff.grouped_ops(CONTEXT_LINES).iter().enumerate() {
            if i > 0 {
                minimal.push(None);
            }
            for op in group {
                minimal.extend(diff.iter_changes(op).map(|c| Some(to_line(c))));
            }
        }
        if !has_changes {
            minimal.clear();
        }
        Self { minimal, full, has_changes }
    }

    pub fn has_changes(&self) -> bool { self.has_changes }
    pub fn full_lines(&self) -> &[DiffLine] { &self.full }

    pub fn minimal_string(&self) -> String {
        let mut out = String::new();
        for line in &self.minimal {
            match line {
                Some(l) => out.push_str(&l.render()),
                None => out.push_str("  ..."),
            }
            out.push('\n');
        }
        out
    }

    pub fn full_string(&self) -> String {
        let mut out = String::new();
        for l in &self.full {
            out.push_str(&l.render());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_keeps_two_lines_of_context() {
        let left = "a\nb\nc\nd\ne\nf\ng\nh\n";
        let right = "a\nb\nc\nd\ne\nf\nG\nh\n";
        let d = TextDiff::new(left, right);
        assert!(d.has_changes());
        let s = d.minimal_string();
        assert!(s.contains("   7,     - g"), "s=\n{}", s);
        assert!(s.contains(",   7 + G"), "s=\n{}", s);
        assert!(s.contains("e"));
        assert!(!s.contains(" a"), "s=\n{}", s);
        assert_eq!(d.full_lines().len(), 9);
    }

    #[test]
    fn equal_sides_render_empty() {
        let d = TextDiff::new("x: 1\n", "x: 1\n");
        assert!(!d.has_changes());
        assert_eq!(d.minimal_string(), "");
    }

    #[test]
    fn large_inputs_use_anchored_diff() {
        let left: String = (0..1200).map(|i| format!("line{}\n", i)).collect();
        let right = left.replace("line600\n", "changed\n");
        let d = TextDiff::new(&left, &right);
        let changed: Vec<_> = d.full_lines().iter().filter(|l| l.tag != LineTag::Equal).collect();
        assert_eq!(changed.len(), 2);
    }
}
