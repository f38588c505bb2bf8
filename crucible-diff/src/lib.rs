//! LCS-style diff engine: given two ordered sequences of `(seqNr, value)` units,
//! produce an edit script of `Unchanged`/`Added`/`Removed` units such that the
//! `Unchanged ∪ Removed` subsequence equals the old input in order and `Unchanged ∪ Added`
//! equals the new input in order. No file in the pack implements sequence diffing directly; this
//! is a standard DP/LCS table plus backtrace, fragmented above `max_matrix_width` the same way
//! `diff_fragmented` below splits and concatenates independently-diffed halves.

use tracing::debug;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Unit {
    pub seq_nr: u64,
    pub value: Vec<u8>,
}

impl Unit {
    pub fn new(seq_nr: u64, value: impl Into<Vec<u8>>) -> Unit {
        Unit {
            seq_nr,
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DiffUnit {
    Unchanged {
        old_seq_nr: u64,
        new_seq_nr: u64,
        value: Vec<u8>,
    },
    Added {
        seq_nr: u64,
        value: Vec<u8>,
    },
    Removed {
        seq_nr: u64,
        value: Vec<u8>,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct DiffParams {
    /// DP table side length beyond which a region is fragmented into independently-diffed
    /// halves rather than solved exactly.
    pub max_matrix_width: usize,
    /// Per-match weight in the DP score; uniform across all matches in this implementation.
    pub quality_match: f64,
    /// At a tie between extending a removal-run and an addition-run, how strongly the traceback
    /// prefers to continue the run already in progress (0.0 = no preference, 1.0 = always
    /// continue), favoring fewer, longer runs over many short ones.
    pub quality_momentum: f64,
    pub emit_unchanged: bool,
}

impl Default for DiffParams {
    fn default() -> Self {
        DiffParams {
            max_matrix_width: 1024,
            quality_match: 1.0,
            quality_momentum: 0.75,
            emit_unchanged: true,
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Dir {
    Added,
    Removed,
}

/// Diff `old` against `new`, fragmenting large inputs per `params.max_matrix_width`.
pub fn diff(old: &[Unit], new: &[Unit], params: &DiffParams) -> Vec<DiffUnit> {
    let mut script = diff_fragmented(old, new, params);
    if !params.emit_unchanged {
        script.retain(|u| !matches!(u, DiffUnit::Unchanged { .. }));
    }
    script
}

fn diff_fragmented(old: &[Unit], new: &[Unit], params: &DiffParams) -> Vec<DiffUnit> {
    if old.len() <= params.max_matrix_width && new.len() <= params.max_matrix_width {
        return diff_block(old, new, params);
    }
    debug!(
        target: "crucible",
        old_len = old.len(),
        new_len = new.len(),
        max_matrix_width = params.max_matrix_width,
        "fragmenting diff region"
    );
    let old_mid = old.len() / 2;
    // Heuristic proportional split: not guaranteed optimal, but any contiguous split preserves
    // the subsequence invariants because each half is diffed against the corresponding slice of
    // the other sequence and the results are concatenated in order.
    let new_mid = if old.is_empty() {
        new.len() / 2
    } else {
        (new.len() * old_mid) / old.len()
    };
    let (old_lo, old_hi) = old.split_at(old_mid);
    let (new_lo, new_hi) = new.split_at(new_mid);
    let mut left = diff_fragmented(old_lo, new_lo, params);
    let right = diff_fragmented(old_hi, new_hi, params);
    left.extend(right);
    left
}

fn diff_block(old: &[Unit], new: &[Unit], params: &DiffParams) -> Vec<DiffUnit> {
    let dp = build_dp(old, new, params.quality_match);
    backtrace(old, new, &dp, params)
}

fn build_dp(old: &[Unit], new: &[Unit], quality_match: f64) -> Vec<Vec<f64>> {
    let rows = old.len() + 1;
    let cols = new.len() + 1;
    let mut dp = vec![vec![0.0f64; cols]; rows];
    for i in 1..rows {
        for j in 1..cols {
            dp[i][j] = if old[i - 1].value == new[j - 1].value {
                dp[i - 1][j - 1] + quality_match
            } else {
                dp[i - 1][j].max(dp[i][j - 1])
            };
        }
    }
    dp
}

fn backtrace(old: &[Unit], new: &[Unit], dp: &[Vec<f64>], params: &DiffParams) -> Vec<DiffUnit> {
    let mut i = old.len();
    let mut j = new.len();
    let mut out = Vec::new();
    let mut last_dir: Option<Dir> = None;

    while i > 0 || j > 0 {
        if i > 0 && j > 0 && old[i - 1].value == new[j - 1].value {
            out.push(DiffUnit::Unchanged {
                old_seq_nr: old[i - 1].seq_nr,
                new_seq_nr: new[j - 1].seq_nr,
                value: new[j - 1].value.clone(),
            });
            i -= 1;
            j -= 1;
            last_dir = None;
            continue;
        }
        let take_added = if i == 0 {
            true
        } else if j == 0 {
            false
        } else if dp[i][j - 1] > dp[i - 1][j] {
            true
        } else if dp[i][j - 1] < dp[i - 1][j] {
            false
        } else {
            match last_dir {
                Some(Dir::Added) => true,
                Some(Dir::Removed) => false,
                None => params.quality_momentum >= 0.5,
            }
        };
        if take_added {
            out.push(DiffUnit::Added {
                seq_nr: new[j - 1].seq_nr,
                value: new[j - 1].value.clone(),
            });
            j -= 1;
            last_dir = Some(Dir::Added);
        } else {
            out.push(DiffUnit::Removed {
                seq_nr: old[i - 1].seq_nr,
                value: old[i - 1].value.clone(),
            });
            i -= 1;
            last_dir = Some(Dir::Removed);
        }
    }
    out.reverse();
    out
}

/// Render the DP matrix as an HTML table for post-mortem inspection of a diff decision. Intended
/// for small inputs only (a debug aid, not a production report).
pub fn render_dp_matrix_html(old: &[Unit], new: &[Unit], params: &DiffParams) -> String {
    let dp = build_dp(old, new, params.quality_match);
    let mut html = String::from("<table border=\"1\">\n<tr><td></td>");
    for u in new {
        html.push_str(&format!("<td>{}</td>", String::from_utf8_lossy(&u.value)));
    }
    html.push_str("</tr>\n");
    for (i, row) in dp.iter().enumerate() {
        html.push_str("<tr><td>");
        if i > 0 {
            html.push_str(&String::from_utf8_lossy(&old[i - 1].value));
        }
        html.push_str("</td>");
        for v in row {
            html.push_str(&format!("<td>{v}</td>"));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</table>\n");
    html
}

#[cfg(test)]
mod test {
    use super::*;

    fn units(strs: &[&str]) -> Vec<Unit> {
        strs.iter()
            .enumerate()
            .map(|(i, s)| Unit::new(i as u64, s.as_bytes().to_vec()))
            .collect()
    }

    fn assert_valid_edit_script(old: &[Unit], new: &[Unit], script: &[DiffUnit]) {
        let reconstructed_old: Vec<Vec<u8>> = script
            .iter()
            .filter_map(|u| match u {
                DiffUnit::Unchanged { value, .. } | DiffUnit::Removed { value, .. } => {
                    Some(value.clone())
                }
                DiffUnit::Added { .. } => None,
            })
            .collect();
        let reconstructed_new: Vec<Vec<u8>> = script
            .iter()
            .filter_map(|u| match u {
                DiffUnit::Unchanged { value, .. } | DiffUnit::Added { value, .. } => {
                    Some(value.clone())
                }
                DiffUnit::Removed { .. } => None,
            })
            .collect();
        let expected_old: Vec<Vec<u8>> = old.iter().map(|u| u.value.clone()).collect();
        let expected_new: Vec<Vec<u8>> = new.iter().map(|u| u.value.clone()).collect();
        assert_eq!(reconstructed_old, expected_old);
        assert_eq!(reconstructed_new, expected_new);
    }

    #[test]
    fn single_substitution() {
        let old = units(&["a", "b", "c"]);
        let new = units(&["a", "x", "c"]);
        let script = diff(&old, &new, &DiffParams::default());
        assert_valid_edit_script(&old, &new, &script);
        let unchanged_count = script
            .iter()
            .filter(|u| matches!(u, DiffUnit::Unchanged { .. }))
            .count();
        assert_eq!(unchanged_count, 2);
    }

    #[test]
    fn identical_sequences_are_all_unchanged() {
        let old = units(&["a", "b", "c"]);
        let new = units(&["a", "b", "c"]);
        let script = diff(&old, &new, &DiffParams::default());
        assert!(script.iter().all(|u| matches!(u, DiffUnit::Unchanged { .. })));
    }

    #[test]
    fn disjoint_sequences_are_all_changed() {
        let old = units(&["a", "b"]);
        let new = units(&["x", "y", "z"]);
        let script = diff(&old, &new, &DiffParams::default());
        assert_valid_edit_script(&old, &new, &script);
        assert!(script.iter().all(|u| !matches!(u, DiffUnit::Unchanged { .. })));
    }

    #[test]
    fn fragmentation_preserves_invariants() {
        let old: Vec<Unit> = (0..50u64)
            .map(|i| Unit::new(i, format!("line{}", i % 7)))
            .collect();
        let new: Vec<Unit> = (0..60u64)
            .map(|i| Unit::new(i, format!("line{}", (i + 1) % 7)))
            .collect();
        let params = DiffParams {
            max_matrix_width: 8,
            ..DiffParams::default()
        };
        let script = diff(&old, &new, &params);
        assert_valid_edit_script(&old, &new, &script);
    }

    #[test]
    fn emit_unchanged_off_drops_unchanged_units() {
        let old = units(&["a", "b", "c"]);
        let new = units(&["a", "x", "c"]);
        let params = DiffParams {
            emit_unchanged: false,
            ..DiffParams::default()
        };
        let script = diff(&old, &new, &params);
        assert!(!script.iter().any(|u| matches!(u, DiffUnit::Unchanged { .. })));
    }

    #[test]
    fn unchanged_carries_new_side_seq_nr() {
        let old = vec![Unit::new(100, b"same".to_vec())];
        let new = vec![Unit::new(200, b"same".to_vec())];
        let script = diff(&old, &new, &DiffParams::default());
        match &script[..] {
            [DiffUnit::Unchanged {
                old_seq_nr,
                new_seq_nr,
                ..
            }] => {
                assert_eq!(*old_seq_nr, 100);
                assert_eq!(*new_seq_nr, 200);
            }
            other => panic!("unexpected script: {other:?}"),
        }
    }

    #[test]
    fn html_debug_sink_renders_a_table() {
        let old = units(&["a", "b"]);
        let new = units(&["a", "c"]);
        let html = render_dp_matrix_html(&old, &new, &DiffParams::default());
        assert!(html.contains("<table"));
    }
}
