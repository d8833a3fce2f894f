//! Bounded, boundary-respecting summaries of phase output.
//!
//! A summary is a list of `- <unit>\n` lines. Units are the top-level list
//! items of the full output (`-`, `*`, `+` or `1.` / `1)` at column 0), or
//! its sentences when there are none. The summary never exceeds
//! `floor(fraction * full.len())` bytes and always ends after a complete
//! unit or a complete sentence.

use regex::Regex;
use std::sync::LazyLock;

use crate::flow_config::SummarySection;

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryPolicy {
    pub fraction: f64,
    pub max_findings: usize,
}

impl SummaryPolicy {
    /// Byte budget for a summary of `full_len` bytes, rounded down.
    pub fn budget(&self, full_len: usize) -> usize {
        (full_len as f64 * self.fraction).floor() as usize
    }
}

impl Default for SummaryPolicy {
    fn default() -> Self {
        SummarySection::default().into()
    }
}

impl From<SummarySection> for SummaryPolicy {
    fn from(section: SummarySection) -> Self {
        Self {
            fraction: section.fraction,
            max_findings: section.max_findings,
        }
    }
}

static LIST_ITEM_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*+]|\d{1,3}[.)])\s+(\S.*)$").unwrap());

/// Top-level findings in document order.
pub fn extract_findings(full: &str) -> Vec<String> {
    full.lines()
        .filter_map(|line| LIST_ITEM_REGEX.captures(line))
        .filter_map(|caps| caps.get(1))
        .map(|m| normalize(m.as_str()))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Sentences of the prose, skipping headings and code fences.
pub fn split_sentences(full: &str) -> Vec<String> {
    let prose: String = full
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("```"))
        .collect::<Vec<_>>()
        .join(" ");

    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = prose.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if is_terminator(*b) && bytes.get(i + 1).is_none_or(|n| n.is_ascii_whitespace()) {
            let sentence = normalize(&prose[start..=i]);
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = i + 1;
        }
    }
    let tail = normalize(&prose[start..]);
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Build the summary of `full` under `policy`.
pub fn summarize(full: &str, policy: &SummaryPolicy) -> String {
    let budget = policy.budget(full.len());
    if budget == 0 {
        return String::new();
    }

    let mut units = extract_findings(full);
    if units.is_empty() {
        units = split_sentences(full);
    }

    let mut summary = String::new();
    for unit in units.into_iter().take(policy.max_findings) {
        let line = format!("- {}\n", unit);
        if summary.len() + line.len() <= budget {
            summary.push_str(&line);
            continue;
        }
        // Fit whatever complete sentences of this unit still fit, then stop.
        let room = budget.saturating_sub(summary.len() + "- \n".len());
        if let Some(prefix) = sentence_prefix(&unit, room) {
            summary.push_str("- ");
            summary.push_str(prefix);
            summary.push('\n');
        }
        break;
    }
    summary
}

/// Longest prefix of `unit` ending at a sentence boundary and at most `max` bytes.
fn sentence_prefix(unit: &str, max: usize) -> Option<&str> {
    let bytes = unit.as_bytes();
    let limit = max.min(bytes.len());
    (0..limit)
        .rev()
        .find(|&i| {
            is_terminator(bytes[i]) && bytes.get(i + 1).is_none_or(|n| n.is_ascii_whitespace())
        })
        .map(|i| &unit[..=i])
}

fn is_terminator(b: u8) -> bool {
    matches!(b, b'.' | b'!' | b'?')
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
