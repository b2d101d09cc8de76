// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tiered prompt detection over a rolling window of child output bytes.
//!
//! Three layers, tried in order of descending confidence: a structured
//! (machine-readable) passthrough, regex pattern families over the
//! ANSI-stripped screen text, and a last-resort stall heuristic. The shape
//! — an ordered table of named signal bundles, each contributing to a score
//! against a threshold — follows the same pattern as the dialog-screen
//! classifier in the driver layer this was adapted from.

use regex::Regex;
use std::sync::OnceLock;

/// Kind of input a detected prompt expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    YesNo,
    ConfirmEnter,
    MultipleChoice,
    FreeText,
    Unknown,
}

impl PromptKind {
    /// The type-keyed safe default injected on TTL expiry or DENY.
    ///
    /// The yes/no default must be `"n"` — config validation rejects any
    /// attempt to override it to `"y"`.
    pub fn safe_default(&self) -> &'static str {
        match self {
            Self::YesNo => "n",
            Self::ConfirmEnter => "\n",
            Self::MultipleChoice => "1",
            Self::FreeText => "",
            Self::Unknown => "n",
        }
    }
}

/// How a detection was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMethod {
    Structured,
    Pattern,
    StallHeuristic,
}

/// Result of a detection attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub kind: PromptKind,
    pub confidence: f64,
    pub excerpt: String,
    pub choices: Vec<String>,
    pub method: DetectionMethod,
}

/// A structured, machine-readable prompt event fed by an adapter layer that
/// parses a tool's own JSON event stream, when available. Always accepted
/// at confidence 1.0.
#[derive(Debug, Clone)]
pub struct StructuredPrompt {
    pub kind: PromptKind,
    pub excerpt: String,
    pub choices: Vec<String>,
}

/// A signal-bundle family: a prompt kind, its base confidence, and the
/// compiled regexes that contribute to matching it.
struct PatternFamily {
    kind: PromptKind,
    base_confidence: f64,
    patterns: Vec<Regex>,
}

fn yes_no_patterns() -> &'static [&'static str] {
    &[
        r"\(y/n\)",
        r"\[y/n\]",
        r"\(yes/no\)",
        r"(proceed|continue|confirm|delete|overwrite|install)\??\s*\[y/n\]",
        r"press y to continue",
        r"type y or n",
    ]
}

fn confirm_enter_patterns() -> &'static [&'static str] {
    &[
        r"press (enter|return) to (continue|proceed)",
        r"\[press enter\]",
        r"-- more --",
    ]
}

fn multiple_choice_patterns() -> &'static [&'static str] {
    &[
        r"enter your choice\s*\[1-\d+\]",
        r"select an option\s*\(\d+-\d+\)",
        r"which .* do you want",
    ]
}

fn free_text_patterns() -> &'static [&'static str] {
    &[
        r"enter [a-z ]+:\s*$",
        r"password:\s*$",
        r"passphrase:\s*$",
        r"^[a-z ]{2,20}:\s*$",
        r">\s*$",
    ]
}

fn compile_all(patterns: &'static [&'static str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("static pattern must compile"))
        .collect()
}

fn families() -> &'static [PatternFamily] {
    static FAMILIES: OnceLock<Vec<PatternFamily>> = OnceLock::new();
    FAMILIES.get_or_init(|| {
        vec![
            PatternFamily {
                kind: PromptKind::YesNo,
                base_confidence: 0.85,
                patterns: compile_all(yes_no_patterns()),
            },
            PatternFamily {
                kind: PromptKind::ConfirmEnter,
                base_confidence: 0.80,
                patterns: compile_all(confirm_enter_patterns()),
            },
            PatternFamily {
                kind: PromptKind::MultipleChoice,
                base_confidence: 0.75,
                patterns: compile_all(multiple_choice_patterns()),
            },
            PatternFamily {
                kind: PromptKind::FreeText,
                base_confidence: 0.65,
                patterns: compile_all(free_text_patterns()),
            },
        ]
    })
}

fn ansi_csi() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[mGKHFABCD]").expect("static regex"))
}

/// Strip ANSI CSI sequences, carriage returns, and backspaces from raw
/// terminal output, leaving plain text suitable for pattern matching.
pub fn strip_ansi(input: &str) -> String {
    let without_csi = ansi_csi().replace_all(input, "");
    without_csi.chars().filter(|&c| c != '\r' && c != '\u{8}').collect()
}

/// Extract numbered choice lines (`1) foo`, `2. bar`, …), sorted by number,
/// capped at 9 entries.
fn extract_choices(text: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?m)^\s*(\d+)[).]\s+(.+)$").expect("static regex"));

    let mut pairs: Vec<(u32, String)> = re
        .captures_iter(text)
        .filter_map(|c| {
            let n: u32 = c.get(1)?.as_str().parse().ok()?;
            let text = c.get(2)?.as_str().trim().to_owned();
            Some((n, text))
        })
        .collect();
    pairs.sort_by_key(|(n, _)| *n);
    pairs.truncate(9);
    pairs.into_iter().map(|(_, text)| text).collect()
}

/// Default minimum confidence for a detection to count as "detected".
pub const DEFAULT_THRESHOLD: f64 = 0.65;

pub struct Detector {
    threshold: f64,
}

impl Detector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Tier 1: accept a structured prompt verbatim at confidence 1.0.
    pub fn detect_structured(&self, prompt: StructuredPrompt) -> DetectionResult {
        DetectionResult {
            kind: prompt.kind,
            confidence: 1.0,
            excerpt: prompt.excerpt,
            choices: prompt.choices,
            method: DetectionMethod::Structured,
        }
    }

    /// Tier 2: evaluate pattern families against the ANSI-stripped buffer.
    /// Families are tried in priority order (yes/no, confirm-enter,
    /// multiple-choice, free-text); the first family with any hit wins.
    pub fn detect_patterns(&self, raw: &str) -> Option<DetectionResult> {
        let text = strip_ansi(raw);

        for family in families() {
            let hits = family.patterns.iter().filter(|re| re.is_match(&text)).count();
            if hits == 0 {
                continue;
            }

            let confidence = (family.base_confidence + 0.05 * (hits.saturating_sub(1) as f64)).min(0.99);
            if confidence < self.threshold {
                continue;
            }

            let choices = if matches!(family.kind, PromptKind::MultipleChoice) {
                extract_choices(&text)
            } else {
                Vec::new()
            };

            let excerpt = excerpt_of(&text);

            return Some(DetectionResult {
                kind: family.kind,
                confidence,
                excerpt,
                choices,
                method: DetectionMethod::Pattern,
            });
        }

        None
    }

    /// Tier 3: a last-resort classification when no output has been seen
    /// for the configured stall timeout. Advisory only — confidence 0.60
    /// never clears the default threshold on its own, so policy must
    /// explicitly opt into accepting low-confidence prompts for this to
    /// ever route anywhere.
    pub fn detect_stall(&self, raw: &str) -> DetectionResult {
        let text = strip_ansi(raw);
        DetectionResult {
            kind: PromptKind::Unknown,
            confidence: 0.60,
            excerpt: excerpt_of(&text),
            choices: Vec::new(),
            method: DetectionMethod::StallHeuristic,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

/// Trailing non-empty lines of `text`, joined, truncated for display.
fn excerpt_of(text: &str) -> String {
    let tail: String = text
        .lines()
        .rev()
        .take(3)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n");
    const MAX_EXCERPT_CHARS: usize = 500;
    if tail.chars().count() > MAX_EXCERPT_CHARS {
        tail.chars().take(MAX_EXCERPT_CHARS).collect()
    } else {
        tail
    }
}

#[cfg(test)]
#[path = "detector_tests.rs"]
mod tests;
