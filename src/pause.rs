//! Detection of output that means "this program is blocked waiting for a key".
//!
//! Only one-shot pipe executions are inspected. The rule set is data: each
//! rule is a regex plus a confidence, and a detector only reports matches at
//! or above its threshold. Adding support for a new tool is adding a rule.

use regex::Regex;

/// Confidence at or above which a rule match pauses the process.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

#[derive(Debug, Clone)]
pub struct PauseRule {
    pub name: &'static str,
    pub pattern: Regex,
    pub confidence: f32,
}

impl PauseRule {
    pub fn new(name: &'static str, pattern: &str, confidence: f32) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            pattern: Regex::new(pattern)?,
            confidence,
        })
    }
}

/// A chunk that matched one of the rules.
#[derive(Debug, Clone, PartialEq)]
pub struct PauseMatch {
    pub rule: &'static str,
    pub confidence: f32,
    /// The output line holding the prompt, as the program printed it.
    pub prompt: String,
}

const STANDARD_RULES: &[(&str, &str, f32)] = &[
    ("press-any-key", r"(?i)press\s+any\s+key", 0.95),
    ("more-marker", r"--\s*More\s*--", 0.95),
    ("continue-question", r"(?i)\b(continue|proceed)\b[^\n]*\?\s*(\[[yn]/[yn]\]|\([yn]/[yn]\))?\s*:?\s*$", 0.9),
    ("yes-no-choice", r"(?i)[\(\[]\s*y(es)?\s*/\s*n(o)?\s*[\)\]]\s*[:?]?\s*$", 0.9),
    ("press-return", r"(?i)(press|hit)\s+(return|enter)\b", 0.8),
    ("end-marker", r"\(END\)\s*$", 0.8),
    ("password", r"(?i)password(\s+for\s+\S+)?\s*:\s*$", 0.7),
    ("any-key-zh", r"(請)?按任[意一]鍵", 0.95),
    ("continue-zh", r"是否繼續", 0.9),
    ("any-key-zh-hans", r"(请)?按任[意一]键", 0.95),
    ("continue-zh-hans", r"是否继续", 0.9),
    // less' bare ':' prompt; too common in ordinary output to act on alone
    ("pager-colon", r"(?m)^:\s*$", 0.4),
];

#[derive(Debug, Clone)]
pub struct PauseDetector {
    rules: Vec<PauseRule>,
    threshold: f32,
}

impl Default for PauseDetector {
    fn default() -> Self {
        Self::standard()
    }
}

impl PauseDetector {
    pub fn empty(threshold: f32) -> Self {
        Self {
            rules: Vec::new(),
            threshold,
        }
    }

    /// The built-in rules at [`DEFAULT_THRESHOLD`].
    pub fn standard() -> Self {
        let rules = STANDARD_RULES
            .iter()
            .filter_map(|(name, pattern, confidence)| match PauseRule::new(name, pattern, *confidence) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    tracing::error!(rule = name, "invalid built-in pause pattern: {e}");
                    None
                }
            })
            .collect();
        Self {
            rules,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_rule(mut self, rule: PauseRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn matches(&self, chunk: &str) -> bool {
        self.detect(chunk).is_some()
    }

    /// Highest-confidence rule that fires on `chunk`, if it clears the
    /// threshold.
    pub fn detect(&self, chunk: &str) -> Option<PauseMatch> {
        let (rule, found) = self
            .rules
            .iter()
            .filter(|rule| rule.confidence >= self.threshold)
            .filter_map(|rule| rule.pattern.find(chunk).map(|m| (rule, m)))
            .max_by(|(a, _), (b, _)| a.confidence.total_cmp(&b.confidence))?;

        Some(PauseMatch {
            rule: rule.name,
            confidence: rule.confidence,
            prompt: enclosing_line(chunk, found.start(), found.end()).to_string(),
        })
    }
}

fn enclosing_line(text: &str, start: usize, end: usize) -> &str {
    let line_start = text[..start].rfind('\n').map_or(0, |i| i + 1);
    let line_end = text[end..].find('\n').map_or(text.len(), |i| end + i);
    text[line_start..line_end].trim_end_matches('\r')
}

/// Bytes written to a paused process for a client's `pause_response`.
pub fn response_input(response: &str) -> String {
    let trimmed = response.trim();
    match trimmed.to_lowercase().as_str() {
        "yes" | "y" | "是" | "繼續" | "继续" => "y\n".to_string(),
        "no" | "n" | "否" | "停止" => "n\n".to_string(),
        "space" => " ".to_string(),
        "enter" | "" => "\n".to_string(),
        _ => format!("{trimmed}\n"),
    }
}
