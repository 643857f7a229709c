// ConvStream - core/topic.rs
//
// Hierarchical topic patterns for bus subscriptions.
//
// Topics are `.`-separated segments (`conversation.blocker`).
// In a pattern, `*` matches exactly one segment and `#` matches zero or more
// trailing segments; `#` is only meaningful as the last segment.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    One,
    Rest,
}

/// A compiled subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Compile a pattern. Any `#` after the first one is treated as the end of
    /// the pattern, so `a.#.b` behaves like `a.#`.
    pub fn new(pattern: &str) -> Self {
        let mut segments = Vec::new();
        for part in pattern.trim().split('.') {
            match part {
                "#" => {
                    segments.push(Segment::Rest);
                    break;
                }
                "*" => segments.push(Segment::One),
                lit => segments.push(Segment::Literal(lit.to_string())),
            }
        }
        Self {
            raw: pattern.trim().to_string(),
            segments,
        }
    }

    /// Pattern that matches every topic.
    pub fn all() -> Self {
        Self::new("#")
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns true if `topic` matches this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split('.').collect();
        let mut i = 0;
        for seg in &self.segments {
            match seg {
                Segment::Rest => return true,
                Segment::One => {
                    if i >= parts.len() {
                        return false;
                    }
                }
                Segment::Literal(lit) => {
                    if parts.get(i) != Some(&lit.as_str()) {
                        return false;
                    }
                }
            }
            i += 1;
        }
        i == parts.len()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for TopicPattern {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
