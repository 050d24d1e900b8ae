//! Topic-style binding patterns.
//!
//! Routing keys are dot-separated words (e.g. `"eu.create"`). Patterns use AMQP
//! topic wildcards:
//! - `*` matches exactly one word
//! - `#` matches zero or more words
//!
//! The empty routing key has zero words, so `#` matches it.

const WORD_SEPARATOR: char = '.';
const WILDCARD_ONE: &str = "*";
const WILDCARD_ANY: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("wildcard must be a whole word in pattern '{pattern}' (word '{word}')")]
    PartialWildcard { pattern: String, word: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    One,
    Any,
}

/// A parsed binding pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPattern {
    segments: Vec<Segment>,
    original: String,
}

impl RoutingPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, PatternError> {
        let original = pattern.into();
        let mut segments = Vec::new();
        for word in words(&original) {
            let segment = match word {
                WILDCARD_ONE => Segment::One,
                WILDCARD_ANY => Segment::Any,
                w if w.contains('*') || w.contains('#') => {
                    return Err(PatternError::PartialWildcard {
                        pattern: original.clone(),
                        word: w.to_string(),
                    });
                }
                w => Segment::Literal(w.to_string()),
            };
            segments.push(segment);
        }
        Ok(Self { segments, original })
    }

    /// Pattern matching every routing key.
    pub fn any() -> Self {
        Self {
            segments: vec![Segment::Any],
            original: WILDCARD_ANY.to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        let key: Vec<&str> = words(routing_key).collect();
        match_segments(&self.segments, &key)
    }
}

impl std::fmt::Display for RoutingPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.original)
    }
}

fn words(s: &str) -> impl Iterator<Item = &str> {
    // An empty key has no words rather than one empty word.
    s.split(WORD_SEPARATOR).filter(move |_| !s.is_empty())
}

fn match_segments(pattern: &[Segment], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((Segment::Any, rest)) => (0..=key.len()).any(|skip| match_segments(rest, &key[skip..])),
        Some((Segment::One, rest)) => !key.is_empty() && match_segments(rest, &key[1..]),
        Some((Segment::Literal(word), rest)) => {
            key.first().is_some_and(|k| *k == word.as_str()) && match_segments(rest, &key[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(s: &str) -> RoutingPattern {
        RoutingPattern::new(s).unwrap()
    }

    #[test]
    fn hash_matches_everything() {
        let p = pattern("#");
        assert!(p.matches(""));
        assert!(p.matches("create"));
        assert!(p.matches("eu.west.create"));
        assert_eq!(p, RoutingPattern::any());
    }

    #[test]
    fn star_matches_one_word() {
        let p = pattern("orders.*");
        assert!(p.matches("orders.created"));
        assert!(!p.matches("orders"));
        assert!(!p.matches("orders.us.created"));
    }

    #[test]
    fn hash_in_the_middle() {
        let p = pattern("orders.#.created");
        assert!(p.matches("orders.created"));
        assert!(p.matches("orders.us.east.created"));
        assert!(!p.matches("orders.us.deleted"));
    }

    #[test]
    fn literal_pattern_is_exact() {
        let p = pattern("widget.read");
        assert!(p.matches("widget.read"));
        assert!(!p.matches("widget.readx"));
        assert!(!p.matches("widget"));
        assert!(!p.matches(""));
    }

    #[test]
    fn empty_pattern_matches_only_empty_key() {
        let p = pattern("");
        assert!(p.matches(""));
        assert!(!p.matches("a"));
    }

    #[test]
    fn partial_wildcard_rejected() {
        let err = RoutingPattern::new("orders.cre*").unwrap_err();
        assert!(matches!(err, PatternError::PartialWildcard { ref word, .. } if word == "cre*"));
        assert!(RoutingPattern::new("a#").is_err());
    }
}
