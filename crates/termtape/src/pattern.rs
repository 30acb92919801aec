//! Shared pattern-matching vocabulary for the expect loop, used by both the
//! live [`crate::session::Session`] and the [`crate::replay::ReplayTransport`].

use regex::Regex;

use crate::error::CoreError;
use crate::error::Result;

/// One entry in a pattern set passed to `expect`/`expect_exact`.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Matches when the deadline is reached instead of raising.
    Timeout,
    /// Matches when the stream has closed (child exited / transport closed).
    Eof,
    /// Regular-expression match against UTF-8-decoded buffer content.
    Regex(String, Regex),
    /// Exact byte-literal match.
    Literal(Vec<u8>),
}

impl Pattern {
    pub fn regex(source: &str) -> Result<Self> {
        let re = Regex::new(source).map_err(|e| CoreError::session(format!("bad pattern regex: {e}")))?;
        Ok(Pattern::Regex(source.to_string(), re))
    }

    pub fn literal(bytes: impl Into<Vec<u8>>) -> Self {
        Pattern::Literal(bytes.into())
    }

    pub fn describe(&self) -> String {
        match self {
            Pattern::Timeout => "TIMEOUT".to_string(),
            Pattern::Eof => "EOF".to_string(),
            Pattern::Regex(src, _) => src.clone(),
            Pattern::Literal(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// A successful match: which pattern matched and the buffer split around it.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub index: usize,
    pub before: Vec<u8>,
    /// The bytes of the pattern itself (empty for `Eof`, which consumes
    /// nothing).
    pub matched: Vec<u8>,
    pub after: Vec<u8>,
}

/// Try to match `patterns` (in declaration order) against `buffer`.
/// `closed` indicates the stream is known to have ended, enabling `Eof`
/// patterns to match. `Timeout` patterns never match here; the caller
/// consults them only once its own deadline has elapsed. Literal and regex
/// patterns are always tried against the whole buffer (non-exact mode
/// decodes the buffer as UTF-8 best-effort for regex matching; exact mode
/// restricts candidates to `Literal`).
pub fn scan(buffer: &[u8], patterns: &[Pattern], closed: bool, exact_only: bool) -> Option<MatchOutcome> {
    let text = String::from_utf8_lossy(buffer);
    for (index, pattern) in patterns.iter().enumerate() {
        match pattern {
            Pattern::Timeout => continue,
            Pattern::Eof => {
                if closed {
                    return Some(MatchOutcome {
                        index,
                        before: buffer.to_vec(),
                        matched: Vec::new(),
                        after: Vec::new(),
                    });
                }
            }
            Pattern::Regex(_, re) => {
                if exact_only {
                    continue;
                }
                if let Some(m) = re.find(&text) {
                    return Some(MatchOutcome {
                        index,
                        before: text[..m.start()].as_bytes().to_vec(),
                        matched: m.as_str().as_bytes().to_vec(),
                        after: text[m.end()..].as_bytes().to_vec(),
                    });
                }
            }
            Pattern::Literal(lit) => {
                if let Some(pos) = find_subslice(buffer, lit) {
                    return Some(MatchOutcome {
                        index,
                        before: buffer[..pos].to_vec(),
                        matched: lit.clone(),
                        after: buffer[pos + lit.len()..].to_vec(),
                    });
                }
            }
        }
    }
    None
}

/// Index of the `Timeout` sentinel in `patterns`, if any.
pub fn timeout_index(patterns: &[Pattern]) -> Option<usize> {
    patterns.iter().position(|p| matches!(p, Pattern::Timeout))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_matches_literal_and_splits_buffer() {
        let patterns = vec![Pattern::literal("ok")];
        let outcome = scan(b"prefix ok suffix", &patterns, false, false).expect("match");
        assert_eq!(outcome.index, 0);
        assert_eq!(outcome.before, b"prefix ".to_vec());
        assert_eq!(outcome.after, b" suffix".to_vec());
    }

    #[test]
    fn scan_matches_regex_in_declaration_order() {
        let patterns = vec![Pattern::regex("zzz").expect("re"), Pattern::regex(r"\d+").expect("re")];
        let outcome = scan(b"value 42", &patterns, false, false).expect("match");
        assert_eq!(outcome.index, 1);
    }

    #[test]
    fn scan_eof_only_matches_when_closed() {
        let patterns = vec![Pattern::Eof];
        assert!(scan(b"anything", &patterns, false, false).is_none());
        assert!(scan(b"anything", &patterns, true, false).is_some());
    }

    #[test]
    fn scan_exact_mode_ignores_regex_patterns() {
        let patterns = vec![Pattern::regex(r"\d+").expect("re")];
        assert!(scan(b"42", &patterns, false, true).is_none());
    }

    #[test]
    fn timeout_index_finds_sentinel() {
        let patterns = vec![Pattern::literal("a"), Pattern::Timeout];
        assert_eq!(timeout_index(&patterns), Some(1));
    }
}
