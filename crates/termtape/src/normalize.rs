//! C1: pure string/byte normalization used by both the matcher and the
//! recorder's command-metadata capture. Every function here is deterministic
//! and idempotent (§8 invariant 2).

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("static ansi regex"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("static whitespace regex"));

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\d{4}-\d{2}-\d{2}[Tt ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
    )
    .expect("static timestamp regex")
});

static HEX_LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").expect("static hex literal regex"));

static HEX_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{7,40}\b").expect("static hex run regex"));

/// Remove ANSI CSI escape sequences (`ESC [ ... final_byte`).
pub fn strip_ansi(s: &str) -> String {
    ANSI_RE.replace_all(s, "").into_owned()
}

/// Coalesce runs of whitespace (including newlines) to a single space and
/// trim both ends.
pub fn collapse_ws(s: &str) -> String {
    WHITESPACE_RE.replace_all(s.trim(), " ").into_owned()
}

/// Replace known volatile substrings with stable placeholders, applied in
/// this order: ISO-8601 timestamps, `0x...` hex literals, bare 7-40
/// character hex runs.
pub fn scrub(s: &str) -> String {
    let s = TIMESTAMP_RE.replace_all(s, "<TS>");
    let s = HEX_LITERAL_RE.replace_all(&s, "<HEX>");
    HEX_RUN_RE.replace_all(&s, "<ID>").into_owned()
}

/// Keep only allow-listed env keys (if `allow` is non-empty), then drop
/// anything in `ignore`.
pub fn filter_env(
    env: &[(String, String)],
    allow: &HashSet<String>,
    ignore: &HashSet<String>,
) -> Vec<(String, String)> {
    env.iter()
        .filter(|(k, _)| allow.is_empty() || allow.contains(k))
        .filter(|(k, _)| !ignore.contains(k))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_csi_sequences() {
        let input = "\x1B[31mred\x1B[0m plain";
        assert_eq!(strip_ansi(input), "red plain");
    }

    #[test]
    fn strip_ansi_is_idempotent() {
        let input = "\x1B[1;32mhello\x1B[0m\tworld  \n";
        let once = strip_ansi(input);
        let twice = strip_ansi(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn collapse_ws_merges_and_trims() {
        assert_eq!(collapse_ws("  a\t\tb\n\nc  "), "a b c");
    }

    #[test]
    fn collapse_ws_is_idempotent() {
        let once = collapse_ws("  a\t\tb\n\nc  ");
        let twice = collapse_ws(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn scrub_replaces_timestamps_hex_and_ids() {
        let input = "at 2024-01-02T03:04:05Z addr 0xdeadBEEF commit abc1234def5678";
        let scrubbed = scrub(input);
        assert!(scrubbed.contains("<TS>"));
        assert!(scrubbed.contains("<HEX>"));
        assert!(scrubbed.contains("<ID>"));
        assert!(!scrubbed.contains("2024-01-02"));
    }

    #[test]
    fn scrub_is_idempotent() {
        let once = scrub("2024-01-02T03:04:05Z 0xFF abcdef1234567");
        let twice = scrub(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn filter_env_applies_allow_then_ignore() {
        let env = vec![
            ("PATH".to_string(), "/bin".to_string()),
            ("SECRET".to_string(), "x".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let allow: HashSet<String> = ["PATH", "SECRET", "HOME"].iter().map(|s| s.to_string()).collect();
        let ignore: HashSet<String> = ["SECRET"].iter().map(|s| s.to_string()).collect();
        let filtered = filter_env(&env, &allow, &ignore);
        assert_eq!(
            filtered,
            vec![
                ("PATH".to_string(), "/bin".to_string()),
                ("HOME".to_string(), "/root".to_string())
            ]
        );
    }

    #[test]
    fn filter_env_empty_allow_keeps_everything_but_ignored() {
        let env = vec![("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())];
        let allow = HashSet::new();
        let ignore: HashSet<String> = ["B"].iter().map(|s| s.to_string()).collect();
        let filtered = filter_env(&env, &allow, &ignore);
        assert_eq!(filtered, vec![("A".to_string(), "1".to_string())]);
    }
}
