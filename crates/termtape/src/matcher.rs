//! C4: build normalized matching keys from context + stdin, and the
//! pluggable command/stdin matchers used to resolve bucket-key collisions.

use std::collections::HashSet;
use std::fmt;

use crate::normalize;

/// Snapshot of the session state a match is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingContext {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: String,
    pub prompt: Option<String>,
}

/// The exact key used for the primary index lookup:
/// `(command_tuple, env_items_sorted, cwd, normalized_prompt, normalized_stdin)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub command_tuple: Vec<String>,
    pub env_items: Vec<(String, String)>,
    pub cwd: String,
    pub normalized_prompt: String,
    pub normalized_stdin: Vec<u8>,
}

/// The coarse key used to enumerate fallback candidates on an exact miss:
/// `(program, cwd, normalized_prompt)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub program: String,
    pub cwd: String,
    pub normalized_prompt: String,
}

/// Positional/literal argument ignore-list, applied before the command
/// tuple enters a key.
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    pub allow_env: HashSet<String>,
    pub ignore_env: HashSet<String>,
    pub ignore_args: HashSet<String>,
}

impl KeyBuilder {
    fn command_tuple(&self, program: &str, args: &[String]) -> Vec<String> {
        std::iter::once(program.to_string())
            .chain(args.iter().filter(|a| !self.ignore_args.contains(*a)).cloned())
            .collect()
    }

    fn normalized_env(&self, env: &[(String, String)]) -> Vec<(String, String)> {
        let mut filtered = normalize::filter_env(env, &self.allow_env, &self.ignore_env);
        filtered.sort_by(|a, b| a.0.cmp(&b.0));
        filtered
    }

    fn normalized_prompt(&self, prompt: Option<&str>) -> String {
        normalize::strip_ansi(prompt.unwrap_or(""))
    }

    fn normalized_stdin(&self, stdin: &[u8]) -> Vec<u8> {
        strip_trailing_crlf(stdin)
    }

    /// Build the exact match key for `ctx` sending `stdin`.
    pub fn build_key(&self, ctx: &MatchingContext, stdin: &[u8]) -> MatchKey {
        MatchKey {
            command_tuple: self.command_tuple(&ctx.program, &ctx.args),
            env_items: self.normalized_env(&ctx.env),
            cwd: ctx.cwd.clone(),
            normalized_prompt: self.normalized_prompt(ctx.prompt.as_deref()),
            normalized_stdin: self.normalized_stdin(stdin),
        }
    }

    /// Build the coarse bucket key for `ctx`.
    pub fn bucket_key(&self, ctx: &MatchingContext) -> BucketKey {
        BucketKey {
            program: ctx.program.clone(),
            cwd: ctx.cwd.clone(),
            normalized_prompt: self.normalized_prompt(ctx.prompt.as_deref()),
        }
    }
}

fn strip_trailing_crlf(bytes: &[u8]) -> Vec<u8> {
    let mut end = bytes.len();
    while end > 0 && (bytes[end - 1] == b'\n' || bytes[end - 1] == b'\r') {
        end -= 1;
    }
    bytes[..end].to_vec()
}

/// A candidate pulled from a bucket, to be confirmed by the stdin/command
/// matchers.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub command: &'a [String],
    pub env: &'a [(String, String)],
    pub stdin: &'a [u8],
}

/// Compares recorded stdin against the stdin of the current send.
pub trait StdinMatcher: fmt::Debug {
    fn matches(&self, expected: &[u8], actual: &[u8], ctx: &MatchingContext) -> bool;
}

/// Compares recorded command tuples against the current program+args.
pub trait CommandMatcher: fmt::Debug {
    fn matches(&self, expected: &[String], actual: &[String], ctx: &MatchingContext) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStdinMatcher;

impl StdinMatcher for DefaultStdinMatcher {
    /// Equal after trimming trailing CRLF from both sides.
    fn matches(&self, expected: &[u8], actual: &[u8], _ctx: &MatchingContext) -> bool {
        strip_trailing_crlf(expected) == strip_trailing_crlf(actual)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCommandMatcher;

impl CommandMatcher for DefaultCommandMatcher {
    /// Equal, element-wise, after `strip_ansi` -> `scrub` -> `collapse_ws`.
    fn matches(&self, expected: &[String], actual: &[String], _ctx: &MatchingContext) -> bool {
        if expected.len() != actual.len() {
            return false;
        }
        expected
            .iter()
            .zip(actual.iter())
            .all(|(e, a)| normalize_command_part(e) == normalize_command_part(a))
    }
}

fn normalize_command_part(s: &str) -> String {
    normalize::collapse_ws(&normalize::scrub(&normalize::strip_ansi(s)))
}
