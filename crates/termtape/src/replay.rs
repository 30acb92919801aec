//! C6: stands in for the live PTY child during replay. Exposes the same
//! send/expect/expect_exact/read_nonblocking/is_alive/close vocabulary the
//! session drives either a real child or this transport through.

use std::time::Duration;
use std::time::Instant;

use crate::decorators::ErrorPolicy;
use crate::decorators::LatencyPolicy;
use crate::decorators::NeverInjectError;
use crate::error::CoreError;
use crate::error::Result;
use crate::matcher::CommandMatcher;
use crate::matcher::DefaultCommandMatcher;
use crate::matcher::DefaultStdinMatcher;
use crate::matcher::KeyBuilder;
use crate::matcher::MatchingContext;
use crate::matcher::StdinMatcher;
use crate::pattern::MatchOutcome;
use crate::pattern::Pattern;
use crate::store::TapeStore;

/// Loop spacing while polling the virtual buffer for a match, mirroring the
/// live session's `read_nonblocking` polling cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct ReplayTransport {
    buffer: Vec<u8>,
    pub before: Vec<u8>,
    pub matched: Vec<u8>,
    pub after: Vec<u8>,
    pub exitstatus: Option<i32>,
    pub signalstatus: Option<i32>,
    closed: bool,
    key_builder: KeyBuilder,
    stdin_matcher: Box<dyn StdinMatcher>,
    command_matcher: Box<dyn CommandMatcher>,
    latency_override: Option<Box<dyn LatencyPolicy>>,
    error_policy: Box<dyn ErrorPolicy>,
}

impl ReplayTransport {
    pub fn new(key_builder: KeyBuilder) -> Self {
        Self {
            buffer: Vec::new(),
            before: Vec::new(),
            matched: Vec::new(),
            after: Vec::new(),
            exitstatus: None,
            signalstatus: None,
            closed: false,
            key_builder,
            stdin_matcher: Box::new(DefaultStdinMatcher),
            command_matcher: Box::new(DefaultCommandMatcher),
            latency_override: None,
            error_policy: Box::new(NeverInjectError),
        }
    }

    pub fn with_stdin_matcher(mut self, matcher: Box<dyn StdinMatcher>) -> Self {
        self.stdin_matcher = matcher;
        self
    }

    pub fn with_command_matcher(mut self, matcher: Box<dyn CommandMatcher>) -> Self {
        self.command_matcher = matcher;
        self
    }

    pub fn with_latency_override(mut self, policy: Option<Box<dyn LatencyPolicy>>) -> Self {
        self.latency_override = policy;
        self
    }

    pub fn with_error_policy(mut self, policy: Box<dyn ErrorPolicy>) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn is_alive(&self) -> bool {
        !self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
        if self.exitstatus.is_none() {
            self.exitstatus = Some(0);
        }
    }

    /// Find the matching exchange, stream its chunks into the virtual
    /// buffer with (possibly overridden) inter-chunk delays, and update
    /// exit status if the exchange carries one.
    pub async fn send(&mut self, store: &mut TapeStore, ctx: &MatchingContext, data: &[u8]) -> Result<()> {
        let matches = store.find_matches(
            &self.key_builder,
            ctx,
            data,
            self.stdin_matcher.as_ref(),
            self.command_matcher.as_ref(),
        );
        if matches.is_empty() {
            return Err(CoreError::tape_miss(preview(data)));
        }
        let (tape_idx, exchange_idx) = matches[0];
        let path = store.paths[tape_idx].clone();
        store.mark_used(&path);
        let exchange = store.tapes[tape_idx].exchanges[exchange_idx].clone();

        for chunk in &exchange.output {
            let delay_ms = match &self.latency_override {
                Some(policy) => policy.resolve_ms(ctx),
                None => chunk.delay_ms,
            };
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            self.buffer.extend_from_slice(&chunk.decode());
        }

        if self.error_policy.should_inject(ctx) {
            return Err(CoreError::tape_miss("synthetic error injection after stream"));
        }

        if let Some(exit) = exchange.exit {
            self.exitstatus = exit.code;
            self.signalstatus = exit.signal;
            self.closed = true;
        }
        Ok(())
    }

    /// Scan the virtual buffer for a pattern match, polling until `timeout`
    /// elapses. Returns `Ok(None)` when a `TIMEOUT` sentinel absorbed the
    /// deadline; `Err(CoreError::Timeout)` is left for the caller to raise
    /// with its own "recent output" context since that's a session-level
    /// concern.
    pub async fn expect(&mut self, patterns: &[Pattern], timeout: Duration, exact_only: bool) -> Option<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = crate::pattern::scan(&self.buffer, patterns, self.closed, exact_only) {
                self.apply_outcome(&outcome);
                return Some(outcome.index);
            }
            if Instant::now() >= deadline {
                return crate::pattern::timeout_index(patterns);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn apply_outcome(&mut self, outcome: &MatchOutcome) {
        self.before = outcome.before.clone();
        self.matched = outcome.matched.clone();
        self.after = outcome.after.clone();
    }

    /// Non-blocking read of up to `size` bytes currently buffered.
    pub fn read_nonblocking(&mut self, size: usize) -> Vec<u8> {
        let take = size.min(self.buffer.len());
        self.buffer.drain(..take).collect()
    }
}

fn preview(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    text.chars().take(64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::model::Chunk;
    use crate::tape::model::Exchange;
    use crate::tape::model::ExchangePre;
    use crate::tape::model::Input;
    use crate::tape::model::Tape;
    use crate::tape::model::TapeMeta;
    use crate::tape::model::TapeSession;
    use crate::tape::model::RangedValue;

    fn seeded_store() -> (tempfile::TempDir, TapeStore) {
        let dir = tempfile::tempdir().expect("tmpdir");
        let mut store = TapeStore::new(dir.path());
        let mut exch = Exchange::new(
            ExchangePre {
                prompt: Some("$ ".to_string()),
            },
            Input::Line("status\n".to_string()),
        );
        exch.output.push(Chunk::new(0, b"ok\n"));
        let tape = Tape {
            meta: TapeMeta {
                created_at: chrono::Utc::now(),
                program: "demo".to_string(),
                args: vec![],
                env: vec![],
                cwd: "/tmp".to_string(),
                pty: None,
                tag: None,
                latency: RangedValue::Fixed(0.0),
                error_rate: RangedValue::Fixed(0.0),
                seed: None,
            },
            session: TapeSession {
                platform: "linux".to_string(),
                version: "0.1.0".to_string(),
            },
            exchanges: vec![exch],
        };
        store.tapes.push(tape);
        store.paths.push(dir.path().join("t1.json5"));
        store.build_index(&KeyBuilder::default());
        (dir, store)
    }

    fn ctx() -> MatchingContext {
        MatchingContext {
            program: "demo".to_string(),
            args: vec![],
            env: vec![],
            cwd: "/tmp".to_string(),
            prompt: Some("$ ".to_string()),
        }
    }

    #[tokio::test]
    async fn send_miss_raises_tape_miss() {
        let (_dir, mut store) = seeded_store();
        let mut transport = ReplayTransport::new(KeyBuilder::default());
        let err = transport.send(&mut store, &ctx(), b"unknown\n").await.unwrap_err();
        assert!(matches!(err, CoreError::TapeMiss { .. }));
    }

    #[tokio::test]
    async fn send_then_expect_resolves_recorded_output() {
        let (_dir, mut store) = seeded_store();
        let mut transport = ReplayTransport::new(KeyBuilder::default());
        transport.send(&mut store, &ctx(), b"status\n").await.expect("send matches");
        let idx = transport
            .expect(&[Pattern::literal("ok")], Duration::from_millis(200), false)
            .await;
        assert_eq!(idx, Some(0));
    }

    #[tokio::test]
    async fn two_replays_of_same_input_are_byte_identical() {
        let (_dir1, mut store1) = seeded_store();
        let (_dir2, mut store2) = seeded_store();
        let mut t1 = ReplayTransport::new(KeyBuilder::default());
        let mut t2 = ReplayTransport::new(KeyBuilder::default());
        t1.send(&mut store1, &ctx(), b"status\n").await.expect("send1");
        t2.send(&mut store2, &ctx(), b"status\n").await.expect("send2");
        assert_eq!(t1.read_nonblocking(1024), t2.read_nonblocking(1024));
    }

    #[tokio::test]
    async fn timeout_sentinel_absorbs_deadline_without_error() {
        let mut transport = ReplayTransport::new(KeyBuilder::default());
        let idx = transport
            .expect(&[Pattern::literal("nope"), Pattern::Timeout], Duration::from_millis(20), false)
            .await;
        assert_eq!(idx, Some(1));
    }
}
