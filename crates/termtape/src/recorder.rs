//! C5: tee child output into per-exchange chunks, stage exchanges at each
//! boundary, and reconcile them against the tape store at session close.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use crate::decorators::TapeDecorator;
use crate::error::Result;
use crate::matcher::KeyBuilder;
use crate::matcher::MatchKey;
use crate::matcher::MatchingContext;
use crate::store::ExchangeRef;
use crate::store::TapeStore;
use crate::tape::model::Chunk;
use crate::tape::model::Exchange;
use crate::tape::model::ExchangePre;
use crate::tape::model::ExitInfo;
use crate::tape::model::Input;
use crate::tape::model::PtyGeometry;
use crate::tape::model::RangedValue;
use crate::tape::model::Tape;
use crate::tape::model::TapeMeta;
use crate::tape::model::TapeSession;

/// How staged exchanges are reconciled with the store at `finalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    /// Existing keys are left untouched; only novel exchanges are written.
    New,
    /// Existing keys are replaced in place; novel exchanges still land in
    /// a new tape.
    Overwrite,
    /// No recorder is attached; this variant exists so callers can
    /// represent "not recording" without an `Option<Recorder>`.
    Disabled,
}

/// Generates a deterministic tape path for a brand-new tape: a short hash
/// of the program, the first input's preview, and a millisecond seed.
pub trait TapeNameGenerator: std::fmt::Debug + Send + Sync {
    fn generate(&self, tapes_root: &std::path::Path, program: &str, first_input_preview: &str, millis: u64) -> PathBuf;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTapeNameGenerator;

impl TapeNameGenerator for DefaultTapeNameGenerator {
    fn generate(&self, tapes_root: &std::path::Path, program: &str, first_input_preview: &str, millis: u64) -> PathBuf {
        let key = format!("{program}|{first_input_preview}|{millis}");
        let digest = blake3::hash(key.as_bytes());
        let short = &digest.to_hex()[..8];
        let safe_program = std::path::Path::new(program)
            .file_name()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("session");
        tapes_root
            .join(safe_program)
            .join(format!("unnamed-{short}.json5"))
    }
}

/// Tees bytes written to the output side of a session into the current
/// exchange's chunk accumulator.
#[derive(Debug, Default)]
struct ChunkSink {
    chunks: Vec<Chunk>,
    last: Option<Instant>,
}

impl ChunkSink {
    fn write(&mut self, data: &[u8]) {
        let now = Instant::now();
        let delay_ms = match self.last {
            Some(last) => now.duration_since(last).as_millis() as u64,
            None => 0,
        };
        self.last = Some(now);
        let redacted = crate::redact::redact_bytes(data);
        self.chunks.push(Chunk::new(delay_ms, &redacted));
    }

    fn reset(&mut self) {
        self.chunks.clear();
        self.last = None;
    }

    fn take(&mut self) -> Vec<Chunk> {
        std::mem::take(&mut self.chunks)
    }
}

/// Static facts about the session a recorder is attached to, supplied once
/// at construction.
#[derive(Debug, Clone)]
pub struct RecorderSessionInfo {
    pub command: String,
    pub cwd: String,
    pub env: Vec<(String, String)>,
    pub pty: Option<PtyGeometry>,
    pub latency: RangedValue,
    pub error_rate: RangedValue,
    pub platform: String,
    pub version: String,
}

struct DraftExchange {
    ctx: MatchingContext,
    input: Input,
    started_at: Instant,
}

pub struct Recorder {
    tapes_path: PathBuf,
    mode: RecordMode,
    key_builder: KeyBuilder,
    name_generator: Box<dyn TapeNameGenerator>,
    info: RecorderSessionInfo,
    sink: ChunkSink,
    draft: Option<DraftExchange>,
    pending: Vec<(MatchingContext, Exchange)>,
    /// Snapshot of the store's exact index, captured once at [`Self::start`].
    /// Finalize decisions are made against this snapshot, not a live query,
    /// so a recorder's own writes never shadow each other mid-session.
    snapshot_index: HashMap<MatchKey, ExchangeRef>,
    tape_decorator: Option<Box<dyn TapeDecorator>>,
}

impl Recorder {
    pub fn new(
        tapes_path: PathBuf,
        mode: RecordMode,
        key_builder: KeyBuilder,
        info: RecorderSessionInfo,
        name_generator: Box<dyn TapeNameGenerator>,
    ) -> Self {
        Self {
            tapes_path,
            mode,
            key_builder,
            name_generator,
            info,
            sink: ChunkSink::default(),
            draft: None,
            pending: Vec::new(),
            snapshot_index: HashMap::new(),
            tape_decorator: None,
        }
    }

    /// Apply `decorator` to every tape this recorder writes from here on.
    pub fn with_tape_decorator(mut self, decorator: Box<dyn TapeDecorator>) -> Self {
        self.tape_decorator = Some(decorator);
        self
    }

    /// Snapshot the store's exact index at recorder-start time.
    pub fn start(&mut self, store: &TapeStore) {
        self.snapshot_index.clear();
        for (tape_idx, tape) in store.tapes.iter().enumerate() {
            for (exchange_idx, exchange) in tape.exchanges.iter().enumerate() {
                let ctx = MatchingContext {
                    program: tape.meta.program.clone(),
                    args: tape.meta.args.clone(),
                    env: tape.meta.env.clone(),
                    cwd: tape.meta.cwd.clone(),
                    prompt: exchange.pre.prompt.clone(),
                };
                let stdin = exchange.input.as_bytes();
                let key = self.key_builder.build_key(&ctx, &stdin);
                self.snapshot_index.entry(key).or_insert((tape_idx, exchange_idx));
            }
        }
    }

    /// Called on every `send`: snapshot the prompt/input and start a fresh
    /// chunk sink.
    pub fn on_send(&mut self, input: Input, ctx: MatchingContext) {
        self.sink.reset();
        self.draft = Some(DraftExchange {
            ctx,
            input,
            started_at: Instant::now(),
        });
    }

    /// Called on every output write while recording, i.e. the tee point in
    /// the session's capture path.
    pub fn on_output(&mut self, data: &[u8]) {
        if self.draft.is_some() {
            self.sink.write(data);
        }
    }

    /// Called on an exchange boundary (successful expect, or child exit).
    /// No-op if there is no open draft (two expects without an intervening
    /// send): callers should not call this twice in a row without a send
    /// between, but if they do, this silently skips rather than emitting
    /// an empty-input exchange.
    pub fn on_exchange_end(&mut self, exit: Option<ExitInfo>) {
        let Some(draft) = self.draft.take() else {
            return;
        };
        let pre = ExchangePre {
            prompt: draft.ctx.prompt.clone(),
        };
        let mut exchange = Exchange::new(pre, draft.input);
        exchange.output = self.sink.take();
        exchange.exit = exit;
        exchange.dur_ms = Some(draft.started_at.elapsed().as_millis() as u64);
        self.pending.push((draft.ctx, exchange));
    }

    /// Reconcile every staged exchange against the snapshot index and
    /// write at most one new tape plus any in-place overwrites.
    pub fn finalize(&mut self, store: &mut TapeStore) -> Result<()> {
        if self.mode == RecordMode::Disabled {
            self.pending.clear();
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let mut novel: Vec<(MatchingContext, Exchange)> = Vec::new();
        for (ctx, exchange) in pending {
            let stdin = exchange.input.as_bytes();
            let key = self.key_builder.build_key(&ctx, &stdin);
            match self.snapshot_index.get(&key) {
                Some(&(tape_idx, exchange_idx)) => match self.mode {
                    RecordMode::New => { /* drop staged, keep existing */ }
                    RecordMode::Overwrite => {
                        let path = store.paths[tape_idx].clone();
                        let mut tape = store.tapes[tape_idx].clone();
                        tape.exchanges[exchange_idx] = exchange;
                        if let Some(decorator) = self.tape_decorator.as_ref() {
                            decorator.decorate(&mut tape);
                        }
                        store.write_tape(&path, &tape, false)?;
                    }
                    RecordMode::Disabled => unreachable!("checked above"),
                },
                None => novel.push((ctx, exchange)),
            }
        }
        if !novel.is_empty() {
            self.write_new_tape(store, novel)?;
        }
        Ok(())
    }

    fn write_new_tape(&self, store: &mut TapeStore, novel: Vec<(MatchingContext, Exchange)>) -> Result<()> {
        let (first_ctx, _) = &novel[0];
        let preview: String = match &novel[0].1.input {
            Input::Line(s) => s.chars().take(64).collect(),
            Input::Raw(b) => String::from_utf8_lossy(b).chars().take(64).collect(),
        };
        let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let path = self
            .name_generator
            .generate(&self.tapes_path, &first_ctx.program, &preview, millis);

        let args = shlex::split(&self.info.command)
            .unwrap_or_default()
            .into_iter()
            .skip(1)
            .collect();

        let mut tape = Tape {
            meta: TapeMeta {
                created_at: chrono::Utc::now(),
                program: first_ctx.program.clone(),
                args,
                env: self.info.env.clone(),
                cwd: self.info.cwd.clone(),
                pty: self.info.pty,
                tag: None,
                latency: self.info.latency.clone(),
                error_rate: self.info.error_rate.clone(),
                seed: None,
            },
            session: TapeSession {
                platform: self.info.platform.clone(),
                version: self.info.version.clone(),
            },
            exchanges: novel.into_iter().map(|(_, exchange)| exchange).collect(),
        };
        if let Some(decorator) = self.tape_decorator.as_ref() {
            decorator.decorate(&mut tape);
        }
        store.write_tape(&path, &tape, true)
    }
}
