//! C7: the central orchestrator. Spawns a child under a PTY (or attaches a
//! replay transport), captures output into a bounded ring plus a rotated
//! on-disk log, and drives the expect/send loop.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use std::time::Instant;

use regex::Regex;
use tokio::time::timeout as tokio_timeout;

use crate::config::Config;
use crate::decorators::ErrorPolicy;
use crate::decorators::InputDecorator;
use crate::decorators::NeverInjectError;
use crate::decorators::OutputDecorator;
use crate::error::CoreError;
use crate::error::Result;
use crate::matcher::CommandMatcher;
use crate::matcher::KeyBuilder;
use crate::matcher::MatchingContext;
use crate::matcher::StdinMatcher;
use crate::observer::EventTag;
use crate::observer::ObserverPipe;
use crate::pattern::Pattern;
use crate::recorder::DefaultTapeNameGenerator;
use crate::recorder::RecordMode;
use crate::recorder::Recorder;
use crate::recorder::RecorderSessionInfo;
use crate::recorder::TapeNameGenerator;
use crate::replay::ReplayTransport;
use crate::store::TapeStore;
use crate::tape::model::Input as TapeInput;
use crate::tape::model::PtyGeometry;
use crate::tape::model::RangedValue;
use termtape_pty::Dimensions;
use termtape_pty::SpawnedPty;

static ERROR_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(error|exception|traceback|panicked|fatal)\b").expect("static error line regex"));

const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackMode {
    NotFound,
    Proxy,
}

/// One successful `expect`, retained so an external collaborator can later
/// synthesize a saved "program config" from the interaction history.
#[derive(Debug, Clone)]
pub struct ExpectRecord {
    pub patterns: Vec<String>,
    pub matched_index: usize,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

pub struct SessionOptions {
    pub session_id: Option<String>,
    pub command: String,
    pub timeout: Duration,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub dimensions: Dimensions,
    pub stream: bool,
    pub replay: bool,
    pub tapes_path: Option<PathBuf>,
    pub record: RecordMode,
    pub fallback: FallbackMode,
    pub latency_override: Option<Box<dyn crate::decorators::LatencyPolicy>>,
    pub error_policy: Option<Box<dyn ErrorPolicy>>,
    pub allow_env: HashSet<String>,
    pub ignore_env: HashSet<String>,
    pub stdin_matcher: Option<Box<dyn StdinMatcher>>,
    pub command_matcher: Option<Box<dyn CommandMatcher>>,
    pub input_decorator: Option<Box<dyn InputDecorator>>,
    pub output_decorator: Option<Box<dyn OutputDecorator>>,
    pub tape_decorator: Option<Box<dyn crate::decorators::TapeDecorator>>,
    /// Whether the narrow `"..."`-ending continuation retry is enabled.
    pub continuation_retry: bool,
    pub config: Config,
}

impl SessionOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            session_id: None,
            command: command.into(),
            timeout: Duration::from_secs(30),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env: Vec::new(),
            dimensions: Dimensions::default(),
            stream: false,
            replay: false,
            tapes_path: None,
            record: RecordMode::Disabled,
            fallback: FallbackMode::NotFound,
            latency_override: None,
            error_policy: None,
            allow_env: HashSet::new(),
            ignore_env: HashSet::new(),
            stdin_matcher: None,
            command_matcher: None,
            input_decorator: None,
            output_decorator: None,
            tape_decorator: None,
            continuation_retry: true,
            config: Config::default(),
        }
    }
}

enum Transport {
    Live(SpawnedPty),
    Replay(ReplayTransport),
}

pub struct Session {
    pub session_id: String,
    pub command: String,
    cwd: PathBuf,
    env: Vec<(String, String)>,
    default_timeout: Duration,
    continuation_retry: bool,
    fallback: FallbackMode,
    input_decorator: Option<Box<dyn InputDecorator>>,
    output_decorator: Option<Box<dyn OutputDecorator>>,

    created_at: chrono::DateTime<chrono::Utc>,
    last_activity: Instant,

    ring: VecDeque<String>,
    output_limit: usize,
    full_log: Vec<u8>,
    partial_line: Vec<u8>,

    log_path: PathBuf,
    log_file: Option<std::fs::File>,
    log_bytes_written: u64,

    observer: Option<ObserverPipe>,

    transport: Transport,
    store: Option<TapeStore>,
    recorder: Option<Recorder>,

    expect_history: Vec<ExpectRecord>,
    last_prompt: Option<String>,
    last_before: Vec<u8>,
    last_matched: Vec<u8>,
    last_after: Vec<u8>,

    exitstatus: Option<i32>,
    signalstatus: Option<i32>,
    closed: bool,
}

impl Session {
    /// Spawn a child under a PTY, or attach a replay transport, per `opts`.
    /// Does not touch the registry; callers that want registration and the
    /// capacity check use `Registry::open`.
    pub async fn new(opts: SessionOptions) -> Result<Self> {
        if opts.command.trim().is_empty() {
            return Err(CoreError::session("command must not be empty"));
        }
        let session_id = opts.session_id.clone().unwrap_or_else(|| format!("session_{}", uuid::Uuid::new_v4()));

        let key_builder = KeyBuilder {
            allow_env: opts.allow_env.clone(),
            ignore_env: opts.ignore_env.clone(),
            ignore_args: HashSet::new(),
        };

        let log_path = opts.config.sessions_dir().join(&session_id).join("output.log");
        let (program, args) = shell_program(&opts.command);

        let (transport, store, recorder) = if opts.replay {
            let tapes_path = opts
                .tapes_path
                .clone()
                .ok_or_else(|| CoreError::session("replay requires tapes_path"))?;
            let mut store = TapeStore::new(tapes_path);
            store.load_all()?;
            store.build_index(&key_builder);

            let mut replay = ReplayTransport::new(key_builder.clone()).with_latency_override(opts.latency_override);
            if let Some(m) = opts.stdin_matcher {
                replay = replay.with_stdin_matcher(m);
            }
            if let Some(m) = opts.command_matcher {
                replay = replay.with_command_matcher(m);
            }
            replay = replay.with_error_policy(opts.error_policy.unwrap_or_else(|| Box::new(NeverInjectError)));

            (Transport::Replay(replay), Some(store), None)
        } else {
            let env_map: HashMap<String, String> = opts.env.iter().cloned().collect();
            let spawned = termtape_pty::spawn_pty_process(&program, &args, &opts.cwd, &env_map, opts.dimensions)
                .await
                .map_err(|e| CoreError::process(opts.command.clone(), e.to_string()))?;

            let (store, recorder) = if opts.record != RecordMode::Disabled {
                let tapes_path = opts.tapes_path.clone().unwrap_or_else(|| PathBuf::from("./tapes"));
                let mut store = TapeStore::new(tapes_path.clone());
                store.load_all()?;
                store.build_index(&key_builder);
                let info = RecorderSessionInfo {
                    command: opts.command.clone(),
                    cwd: opts.cwd.display().to_string(),
                    env: opts.env.clone(),
                    pty: Some(PtyGeometry {
                        rows: opts.dimensions.rows,
                        cols: opts.dimensions.cols,
                    }),
                    latency: RangedValue::Fixed(0.0),
                    error_rate: RangedValue::Fixed(0.0),
                    platform: std::env::consts::OS.to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                };
                let name_gen: Box<dyn TapeNameGenerator> = Box::new(DefaultTapeNameGenerator);
                let mut recorder = Recorder::new(tapes_path, opts.record, key_builder.clone(), info, name_gen);
                if let Some(decorator) = opts.tape_decorator {
                    recorder = recorder.with_tape_decorator(decorator);
                }
                recorder.start(&store);
                (Some(store), Some(recorder))
            } else {
                (None, None)
            };
            (Transport::Live(spawned), store, recorder)
        };

        let mut observer = if opts.stream {
            let pipe_path = opts.config.sessions_dir().join(&session_id).join("events.pipe");
            ObserverPipe::open(&pipe_path).ok()
        } else {
            None
        };
        if let Some(observer) = observer.as_mut() {
            observer.write_event(EventTag::Mtx, &format!("opened: {}", opts.command));
        }

        let mut session = Self {
            session_id,
            command: opts.command,
            cwd: opts.cwd,
            env: opts.env,
            default_timeout: opts.timeout,
            continuation_retry: opts.continuation_retry,
            fallback: opts.fallback,
            input_decorator: opts.input_decorator,
            output_decorator: opts.output_decorator,
            created_at: chrono::Utc::now(),
            last_activity: Instant::now(),
            ring: VecDeque::new(),
            output_limit: opts.config.output_limit,
            full_log: Vec::new(),
            partial_line: Vec::new(),
            log_path,
            log_file: None,
            log_bytes_written: 0,
            observer,
            transport,
            store,
            recorder,
            expect_history: Vec::new(),
            last_prompt: None,
            last_before: Vec::new(),
            last_matched: Vec::new(),
            last_after: Vec::new(),
            exitstatus: None,
            signalstatus: None,
            closed: false,
        };
        session.ensure_log_file()?;
        Ok(session)
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    fn ensure_log_file(&mut self) -> Result<()> {
        if let Some(dir) = self.log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        self.log_bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.log_file = Some(file);
        Ok(())
    }

    fn matching_context(&self) -> MatchingContext {
        let (program, args) = shell_program(&self.command);
        MatchingContext {
            program,
            args,
            env: self.env.clone(),
            cwd: self.cwd.display().to_string(),
            prompt: self.last_prompt.clone(),
        }
    }

    /// Tee one chunk of child/transport output into the ring, full log,
    /// rotated on-disk log, observer pipe, and recorder sink.
    fn capture_output(&mut self, data: &[u8]) {
        self.last_activity = Instant::now();
        let ctx = self.matching_context();
        let data = match self.output_decorator.as_ref() {
            Some(decorator) => decorator.decorate(data, &ctx),
            None => data.to_vec(),
        };
        self.full_log.extend_from_slice(&data);
        self.partial_line.extend_from_slice(&data);
        while let Some(pos) = self.partial_line.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial_line.drain(..=pos).collect();
            let line_text = String::from_utf8_lossy(&line).into_owned();
            if self.ring.len() >= self.output_limit {
                self.ring.pop_front();
            }
            self.ring.push_back(line_text.clone());
            if let Some(observer) = self.observer.as_mut() {
                let tag = if ERROR_LINE_RE.is_match(&line_text) { EventTag::Err } else { EventTag::Out };
                observer.write_event(tag, line_text.trim_end());
            }
        }
        self.write_log(&data);
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.on_output(&data);
        }
    }

    fn write_log(&mut self, data: &[u8]) {
        if self.log_bytes_written + data.len() as u64 > LOG_ROTATE_BYTES {
            self.rotate_log();
        }
        if let Some(file) = self.log_file.as_mut() {
            if file.write_all(data).is_ok() {
                self.log_bytes_written += data.len() as u64;
            }
        }
    }

    fn rotate_log(&mut self) {
        self.log_file = None;
        let ts = chrono::Utc::now().timestamp();
        let rotated = self.log_path.with_file_name(format!("output_{ts}.log"));
        let _ = std::fs::rename(&self.log_path, rotated);
        self.log_bytes_written = 0;
        let _ = self.ensure_log_file();
    }

    /// Pull any output the live child has produced without blocking.
    async fn drain_live_output(&mut self) {
        if let Transport::Live(spawned) = &mut self.transport {
            let mut pending = Vec::new();
            while let Some(chunk) = spawned.try_recv_chunk() {
                pending.push(chunk);
            }
            for chunk in pending {
                self.capture_output(&chunk);
            }
        }
        self.poll_live_exit();
    }

    /// Non-blocking check for whether the live child has exited, caching
    /// `exitstatus`/`signalstatus` the moment it has. Without this,
    /// `is_alive`/`exitstatus` would only ever reflect reality after
    /// `close()` runs, since nothing else observes `SpawnedPty::wait`.
    fn poll_live_exit(&mut self) {
        if self.exitstatus.is_some() {
            return;
        }
        if let Transport::Live(spawned) = &mut self.transport {
            if let Some(info) = spawned.try_wait() {
                self.exitstatus = info.code;
                self.signalstatus = info.signal;
            }
        }
    }

    fn current_exit_info(&self) -> Option<crate::tape::model::ExitInfo> {
        if self.is_alive() {
            None
        } else {
            Some(crate::tape::model::ExitInfo {
                code: self.exitstatus,
                signal: self.signalstatus,
            })
        }
    }

    pub async fn send(&mut self, text: &str) -> Result<()> {
        self.send_raw(text.as_bytes()).await
    }

    pub async fn sendline(&mut self, line: &str) -> Result<()> {
        let mut payload = line.as_bytes().to_vec();
        payload.push(b'\n');
        self.send_raw(&payload).await
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(CoreError::session("send on a closed session"));
        }
        let ctx = self.matching_context();
        let data = match self.input_decorator.as_ref() {
            Some(decorator) => decorator.decorate(data, &ctx),
            None => data.to_vec(),
        };
        let input = match std::str::from_utf8(&data) {
            Ok(text) => TapeInput::Line(text.to_string()),
            Err(_) => TapeInput::Raw(data.clone()),
        };
        if let Some(observer) = self.observer.as_mut() {
            observer.write_event(EventTag::In, &String::from_utf8_lossy(&data));
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.on_send(input, ctx.clone());
        }

        match &mut self.transport {
            Transport::Live(spawned) => {
                spawned
                    .writer()
                    .send(data.clone())
                    .await
                    .map_err(|_| CoreError::session("child stdin closed"))?;
                self.last_activity = Instant::now();
                Ok(())
            }
            Transport::Replay(replay) => {
                let store = self.store.as_mut().ok_or_else(|| CoreError::session("replay session missing tape store"))?;
                match replay.send(store, &ctx, &data).await {
                    Ok(()) => Ok(()),
                    Err(CoreError::TapeMiss { input_preview }) if self.fallback == FallbackMode::Proxy => {
                        tracing::info!(preview = %input_preview, "no tape match, falling back to a live process");
                        self.switch_to_live().await?;
                        Box::pin(self.send_raw(&data)).await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn switch_to_live(&mut self) -> Result<()> {
        let (program, args) = shell_program(&self.command);
        let env_map: HashMap<String, String> = self.env.iter().cloned().collect();
        let spawned = termtape_pty::spawn_pty_process(&program, &args, &self.cwd, &env_map, Dimensions::default())
            .await
            .map_err(|e| CoreError::process(self.command.clone(), e.to_string()))?;
        self.transport = Transport::Live(spawned);
        if let Some(observer) = self.observer.as_mut() {
            observer.write_event(EventTag::Mtx, "switched to a live process after a tape miss");
        }
        Ok(())
    }

    /// `expect`: regex/literal/TIMEOUT/EOF patterns, scanning order as
    /// declared. Embeds the narrow `"..."`-continuation retry.
    pub async fn expect(&mut self, patterns: &[Pattern], timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.unwrap_or(self.default_timeout);
        let short_timeout = timeout.is_some_and(|t| t < self.default_timeout);

        if let Some(index) = self.expect_loop(patterns, deadline, false).await? {
            self.record_expectation(patterns, index);
            return Ok(index);
        }

        let growth_recent = self.last_activity.elapsed() < Duration::from_secs(1);
        let ends_with_ellipsis = self.ring.back().map(|l| l.trim_end().ends_with("...")).unwrap_or(false);
        if self.continuation_retry && short_timeout && self.is_alive() && growth_recent && ends_with_ellipsis {
            let _ = self.send("").await;
            if let Some(index) = self.expect_loop(patterns, self.default_timeout, false).await? {
                self.record_expectation(patterns, index);
                return Ok(index);
            }
        }
        Err(CoreError::timeout(describe_patterns(patterns), self.get_recent_output(50)))
    }

    /// `expect_exact`: same shape, byte-literal matching only.
    pub async fn expect_exact(&mut self, patterns: &[Pattern], timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.unwrap_or(self.default_timeout);
        match self.expect_loop(patterns, deadline, true).await? {
            Some(index) => {
                self.record_expectation(patterns, index);
                Ok(index)
            }
            None => Err(CoreError::timeout(describe_patterns(patterns), self.get_recent_output(50))),
        }
    }

    async fn expect_loop(&mut self, patterns: &[Pattern], deadline: Duration, exact_only: bool) -> Result<Option<usize>> {
        if let Transport::Replay(replay) = &mut self.transport {
            let index = replay.expect(patterns, deadline, exact_only).await;
            if index.is_some() {
                self.last_before = replay.before.clone();
                self.last_matched = replay.matched.clone();
                self.last_after = replay.after.clone();
            }
            return Ok(index);
        }

        let started = Instant::now();
        loop {
            self.drain_live_output().await;
            let closed = !self.is_alive();
            let combined = combined_buffer(&self.full_log, &self.partial_line);
            if let Some(outcome) = crate::pattern::scan(&combined, patterns, closed, exact_only) {
                self.last_before = outcome.before;
                self.last_matched = outcome.matched;
                self.last_after = outcome.after;
                return Ok(Some(outcome.index));
            }
            if closed {
                let exit = self.current_exit_info();
                if let Some(recorder) = self.recorder.as_mut() {
                    recorder.on_exchange_end(exit);
                }
                return Err(CoreError::process(self.command.clone(), "unexpected EOF during expect"));
            }
            if started.elapsed() >= deadline {
                return Ok(crate::pattern::timeout_index(patterns));
            }
            let remaining = deadline.saturating_sub(started.elapsed()).min(Duration::from_millis(20));
            if let Transport::Live(spawned) = &mut self.transport {
                match tokio_timeout(remaining, spawned.recv_chunk()).await {
                    Ok(Some(chunk)) => self.capture_output(&chunk),
                    Ok(None) => self.poll_live_exit(),
                    Err(_) => {}
                }
            }
        }
    }

    fn record_expectation(&mut self, patterns: &[Pattern], index: usize) {
        if let Ok(text) = std::str::from_utf8(&self.last_after) {
            self.last_prompt = Some(text.to_string());
        }
        self.expect_history.push(ExpectRecord {
            patterns: patterns.iter().map(Pattern::describe).collect(),
            matched_index: index,
            before: self.last_before.clone(),
            after: self.last_after.clone(),
        });
        let exit = self.current_exit_info();
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.on_exchange_end(exit);
        }
    }

    /// `read_until`: blocks until `pattern` matches, the deadline elapses,
    /// or the child exits without matching. Returns the bytes seen before
    /// the match, plus the matched pattern bytes themselves when
    /// `include_pattern` is set.
    pub async fn read_until(&mut self, pattern: Pattern, timeout: Option<Duration>, include_pattern: bool) -> Result<Vec<u8>> {
        let deadline = timeout.unwrap_or(self.default_timeout);
        let patterns = [pattern];
        let index = self
            .expect_loop(&patterns, deadline, false)
            .await?
            .ok_or_else(|| CoreError::timeout(describe_patterns(&patterns), self.get_recent_output(50)))?;
        self.record_expectation(&patterns, index);

        let mut out = self.last_before.clone();
        if include_pattern {
            out.extend_from_slice(&self.last_matched);
        }
        Ok(out)
    }

    /// Ctrl+] (ASCII GS, `0x1D`) — the conventional escape-to-detach byte
    /// for terminal-forwarding loops, same default `telnet` uses.
    const INTERACT_ESCAPE_BYTE: u8 = 0x1d;

    /// `interact()`: puts the local terminal into raw mode and forwards it
    /// to the child verbatim until the operator presses Ctrl+] or the child
    /// exits. Always restores the terminal mode before returning, even on
    /// error.
    pub async fn interact(&mut self) -> Result<()> {
        crossterm::terminal::enable_raw_mode().map_err(|e| CoreError::session(format!("failed to enable raw terminal mode: {e}")))?;
        let result = self.interact_loop().await;
        let _ = crossterm::terminal::disable_raw_mode();
        result
    }

    async fn interact_loop(&mut self) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let (stdin_tx, mut stdin_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(32);
        std::thread::spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match std::io::Read::read(&mut stdin, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut stdout = tokio::io::stdout();
        loop {
            if !self.is_alive() {
                return Ok(());
            }

            match stdin_rx.try_recv() {
                Ok(bytes) if bytes.contains(&Self::INTERACT_ESCAPE_BYTE) => return Ok(()),
                Ok(bytes) => self.send_raw(&bytes).await?,
                Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => return Ok(()),
                Err(tokio::sync::mpsc::error::TryRecvError::Empty) => {}
            }

            let live_chunk = if let Transport::Live(spawned) = &mut self.transport {
                Some(tokio_timeout(Duration::from_millis(20), spawned.recv_chunk()).await.ok().flatten())
            } else {
                None
            };

            match live_chunk {
                Some(Some(chunk)) => {
                    stdout.write_all(&chunk).await?;
                    stdout.flush().await?;
                    self.capture_output(&chunk);
                }
                Some(None) => self.poll_live_exit(),
                None => {
                    let bytes = self.read_nonblocking(4096);
                    if bytes.is_empty() {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    } else {
                        stdout.write_all(&bytes).await?;
                        stdout.flush().await?;
                    }
                }
            }
        }
    }

    pub fn read_nonblocking(&mut self, size: usize) -> Vec<u8> {
        match &mut self.transport {
            Transport::Replay(replay) => replay.read_nonblocking(size),
            Transport::Live(spawned) => {
                let mut chunks = Vec::new();
                let mut total = 0;
                while total < size {
                    match spawned.try_recv_chunk() {
                        Some(chunk) => {
                            total += chunk.len();
                            chunks.push(chunk);
                        }
                        None => break,
                    }
                }
                let mut out = Vec::new();
                for chunk in chunks {
                    self.capture_output(&chunk);
                    out.extend_from_slice(&chunk);
                }
                out.truncate(size);
                out
            }
        }
    }

    pub fn get_recent_output(&self, lines: usize) -> String {
        self.ring.iter().rev().take(lines).rev().cloned().collect::<Vec<_>>().join("")
    }

    pub fn get_full_output(&self) -> Vec<u8> {
        self.full_log.clone()
    }

    pub fn is_alive(&self) -> bool {
        if self.closed {
            return false;
        }
        match &self.transport {
            Transport::Live(_) => self.exitstatus.is_none(),
            Transport::Replay(replay) => replay.is_alive(),
        }
    }

    pub fn exitstatus(&self) -> Option<i32> {
        self.exitstatus
    }

    pub fn expect_history(&self) -> &[ExpectRecord] {
        &self.expect_history
    }

    /// Idempotent teardown: SIGTERM, 500ms grace, SIGKILL for live
    /// sessions; immediate mark-closed for replay. Finalizes the recorder
    /// if one was attached.
    pub async fn close(&mut self, force: bool) -> Result<Option<i32>> {
        if self.closed {
            return Ok(self.exitstatus);
        }
        match &mut self.transport {
            Transport::Live(spawned) => {
                if self.exitstatus.is_none() {
                    let grace = if force { Duration::from_millis(0) } else { Duration::from_millis(500) };
                    spawned.terminate(grace).await;
                    if let Ok(Some(exit)) = tokio_timeout(Duration::from_secs(2), spawned.wait()).await {
                        self.exitstatus = exit.code;
                        self.signalstatus = exit.signal;
                    } else {
                        self.exitstatus = Some(-1);
                    }
                }
            }
            Transport::Replay(replay) => {
                replay.close();
                if self.exitstatus.is_none() {
                    self.exitstatus = replay.exitstatus.or(Some(0));
                    self.signalstatus = replay.signalstatus;
                }
            }
        }
        self.closed = true;
        if let (Some(recorder), Some(store)) = (self.recorder.as_mut(), self.store.as_mut()) {
            if let Err(e) = recorder.finalize(store) {
                tracing::warn!(error = %e, "recorder finalize failed during close");
            }
        }
        if let Some(observer) = self.observer.as_mut() {
            observer.write_event(EventTag::Mtx, &format!("closed: exit={:?}", self.exitstatus));
        }
        Ok(self.exitstatus)
    }
}

fn describe_patterns(patterns: &[Pattern]) -> String {
    patterns.iter().map(Pattern::describe).collect::<Vec<_>>().join(", ")
}

fn combined_buffer(full_log: &[u8], partial: &[u8]) -> Vec<u8> {
    let mut out = full_log.to_vec();
    out.extend_from_slice(partial);
    out
}

/// Shell-aware split of a command line into `(program, args)`, for
/// transport spawn, matching-context construction, and recorder metadata.
/// Falls back to treating the whole string as the program name if it can't
/// be tokenized (e.g. an unterminated quote).
fn shell_program(command: &str) -> (String, Vec<String>) {
    match shlex::split(command) {
        Some(mut parts) if !parts.is_empty() => {
            let program = parts.remove(0);
            (program, parts)
        }
        _ => (command.to_string(), Vec::new()),
    }
}
