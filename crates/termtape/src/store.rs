//! C3: directory-backed tape store with a two-level match index and
//! atomic, lock-protected writes.

use std::collections::HashMap;
use std::collections::HashSet;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use crate::error::CoreError;
use crate::error::Result;
use crate::matcher::BucketKey;
use crate::matcher::CommandMatcher;
use crate::matcher::KeyBuilder;
use crate::matcher::MatchKey;
use crate::matcher::MatchingContext;
use crate::matcher::StdinMatcher;
use crate::redact;
use crate::tape::codec;
use crate::tape::model::Input;
use crate::tape::model::Tape;

/// `(tape index, exchange index)` into [`TapeStore::tapes`].
pub type ExchangeRef = (usize, usize);

pub struct TapeStore {
    pub root: PathBuf,
    pub tapes: Vec<Tape>,
    pub paths: Vec<PathBuf>,
    used: HashSet<usize>,
    new_tapes: HashSet<usize>,
    exact_index: HashMap<MatchKey, Vec<ExchangeRef>>,
    bucket_index: HashMap<BucketKey, Vec<ExchangeRef>>,
    index_built: bool,
}

impl TapeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tapes: Vec::new(),
            paths: Vec::new(),
            used: HashSet::new(),
            new_tapes: HashSet::new(),
            exact_index: HashMap::new(),
            bucket_index: HashMap::new(),
            index_built: false,
        }
    }

    /// Recursively load every `*.json5` under `root`, in sorted path order.
    /// Files that fail to parse are logged and skipped; use [`Self::validate`]
    /// to enumerate parse failures without mutating the store.
    pub fn load_all(&mut self) -> Result<()> {
        self.tapes.clear();
        self.paths.clear();
        self.index_built = false;
        let mut files = collect_json5_files(&self.root)?;
        files.sort();
        for path in files {
            let text = std::fs::read_to_string(&path)?;
            match codec::decode(&text) {
                Ok(tape) => {
                    self.tapes.push(tape);
                    self.paths.push(path);
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable tape");
                }
            }
        }
        Ok(())
    }

    /// Build (or rebuild) the exact and bucket indexes from currently
    /// loaded tapes.
    pub fn build_index(&mut self, builder: &KeyBuilder) {
        self.exact_index.clear();
        self.bucket_index.clear();
        for (tape_idx, tape) in self.tapes.iter().enumerate() {
            for (exchange_idx, exchange) in tape.exchanges.iter().enumerate() {
                let ctx = MatchingContext {
                    program: tape.meta.program.clone(),
                    args: tape.meta.args.clone(),
                    env: tape.meta.env.clone(),
                    cwd: tape.meta.cwd.clone(),
                    prompt: exchange.pre.prompt.clone(),
                };
                let stdin = exchange.input.as_bytes();
                let key = builder.build_key(&ctx, &stdin);
                self.exact_index
                    .entry(key)
                    .or_default()
                    .push((tape_idx, exchange_idx));
                let bucket = builder.bucket_key(&ctx);
                self.bucket_index
                    .entry(bucket)
                    .or_default()
                    .push((tape_idx, exchange_idx));
            }
        }
        self.index_built = true;
    }

    pub fn index_is_built(&self) -> bool {
        self.index_built
    }

    /// C4 `find_matches`: exact key hit short-circuits; otherwise fall back
    /// to the bucket and confirm candidates with the injected matchers.
    /// Deterministic: a pure function of `(ctx, stdin)` plus store contents.
    pub fn find_matches(
        &self,
        builder: &KeyBuilder,
        ctx: &MatchingContext,
        stdin: &[u8],
        stdin_matcher: &dyn StdinMatcher,
        command_matcher: &dyn CommandMatcher,
    ) -> Vec<ExchangeRef> {
        let exact_key = builder.build_key(ctx, stdin);
        if let Some(hits) = self.exact_index.get(&exact_key) {
            return hits.clone();
        }
        let bucket = builder.bucket_key(ctx);
        let Some(candidates) = self.bucket_index.get(&bucket) else {
            return Vec::new();
        };
        let mut survivors = Vec::new();
        for &(tape_idx, exchange_idx) in candidates {
            let tape = &self.tapes[tape_idx];
            let exchange = &tape.exchanges[exchange_idx];
            let candidate_env =
                crate::normalize::filter_env(&tape.meta.env, &builder.allow_env, &builder.ignore_env);
            let ctx_env = crate::normalize::filter_env(&ctx.env, &builder.allow_env, &builder.ignore_env);
            if candidate_env != ctx_env {
                continue;
            }
            let mut recorded_command = vec![tape.meta.program.clone()];
            recorded_command.extend(tape.meta.args.clone());
            let mut incoming_command = vec![ctx.program.clone()];
            incoming_command.extend(ctx.args.clone());
            if !command_matcher.matches(&recorded_command, &incoming_command, ctx) {
                continue;
            }
            let recorded_stdin = exchange.input.as_bytes();
            if !stdin_matcher.matches(&recorded_stdin, stdin, ctx) {
                continue;
            }
            survivors.push((tape_idx, exchange_idx));
        }
        survivors
    }

    /// Mark the tape at `path` as consulted during this session.
    pub fn mark_used(&mut self, path: &Path) {
        if let Some(idx) = self.paths.iter().position(|p| p == path) {
            self.used.insert(idx);
        }
    }

    pub fn used_paths(&self) -> Vec<&Path> {
        self.used.iter().map(|&i| self.paths[i].as_path()).collect()
    }

    pub fn unused_paths(&self) -> Vec<&Path> {
        (0..self.paths.len())
            .filter(|i| !self.used.contains(i))
            .map(|i| self.paths[i].as_path())
            .collect()
    }

    pub fn new_paths(&self) -> Vec<&Path> {
        self.new_tapes.iter().map(|&i| self.paths[i].as_path()).collect()
    }

    /// Write `tape` to `path` atomically: acquire an advisory lock on a
    /// deterministic sibling `<dest>.lock` file (so two writers targeting
    /// the *same* destination actually contend on the same file, unlike a
    /// freshly-named temp file), then encode, write to a temp file, and
    /// rename into place while still holding the lock. The destination is
    /// either absent or fully valid, never partial.
    pub fn write_tape(&mut self, path: &Path, tape: &Tape, mark_new: bool) -> Result<()> {
        let encoded = codec::encode(tape)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        let lock_file = std::fs::OpenOptions::new().create(true).write(true).open(&lock_path)?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let _guard = lock
            .write()
            .map_err(|e| CoreError::schema(path.display().to_string(), format!("lock failed: {e}")))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(encoded.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|e| CoreError::schema(path.display().to_string(), format!("persist failed: {}", e.error)))?;

        match self.paths.iter().position(|p| p == path) {
            Some(idx) => self.tapes[idx] = tape.clone(),
            None => {
                self.paths.push(path.to_path_buf());
                self.tapes.push(tape.clone());
                if mark_new {
                    self.new_tapes.insert(self.paths.len() - 1);
                }
            }
        }
        self.index_built = false;
        Ok(())
    }

    /// Validate every `*.json5` under `root` without mutating the store.
    pub fn validate(&self, strict: bool) -> Vec<(PathBuf, String)> {
        let mut errors = Vec::new();
        let Ok(files) = collect_json5_files(&self.root) else {
            return errors;
        };
        for path in files {
            let Ok(text) = std::fs::read_to_string(&path) else {
                errors.push((path, "unreadable file".to_string()));
                continue;
            };
            let value: serde_json::Value = match json5::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    errors.push((path, format!("json5 parse error: {e}")));
                    continue;
                }
            };
            let result = if strict {
                codec::validate_strict(&value)
            } else {
                codec::validate_lenient(&value)
            };
            if let Err(e) = result {
                errors.push((path, e.to_string()));
            }
        }
        errors
    }

    /// Walk every exchange of every loaded tape, redacting input text and
    /// output chunk bytes. When `inplace`, rewrites the backing files.
    /// Returns one diff-description string per modified exchange.
    pub fn redact_all(&mut self, inplace: bool) -> Result<Vec<String>> {
        let mut diffs = Vec::new();
        let mut rewrites: Vec<(PathBuf, Tape)> = Vec::new();
        for (tape_idx, tape) in self.tapes.iter().enumerate() {
            let mut new_tape = tape.clone();
            let mut changed = false;
            for exchange in new_tape.exchanges.iter_mut() {
                if let Input::Line(text) = &exchange.input {
                    let redacted = redact::redact_str(text);
                    if redacted != *text {
                        diffs.push(format!("{}: input redacted", self.paths[tape_idx].display()));
                        exchange.input = Input::Line(redacted);
                        changed = true;
                    }
                }
                for chunk in exchange.output.iter_mut() {
                    let decoded = chunk.decode();
                    let redacted = redact::redact_bytes(&decoded);
                    if redacted != decoded {
                        diffs.push(format!("{}: output chunk redacted", self.paths[tape_idx].display()));
                        *chunk = crate::tape::model::Chunk::new(chunk.delay_ms, &redacted);
                        changed = true;
                    }
                }
            }
            if changed {
                if inplace {
                    rewrites.push((self.paths[tape_idx].clone(), new_tape.clone()));
                }
                self.tapes[tape_idx] = new_tape;
            }
        }
        for (path, tape) in rewrites {
            self.write_tape(&path, &tape, false)?;
        }
        Ok(diffs)
    }
}

fn collect_json5_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json5") {
                out.push(path);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::DefaultCommandMatcher;
    use crate::matcher::DefaultStdinMatcher;
    use crate::tape::model::Chunk;
    use crate::tape::model::Exchange;
    use crate::tape::model::ExchangePre;
    use crate::tape::model::TapeMeta;
    use crate::tape::model::TapeSession;

    fn sample_tape(program: &str, input: &str, output: &str) -> Tape {
        let mut exch = Exchange::new(
            ExchangePre {
                prompt: Some("$ ".to_string()),
            },
            Input::Line(input.to_string()),
        );
        exch.output.push(Chunk::new(0, output.as_bytes()));
        Tape {
            meta: TapeMeta {
                created_at: chrono::Utc::now(),
                program: program.to_string(),
                args: vec![],
                env: vec![],
                cwd: "/tmp".to_string(),
                pty: None,
                tag: None,
                latency: crate::tape::model::RangedValue::Fixed(0.0),
                error_rate: crate::tape::model::RangedValue::Fixed(0.0),
                seed: None,
            },
            session: TapeSession {
                platform: "linux".to_string(),
                version: "0.1.0".to_string(),
            },
            exchanges: vec![exch],
        }
    }

    #[test]
    fn write_then_load_round_trips_and_is_atomic_on_success() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let mut store = TapeStore::new(dir.path());
        let tape = sample_tape("demo", "status\n", "ok\n");
        let path = dir.path().join("demo").join("t1.json5");
        store.write_tape(&path, &tape, true).expect("write");
        assert!(path.exists());

        let mut loaded = TapeStore::new(dir.path());
        loaded.load_all().expect("load");
        assert_eq!(loaded.tapes.len(), 1);
        assert_eq!(loaded.tapes[0].meta.program, "demo");
    }

    #[test]
    fn find_matches_exact_hit_short_circuits_bucket_scan() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let mut store = TapeStore::new(dir.path());
        store.tapes.push(sample_tape("demo", "status\n", "ok\n"));
        store.paths.push(dir.path().join("t1.json5"));
        let builder = KeyBuilder::default();
        store.build_index(&builder);

        let ctx = MatchingContext {
            program: "demo".to_string(),
            args: vec![],
            env: vec![],
            cwd: "/tmp".to_string(),
            prompt: Some("$ ".to_string()),
        };
        let matches = store.find_matches(
            &builder,
            &ctx,
            b"status\n",
            &DefaultStdinMatcher,
            &DefaultCommandMatcher,
        );
        assert_eq!(matches, vec![(0, 0)]);
    }

    #[test]
    fn find_matches_is_pure_function_of_context_and_stdin() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let mut store = TapeStore::new(dir.path());
        store.tapes.push(sample_tape("demo", "status\n", "ok\n"));
        store.paths.push(dir.path().join("t1.json5"));
        let builder = KeyBuilder::default();
        store.build_index(&builder);
        let ctx = MatchingContext {
            program: "demo".to_string(),
            args: vec![],
            env: vec![],
            cwd: "/tmp".to_string(),
            prompt: Some("$ ".to_string()),
        };
        let a = store.find_matches(&builder, &ctx, b"status\n", &DefaultStdinMatcher, &DefaultCommandMatcher);
        let b = store.find_matches(&builder, &ctx, b"status\n", &DefaultStdinMatcher, &DefaultCommandMatcher);
        assert_eq!(a, b);
    }

    #[test]
    fn validate_reports_parse_errors_without_mutating_store() {
        let dir = tempfile::tempdir().expect("tmpdir");
        std::fs::create_dir_all(dir.path().join("demo")).expect("mkdir");
        std::fs::write(dir.path().join("demo").join("broken.json5"), b"{ not json").expect("write");
        let store = TapeStore::new(dir.path());
        let errors = store.validate(false);
        assert_eq!(errors.len(), 1);
        assert!(store.tapes.is_empty());
    }

    #[test]
    fn redact_all_masks_secret_bearing_chunks() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let mut store = TapeStore::new(dir.path());
        let tape = sample_tape("demo", "password=secret", "token: supersecret\n");
        let path = dir.path().join("demo").join("t1.json5");
        store.write_tape(&path, &tape, true).expect("write");

        let diffs = store.redact_all(true).expect("redact");
        assert!(!diffs.is_empty());
        let rewritten = std::fs::read_to_string(&path).expect("read back");
        let decoded = codec::decode(&rewritten).expect("decode");
        match &decoded.exchanges[0].input {
            Input::Line(text) => assert!(text.contains("***")),
            Input::Raw(_) => panic!("expected line input"),
        }
        assert!(decoded.exchanges[0].output[0].decode().ends_with(b"***\n"));
    }
}
