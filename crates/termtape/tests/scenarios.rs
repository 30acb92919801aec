//! End-to-end scenarios against real short-lived child processes, standing
//! in for the hypothetical Python-child scenarios: `/bin/cat`, `/bin/sh`,
//! and `/bin/echo` are assumed present on any Unix test runner.

use std::path::PathBuf;
use std::time::Duration;

use termtape::config::Config;
use termtape::pattern::Pattern;
use termtape::recorder::RecordMode;
use termtape::registry::Registry;
use termtape::session::FallbackMode;
use termtape::session::Session;
use termtape::session::SessionOptions;
use termtape::store::TapeStore;
use termtape::tape::model::Chunk;
use termtape::tape::model::Exchange;
use termtape::tape::model::ExchangePre;
use termtape::tape::model::Input;
use termtape::tape::model::RangedValue;
use termtape::tape::model::Tape;
use termtape::tape::model::TapeMeta;
use termtape::tape::model::TapeSession;

#[tokio::test]
async fn echo_round_trip() {
    let opts = SessionOptions::new("/bin/sh -c 'echo hello world'");
    let mut session = Session::new(opts).await.expect("spawn");

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if String::from_utf8_lossy(&session.get_full_output()).contains("hello world") {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "never saw output");
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.read_nonblocking(4096);
    }
    assert!(String::from_utf8_lossy(&session.get_full_output()).contains("hello world"));

    session.close(false).await.expect("close");
    assert!(!session.is_alive());
}

#[tokio::test]
async fn expect_timeout_reports_recent_output() {
    let opts = SessionOptions::new("/bin/sh -c 'sleep 5'");
    let mut session = Session::new(opts).await.expect("spawn");

    let pattern = Pattern::regex(">>>").expect("compile pattern");
    let err = session
        .expect(&[pattern], Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Recent output:"));

    session.close(true).await.expect("close");
}

#[tokio::test]
async fn expect_raises_process_error_on_unexpected_eof() {
    let opts = SessionOptions::new("/bin/echo hi");
    let mut session = Session::new(opts).await.expect("spawn");

    let pattern = Pattern::regex("never-matches-anything").expect("compile pattern");
    let err = session
        .expect(&[pattern], Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, termtape::error::CoreError::Process { .. }), "got {err:?}");
    assert!(!session.is_alive());
    assert!(session.exitstatus().is_some());
}

#[tokio::test]
async fn session_reuse_shares_identity_and_ring() {
    // Neither call pins a session_id: reuse must match on `command` alone.
    let registry = Registry::new(Config::default());
    let opts = SessionOptions::new("/bin/cat");
    let first = registry.control(opts, true).await.expect("spawn first");
    let first_id = first.lock().await.session_id.clone();

    let opts_again = SessionOptions::new("/bin/cat");
    let second = registry.control(opts_again, true).await.expect("reuse");
    let second_id = second.lock().await.session_id.clone();
    assert_eq!(first_id, second_id);

    {
        let mut guard = first.lock().await;
        guard.sendline("x=42").await.expect("send via first handle");
    }
    {
        let mut guard = second.lock().await;
        guard.sendline("print(x)").await.expect("send via second handle");
        tokio::time::sleep(Duration::from_millis(100)).await;
        guard.read_nonblocking(4096);
        assert!(guard.get_recent_output(50).contains("42"));
        guard.close(true).await.expect("close");
    }
}

#[tokio::test]
async fn record_then_replay_matches_without_spawning_the_recorded_command() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let tapes_path = dir.path().join("tapes");
    let command = "/bin/sh -c \"read line; echo ok\"";

    let mut record_opts = SessionOptions::new(command);
    record_opts.tapes_path = Some(tapes_path.clone());
    record_opts.record = RecordMode::New;
    let mut recording = Session::new(record_opts).await.expect("spawn recording session");
    recording.sendline("status").await.expect("send status");
    let ok_pattern = Pattern::regex("ok").expect("compile pattern");
    recording
        .expect(&[ok_pattern.clone()], Some(Duration::from_secs(5)))
        .await
        .expect("expect ok while recording");
    recording.close(false).await.expect("close recording session");

    let mut replay_opts = SessionOptions::new(command);
    replay_opts.replay = true;
    replay_opts.record = RecordMode::Disabled;
    replay_opts.tapes_path = Some(tapes_path);
    let mut replay = Session::new(replay_opts).await.expect("open replay session");
    replay.sendline("status").await.expect("replay send matches a tape");
    let index = replay
        .expect(&[ok_pattern], Some(Duration::from_secs(1)))
        .await
        .expect("replay expect matches recorded output");
    assert_eq!(index, 0);
    replay.close(false).await.expect("close replay session");
}

#[tokio::test]
async fn proxy_fallback_switches_to_a_live_child_on_a_tape_miss() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let tapes_path = dir.path().join("tapes");
    let command = "/bin/sh -c \"read line; echo ok\"";

    // Seed one recorded exchange so the tape store is non-empty but has no
    // match for the input this test sends.
    let mut record_opts = SessionOptions::new(command);
    record_opts.tapes_path = Some(tapes_path.clone());
    record_opts.record = RecordMode::New;
    let mut seed = Session::new(record_opts).await.expect("spawn seed session");
    seed.sendline("status").await.expect("seed send");
    seed.expect(&[Pattern::regex("ok").expect("pattern")], Some(Duration::from_secs(5)))
        .await
        .expect("seed expect");
    seed.close(false).await.expect("close seed session");

    let mut replay_opts = SessionOptions::new(command);
    replay_opts.replay = true;
    replay_opts.record = RecordMode::Disabled;
    replay_opts.fallback = FallbackMode::Proxy;
    replay_opts.tapes_path = Some(tapes_path);
    let mut session = Session::new(replay_opts).await.expect("open replay session");

    session
        .sendline("unmatched-input")
        .await
        .expect("send falls back to a live child instead of erroring");
    let index = session
        .expect(&[Pattern::regex("ok").expect("pattern")], Some(Duration::from_secs(5)))
        .await
        .expect("live child echoes back ok");
    assert_eq!(index, 0);
    session.close(true).await.expect("close");
}

#[tokio::test]
async fn redact_all_masks_secrets_in_place() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let tapes_path: PathBuf = dir.path().join("tapes");
    std::fs::create_dir_all(&tapes_path).expect("mkdir");

    let mut exchange = Exchange::new(ExchangePre::default(), Input::Line("password=secret".to_string()));
    exchange.output.push(Chunk::new(0, b"token: supersecret\n"));
    let tape = Tape {
        meta: TapeMeta {
            created_at: chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .expect("fixed timestamp")
                .with_timezone(&chrono::Utc),
            program: "demo".to_string(),
            args: vec!["--flag".to_string()],
            env: Vec::new(),
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
        exchanges: vec![exchange],
    };

    let mut store = TapeStore::new(tapes_path.clone());
    let path = tapes_path.join("secret.json5");
    store.write_tape(&path, &tape, true).expect("write tape");

    store.redact_all(true).expect("redact in place");

    let mut reloaded = TapeStore::new(tapes_path);
    reloaded.load_all().expect("reload");
    let reloaded_tape = &reloaded.tapes[0];
    match &reloaded_tape.exchanges[0].input {
        Input::Line(text) => {
            assert!(text.contains("***"));
            assert!(!text.contains("secret"));
        }
        Input::Raw(_) => panic!("expected a line input"),
    }
    let decoded = reloaded_tape.exchanges[0].output[0].decode();
    let decoded_text = String::from_utf8_lossy(&decoded);
    assert!(decoded_text.ends_with("***\n"));
}
