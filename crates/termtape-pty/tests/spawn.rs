use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use termtape_pty::Dimensions;
use termtape_pty::spawn_pty_process;

#[tokio::test]
async fn echoes_output_back_to_caller() {
    let env = HashMap::new();
    let mut spawned = spawn_pty_process(
        "/bin/echo",
        &["hello".to_string(), "world".to_string()],
        Path::new("."),
        &env,
        Dimensions::default(),
    )
    .await
    .expect("spawn echo");

    let mut collected = Vec::new();
    while let Some(chunk) = tokio::time::timeout(Duration::from_secs(2), spawned.recv_chunk())
        .await
        .ok()
        .flatten()
    {
        collected.extend_from_slice(&chunk);
    }

    let text = String::from_utf8_lossy(&collected);
    assert!(text.contains("hello world"), "got: {text:?}");

    let exit = spawned.wait().await.expect("exit info");
    assert_eq!(exit.code, Some(0));
}

#[tokio::test]
async fn terminate_kills_a_sleeping_child() {
    let env = HashMap::new();
    let mut spawned = spawn_pty_process(
        "/bin/sleep",
        &["30".to_string()],
        Path::new("."),
        &env,
        Dimensions::default(),
    )
    .await
    .expect("spawn sleep");

    spawned.terminate(Duration::from_millis(200)).await;
    let exit = tokio::time::timeout(Duration::from_secs(2), spawned.wait())
        .await
        .expect("wait did not time out");
    assert!(exit.is_some());
}

#[tokio::test]
async fn try_wait_observes_exit_and_a_later_wait_call_sees_the_same_value() {
    let env = HashMap::new();
    let mut spawned = spawn_pty_process("/bin/echo", &["hi".to_string()], Path::new("."), &env, Dimensions::default())
        .await
        .expect("spawn echo");

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    let observed = loop {
        if let Some(info) = spawned.try_wait() {
            break info;
        }
        assert!(std::time::Instant::now() < deadline, "child never reported exit");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(observed.code, Some(0));

    // wait() must return the cached value rather than hang on an
    // already-consumed receiver.
    let exit = tokio::time::timeout(Duration::from_millis(200), spawned.wait())
        .await
        .expect("wait did not time out")
        .expect("cached exit info");
    assert_eq!(exit.code, Some(0));
}
