//! Thin async wrapper around `portable-pty`.
//!
//! Spawns a child process attached to a real PTY and exposes it as a pair of
//! channels: a `Sender<Vec<u8>>` for stdin and a `Receiver<Vec<u8>>` that
//! streams whatever the child writes to its controlling terminal. All the
//! blocking PTY I/O happens on dedicated OS threads so the async caller never
//! blocks the executor.

use std::collections::HashMap;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::Context;
use anyhow::Result;
use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub rows: u16,
    pub cols: u16,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// How a child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// A live child process attached to a PTY.
///
/// Dropping this value does not kill the child; callers that want the
/// process gone must call [`SpawnedPty::kill`] explicitly.
pub struct SpawnedPty {
    pub pid: Option<u32>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    output_rx: mpsc::Receiver<Vec<u8>>,
    exit_rx: Option<oneshot::Receiver<ExitInfo>>,
    exit_info: Option<ExitInfo>,
    resize_tx: mpsc::UnboundedSender<Dimensions>,
}

impl SpawnedPty {
    /// Sender used to push bytes into the child's stdin.
    pub fn writer(&self) -> mpsc::Sender<Vec<u8>> {
        self.writer_tx.clone()
    }

    /// Pull the next chunk of output the reader thread has captured.
    ///
    /// Returns `None` once the PTY master has been closed (the reader thread
    /// observed EOF) and every already-buffered chunk has been drained.
    pub async fn recv_chunk(&mut self) -> Option<Vec<u8>> {
        self.output_rx.recv().await
    }

    /// Attempt to receive a chunk without waiting.
    pub fn try_recv_chunk(&mut self) -> Option<Vec<u8>> {
        self.output_rx.try_recv().ok()
    }

    /// Resolve once the child has exited.
    ///
    /// Safe to call more than once: the resolved [`ExitInfo`] is cached
    /// internally, so a later call (e.g. from `close()` after
    /// [`SpawnedPty::try_wait`] already observed the exit) returns the same
    /// value instead of hanging on an already-consumed receiver.
    pub async fn wait(&mut self) -> Option<ExitInfo> {
        if let Some(info) = self.exit_info {
            return Some(info);
        }
        let rx = self.exit_rx.take()?;
        let info = rx.await.ok()?;
        self.exit_info = Some(info);
        Some(info)
    }

    /// Non-blocking check for whether the child has exited yet.
    ///
    /// Like [`SpawnedPty::wait`], the result is cached, so this can be
    /// polled repeatedly from a drain loop without losing the exit info to a
    /// later `wait()` call.
    pub fn try_wait(&mut self) -> Option<ExitInfo> {
        if let Some(info) = self.exit_info {
            return Some(info);
        }
        let info = self.exit_rx.as_mut()?.try_recv().ok()?;
        self.exit_info = Some(info);
        self.exit_rx = None;
        Some(info)
    }

    /// Change the PTY's reported window size.
    pub fn resize(&self, dims: Dimensions) {
        let _ = self.resize_tx.send(dims);
    }

    /// Send `SIGTERM` (best effort; `kill()` on non-Unix), wait up to
    /// `grace`, then force-kill with `SIGKILL` if the process is still
    /// alive.
    pub async fn terminate(&self, grace: std::time::Duration) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SAFETY: libc::kill with a valid pid and a standard signal
            // number never triggers undefined behaviour; at worst it fails
            // with ESRCH if the process is already gone.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            tokio::time::sleep(grace).await;
            let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
            if alive {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
            }
            return;
        }
        #[cfg(not(unix))]
        {
            tokio::time::sleep(grace).await;
        }
    }
}

/// Spawn `program` with `args` under a freshly allocated PTY of size `dims`.
///
/// `env` is merged on top of the current process environment; `cwd` sets the
/// child's working directory.
pub async fn spawn_pty_process(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    dims: Dimensions,
) -> Result<SpawnedPty> {
    let program = program.to_owned();
    let args = args.to_owned();
    let cwd = cwd.to_owned();
    let env = env.clone();

    tokio::task::spawn_blocking(move || spawn_pty_process_blocking(&program, &args, &cwd, &env, dims))
        .await
        .context("pty spawn task panicked")?
}

fn spawn_pty_process_blocking(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    dims: Dimensions,
) -> Result<SpawnedPty> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: dims.rows,
            cols: dims.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("failed to allocate pty")?;

    let mut builder = CommandBuilder::new(program);
    builder.args(args);
    builder.cwd(cwd);
    for (k, v) in env {
        builder.env(k, v);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .context("failed to spawn child under pty")?;
    let pid = child.process_id();
    // Drop our copy of the slave so the master sees EOF once the child exits.
    drop(pair.slave);

    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(128);
    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(256);
    let (resize_tx, mut resize_rx) = mpsc::unbounded_channel::<Dimensions>();

    let mut reader = pair
        .master
        .try_clone_reader()
        .context("failed to clone pty reader")?;
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let writer = pair
        .master
        .take_writer()
        .context("failed to take pty writer")?;
    let writer = Arc::new(StdMutex::new(writer));
    tokio::spawn({
        let writer = writer.clone();
        async move {
            while let Some(bytes) = writer_rx.recv().await {
                let writer = writer.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    if let Ok(mut guard) = writer.lock() {
                        let _ = guard.write_all(&bytes);
                        let _ = guard.flush();
                    }
                })
                .await;
            }
        }
    });

    let master = Arc::new(StdMutex::new(pair.master));
    tokio::spawn({
        let master = master.clone();
        async move {
            while let Some(dims) = resize_rx.recv().await {
                if let Ok(guard) = master.lock() {
                    let _ = guard.resize(PtySize {
                        rows: dims.rows,
                        cols: dims.cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    });
                }
            }
        }
    });

    let (exit_tx, exit_rx) = oneshot::channel::<ExitInfo>();
    tokio::task::spawn_blocking(move || {
        let info = match child.wait() {
            Ok(status) => ExitInfo {
                code: Some(status.exit_code() as i32),
                signal: None,
            },
            Err(_) => ExitInfo {
                code: None,
                signal: None,
            },
        };
        let _ = exit_tx.send(info);
    });

    Ok(SpawnedPty {
        pid,
        writer_tx,
        output_rx,
        exit_rx: Some(exit_rx),
        exit_info: None,
        resize_tx,
    })
}
