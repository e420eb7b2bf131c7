//! Stdio relay between host named pipes and guest streams.
//!
//! Each started process gets up to three copy tasks. The guest side applies
//! backpressure naturally: a copy blocks on the slow end, there is no
//! intermediate queue. Guest-stdout EOF closes the host endpoints exactly
//! once; the I/O-closed signal fires when every copy has finished, and the
//! exit path never runs ahead of it.

use std::sync::{Arc, Mutex};

use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::unix::pipe;
use tokio::task::AbortHandle;
use vmbox_sandbox::IoStream;

use crate::container::Stdio;
use crate::sync::WaitableCell;
use crate::Result;

const BUF_SIZE: usize = 32 * 1024;

static BUF_POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// Fixed-size copy buffer checked out of the shared pool, returned on drop.
struct PooledBuf(Option<Vec<u8>>);

impl PooledBuf {
    fn get() -> Self {
        let buf = BUF_POOL
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUF_SIZE]);
        Self(Some(buf))
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.0.take() {
            BUF_POOL.lock().unwrap().push(buf);
        }
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.0.as_deref().unwrap()
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.0.as_deref_mut().unwrap()
    }
}

async fn copy_stream(
    mut from: impl AsyncRead + Unpin,
    mut to: impl AsyncWrite + Unpin,
) -> std::io::Result<u64> {
    let mut buf = PooledBuf::get();
    let mut total = 0u64;
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        to.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    to.flush().await?;
    Ok(total)
}

/// Host ends of a process's stdio, opened before any copy starts so open
/// failures surface to the `start` caller.
pub struct HostIo {
    stdin: Option<pipe::Receiver>,
    stdout: Option<pipe::Sender>,
    stderr: Option<pipe::Sender>,
}

impl HostIo {
    /// Open the named-pipe endpoints: stdin read-only, stdout write-only,
    /// stderr write-only unless a terminal is in use. Empty paths are
    /// skipped.
    pub fn open(stdio: &Stdio) -> Result<Self> {
        let stdin = match stdio.stdin.as_str() {
            "" => None,
            path => Some(pipe::OpenOptions::new().open_receiver(path)?),
        };
        let stdout = match stdio.stdout.as_str() {
            "" => None,
            path => Some(pipe::OpenOptions::new().open_sender(path)?),
        };
        let stderr = match stdio.stderr.as_str() {
            "" => None,
            path if !stdio.terminal => Some(pipe::OpenOptions::new().open_sender(path)?),
            _ => None,
        };
        Ok(Self {
            stdin,
            stdout,
            stderr,
        })
    }
}

/// Handle to the copy tasks of one process.
///
/// The endpoints themselves are owned by the tasks; closing works by
/// aborting a task at its await point, which drops both of its ends. Option
/// taking makes every close path run at most once.
#[derive(Default)]
pub struct TtyIo {
    stdin: Mutex<Option<AbortHandle>>,
    outputs: Mutex<Vec<AbortHandle>>,
}

impl TtyIo {
    /// Close the stdin half: the guest sees EOF on its stdin. Idempotent.
    pub fn close_stdin(&self) {
        if let Some(handle) = self.stdin.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Close every host endpoint. Runs at most once per handle.
    pub fn close(&self) {
        self.close_stdin();
        for handle in self.outputs.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

/// Launch the copy tasks for one process and return the close handle.
///
/// `io_done` fires after all copies have finished and the host endpoints are
/// closed; the waiter blocks on it before collecting the exit status.
pub fn io_copy(host: HostIo, guest: IoStream, io_done: WaitableCell<()>) -> Arc<TtyIo> {
    let tty = Arc::new(TtyIo::default());
    let mut copies = Vec::new();

    if let Some(rx) = host.stdin {
        let mut guest_stdin = guest.stdin;
        let handle = tokio::spawn(async move {
            // the guest may exit before the host closes stdin
            let _ = copy_stream(rx, &mut guest_stdin).await;
            let _ = guest_stdin.shutdown().await;
        });
        *tty.stdin.lock().unwrap() = Some(handle.abort_handle());
        copies.push(handle);
    }

    if let Some(tx) = host.stdout {
        let closer = tty.clone();
        let mut guest_stdout = guest.stdout;
        let handle = tokio::spawn(async move {
            if let Err(err) = copy_stream(&mut guest_stdout, tx).await {
                warn!("stdout copy: {err}");
            }
            closer.close();
        });
        copies.push(handle);
    }

    if let Some(tx) = host.stderr {
        let mut guest_stderr = guest.stderr;
        let handle = tokio::spawn(async move {
            if let Err(err) = copy_stream(&mut guest_stderr, tx).await {
                warn!("stderr copy: {err}");
            }
        });
        tty.outputs.lock().unwrap().push(handle.abort_handle());
        copies.push(handle);
    }

    let closer = tty.clone();
    tokio::spawn(async move {
        for copy in copies {
            let _ = copy.await;
        }
        closer.close();
        let _ = io_done.set(());
    });

    tty
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;
    use crate::utils::WithTimeout as _;

    fn fifo(dir: &std::path::Path, name: &str) -> String {
        let path = dir.join(name);
        mkfifo(&path, Mode::from_bits_truncate(0o600)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn guest_streams() -> (IoStream, tokio::io::DuplexStream, tokio::io::DuplexStream) {
        let (stdin_tx, _stdin_rx) = tokio::io::duplex(1024);
        let (stdout_tx, stdout_rx) = tokio::io::duplex(1024);
        let (stderr_tx, stderr_rx) = tokio::io::duplex(1024);
        (
            IoStream {
                stdin: Box::new(stdin_tx),
                stdout: Box::new(stdout_rx),
                stderr: Box::new(stderr_rx),
            },
            stdout_tx,
            stderr_tx,
        )
    }

    #[tokio::test]
    async fn stdout_bytes_reach_host_before_io_done() {
        let dir = tempfile::tempdir().unwrap();
        let stdio = Stdio {
            stdout: fifo(dir.path(), "stdout"),
            ..Default::default()
        };
        let mut reader = pipe::OpenOptions::new()
            .open_receiver(&stdio.stdout)
            .unwrap();

        let (guest, mut stdout_tx, stderr_tx) = guest_streams();
        drop(stderr_tx);
        let host = HostIo::open(&stdio).unwrap();
        let io_done = WaitableCell::new();
        let _tty = io_copy(host, guest, io_done.clone());

        stdout_tx.write_all(b"hello\n").await.unwrap();
        assert_eq!(None, io_done.wait().with_timeout(Duration::ZERO).await);

        drop(stdout_tx);
        io_done.wait().await;

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello\n");
    }

    #[tokio::test]
    async fn close_stdin_is_idempotent_and_releases_relay() {
        let dir = tempfile::tempdir().unwrap();
        let stdio = Stdio {
            stdin: fifo(dir.path(), "stdin"),
            stdout: fifo(dir.path(), "stdout"),
            ..Default::default()
        };
        let _out_reader = pipe::OpenOptions::new()
            .open_receiver(&stdio.stdout)
            .unwrap();

        let (guest, stdout_tx, stderr_tx) = guest_streams();
        drop(stderr_tx);
        let host = HostIo::open(&stdio).unwrap();
        let io_done = WaitableCell::new();
        let tty = io_copy(host, guest, io_done.clone());

        tty.close_stdin();
        tty.close_stdin();

        drop(stdout_tx);
        io_done.wait().await;
    }

    #[tokio::test]
    async fn stderr_is_skipped_with_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let stdio = Stdio {
            stdout: fifo(dir.path(), "stdout"),
            stderr: fifo(dir.path(), "stderr"),
            terminal: true,
            ..Default::default()
        };
        let _out_reader = pipe::OpenOptions::new()
            .open_receiver(&stdio.stdout)
            .unwrap();

        let host = HostIo::open(&stdio).unwrap();
        assert!(host.stderr.is_none());
        assert!(host.stdout.is_some());
    }

    #[tokio::test]
    async fn buffers_return_to_pool() {
        {
            let _buf = PooledBuf::get();
        }
        assert!(!BUF_POOL.lock().unwrap().is_empty());
    }
}
