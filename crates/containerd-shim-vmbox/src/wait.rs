//! Exit reaping.
//!
//! One waiter task per started process. The waiter never runs ahead of the
//! I/O relay: stdout and stderr are flushed to the host pipes before the
//! exit status becomes observable through `wait`.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use containerd_shim::api::Status;
use log::error;
use tokio::sync::mpsc;
use vmbox_sandbox::Sandbox;

use crate::container::ProcState;
use crate::exec::{Exec, EXIT_CODE_UNSET};
use crate::sync::WaitableCell;

/// Record queued for the exit dispatcher after a process has been reaped.
#[derive(Debug, Clone)]
pub struct Exit {
    pub id: String,
    pub exec_id: String,
    pub pid: u32,
    pub status: u32,
    pub timestamp: DateTime<Utc>,
}

/// Reaps one process: container init when `exec` is `None`, the exec'd
/// process otherwise.
pub(crate) struct Waiter {
    pub sandbox: Arc<dyn Sandbox>,
    pub ec: mpsc::Sender<Exit>,
    pub container_id: String,
    pub exec_id: String,
    pub exec: Option<Arc<Exec>>,
    pub pid: u32,
    pub io_done: WaitableCell<()>,
    pub exit_ch: WaitableCell<u32>,
    pub state: Arc<Mutex<ProcState>>,
}

impl Waiter {
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        // make sure waiters are released even if this task dies early
        let guard = self.exit_ch.set_guard_with(|| EXIT_CODE_UNSET);

        self.io_done.wait().await;

        // the token is assigned during start; wait may have been issued
        // before that, so the exec record is consulted only now
        let process_id = match &self.exec {
            Some(exec) => exec.token(),
            None => self.container_id.clone(),
        };

        let status = match self
            .sandbox
            .wait_process(&self.container_id, &process_id)
            .await
        {
            Ok(code) => code as u32,
            Err(err) => {
                error!(
                    "wait for process failed, container: {}, process: {process_id}: {err}",
                    self.container_id
                );
                EXIT_CODE_UNSET
            }
        };

        let timestamp = Utc::now();
        {
            let mut state = self.state.lock().unwrap();
            state.status = Status::Stopped;
            state.exit_code = status;
            state.exited_at = Some(timestamp);
        }
        let _ = self.exit_ch.set(status);
        drop(guard);

        let _ = self
            .ec
            .send(Exit {
                id: self.container_id,
                exec_id: self.exec_id,
                pid: self.pid,
                status,
                timestamp,
            })
            .await;
    }
}
