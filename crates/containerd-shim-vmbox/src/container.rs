use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use containerd_shim::api::{CreateTaskRequest, Status};
use oci_spec::runtime::Spec;

use crate::exec::Exec;
use crate::io::TtyIo;
use crate::oci::ContainerType;
use crate::sync::WaitableCell;
use crate::{Error, Result};

/// Host-side stdio wiring of a process: named-pipe paths handed over by
/// containerd plus the terminal flag.
#[derive(Debug, Clone, Default)]
pub struct Stdio {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

/// Mutable status of one process, guarded by its own mutex. The lock is
/// never held across an engine call.
#[derive(Debug)]
pub struct ProcState {
    pub status: Status,
    pub exit_code: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

impl ProcState {
    pub fn new(exit_code: u32) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            status: Status::Created,
            exit_code,
            exited_at: None,
        }))
    }
}

/// One entry per OCI container in the sandbox.
pub struct Container {
    pub id: String,
    pub bundle: String,
    pub pid: u32,
    pub container_type: ContainerType,
    /// Parsed OCI spec, retained for the post-stop hooks at delete time.
    pub spec: Spec,
    pub stdio: Stdio,
    pub execs: HashMap<String, Arc<Exec>>,
    pub ttyio: Option<Arc<TtyIo>>,
    pub io_done: WaitableCell<()>,
    pub exit_ch: WaitableCell<u32>,
    pub state: Arc<Mutex<ProcState>>,
}

impl Container {
    pub fn new(
        req: &CreateTaskRequest,
        pid: u32,
        container_type: ContainerType,
        spec: Spec,
    ) -> Self {
        Self {
            id: req.id.clone(),
            bundle: req.bundle.clone(),
            pid,
            container_type,
            spec,
            stdio: Stdio {
                stdin: req.stdin.clone(),
                stdout: req.stdout.clone(),
                stderr: req.stderr.clone(),
                terminal: req.terminal,
            },
            execs: HashMap::new(),
            ttyio: None,
            io_done: WaitableCell::new(),
            exit_ch: WaitableCell::new(),
            state: ProcState::new(0),
        }
    }

    pub fn get_exec(&self, exec_id: &str) -> Result<Arc<Exec>> {
        self.execs
            .get(exec_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("exec does not exist: {exec_id}")))
    }

    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status
    }

    pub fn set_status(&self, status: Status) {
        self.state.lock().unwrap().status = status;
    }
}
