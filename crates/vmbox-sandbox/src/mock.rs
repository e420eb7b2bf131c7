//! In-memory engine used by the shim's tests.
//!
//! Containers and processes live in a table; tests script process exits with
//! [`MockSandbox::set_exit`] and drive guest stdio through the duplex pairs
//! returned by [`MockSandbox::take_guest_io`]. Signals terminate the target
//! process with `128 + signal`, like a guest that honors SIGKILL.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use oci_spec::runtime::LinuxResources;
use tokio::io::DuplexStream;
use tokio::sync::watch;

use crate::{
    Cmd, ContainerConfig, ContainerStats, ContainerStatus, Engine, Error, GuestProcess, IoStream,
    Result, RuntimeConfig, Sandbox, SandboxConfig, State,
};

const IO_BUFFER: usize = 32 * 1024;

/// Test-side ends of a process's guest stdio.
pub struct GuestIo {
    /// Reads what the shim wrote to guest stdin.
    pub stdin: DuplexStream,
    /// Written by the test to emit guest stdout.
    pub stdout: DuplexStream,
    /// Written by the test to emit guest stderr.
    pub stderr: DuplexStream,
}

struct ProcEntry {
    exit_tx: watch::Sender<Option<i32>>,
    exit_rx: watch::Receiver<Option<i32>>,
    guest: Option<GuestIo>,
}

impl ProcEntry {
    fn new() -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            exit_tx,
            exit_rx,
            guest: None,
        }
    }
}

#[derive(Default)]
struct SandboxState {
    containers: HashMap<String, State>,
    processes: HashMap<String, ProcEntry>,
    signals: Vec<(String, u32, bool)>,
    winsizes: Vec<(String, u32, u32)>,
    updates: u32,
    stop_calls: u32,
    delete_calls: u32,
    next_token: u32,
    fail: HashSet<String>,
}

pub struct MockSandbox {
    id: String,
    netns: Option<String>,
    state: Mutex<SandboxState>,
}

impl MockSandbox {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            netns: None,
            state: Mutex::default(),
        })
    }

    fn from_config(config: &SandboxConfig) -> Arc<Self> {
        let sandbox = Arc::new(Self {
            id: config.id.clone(),
            netns: config.netns.clone(),
            state: Mutex::default(),
        });
        sandbox.add_container(&config.container.id);
        sandbox
    }

    /// Register a container and its init process entry.
    pub fn add_container(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(id.to_string(), State::Ready);
        state.processes.insert(id.to_string(), ProcEntry::new());
    }

    /// Make the next operation named `op` fail once.
    pub fn fail_next(&self, op: &str) {
        self.state.lock().unwrap().fail.insert(op.to_string());
    }

    fn take_failure(&self, op: &str) -> Result<()> {
        if self.state.lock().unwrap().fail.remove(op) {
            return Err(Error::Agent(format!("injected {op} failure")));
        }
        Ok(())
    }

    /// Mark a process exited. Closes any guest stdio still held by the mock
    /// so the shim's relay observes EOF before the exit code.
    pub fn set_exit(&self, process_id: &str, code: i32) {
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(process_id) {
            state.containers.insert(process_id.to_string(), State::Stopped);
        }
        if let Some(entry) = state.processes.get_mut(process_id) {
            entry.guest.take();
            let _ = entry.exit_tx.send(Some(code));
        }
    }

    /// Detach the guest-side stdio handles for a process. The caller owns
    /// them afterwards; dropping them delivers EOF to the shim.
    pub fn take_guest_io(&self, process_id: &str) -> Option<GuestIo> {
        self.state
            .lock()
            .unwrap()
            .processes
            .get_mut(process_id)
            .and_then(|entry| entry.guest.take())
    }

    pub fn stop_calls(&self) -> u32 {
        self.state.lock().unwrap().stop_calls
    }

    pub fn delete_calls(&self) -> u32 {
        self.state.lock().unwrap().delete_calls
    }

    pub fn signals(&self) -> Vec<(String, u32, bool)> {
        self.state.lock().unwrap().signals.clone()
    }

    pub fn winsizes(&self) -> Vec<(String, u32, u32)> {
        self.state.lock().unwrap().winsizes.clone()
    }

    fn set_state(&self, container_id: &str, to: State) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(container_id) {
            Some(current) => {
                *current = to;
                Ok(())
            }
            None => Err(Error::NotFound(container_id.to_string())),
        }
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn netns(&self) -> Option<String> {
        self.netns.clone()
    }

    fn containers(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    async fn start(&self) -> Result<()> {
        self.take_failure("start")?;
        let mut state = self.state.lock().unwrap();
        for value in state.containers.values_mut() {
            *value = State::Running;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.take_failure("stop")?;
        let mut state = self.state.lock().unwrap();
        state.stop_calls += 1;
        for value in state.containers.values_mut() {
            *value = State::Stopped;
        }
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.take_failure("delete")?;
        self.state.lock().unwrap().delete_calls += 1;
        Ok(())
    }

    async fn create_container(&self, config: ContainerConfig) -> Result<()> {
        self.take_failure("create_container")?;
        self.add_container(&config.id);
        Ok(())
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.take_failure("start_container")?;
        self.set_state(container_id, State::Running)
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.take_failure("stop_container")?;
        self.state.lock().unwrap().stop_calls += 1;
        self.set_state(container_id, State::Stopped)
    }

    async fn delete_container(&self, container_id: &str) -> Result<()> {
        self.take_failure("delete_container")?;
        let mut state = self.state.lock().unwrap();
        state.delete_calls += 1;
        state.containers.remove(container_id);
        state.processes.remove(container_id);
        Ok(())
    }

    async fn pause_container(&self, container_id: &str) -> Result<()> {
        self.take_failure("pause")?;
        self.set_state(container_id, State::Paused)
    }

    async fn resume_container(&self, container_id: &str) -> Result<()> {
        self.take_failure("resume")?;
        self.set_state(container_id, State::Running)
    }

    async fn status_container(&self, container_id: &str) -> Result<ContainerStatus> {
        let state = self.state.lock().unwrap();
        let current = state
            .containers
            .get(container_id)
            .ok_or_else(|| Error::NotFound(container_id.to_string()))?;
        Ok(ContainerStatus {
            id: container_id.to_string(),
            state: *current,
            annotations: HashMap::new(),
        })
    }

    async fn stats_container(&self, container_id: &str) -> Result<ContainerStats> {
        let state = self.state.lock().unwrap();
        if !state.containers.contains_key(container_id) {
            return Err(Error::NotFound(container_id.to_string()));
        }
        let mut stats = ContainerStats::default();
        stats.cgroup.cpu.total_usage = 1_000_000;
        stats.cgroup.memory.usage.usage = 4096;
        stats.cgroup.memory.usage.limit = 1 << 20;
        stats.cgroup.pids.current = 1;
        Ok(stats)
    }

    async fn update_container(
        &self,
        container_id: &str,
        _resources: LinuxResources,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(container_id) {
            return Err(Error::NotFound(container_id.to_string()));
        }
        state.updates += 1;
        Ok(())
    }

    async fn enter_container(&self, container_id: &str, _cmd: Cmd) -> Result<GuestProcess> {
        self.take_failure("enter")?;
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(container_id) {
            return Err(Error::NotFound(container_id.to_string()));
        }
        state.next_token += 1;
        let token = format!("{container_id}-token-{}", state.next_token);
        state.processes.insert(token.clone(), ProcEntry::new());
        Ok(GuestProcess {
            token,
            pid: 1000 + state.next_token as i32,
        })
    }

    async fn wait_process(&self, _container_id: &str, process_id: &str) -> Result<i32> {
        let mut rx = {
            let state = self.state.lock().unwrap();
            state
                .processes
                .get(process_id)
                .map(|entry| entry.exit_rx.clone())
                .ok_or_else(|| Error::NotFound(process_id.to_string()))?
        };
        let code = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Agent("exit channel closed".to_string()))?;
        Ok(code.unwrap())
    }

    async fn signal_process(
        &self,
        _container_id: &str,
        process_id: &str,
        signal: u32,
        all: bool,
    ) -> Result<()> {
        self.take_failure("signal")?;
        {
            let mut state = self.state.lock().unwrap();
            if !state.processes.contains_key(process_id) {
                return Err(Error::NotFound(process_id.to_string()));
            }
            state.signals.push((process_id.to_string(), signal, all));
        }
        self.set_exit(process_id, 128 + signal as i32);
        Ok(())
    }

    async fn winsize_process(
        &self,
        _container_id: &str,
        process_id: &str,
        height: u32,
        width: u32,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.processes.contains_key(process_id) {
            return Err(Error::NotFound(process_id.to_string()));
        }
        state.winsizes.push((process_id.to_string(), height, width));
        Ok(())
    }

    async fn io_stream(&self, _container_id: &str, process_id: &str) -> Result<IoStream> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .processes
            .get_mut(process_id)
            .ok_or_else(|| Error::NotFound(process_id.to_string()))?;

        let (shim_stdin, guest_stdin) = tokio::io::duplex(IO_BUFFER);
        let (guest_stdout, shim_stdout) = tokio::io::duplex(IO_BUFFER);
        let (guest_stderr, shim_stderr) = tokio::io::duplex(IO_BUFFER);
        entry.guest = Some(GuestIo {
            stdin: guest_stdin,
            stdout: guest_stdout,
            stderr: guest_stderr,
        });

        Ok(IoStream {
            stdin: Box::new(shim_stdin),
            stdout: Box::new(shim_stdout),
            stderr: Box::new(shim_stderr),
        })
    }
}

/// Engine whose sandboxes are [`MockSandbox`]es.
#[derive(Default)]
pub struct MockEngine {
    sandboxes: Mutex<HashMap<String, Arc<MockSandbox>>>,
}

impl MockEngine {
    /// Pre-register a sandbox, as if created by an earlier shim.
    pub fn insert_sandbox(&self, sandbox: Arc<MockSandbox>) {
        self.sandboxes
            .lock()
            .unwrap()
            .insert(sandbox.id(), sandbox);
    }

    pub fn sandbox(&self, id: &str) -> Option<Arc<MockSandbox>> {
        self.sandboxes.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn new(_config: &RuntimeConfig) -> Result<Self> {
        Ok(Self::default())
    }

    async fn create_sandbox(&self, config: SandboxConfig) -> Result<Arc<dyn Sandbox>> {
        let sandbox = MockSandbox::from_config(&config);
        self.insert_sandbox(sandbox.clone());
        Ok(sandbox)
    }

    async fn fetch_sandbox(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>> {
        self.sandbox(sandbox_id)
            .map(|sandbox| sandbox as Arc<dyn Sandbox>)
            .ok_or_else(|| Error::NotFound(sandbox_id.to_string()))
    }
}
