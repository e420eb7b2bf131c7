//! The task service: the shim side of the containerd task API.
//!
//! One instance serves one sandbox. Every handler is serialized by the
//! service mutex; `wait` holds it only for the lookup and then parks on the
//! process's exit cell so other calls keep flowing.

mod create;
mod delete;
mod start;


use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use containerd_shim::api::{
    CheckpointTaskRequest, CloseIORequest, ConnectRequest, ConnectResponse, CreateTaskRequest,
    CreateTaskResponse, DeleteRequest, DeleteResponse, Empty, ExecProcessRequest, KillRequest,
    PauseRequest, PidsRequest, PidsResponse, ProcessInfo, ResizePtyRequest, ResumeRequest,
    ShutdownRequest, StartRequest, StartResponse, StateRequest, StateResponse, StatsRequest,
    StatsResponse, Status, UpdateTaskRequest, WaitRequest, WaitResponse,
};
use containerd_shim::event::Event;
use containerd_shim::protos::events::task::{
    TaskExecAdded, TaskExit, TaskPaused, TaskResumed,
};
use containerd_shim::protos::prost_types::Any;
use containerd_shim::protos::shim::oci::ProcessDetails;
use containerd_shim::{ExitSignal, Task, TtrpcContext, TtrpcResult};
use log::debug;
use oci_spec::runtime::LinuxResources;
use tokio::sync::{mpsc, Mutex};
use vmbox_sandbox::{Engine, RuntimeConfig, Sandbox};

use crate::container::Container;
use crate::events::{self, EventQueue, ToTimestamp};
use crate::exec::Exec;
use crate::metrics::marshal_metrics;
use crate::wait::Exit;
use crate::{Error, Result};

/// First pseudo-pid handed out; lower values stay clear of the values init
/// systems expect.
const FIRST_PID: u32 = 5;

const EXIT_BUFFER_SIZE: usize = 32;

pub(crate) struct ServiceState {
    pub sandbox: Option<Arc<dyn Sandbox>>,
    pub containers: HashMap<String, Container>,
    /// pseudo-pid → exec id; the empty string marks an init process.
    pub processes: HashMap<u32, String>,
    pid_counter: u32,
}

impl ServiceState {
    fn new() -> Self {
        Self {
            sandbox: None,
            containers: HashMap::new(),
            processes: HashMap::new(),
            pid_counter: FIRST_PID,
        }
    }

    /// Allocate a pseudo-pid unique within this shim. Probes upward from
    /// the counter and reseeds at the floor when the counter wraps.
    pub fn next_pid(&mut self) -> u32 {
        while self.processes.contains_key(&self.pid_counter) {
            self.pid_counter = self.pid_counter.wrapping_add(1);
            if self.pid_counter < FIRST_PID {
                self.pid_counter = FIRST_PID;
            }
        }
        self.pid_counter
    }

    pub fn get_container(&self, id: &str) -> Result<&Container> {
        self.containers
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("container does not exist: {id}")))
    }

    pub fn get_container_mut(&mut self, id: &str) -> Result<&mut Container> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("container does not exist: {id}")))
    }

    pub fn sandbox(&self) -> Result<Arc<dyn Sandbox>> {
        self.sandbox
            .clone()
            .ok_or_else(|| Error::FailedPrecondition("sandbox has not been created".to_string()))
    }
}

/// The shim service; remote task calls land here.
pub struct Service {
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) config: RuntimeConfig,
    pub(crate) state: Mutex<ServiceState>,
    pub(crate) events: EventQueue,
    pub(crate) ec: mpsc::Sender<Exit>,
    exit: Arc<ExitSignal>,
    pub(crate) id: String,
}

impl Service {
    pub fn new(
        engine: Arc<dyn Engine>,
        config: RuntimeConfig,
        events: EventQueue,
        exit: Arc<ExitSignal>,
        id: impl AsRef<str>,
    ) -> Self {
        let (ec, ec_rx) = mpsc::channel(EXIT_BUFFER_SIZE);
        spawn_exit_dispatcher(events.clone(), ec_rx);
        Self {
            engine,
            config,
            state: Mutex::new(ServiceState::new()),
            events,
            ec,
            exit,
            id: id.as_ref().to_string(),
        }
    }

    pub(crate) async fn publish(&self, event: impl Event) {
        events::send(&self.events, event).await;
    }
}

/// Drains exit records into `TaskExit` events for the host runtime.
fn spawn_exit_dispatcher(events: EventQueue, mut ec: mpsc::Receiver<Exit>) {
    tokio::spawn(async move {
        while let Some(exit) = ec.recv().await {
            let id = if exit.exec_id.is_empty() {
                exit.id.clone()
            } else {
                exit.exec_id.clone()
            };
            events::send(
                &events,
                TaskExit {
                    container_id: exit.id,
                    id,
                    pid: exit.pid,
                    exit_status: exit.status,
                    exited_at: Some(exit.timestamp.to_timestamp()).into(),
                },
            )
            .await;
        }
    });
}

// Handler bodies, callable without a ttrpc context from tests.
impl Service {
    pub(crate) async fn task_exec(&self, req: ExecProcessRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        {
            let container = state.get_container(&req.id)?;
            if container.execs.contains_key(&req.exec_id) {
                return Err(Error::AlreadyExists(format!("exec {}", req.exec_id)));
            }
        }
        let pid = state.next_pid();
        let exec = Arc::new(Exec::new(&req, pid)?);
        state
            .get_container_mut(&req.id)?
            .execs
            .insert(req.exec_id.clone(), exec);
        state.processes.insert(pid, req.exec_id.clone());

        self.publish(TaskExecAdded {
            container_id: req.id,
            exec_id: req.exec_id,
        })
        .await;
        Ok(())
    }

    pub(crate) async fn task_wait(&self, req: WaitRequest) -> Result<WaitResponse> {
        let (exit_ch, proc_state) = {
            let state = self.state.lock().await;
            let container = state.get_container(&req.id)?;
            if req.exec_id.is_empty() {
                (container.exit_ch.clone(), container.state.clone())
            } else {
                let exec = container.get_exec(&req.exec_id)?;
                (exec.exit_ch.clone(), exec.state.clone())
            }
        };

        // park outside the service lock; other task calls keep flowing
        let exit_status = exit_ch.wait().await;
        let exited_at = proc_state.lock().unwrap().exited_at;

        Ok(WaitResponse {
            exit_status,
            exited_at: exited_at.map(ToTimestamp::to_timestamp).into(),
            ..Default::default()
        })
    }

    pub(crate) async fn task_state(&self, req: StateRequest) -> Result<StateResponse> {
        let state = self.state.lock().await;
        let container = state.get_container(&req.id)?;

        if req.exec_id.is_empty() {
            let st = container.state.lock().unwrap();
            return Ok(StateResponse {
                id: container.id.clone(),
                bundle: container.bundle.clone(),
                pid: container.pid,
                status: st.status as _,
                stdin: container.stdio.stdin.clone(),
                stdout: container.stdio.stdout.clone(),
                stderr: container.stdio.stderr.clone(),
                terminal: container.stdio.terminal,
                exit_status: st.exit_code,
                exited_at: st.exited_at.map(ToTimestamp::to_timestamp).into(),
                ..Default::default()
            });
        }

        let exec = container.get_exec(&req.exec_id)?;
        let tty = exec.tty();
        let st = exec.state.lock().unwrap();
        Ok(StateResponse {
            id: exec.token(),
            bundle: container.bundle.clone(),
            pid: exec.pid,
            status: st.status as _,
            stdin: tty.stdin,
            stdout: tty.stdout,
            stderr: tty.stderr,
            terminal: tty.terminal,
            exit_status: st.exit_code,
            exited_at: st.exited_at.map(ToTimestamp::to_timestamp).into(),
            ..Default::default()
        })
    }

    pub(crate) async fn task_kill(&self, req: KillRequest) -> Result<()> {
        let state = self.state.lock().await;
        let container = state.get_container(&req.id)?;
        let process_id = if req.exec_id.is_empty() {
            container.id.clone()
        } else {
            container.get_exec(&req.exec_id)?.token()
        };
        let sandbox = state.sandbox()?;
        sandbox
            .signal_process(&req.id, &process_id, req.signal, req.all)
            .await?;
        Ok(())
    }

    pub(crate) async fn task_pause(&self, req: PauseRequest) -> Result<()> {
        let state = self.state.lock().await;
        let container = state.get_container(&req.id)?;
        let proc_state = container.state.clone();
        let sandbox = state.sandbox()?;

        proc_state.lock().unwrap().status = Status::Pausing;
        match sandbox.pause_container(&req.id).await {
            Ok(()) => {
                proc_state.lock().unwrap().status = Status::Paused;
            }
            Err(err) => {
                proc_state.lock().unwrap().status = Status::Unknown;
                return Err(err.into());
            }
        }

        self.publish(TaskPaused {
            container_id: req.id,
        })
        .await;
        Ok(())
    }

    pub(crate) async fn task_resume(&self, req: ResumeRequest) -> Result<()> {
        let state = self.state.lock().await;
        let container = state.get_container(&req.id)?;
        let proc_state = container.state.clone();
        let sandbox = state.sandbox()?;

        match sandbox.resume_container(&req.id).await {
            Ok(()) => {
                proc_state.lock().unwrap().status = Status::Running;
            }
            Err(err) => {
                proc_state.lock().unwrap().status = Status::Unknown;
                return Err(err.into());
            }
        }

        self.publish(TaskResumed {
            container_id: req.id,
        })
        .await;
        Ok(())
    }

    pub(crate) async fn task_resize_pty(&self, req: ResizePtyRequest) -> Result<()> {
        let state = self.state.lock().await;
        let container = state.get_container(&req.id)?;

        if !req.exec_id.is_empty() {
            // the guest learns the size when the exec starts
            container
                .get_exec(&req.exec_id)?
                .set_winsize(req.height, req.width);
            return Ok(());
        }

        let sandbox = state.sandbox()?;
        sandbox
            .winsize_process(&req.id, &req.id, req.height, req.width)
            .await?;
        Ok(())
    }

    pub(crate) async fn task_close_io(&self, req: CloseIORequest) -> Result<()> {
        let state = self.state.lock().await;
        let container = state.get_container(&req.id)?;
        let tty = if req.exec_id.is_empty() {
            container.ttyio.clone()
        } else {
            container.get_exec(&req.exec_id)?.ttyio.lock().unwrap().clone()
        };
        if let Some(tty) = tty {
            tty.close_stdin();
        }
        Ok(())
    }

    pub(crate) async fn task_connect(&self, req: ConnectRequest) -> Result<ConnectResponse> {
        let state = self.state.lock().await;
        let container = state.get_container(&req.id)?;
        Ok(ConnectResponse {
            shim_pid: std::process::id(),
            task_pid: container.pid,
            ..Default::default()
        })
    }

    pub(crate) async fn task_shutdown(&self, _req: ShutdownRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.containers.is_empty() {
            return Ok(());
        }
        debug!("shutting down shim of sandbox {}", self.id);

        // taking the handle makes repeated shutdowns tear down only once
        let mut first_err = None;
        if let Some(sandbox) = state.sandbox.take() {
            if let Err(err) = sandbox.stop().await {
                first_err = Some(err);
            }
            if let Err(err) = sandbox.delete().await {
                first_err.get_or_insert(err);
            }
        }

        // the process exits only after the service lock is released
        drop(state);
        self.exit.signal();

        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    pub(crate) async fn task_stats(&self, req: StatsRequest) -> Result<StatsResponse> {
        let state = self.state.lock().await;
        state.get_container(&req.id)?;
        let sandbox = state.sandbox()?;
        let stats = sandbox.stats_container(&req.id).await?;
        Ok(StatsResponse {
            stats: Some(marshal_metrics(&stats)?),
        })
    }

    pub(crate) async fn task_update(&self, req: UpdateTaskRequest) -> Result<()> {
        let state = self.state.lock().await;
        state.get_container(&req.id)?;
        let sandbox = state.sandbox()?;

        let any = req
            .resources
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("missing resources".to_string()))?;
        let resources: LinuxResources = serde_json::from_slice(&any.value)
            .map_err(|err| Error::InvalidArgument(format!("invalid resources: {err}")))?;

        sandbox.update_container(&req.id, resources).await?;
        Ok(())
    }

    pub(crate) async fn task_pids(&self, _req: PidsRequest) -> Result<PidsResponse> {
        let processes = self.state.lock().await.processes.clone();

        let mut out = Vec::with_capacity(processes.len());
        for (pid, exec_id) in processes {
            let mut info = ProcessInfo {
                pid,
                ..Default::default()
            };
            if !exec_id.is_empty() {
                let details = ProcessDetails { exec_id };
                info.info = Some(Any::from_msg(&details).unwrap());
            }
            out.push(info);
        }
        Ok(PidsResponse {
            processes: out,
            ..Default::default()
        })
    }
}

#[async_trait]
impl Task for Service {
    async fn create(
        &self,
        _ctx: &TtrpcContext,
        req: CreateTaskRequest,
    ) -> TtrpcResult<CreateTaskResponse> {
        debug!("create: {:?}", req);
        Ok(self.task_create(req).await?)
    }

    async fn start(&self, _ctx: &TtrpcContext, req: StartRequest) -> TtrpcResult<StartResponse> {
        debug!("start: {:?}", req);
        Ok(self.task_start(req).await?)
    }

    async fn exec(&self, _ctx: &TtrpcContext, req: ExecProcessRequest) -> TtrpcResult<Empty> {
        debug!("exec: {:?}", req);
        self.task_exec(req).await?;
        Ok(Empty::default())
    }

    async fn wait(&self, _ctx: &TtrpcContext, req: WaitRequest) -> TtrpcResult<WaitResponse> {
        debug!("wait: {:?}", req);
        Ok(self.task_wait(req).await?)
    }

    async fn delete(
        &self,
        _ctx: &TtrpcContext,
        req: DeleteRequest,
    ) -> TtrpcResult<DeleteResponse> {
        debug!("delete: {:?}", req);
        Ok(self.task_delete(req).await?)
    }

    async fn kill(&self, _ctx: &TtrpcContext, req: KillRequest) -> TtrpcResult<Empty> {
        debug!("kill: {:?}", req);
        self.task_kill(req).await?;
        Ok(Empty::default())
    }

    async fn pause(&self, _ctx: &TtrpcContext, req: PauseRequest) -> TtrpcResult<Empty> {
        debug!("pause: {:?}", req);
        self.task_pause(req).await?;
        Ok(Empty::default())
    }

    async fn resume(&self, _ctx: &TtrpcContext, req: ResumeRequest) -> TtrpcResult<Empty> {
        debug!("resume: {:?}", req);
        self.task_resume(req).await?;
        Ok(Empty::default())
    }

    async fn resize_pty(&self, _ctx: &TtrpcContext, req: ResizePtyRequest) -> TtrpcResult<Empty> {
        debug!("resize_pty: {:?}", req);
        self.task_resize_pty(req).await?;
        Ok(Empty::default())
    }

    async fn state(&self, _ctx: &TtrpcContext, req: StateRequest) -> TtrpcResult<StateResponse> {
        debug!("state: {:?}", req);
        Ok(self.task_state(req).await?)
    }

    async fn close_io(&self, _ctx: &TtrpcContext, req: CloseIORequest) -> TtrpcResult<Empty> {
        debug!("close_io: {:?}", req);
        self.task_close_io(req).await?;
        Ok(Empty::default())
    }

    async fn connect(
        &self,
        _ctx: &TtrpcContext,
        req: ConnectRequest,
    ) -> TtrpcResult<ConnectResponse> {
        debug!("connect: {:?}", req);
        Ok(self.task_connect(req).await?)
    }

    async fn shutdown(&self, _ctx: &TtrpcContext, req: ShutdownRequest) -> TtrpcResult<Empty> {
        debug!("shutdown");
        self.task_shutdown(req).await?;
        Ok(Empty::default())
    }

    async fn stats(&self, _ctx: &TtrpcContext, req: StatsRequest) -> TtrpcResult<StatsResponse> {
        debug!("stats: {:?}", req);
        Ok(self.task_stats(req).await?)
    }

    async fn update(&self, _ctx: &TtrpcContext, req: UpdateTaskRequest) -> TtrpcResult<Empty> {
        debug!("update: {:?}", req);
        self.task_update(req).await?;
        Ok(Empty::default())
    }

    async fn pids(&self, _ctx: &TtrpcContext, req: PidsRequest) -> TtrpcResult<PidsResponse> {
        debug!("pids: {:?}", req);
        Ok(self.task_pids(req).await?)
    }

    async fn checkpoint(
        &self,
        _ctx: &TtrpcContext,
        _req: CheckpointTaskRequest,
    ) -> TtrpcResult<Empty> {
        Err(Error::NotImplemented("service Checkpoint".to_string()).into())
    }
}
