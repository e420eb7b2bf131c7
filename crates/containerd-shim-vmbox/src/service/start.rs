//! Starting processes: the container init and exec'd processes.

use containerd_shim::api::{StartRequest, StartResponse, Status};
use containerd_shim::protos::events::task::{TaskExecStarted, TaskStart};
use vmbox_sandbox::Sandbox as _;

use super::Service;
use crate::io::{self, HostIo};
use crate::oci::{self, ContainerType};
use crate::wait::Waiter;
use crate::Result;

impl Service {
    pub(crate) async fn task_start(&self, req: StartRequest) -> Result<StartResponse> {
        let mut state = self.state.lock().await;
        state.get_container(&req.id)?;
        let sandbox = state.sandbox()?;

        if !req.exec_id.is_empty() {
            // exec'd process
            let exec = state.get_container(&req.id)?.get_exec(&req.exec_id)?;

            let process = sandbox.enter_container(&req.id, exec.cmd.clone()).await?;
            exec.set_token(&process.token);
            exec.state.lock().unwrap().status = Status::Running;

            let tty = exec.tty();
            if tty.height != 0 && tty.width != 0 {
                sandbox
                    .winsize_process(&req.id, &process.token, tty.height, tty.width)
                    .await?;
            }

            let host = HostIo::open(&tty.stdio())?;
            let streams = sandbox.io_stream(&req.id, &process.token).await?;
            let relay = io::io_copy(host, streams, exec.io_done.clone());
            *exec.ttyio.lock().unwrap() = Some(relay);

            Waiter {
                sandbox: sandbox.clone(),
                ec: self.ec.clone(),
                container_id: req.id.clone(),
                exec_id: req.exec_id.clone(),
                exec: Some(exec.clone()),
                pid: exec.pid,
                io_done: exec.io_done.clone(),
                exit_ch: exec.exit_ch.clone(),
                state: exec.state.clone(),
            }
            .spawn();

            self.publish(TaskExecStarted {
                container_id: req.id,
                exec_id: req.exec_id,
                pid: exec.pid,
            })
            .await;

            return Ok(StartResponse {
                pid: exec.pid,
                ..Default::default()
            });
        }

        // container init
        let (container_type, bundle, hooks, stdio, io_done, exit_ch, proc_state, pid) = {
            let container = state.get_container(&req.id)?;
            (
                container.container_type,
                container.bundle.clone(),
                oci::poststart_hooks(&container.spec),
                container.stdio.clone(),
                container.io_done.clone(),
                container.exit_ch.clone(),
                container.state.clone(),
                container.pid,
            )
        };

        match container_type {
            ContainerType::Sandbox => sandbox.start().await?,
            ContainerType::Member => sandbox.start_container(&req.id).await?,
        }

        oci::run_hooks(&hooks, sandbox.netns().as_deref(), &req.id, &bundle).await?;

        proc_state.lock().unwrap().status = Status::Running;

        let host = HostIo::open(&stdio)?;
        let streams = sandbox.io_stream(&req.id, &req.id).await?;
        let relay = io::io_copy(host, streams, io_done.clone());
        state.get_container_mut(&req.id)?.ttyio = Some(relay);

        Waiter {
            sandbox: sandbox.clone(),
            ec: self.ec.clone(),
            container_id: req.id.clone(),
            exec_id: String::new(),
            exec: None,
            pid,
            io_done,
            exit_ch,
            state: proc_state,
        }
        .spawn();

        self.publish(TaskStart {
            container_id: req.id,
            pid,
        })
        .await;

        Ok(StartResponse {
            pid,
            ..Default::default()
        })
    }
}
