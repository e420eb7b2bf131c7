//! Deleting processes: exec bookkeeping removal and full container
//! teardown with post-stop hooks and rootfs unmount.

use std::path::Path;

use containerd_shim::api::{DeleteRequest, DeleteResponse};
use containerd_shim::mount::umount_recursive;
use containerd_shim::protos::events::task::TaskDelete;
use log::warn;
use vmbox_sandbox::{Sandbox as _, State};

use super::Service;
use crate::events::ToTimestamp;
use crate::oci;
use crate::Result;

impl Service {
    pub(crate) async fn task_delete(&self, req: DeleteRequest) -> Result<DeleteResponse> {
        let mut state = self.state.lock().await;

        if !req.exec_id.is_empty() {
            let container = state.get_container_mut(&req.id)?;
            let exec = container.get_exec(&req.exec_id)?;
            container.execs.remove(&req.exec_id);
            state.processes.remove(&exec.pid);

            let (exit_code, exited_at) = {
                let st = exec.state.lock().unwrap();
                (st.exit_code, st.exited_at)
            };
            return Ok(DeleteResponse {
                pid: exec.pid,
                exit_status: exit_code,
                exited_at: exited_at.map(ToTimestamp::to_timestamp).into(),
                ..Default::default()
            });
        }

        let sandbox = state.sandbox()?;
        let (bundle, hooks, pid, proc_state) = {
            let container = state.get_container(&req.id)?;
            (
                container.bundle.clone(),
                oci::poststop_hooks(&container.spec),
                container.pid,
                container.state.clone(),
            )
        };

        // containers are removed at the container level only; the sandbox
        // itself is torn down by shutdown once the table is empty
        let status = sandbox.status_container(&req.id).await?;
        if status.state != State::Stopped {
            sandbox.stop_container(&req.id).await?;
        }
        sandbox.delete_container(&req.id).await?;

        oci::run_hooks(&hooks, sandbox.netns().as_deref(), &req.id, &bundle).await?;

        let rootfs = Path::new(&bundle).join("rootfs");
        if let Err(err) = umount_recursive(rootfs.to_str(), 0) {
            warn!("failed to clean up rootfs mount: {err}");
        }

        state.containers.remove(&req.id);
        state.processes.remove(&pid);

        let (exit_code, exited_at) = {
            let st = proc_state.lock().unwrap();
            (st.exit_code, st.exited_at)
        };

        self.publish(TaskDelete {
            container_id: req.id,
            pid,
            exit_status: exit_code,
            exited_at: exited_at.map(ToTimestamp::to_timestamp).into(),
            ..Default::default()
        })
        .await;

        Ok(DeleteResponse {
            pid,
            exit_status: exit_code,
            exited_at: exited_at.map(ToTimestamp::to_timestamp).into(),
            ..Default::default()
        })
    }
}
