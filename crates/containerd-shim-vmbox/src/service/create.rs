//! Container creation: rootfs assembly, sandbox/member classification, and
//! registration in the service tables.

use anyhow::anyhow;
use containerd_shim::api::{CreateTaskRequest, CreateTaskResponse};
use containerd_shim::mount::{mount_rootfs, umount_recursive};
use containerd_shim::protos::events::task::{TaskCreate, TaskIo};
use log::warn;
use oci_spec::runtime::Spec;
use vmbox_sandbox::Sandbox as _;

use super::{Service, ServiceState};
use crate::container::Container;
use crate::oci::{self, ContainerType};
use crate::utils::valid_create_params;
use crate::{Error, Result};

impl Service {
    pub(crate) async fn task_create(&self, req: CreateTaskRequest) -> Result<CreateTaskResponse> {
        if !req.checkpoint.is_empty() || !req.parent_checkpoint.is_empty() {
            return Err(Error::NotImplemented(
                "checkpoint is not supported".to_string(),
            ));
        }

        let bundle = valid_create_params(&req.id, &req.bundle)?;

        let mut state = self.state.lock().await;
        if state.containers.contains_key(&req.id) {
            return Err(Error::InvalidArgument(format!(
                "id already in use: {}",
                req.id
            )));
        }

        let mut spec = Spec::load(bundle.join("config.json")).map_err(|err| {
            Error::InvalidArgument(format!("could not load runtime spec: {err}"))
        })?;

        // Containers only keep the mount namespace to themselves; the rest
        // is shared with the sandbox, so everything except the network
        // namespace is dropped. An empty netns path inherits the sandbox's.
        let netns = state.sandbox.as_ref().and_then(|sandbox| sandbox.netns());
        oci::strip_namespaces(&mut spec, netns.as_deref());

        let rootfs = bundle.join("rootfs");
        for rm in &req.rootfs {
            let mount_type = match rm.r#type.as_str() {
                "" => None,
                other => Some(other),
            };
            let source = match rm.source.as_str() {
                "" => None,
                other => Some(other),
            };
            if let Err(err) = mount_rootfs(mount_type, source, &rm.options.to_vec(), &rootfs) {
                unmount_on_failure(&rootfs);
                return Err(err.into());
            }
        }

        let container = match self.create_in_sandbox(&mut state, &req, spec, netns).await {
            Ok(container) => container,
            Err(err) => {
                unmount_on_failure(&rootfs);
                return Err(err);
            }
        };

        let pid = container.pid;
        state.processes.insert(pid, String::new());
        state.containers.insert(req.id.clone(), container);

        self.publish(TaskCreate {
            container_id: req.id,
            bundle: req.bundle,
            rootfs: req.rootfs,
            io: Some(TaskIo {
                stdin: req.stdin,
                stdout: req.stdout,
                stderr: req.stderr,
                terminal: req.terminal,
            }),
            pid,
            ..Default::default()
        })
        .await;

        Ok(CreateTaskResponse {
            pid,
            ..Default::default()
        })
    }

    /// Create the sandbox (first, sandbox-type container) or join the
    /// existing one (member container), then build the bookkeeping record.
    async fn create_in_sandbox(
        &self,
        state: &mut ServiceState,
        req: &CreateTaskRequest,
        mut spec: Spec,
        netns: Option<String>,
    ) -> Result<Container> {
        let container_type = oci::container_type(&spec);
        let disable_output = !req.terminal && spec_wants_terminal(&spec);

        match container_type {
            ContainerType::Sandbox => {
                if let Some(sandbox) = &state.sandbox {
                    return Err(Error::AlreadyExists(format!(
                        "cannot create another sandbox in sandbox: {}",
                        sandbox.id()
                    )));
                }

                let config =
                    oci::sandbox_config(&spec, &self.config, &req.id, &req.bundle, disable_output);
                oci::run_hooks(
                    &oci::prestart_hooks(&spec),
                    config.netns.as_deref(),
                    &req.id,
                    &req.bundle,
                )
                .await?;

                let sandbox = self.engine.create_sandbox(config).await?;
                let containers = sandbox.containers();
                if containers.len() != 1 {
                    return Err(Error::Any(anyhow!(
                        "container list from sandbox is wrong, expecting one container, found {}",
                        containers.len()
                    )));
                }
                state.sandbox = Some(sandbox);
            }
            ContainerType::Member => {
                let sandbox = state.sandbox()?;

                // empty-dir volumes become tmpfs inside the VM
                oci::set_ephemeral_storage_type(&mut spec);

                oci::run_hooks(
                    &oci::prestart_hooks(&spec),
                    netns.as_deref(),
                    &req.id,
                    &req.bundle,
                )
                .await?;

                sandbox
                    .create_container(oci::container_config(
                        &spec,
                        &req.id,
                        &req.bundle,
                        disable_output,
                    ))
                    .await?;
            }
        }

        let pid = state.next_pid();
        Ok(Container::new(req, pid, container_type, spec))
    }
}

fn spec_wants_terminal(spec: &Spec) -> bool {
    spec.process()
        .as_ref()
        .and_then(|process| process.terminal().as_ref().copied())
        .unwrap_or_default()
}

fn unmount_on_failure(rootfs: &std::path::Path) {
    if let Err(err) = umount_recursive(rootfs.to_str(), 0) {
        warn!("failed to clean up rootfs mount: {err}");
    }
}
