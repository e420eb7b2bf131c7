//! OCI spec handling: container classification, namespace rewriting, and
//! lifecycle hook execution.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::fd::AsFd as _;
use std::path::{Path, PathBuf};
use std::process::Stdio as ProcessStdio;
use std::time::Duration;

use anyhow::anyhow;
use log::debug;
use nix::sched::CloneFlags;
use oci_spec::runtime::{Hook, LinuxNamespaceType, Spec};
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;
use vmbox_sandbox::{ContainerConfig, RuntimeConfig, SandboxConfig};

use crate::utils::WithTimeout as _;
use crate::{Error, Result};

pub const CONTAINER_TYPE_ANNOTATION: &str = "io.kubernetes.cri.container-type";
pub const SANDBOX_ID_ANNOTATION: &str = "io.kubernetes.cri.sandbox-id";

const K8S_EMPTY_DIR: &str = "kubernetes.io~empty-dir";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerType {
    /// The pod sandbox itself; owns the VM. Exactly one per shim.
    Sandbox,
    /// A container joining an already created sandbox.
    Member,
}

pub fn annotation<'a>(spec: &'a Spec, key: &str) -> Option<&'a str> {
    spec.annotations()
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Classify a container from its CRI annotations. Anything that does not
/// explicitly declare itself a member is the sandbox.
pub fn container_type(spec: &Spec) -> ContainerType {
    match annotation(spec, CONTAINER_TYPE_ANNOTATION) {
        Some("container") => ContainerType::Member,
        _ => ContainerType::Sandbox,
    }
}

/// The parent sandbox a member container belongs to.
pub fn sandbox_id(spec: &Spec) -> Option<String> {
    annotation(spec, SANDBOX_ID_ANNOTATION).map(str::to_string)
}

/// Path of the network namespace in the spec, if one is set.
pub fn netns_path(spec: &Spec) -> Option<String> {
    let linux = spec.linux().as_ref()?;
    linux
        .namespaces()
        .iter()
        .flatten()
        .find(|ns| ns.typ() == LinuxNamespaceType::Network)
        .and_then(|ns| ns.path().as_ref())
        .filter(|path| !path.as_os_str().is_empty())
        .map(|path| path.to_string_lossy().to_string())
}

/// Containers share every namespace with the sandbox except mount and
/// network, so everything but the network namespace is dropped from the
/// spec. An empty network namespace path is pointed at `netns` when the
/// sandbox already has one.
pub fn strip_namespaces(spec: &mut Spec, netns: Option<&str>) {
    let Some(mut linux) = spec.linux().clone() else {
        return;
    };
    let namespaces = linux.namespaces().clone().unwrap_or_default();
    let kept: Vec<_> = namespaces
        .into_iter()
        .filter(|ns| ns.typ() == LinuxNamespaceType::Network)
        .map(|mut ns| {
            let empty = ns
                .path()
                .as_ref()
                .map(|path| path.as_os_str().is_empty())
                .unwrap_or(true);
            if empty {
                if let Some(path) = netns {
                    ns.set_path(Some(PathBuf::from(path)));
                }
            }
            ns
        })
        .collect();
    linux.set_namespaces(Some(kept));
    spec.set_linux(Some(linux));
}

/// True for mount sources provisioned by kubernetes for ephemeral storage.
pub fn is_ephemeral_storage(path: &Path) -> bool {
    let components: Vec<_> = path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    components.len() > 1 && components[components.len() - 2] == K8S_EMPTY_DIR
}

/// Rewrite empty-dir mounts to the `ephemeral` type so the volume is backed
/// by tmpfs inside the VM and shared between the pod's containers.
pub fn set_ephemeral_storage_type(spec: &mut Spec) {
    let Some(mut mounts) = spec.mounts().clone() else {
        return;
    };
    for mount in &mut mounts {
        let ephemeral = mount
            .source()
            .as_ref()
            .map(|source| is_ephemeral_storage(source))
            .unwrap_or(false);
        if ephemeral {
            mount.set_typ(Some("ephemeral".to_string()));
        }
    }
    spec.set_mounts(Some(mounts));
}

pub fn sandbox_config(
    spec: &Spec,
    config: &RuntimeConfig,
    id: &str,
    bundle: &str,
    disable_output: bool,
) -> SandboxConfig {
    SandboxConfig {
        id: id.to_string(),
        hostname: spec.hostname().clone().unwrap_or_default(),
        netns: netns_path(spec),
        annotations: spec.annotations().clone().unwrap_or_default(),
        hypervisor: config.hypervisor.clone(),
        agent: config.agent.clone(),
        container: container_config(spec, id, bundle, disable_output),
    }
}

pub fn container_config(
    spec: &Spec,
    id: &str,
    bundle: &str,
    disable_output: bool,
) -> ContainerConfig {
    ContainerConfig {
        id: id.to_string(),
        bundle: bundle.to_string(),
        annotations: spec.annotations().clone().unwrap_or_default(),
        disable_output,
    }
}

pub fn prestart_hooks(spec: &Spec) -> Vec<Hook> {
    hooks_of(spec, |hooks| hooks.prestart())
}

pub fn poststart_hooks(spec: &Spec) -> Vec<Hook> {
    hooks_of(spec, |hooks| hooks.poststart())
}

pub fn poststop_hooks(spec: &Spec) -> Vec<Hook> {
    hooks_of(spec, |hooks| hooks.poststop())
}

fn hooks_of(
    spec: &Spec,
    select: impl Fn(&oci_spec::runtime::Hooks) -> &Option<Vec<Hook>>,
) -> Vec<Hook> {
    spec.hooks()
        .as_ref()
        .and_then(|hooks| select(hooks).clone())
        .unwrap_or_default()
}

/// Run lifecycle hooks in order, each inside the given network namespace.
pub async fn run_hooks(hooks: &[Hook], netns: Option<&str>, id: &str, bundle: &str) -> Result<()> {
    for hook in hooks {
        debug!("running hook: {:?}", hook.path());
        run_hook(hook, netns, id, bundle).await?;
    }
    Ok(())
}

async fn run_hook(hook: &Hook, netns: Option<&str>, id: &str, bundle: &str) -> Result<()> {
    let mut cmd = Command::new(hook.path());
    // Per the OCI spec the first element of args is arg0, which may differ
    // from the hook path.
    if let Some((arg0, args)) = hook.args().as_ref().and_then(|a| a.split_first()) {
        cmd.arg0(arg0).args(args);
    } else {
        cmd.arg0(hook.path().display().to_string());
    }

    let envs: HashMap<String, String> = hook
        .env()
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (entry.clone(), String::new()),
        })
        .collect();
    cmd.env_clear().envs(envs).stdin(ProcessStdio::piped());

    if let Some(path) = netns.filter(|path| !path.is_empty()) {
        let ns = std::fs::File::open(path)?;
        unsafe {
            cmd.pre_exec(move || {
                nix::sched::setns(ns.as_fd(), CloneFlags::CLONE_NEWNET)
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
            });
        }
    }

    let mut child = cmd.spawn()?;

    if let Some(stdin) = &mut child.stdin {
        // A BrokenPipe means the hook already finished, successfully or
        // not; its exit status settles that below. Any other write error
        // leaves the hook waiting on stdin, so it is torn down.
        let state = serde_json::json!({
            "id": id,
            "pid": std::process::id(),
            "bundle": bundle,
        });
        if let Err(err) = stdin.write_all(state.to_string().as_bytes()).await {
            if err.kind() != ErrorKind::BrokenPipe {
                let _ = child.start_kill();
                return Err(err.into());
            }
        }
    }
    drop(child.stdin.take());

    let timeout = hook.timeout().as_ref().map(|secs| *secs as u64);
    let status = match timeout {
        Some(secs) => match child
            .wait()
            .with_timeout(Duration::from_secs(secs as u64))
            .await
        {
            Some(status) => status?,
            None => {
                let _ = child.start_kill();
                return Err(Error::Any(anyhow!(
                    "hook {} timed out after {secs}s",
                    hook.path().display()
                )));
            }
        },
        None => child.wait().await?,
    };

    if !status.success() {
        return Err(Error::Any(anyhow!(
            "hook {} exited with status {:?}",
            hook.path().display(),
            status.code()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use oci_spec::runtime::{
        HookBuilder, LinuxBuilder, LinuxNamespaceBuilder, MountBuilder, SpecBuilder,
    };

    use super::*;

    fn annotated_spec(annotations: &[(&str, &str)]) -> Spec {
        let annotations: HashMap<String, String> = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SpecBuilder::default()
            .annotations(annotations)
            .build()
            .unwrap()
    }

    #[test]
    fn classifies_containers() {
        assert_eq!(container_type(&Spec::default()), ContainerType::Sandbox);
        assert_eq!(
            container_type(&annotated_spec(&[(CONTAINER_TYPE_ANNOTATION, "sandbox")])),
            ContainerType::Sandbox
        );
        let member = annotated_spec(&[
            (CONTAINER_TYPE_ANNOTATION, "container"),
            (SANDBOX_ID_ANNOTATION, "sb-1"),
        ]);
        assert_eq!(container_type(&member), ContainerType::Member);
        assert_eq!(sandbox_id(&member).as_deref(), Some("sb-1"));
    }

    #[test]
    fn strips_all_but_network_namespace() {
        let linux = LinuxBuilder::default()
            .namespaces(vec![
                LinuxNamespaceBuilder::default()
                    .typ(LinuxNamespaceType::Pid)
                    .build()
                    .unwrap(),
                LinuxNamespaceBuilder::default()
                    .typ(LinuxNamespaceType::Ipc)
                    .build()
                    .unwrap(),
                LinuxNamespaceBuilder::default()
                    .typ(LinuxNamespaceType::Network)
                    .build()
                    .unwrap(),
            ])
            .build()
            .unwrap();
        let mut spec = SpecBuilder::default().linux(linux).build().unwrap();

        strip_namespaces(&mut spec, Some("/var/run/netns/pod"));

        let namespaces = spec
            .linux()
            .as_ref()
            .unwrap()
            .namespaces()
            .clone()
            .unwrap();
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].typ(), LinuxNamespaceType::Network);
        assert_eq!(
            namespaces[0].path().as_ref().unwrap(),
            &PathBuf::from("/var/run/netns/pod")
        );
    }

    #[test]
    fn keeps_existing_netns_path() {
        let linux = LinuxBuilder::default()
            .namespaces(vec![LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Network)
                .path("/var/run/netns/existing")
                .build()
                .unwrap()])
            .build()
            .unwrap();
        let mut spec = SpecBuilder::default().linux(linux).build().unwrap();

        strip_namespaces(&mut spec, Some("/var/run/netns/other"));

        assert_eq!(netns_path(&spec).as_deref(), Some("/var/run/netns/existing"));
    }

    #[test]
    fn rewrites_empty_dir_mounts() {
        let mounts = vec![
            MountBuilder::default()
                .destination("/data")
                .typ("bind")
                .source("/var/lib/kubelet/pods/x/volumes/kubernetes.io~empty-dir/cache")
                .build()
                .unwrap(),
            MountBuilder::default()
                .destination("/etc/hosts")
                .typ("bind")
                .source("/var/lib/kubelet/pods/x/etc-hosts")
                .build()
                .unwrap(),
        ];
        let mut spec = SpecBuilder::default().mounts(mounts).build().unwrap();

        set_ephemeral_storage_type(&mut spec);

        let mounts = spec.mounts().clone().unwrap();
        assert_eq!(mounts[0].typ().as_deref(), Some("ephemeral"));
        assert_eq!(mounts[1].typ().as_deref(), Some("bind"));
    }

    #[tokio::test]
    async fn runs_hooks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let hook = HookBuilder::default()
            .path("/bin/sh")
            .args(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("cat > /dev/null; touch {}", marker.display()),
            ])
            .build()
            .unwrap();

        run_hooks(&[hook], None, "c1", "/bundle").await.unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn failing_hook_is_an_error() {
        let hook = HookBuilder::default()
            .path("/bin/sh")
            .args(vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()])
            .build()
            .unwrap();

        let err = run_hooks(&[hook], None, "c1", "/bundle").await.unwrap_err();
        assert!(err.to_string().contains("exited with status"));
    }
}
