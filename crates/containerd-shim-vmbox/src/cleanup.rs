//! Recovery teardown.
//!
//! Invoked through the shim's `delete` command when containerd needs to get
//! rid of a sandbox whose shim is not (or no longer) running. Best effort by
//! design: every step logs and keeps going where the regular delete path
//! would fail the call.

use std::path::Path;

use containerd_shim::mount::umount_recursive;
use log::{info, warn};
use oci_spec::runtime::Spec;
use vmbox_sandbox::{Engine, Sandbox, State};

use crate::oci::{self, ContainerType};
use crate::{Error, Result};

/// Tear down whatever the bundle refers to: the whole sandbox for a
/// sandbox-type bundle, a single member container otherwise.
pub async fn cleanup(engine: &dyn Engine, id: &str, bundle: &Path) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidArgument("missing container id".to_string()));
    }

    let spec = Spec::load(bundle.join("config.json"))
        .map_err(|err| Error::InvalidArgument(format!("could not load runtime spec: {err}")))?;

    match oci::container_type(&spec) {
        ContainerType::Sandbox => {
            let parent = bundle.parent().unwrap_or_else(|| Path::new("/"));
            cleanup_sandbox(engine, id, parent).await
        }
        ContainerType::Member => {
            let sandbox_id = oci::sandbox_id(&spec).ok_or_else(|| {
                Error::InvalidArgument("missing sandbox id annotation".to_string())
            })?;
            cleanup_container(engine, &sandbox_id, id, bundle).await
        }
    }
}

async fn cleanup_container(
    engine: &dyn Engine,
    sandbox_id: &str,
    container_id: &str,
    bundle: &Path,
) -> Result<()> {
    info!("cleaning up container {container_id} in sandbox {sandbox_id}");
    let sandbox = engine.fetch_sandbox(sandbox_id).await?;

    match sandbox.status_container(container_id).await {
        Ok(status) if status.state != State::Stopped => {
            if let Err(err) = sandbox.stop_container(container_id).await {
                warn!("failed to stop container {container_id}: {err}");
            }
        }
        Ok(_) => {}
        Err(err) => warn!("failed to get container {container_id} status: {err}"),
    }

    if let Err(err) = sandbox.delete_container(container_id).await {
        warn!("failed to remove container {container_id}: {err}");
    }

    unmount_rootfs(&bundle.join("rootfs"));
    Ok(())
}

async fn cleanup_sandbox(engine: &dyn Engine, sandbox_id: &str, bundle_parent: &Path) -> Result<()> {
    info!("cleaning up sandbox {sandbox_id}");
    let sandbox = engine.fetch_sandbox(sandbox_id).await?;

    for container_id in sandbox.containers() {
        unmount_rootfs(&bundle_parent.join(&container_id).join("rootfs"));
    }

    if let Err(err) = sandbox.stop().await {
        warn!("failed to stop sandbox {sandbox_id}: {err}");
    }
    if let Err(err) = sandbox.delete().await {
        warn!("failed to delete sandbox {sandbox_id}: {err}");
    }
    Ok(())
}

fn unmount_rootfs(rootfs: &Path) {
    if let Err(err) = umount_recursive(rootfs.to_str(), 0) {
        warn!("failed to clean up rootfs mount {}: {err}", rootfs.display());
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use oci_spec::runtime::SpecBuilder;
    use vmbox_sandbox::mock::{MockEngine, MockSandbox};

    use super::*;
    use crate::oci::{CONTAINER_TYPE_ANNOTATION, SANDBOX_ID_ANNOTATION};

    fn write_bundle(dir: &Path, annotations: &[(&str, &str)]) {
        let annotations: std::collections::HashMap<String, String> = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let spec = SpecBuilder::default()
            .annotations(annotations)
            .build()
            .unwrap();
        serde_json::to_writer(File::create(dir.join("config.json")).unwrap(), &spec).unwrap();
    }

    #[tokio::test]
    async fn tears_down_sandbox_bundle() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), &[]);

        let engine = MockEngine::default();
        let sandbox = MockSandbox::new("sb-1");
        sandbox.add_container("sb-1");
        engine.insert_sandbox(sandbox.clone());

        cleanup(&engine, "sb-1", dir.path()).await.unwrap();
        assert_eq!(sandbox.stop_calls(), 1);
        assert_eq!(sandbox.delete_calls(), 1);
    }

    #[tokio::test]
    async fn stops_running_member_container() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(
            dir.path(),
            &[
                (CONTAINER_TYPE_ANNOTATION, "container"),
                (SANDBOX_ID_ANNOTATION, "sb-1"),
            ],
        );

        let engine = MockEngine::default();
        let sandbox = MockSandbox::new("sb-1");
        sandbox.add_container("sb-1");
        sandbox.add_container("c1");
        sandbox.start().await.unwrap();
        engine.insert_sandbox(sandbox.clone());

        cleanup(&engine, "c1", dir.path()).await.unwrap();
        assert_eq!(sandbox.stop_calls(), 1);
        assert!(!sandbox.containers().contains(&"c1".to_string()));
    }

    #[tokio::test]
    async fn unknown_sandbox_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), &[]);

        let engine = MockEngine::default();
        let err = cleanup(&engine, "sb-1", dir.path()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Sandbox(vmbox_sandbox::Error::NotFound(_))
        ));
    }
}
