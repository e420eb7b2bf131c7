//! Facade over the VM sandbox engine.
//!
//! The shim drives one lightweight VM ("sandbox") per pod and one or more
//! OCI containers inside it. Everything it needs from the engine is
//! expressed by the [`Engine`] and [`Sandbox`] traits so the task service
//! can be tested against the in-memory [`mock`] implementation.

use std::sync::Arc;

use async_trait::async_trait;
use oci_spec::runtime::LinuxResources;
use thiserror::Error;

mod config;
pub mod mock;
mod types;

pub use config::{AgentConfig, HypervisorConfig, RuntimeConfig};
pub use types::{
    CgroupStats, Cmd, ContainerConfig, ContainerStats, ContainerStatus, CpuStats, EnvVar,
    GuestProcess, HugetlbStats, IoStream, MemoryData, MemoryStats, PidsStats, SandboxConfig,
    State,
};

#[derive(Debug, Error)]
pub enum Error {
    /// No sandbox or container by that id is known to the engine.
    #[error("not found: {0}")]
    NotFound(String),
    /// The configuration handed to the engine is unusable.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// The in-guest agent rejected or failed an operation.
    #[error("agent: {0}")]
    Agent(String),
    /// The hypervisor process failed.
    #[error("hypervisor: {0}")]
    Hypervisor(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Entry point into the sandbox engine.
///
/// `create_sandbox` boots the VM and materializes the initial container;
/// `fetch_sandbox` reattaches to a sandbox created by an earlier shim
/// invocation (the recovery path).
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    async fn new(config: &RuntimeConfig) -> Result<Self>
    where
        Self: Sized;

    async fn create_sandbox(&self, config: SandboxConfig) -> Result<Arc<dyn Sandbox>>;

    async fn fetch_sandbox(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>>;
}

/// One running VM and the containers inside it.
///
/// Process-level operations address the container's init process by the
/// container id and an exec'd process by the token handed out by
/// [`Sandbox::enter_container`].
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> String;

    /// Path of the network namespace the sandbox is wired into, if any.
    fn netns(&self) -> Option<String>;

    /// Ids of every container currently known to the sandbox.
    fn containers(&self) -> Vec<String>;

    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn delete(&self) -> Result<()>;

    async fn create_container(&self, config: ContainerConfig) -> Result<()>;
    async fn start_container(&self, container_id: &str) -> Result<()>;
    async fn stop_container(&self, container_id: &str) -> Result<()>;
    async fn delete_container(&self, container_id: &str) -> Result<()>;
    async fn pause_container(&self, container_id: &str) -> Result<()>;
    async fn resume_container(&self, container_id: &str) -> Result<()>;
    async fn status_container(&self, container_id: &str) -> Result<ContainerStatus>;
    async fn stats_container(&self, container_id: &str) -> Result<ContainerStats>;
    async fn update_container(
        &self,
        container_id: &str,
        resources: LinuxResources,
    ) -> Result<()>;

    /// Run an additional process inside a container. The returned token is
    /// the only handle for addressing the process afterwards.
    async fn enter_container(&self, container_id: &str, cmd: Cmd) -> Result<GuestProcess>;

    async fn wait_process(&self, container_id: &str, process_id: &str) -> Result<i32>;
    async fn signal_process(
        &self,
        container_id: &str,
        process_id: &str,
        signal: u32,
        all: bool,
    ) -> Result<()>;
    async fn winsize_process(
        &self,
        container_id: &str,
        process_id: &str,
        height: u32,
        width: u32,
    ) -> Result<()>;

    /// Byte streams of the process: guest stdin (written by the shim),
    /// guest stdout and stderr (read by the shim).
    async fn io_stream(&self, container_id: &str, process_id: &str) -> Result<IoStream>;
}
