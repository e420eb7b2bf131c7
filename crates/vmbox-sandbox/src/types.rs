use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{AgentConfig, HypervisorConfig};

/// A single environment variable of a guest process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub var: String,
    pub value: String,
}

/// Command description for a process launched inside a container.
///
/// User and group travel as numeric strings; the in-guest agent resolves
/// them against the container image.
#[derive(Debug, Clone, Default)]
pub struct Cmd {
    pub args: Vec<String>,
    pub envs: Vec<EnvVar>,
    pub work_dir: String,
    pub user: String,
    pub primary_group: String,
    pub interactive: bool,
    pub detach: bool,
    pub no_new_privileges: bool,
}

/// Handle to a process started through `enter_container`.
#[derive(Debug, Clone)]
pub struct GuestProcess {
    /// Token assigned by the in-guest agent; addresses the process in every
    /// later call.
    pub token: String,
    /// Pid of the process inside the guest, informational only.
    pub pid: i32,
}

/// Lifecycle state of a sandbox or container as the engine reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Ready,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub id: String,
    pub state: State,
    pub annotations: HashMap<String, String>,
}

/// Cgroup counters collected inside the guest.
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    pub cgroup: CgroupStats,
}

#[derive(Debug, Clone, Default)]
pub struct CgroupStats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub pids: PidsStats,
    pub hugetlb: HashMap<String, HugetlbStats>,
}

#[derive(Debug, Clone, Default)]
pub struct CpuStats {
    pub total_usage: u64,
    pub percpu_usage: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub cache: u64,
    pub usage: MemoryData,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryData {
    pub usage: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PidsStats {
    pub current: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Default)]
pub struct HugetlbStats {
    pub usage: u64,
    pub max_usage: u64,
    pub failcnt: u64,
}

/// Guest-side byte streams of one process.
pub struct IoStream {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
}

/// Everything the engine needs to boot a sandbox VM. The initial container
/// is created together with the sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfig {
    pub id: String,
    pub hostname: String,
    /// Path of the network namespace the VM attaches to; the engine sets one
    /// up when empty.
    pub netns: Option<String>,
    pub annotations: HashMap<String, String>,
    pub hypervisor: HypervisorConfig,
    pub agent: AgentConfig,
    pub container: ContainerConfig,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub id: String,
    pub bundle: String,
    pub annotations: HashMap<String, String>,
    /// Suppress guest output wiring for detached tty-less containers.
    pub disable_output: bool,
}
