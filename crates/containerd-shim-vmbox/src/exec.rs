use std::sync::{Arc, Mutex};

use containerd_shim::api::ExecProcessRequest;
use oci_spec::runtime::Process as ProcessSpec;
use vmbox_sandbox::{Cmd, EnvVar};

use crate::container::{ProcState, Stdio};
use crate::io::TtyIo;
use crate::sync::WaitableCell;
use crate::{Error, Result};

/// Exit code reported when the guest never delivers one.
pub(crate) const EXIT_CODE_UNSET: u32 = 255;

/// Terminal description of an exec'd process. Width and height may be
/// updated by `resize_pty` before the process starts; the guest learns the
/// size when the process does.
#[derive(Debug, Clone, Default)]
pub struct Tty {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub height: u32,
    pub width: u32,
    pub terminal: bool,
}

impl Tty {
    pub fn stdio(&self) -> Stdio {
        Stdio {
            stdin: self.stdin.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            terminal: self.terminal,
        }
    }
}

/// An additional process running inside an existing container.
///
/// The guest assigns the token at start time; until then the exec is known
/// only by the id containerd used to register it.
pub struct Exec {
    pub pid: u32,
    pub cmd: Cmd,
    token: Mutex<String>,
    tty: Mutex<Tty>,
    pub ttyio: Mutex<Option<Arc<TtyIo>>>,
    pub io_done: WaitableCell<()>,
    pub exit_ch: WaitableCell<u32>,
    pub state: Arc<Mutex<ProcState>>,
}

impl Exec {
    pub fn new(req: &ExecProcessRequest, pid: u32) -> Result<Self> {
        let any = req
            .spec
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("missing process spec".to_string()))?;
        let process: ProcessSpec = serde_json::from_slice(&any.value)
            .map_err(|err| Error::InvalidArgument(format!("invalid process spec: {err}")))?;

        let mut tty = Tty {
            stdin: req.stdin.clone(),
            stdout: req.stdout.clone(),
            stderr: req.stderr.clone(),
            height: 0,
            width: 0,
            terminal: req.terminal,
        };
        if let Some(size) = process.console_size() {
            tty.height = size.height() as u32;
            tty.width = size.width() as u32;
        }

        let cmd = Cmd {
            args: process.args().clone().unwrap_or_default(),
            envs: parse_envs(process.env().as_deref().unwrap_or_default()),
            work_dir: process.cwd().to_string_lossy().to_string(),
            user: process.user().uid().to_string(),
            primary_group: process.user().gid().to_string(),
            interactive: req.terminal,
            detach: !req.terminal,
            no_new_privileges: process.no_new_privileges().unwrap_or_default(),
        };

        Ok(Self {
            pid,
            cmd,
            token: Mutex::new(String::new()),
            tty: Mutex::new(tty),
            ttyio: Mutex::new(None),
            io_done: WaitableCell::new(),
            exit_ch: WaitableCell::new(),
            state: ProcState::new(EXIT_CODE_UNSET),
        })
    }

    /// The guest-assigned process token; empty until the exec has started.
    pub fn token(&self) -> String {
        self.token.lock().unwrap().clone()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.lock().unwrap() = token.into();
    }

    pub fn tty(&self) -> Tty {
        self.tty.lock().unwrap().clone()
    }

    pub fn set_winsize(&self, height: u32, width: u32) {
        let mut tty = self.tty.lock().unwrap();
        tty.height = height;
        tty.width = width;
    }
}

fn parse_envs(envs: &[String]) -> Vec<EnvVar> {
    envs.iter()
        .map(|entry| match entry.split_once('=') {
            Some((var, value)) => EnvVar {
                var: var.to_string(),
                value: value.to_string(),
            },
            None => EnvVar {
                var: entry.clone(),
                value: String::new(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use containerd_shim::protos::prost_types::Any;
    use oci_spec::runtime::ProcessBuilder;

    use super::*;

    fn exec_request(spec: Option<Vec<u8>>) -> ExecProcessRequest {
        ExecProcessRequest {
            id: "c1".to_string(),
            exec_id: "x1".to_string(),
            stdout: "/run/fifo/out".to_string(),
            spec: spec.map(|value| Any {
                type_url: "types.containerd.io/opencontainers/runtime-spec/1/Process".to_string(),
                value,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn builds_cmd_from_process_spec() {
        let process = ProcessBuilder::default()
            .args(vec!["/bin/echo".to_string(), "hi".to_string()])
            .env(vec!["PATH=/bin".to_string(), "FLAG".to_string()])
            .cwd("/work")
            .build()
            .unwrap();
        let req = exec_request(Some(serde_json::to_vec(&process).unwrap()));

        let exec = Exec::new(&req, 6).unwrap();
        assert_eq!(exec.cmd.args, vec!["/bin/echo", "hi"]);
        assert_eq!(exec.cmd.work_dir, "/work");
        assert_eq!(
            exec.cmd.envs,
            vec![
                EnvVar {
                    var: "PATH".to_string(),
                    value: "/bin".to_string()
                },
                EnvVar {
                    var: "FLAG".to_string(),
                    value: String::new()
                },
            ]
        );
        assert!(exec.cmd.detach);
        assert!(!exec.cmd.interactive);
        assert_eq!(exec.token(), "");
        assert_eq!(exec.state.lock().unwrap().exit_code, 255);
    }

    #[test]
    fn rejects_missing_spec() {
        let err = Exec::new(&exec_request(None), 6).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn rejects_malformed_spec() {
        let err = Exec::new(&exec_request(Some(b"not json".to_vec())), 6).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
