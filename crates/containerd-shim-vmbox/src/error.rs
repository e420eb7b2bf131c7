//! Error types used by the task service.
//! This handles converting to the appropriate ttrpc error codes.

use anyhow::Error as AnyError;
use containerd_shim::Error as ShimError;
use oci_spec::OciSpecError;
use thiserror::Error;
use ttrpc::error::get_status;
use ttrpc::proto::Code;

#[derive(Debug, Error)]
pub enum Error {
    /// An error occurred while parsing the OCI spec
    #[error("{0}")]
    Oci(#[from] OciSpecError),
    /// An error that can occur while setting up the stdio pipes
    #[error("{0}")]
    Stdio(#[from] std::io::Error),
    /// Errors to/from the containerd shim library.
    #[error("{0}")]
    Shim(#[from] ShimError),
    /// Requested item is not found
    #[error("not found: {0}")]
    NotFound(String),
    /// Requested item already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Supplied arguments/options/config is invalid
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation was rejected because the system is not in a state
    /// required for the operation
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// The operation is not supported by this shim
    #[error("not implemented: {0}")]
    NotImplemented(String),
    /// Errors from the sandbox engine
    #[error("{0}")]
    Sandbox(#[from] vmbox_sandbox::Error),
    /// Error while parsing JSON
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Any other error
    #[error("{0}")]
    Any(#[from] AnyError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for ttrpc::Error {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::NotFound(msg) => get_status(Code::NOT_FOUND, msg),
            Error::AlreadyExists(msg) => get_status(Code::ALREADY_EXISTS, msg),
            Error::InvalidArgument(msg) => get_status(Code::INVALID_ARGUMENT, msg),
            Error::FailedPrecondition(msg) => get_status(Code::FAILED_PRECONDITION, msg),
            Error::NotImplemented(msg) => get_status(Code::UNIMPLEMENTED, msg),
            Error::Oci(_) | Error::Json(_) => get_status(Code::INVALID_ARGUMENT, e.to_string()),
            Error::Sandbox(vmbox_sandbox::Error::NotFound(msg)) => {
                get_status(Code::NOT_FOUND, msg)
            }
            Error::Sandbox(_) => get_status(Code::INTERNAL, e.to_string()),
            _ => get_status(Code::UNKNOWN, e.to_string()),
        };
        ttrpc::Error::RpcStatus(status)
    }
}

#[cfg(test)]
mod tests {
    use ttrpc::proto::Status;

    use super::*;

    fn status_of(e: Error) -> Status {
        match ttrpc::Error::from(e) {
            ttrpc::Error::RpcStatus(status) => status,
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_to_ttrpc_status() {
        assert_eq!(
            status_of(Error::InvalidArgument("bad".to_string())),
            get_status(Code::INVALID_ARGUMENT, "bad")
        );
        assert_eq!(
            status_of(Error::NotFound("gone".to_string())),
            get_status(Code::NOT_FOUND, "gone")
        );
        assert_eq!(
            status_of(Error::AlreadyExists("dup".to_string())),
            get_status(Code::ALREADY_EXISTS, "dup")
        );
        assert_eq!(
            status_of(Error::FailedPrecondition("early".to_string())),
            get_status(Code::FAILED_PRECONDITION, "early")
        );
        assert_eq!(
            status_of(Error::NotImplemented("checkpoint".to_string())),
            get_status(Code::UNIMPLEMENTED, "checkpoint")
        );
        assert_eq!(
            status_of(Error::Sandbox(vmbox_sandbox::Error::Agent(
                "boom".to_string()
            ))),
            get_status(Code::INTERNAL, "agent: boom")
        );
        assert_eq!(
            status_of(Error::Sandbox(vmbox_sandbox::Error::NotFound(
                "sb".to_string()
            ))),
            get_status(Code::NOT_FOUND, "sb")
        );
    }
}
