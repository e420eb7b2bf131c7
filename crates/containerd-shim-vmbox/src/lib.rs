//! containerd shim for containers running inside a lightweight VM.
//!
//! The shim is spawned once per sandbox. It serves the containerd task API
//! on a ttrpc socket, translates task calls into operations on a
//! [`vmbox_sandbox::Engine`], and relays stdio between host named pipes and
//! the guest's serial channels. The engine itself plugs in through
//! [`cli::shim_main`].

pub mod cleanup;
pub mod cli;
pub mod container;
pub mod error;
pub mod events;
pub mod exec;
pub mod io;
pub mod metrics;
pub mod oci;
pub mod service;
pub mod sync;
pub mod utils;
pub mod wait;

pub use cli::{shim_main, Cli};
pub use error::{Error, Result};
pub use service::Service;
