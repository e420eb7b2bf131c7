//! containerd shim protocol implementation.
//!
//! The `start` invocation resolves the socket the shim will serve on and
//! forks the listener; the `delete` invocation runs the recovery cleanup.
//! The long-lived instance serves [`Service`] until `Shutdown`.

use std::env::current_dir;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use containerd_shim::error::Error as ShimError;
use containerd_shim::publisher::RemotePublisher;
use containerd_shim::util::write_str_to_file;
use containerd_shim::{self as shim, api, ExitSignal};
use log::warn;
use nix::sys::signal::Signal;
use oci_spec::runtime::Spec;
use shim::Flags;
use vmbox_sandbox::{Engine, RuntimeConfig};

use crate::events::{self, ToTimestamp};
use crate::service::Service;
use crate::{cleanup, oci};

/// Cli implements the containerd shim interface with `Service` as the task
/// service and a pluggable sandbox engine.
pub struct Cli<E: Engine> {
    namespace: String,
    id: String,
    config: RuntimeConfig,
    exit: Arc<ExitSignal>,
    _engine: PhantomData<E>,
}

#[async_trait]
impl<E: Engine> shim::Shim for Cli<E> {
    type T = Service;

    async fn new(_runtime_id: &str, args: &Flags, _config: &mut shim::Config) -> Self {
        let config = RuntimeConfig::load().unwrap_or_else(|err| {
            warn!("failed to load runtime config, using defaults: {err}");
            RuntimeConfig::default()
        });
        Cli {
            namespace: args.namespace.to_string(),
            id: args.id.to_string(),
            config,
            exit: Arc::default(),
            _engine: PhantomData,
        }
    }

    async fn start_shim(&mut self, opts: shim::StartOpts) -> shim::Result<String> {
        let dir = current_dir().map_err(|err| ShimError::Other(err.to_string()))?;
        let spec = Spec::load(dir.join("config.json")).map_err(|err| {
            ShimError::InvalidArgument(format!("error loading runtime spec: {err}"))
        })?;

        // Member containers group under their parent sandbox: they get the
        // sandbox shim's socket back instead of forking a second shim.
        let id = opts.id.clone();
        let grouping = oci::sandbox_id(&spec).unwrap_or(id);

        let address = shim::spawn(opts, &grouping, vec![]).await?;

        write_str_to_file("address", &address).await?;

        Ok(address)
    }

    async fn wait(&mut self) {
        self.exit.wait().await;
    }

    async fn create_task_service(&self, publisher: RemotePublisher) -> Self::T {
        let engine = E::new(&self.config)
            .await
            .expect("failed to initialize sandbox engine");
        let events = events::event_queue(publisher, &self.namespace);
        Service::new(
            Arc::new(engine),
            self.config.clone(),
            events,
            self.exit.clone(),
            &self.id,
        )
    }

    async fn delete_shim(&mut self) -> shim::Result<api::DeleteResponse> {
        let bundle = current_dir().map_err(|err| ShimError::Other(err.to_string()))?;
        let engine = E::new(&self.config)
            .await
            .map_err(|err| ShimError::Other(err.to_string()))?;

        cleanup::cleanup(&engine, &self.id, &bundle)
            .await
            .map_err(|err| ShimError::Other(err.to_string()))?;

        Ok(api::DeleteResponse {
            exit_status: 128 + Signal::SIGKILL as u32,
            exited_at: Some(Utc::now().to_timestamp()).into(),
            ..Default::default()
        })
    }
}

/// Binary entry point: `shim_main::<MyEngine>("vmbox", None)` serves
/// `io.containerd.vmbox.v2`.
pub fn shim_main<E: Engine>(runtime_name: &str, config: Option<shim::Config>) {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async {
            let shim_id = format!("io.containerd.{}.v2", runtime_name.to_lowercase());
            shim::run::<Cli<E>>(&shim_id, config).await;
        });
}
