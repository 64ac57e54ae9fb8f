use std::{
    path::Path,
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use postbag_common::{Signal, internal, logging, tracing};
use postbag_dispatch::{DispatchConfig, MemoryMessageStore, Scheduler};
use postbag_metrics::MetricsConfig;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::{
    runtime::RuntimeConfig,
    seed::{self, SeedConfig},
    transport::{LogTransport, LogTransportConfig},
};

/// Top-level process configuration, read from a RON file
#[derive(Debug, Default, Deserialize)]
pub struct Postbag {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub transport: LogTransportConfig,
    #[serde(default)]
    pub seed: Option<SeedConfig>,
}

/// The wired-up dispatch engine
#[derive(Debug)]
pub struct Engine {
    pub store: MemoryMessageStore,
    pub scheduler: Arc<Scheduler>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Postbag {
    /// Read and parse a configuration file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not valid RON
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        ron::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Check every section for values that would prevent startup
    ///
    /// # Errors
    /// Returns the first invalid setting
    pub fn validate(&self) -> anyhow::Result<()> {
        self.dispatch.validate()?;
        self.runtime.validate()?;

        if let Some(seed) = &self.seed
            && seed.recipient.trim().is_empty()
        {
            anyhow::bail!("seed.recipient must not be empty");
        }

        Ok(())
    }

    /// Build the store, transport and scheduler, seeding the store if configured
    ///
    /// Dispatch metrics are attached when metrics have been initialised.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or seeding fails
    pub fn engine(self) -> anyhow::Result<Engine> {
        self.validate()?;

        let store = MemoryMessageStore::new();
        if let Some(seed) = &self.seed {
            seed::load(&store, seed)?;
        }

        let metrics = postbag_metrics::metrics().map(|metrics| Arc::clone(&metrics.dispatch));
        let scheduler = Scheduler::new(
            self.dispatch,
            Arc::new(store.clone()),
            Arc::new(LogTransport::new(self.transport)),
            metrics,
        )?;

        Ok(Engine {
            store,
            scheduler: Arc::new(scheduler),
        })
    }

    /// Run the dispatcher until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// This function will return an error if metrics or the engine fail to
    /// initialise.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        internal!("Controller running");

        postbag_metrics::init_metrics(&self.metrics)?;

        let Engine { store, scheduler } = self.engine()?;
        internal!(level = INFO, queued = store.len(), "Dispatch engine ready");

        let ret = tokio::select! {
            () = scheduler.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                Ok(())
            }
            r = shutdown() => {
                r
            }
        };

        internal!(level = INFO, "Shutting down...");

        ret
    }
}
