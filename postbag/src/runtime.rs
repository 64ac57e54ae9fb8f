//! Tokio runtime configuration

use serde::Deserialize;

fn default_thread_name() -> String {
    "postbag-worker".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Worker thread count; `None` uses one per core
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Name given to every runtime worker thread
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            thread_name: default_thread_name(),
        }
    }
}

impl RuntimeConfig {
    /// # Errors
    /// Returns an error if `worker_threads` is zero or the name is empty
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_threads == Some(0) {
            anyhow::bail!("runtime.worker_threads must be greater than zero");
        }
        if self.thread_name.trim().is_empty() {
            anyhow::bail!("runtime.thread_name must not be empty");
        }

        Ok(())
    }

    /// Build a multi-threaded runtime with every driver enabled
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the runtime cannot start
    pub fn build(&self) -> anyhow::Result<tokio::runtime::Runtime> {
        self.validate()?;

        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name(self.thread_name.clone());

        if let Some(threads) = self.worker_threads {
            builder.worker_threads(threads);
        }

        Ok(builder.build()?)
    }
}
