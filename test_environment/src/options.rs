//! Options for launching a container.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

use container_runtime_interface::{ByteStream, RegistryCredentials, RuntimeError};
use futures_util::StreamExt;
use tracing::warn;

/// Destination for image pull progress and container output.
pub type LogSink = Arc<Mutex<dyn Write + Send>>;

/// Wrap a writer as a [`LogSink`].
pub fn log_sink(writer: impl Write + Send + 'static) -> LogSink {
    Arc::new(Mutex::new(writer))
}

/// Builder-style options for a single container launch.
///
/// Launch helpers fill in their own defaults only where the caller left a
/// value unset.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub(crate) pull: bool,
    pub(crate) credentials: Option<RegistryCredentials>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) port_bindings: HashMap<String, String>,
    pub(crate) name: Option<String>,
    pub(crate) volumes: BTreeMap<String, String>,
    pub(crate) log_sink: Option<LogSink>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull the image before creating the container. A pulled image is also
    /// removed when the container is closed.
    pub fn pull_image(mut self) -> Self {
        self.pull = true;
        self
    }

    pub fn pull_image_with(mut self, credentials: RegistryCredentials) -> Self {
        self.pull = true;
        self.credentials = Some(credentials);
        self
    }

    /// Add environment variables. Later values win for the same key.
    pub fn env<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Publish container ports: host port -> container port.
    pub fn port_bindings<K, V>(mut self, bindings: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.port_bindings
            .extend(bindings.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bind mounts: host path -> container path.
    pub fn volumes<K, V>(mut self, volumes: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.volumes
            .extend(volumes.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn is_pull(&self) -> bool {
        self.pull
    }

    pub fn container_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    // ==================== Defaults ====================

    pub(crate) fn default_name(mut self, name: impl Into<String>) -> Self {
        if self.name.is_none() {
            self.name = Some(name.into());
        }
        self
    }

    pub(crate) fn default_pull(mut self, credentials: Option<RegistryCredentials>) -> Self {
        if !self.pull {
            self.pull = true;
            self.credentials = credentials;
        }
        self
    }

    pub(crate) fn default_env<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            self.env.entry(key.into()).or_insert_with(|| value.into());
        }
        self
    }

    /// `KEY=value` entries in key order.
    pub(crate) fn env_entries(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    }

    pub(crate) fn volume_entries(&self) -> Vec<String> {
        self.volumes
            .iter()
            .map(|(host, container)| format!("{}:{}", host, container))
            .collect()
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("pull", &self.pull)
            .field("credentials", &self.credentials.as_ref().map(|c| &c.username))
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("port_bindings", &self.port_bindings)
            .field("name", &self.name)
            .field("volumes", &self.volumes)
            .field("log_sink", &self.log_sink.is_some())
            .finish()
    }
}

/// Consume `stream`, copying every chunk into `sink` when one is given.
///
/// Sink write failures are logged and do not stop the drain; stream errors do.
pub(crate) async fn drain_into(
    mut stream: ByteStream,
    sink: Option<&LogSink>,
) -> Result<(), RuntimeError> {
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Some(sink) = sink {
            write_chunk(sink, &chunk);
        }
    }
    Ok(())
}

fn write_chunk(sink: &LogSink, chunk: &[u8]) {
    let mut writer = match sink.lock() {
        Ok(writer) => writer,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
        warn!("Failed to write container output to log sink: {}", e);
    }
}
