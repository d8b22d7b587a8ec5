use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::bus::LocalBus;
use crate::conventions::Conventions;
use crate::databus::{DataBusStore, FileShareDataBus, InMemoryDataBus};

const DEFAULT_ENDPOINT: &str = "busline";
const DEFAULT_LOG_FILTER: &str = "busline=info";

/// Endpoint configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Local endpoint name, stamped as the reply address of outgoing messages.
    pub endpoint_name: String,
    /// Base directory of the file-share data bus. In-memory when unset.
    pub data_bus_path: Option<PathBuf>,
    /// `tracing_subscriber::EnvFilter` directive.
    pub log_filter: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint_name: DEFAULT_ENDPOINT.to_string(),
            data_bus_path: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl BusConfig {
    /// Load configuration from environment variables
    ///
    /// Reads `BUSLINE_ENDPOINT`, `BUSLINE_DATABUS_PATH` and `BUSLINE_LOG`.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let endpoint_name = lookup("BUSLINE_ENDPOINT").unwrap_or(defaults.endpoint_name);
        if endpoint_name.trim().is_empty() {
            anyhow::bail!("BUSLINE_ENDPOINT must not be empty");
        }

        let data_bus_path = lookup("BUSLINE_DATABUS_PATH")
            .filter(|p| !p.is_empty())
            .map(|p| {
                let path = PathBuf::from(&p);
                if path.is_relative() {
                    env::current_dir()
                        .map(|cwd| cwd.join(&path))
                        .with_context(|| format!("BUSLINE_DATABUS_PATH '{}' could not be resolved", p))
                } else {
                    Ok(path)
                }
            })
            .transpose()?;

        Ok(Self {
            endpoint_name,
            data_bus_path,
            log_filter: lookup("BUSLINE_LOG").unwrap_or(defaults.log_filter),
        })
    }

    pub fn with_endpoint_name(mut self, name: impl Into<String>) -> Self {
        self.endpoint_name = name.into();
        self
    }

    pub fn with_data_bus_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_bus_path = Some(path.into());
        self
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// The byte store the data bus should use.
    pub fn data_bus_store(&self) -> Arc<dyn DataBusStore> {
        match &self.data_bus_path {
            Some(path) => Arc::new(FileShareDataBus::new(path.clone())),
            None => Arc::new(InMemoryDataBus::new()),
        }
    }

    /// An in-process bus for this endpoint.
    pub fn local_bus(&self, conventions: Arc<Conventions>) -> LocalBus {
        LocalBus::new(self.endpoint_name.clone(), conventions)
    }
}
