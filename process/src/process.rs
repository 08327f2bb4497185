//! Thing runtime - assembles identity, transport, worker pool and operations
//! from configuration

use anyhow::{anyhow, Result};
use config::Config;
use std::sync::Arc;
use thing_sdk::config::get_sub_config;
use thing_sdk::{ThingConfig, ThingOp, ThingPath, Transport, WorkerPool};
use tracing::{error, info};

mod in_memory_transport;
pub use in_memory_transport::InMemoryTransport;

/// One running thing
pub struct Thing {
    /// Settings it was created with
    config: ThingConfig,

    /// Pool inbound messages are dispatched on
    pool: Arc<WorkerPool>,

    /// Operations bound to the transport
    op: ThingOp,
}

impl Thing {
    /// Create a transport of the given class
    pub fn create_transport(class: &str, config: &Config) -> Result<Arc<dyn Transport>> {
        match class {
            // In-memory
            "in-memory" => Ok(Arc::new(InMemoryTransport::new(config))),

            // Unknown
            _ => Err(anyhow!("Unknown transport class {class}")),
        }
    }

    /// Create a thing with the transport described by `[transport]`
    pub fn create(config: &Config) -> Result<Self> {
        let transport_config = get_sub_config(config, "transport");
        let class = transport_config.get_string("class")
            .unwrap_or("in-memory".to_string());

        info!("Creating transport ({class})");
        let transport = Self::create_transport(&class, &transport_config)
            .inspect_err(|e| error!("Failed to create transport: {e}"))?;

        Self::with_transport(config, transport)
    }

    /// Create a thing on an existing transport, which may be shared with other things
    pub fn with_transport(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let config = ThingConfig::from_config(config)?;
        info!("Creating thing {} with {} workers", config.path, config.workers);

        let pool = Arc::new(WorkerPool::new(config.workers));
        let op = ThingOp::new(config.path.clone(), transport, pool.clone(), config.call_option);

        Ok(Self { config, pool, op })
    }

    pub fn path(&self) -> &ThingPath {
        &self.config.path
    }

    pub fn config(&self) -> &ThingConfig {
        &self.config
    }

    /// Operations of this thing
    pub fn op(&self) -> &ThingOp {
        &self.op
    }

    /// Stop dispatching inbound messages
    ///
    /// Binds are not released; unbind them first if the transport outlives
    /// the thing.
    pub fn destroy(&self) {
        info!("Destroying thing {}", self.config.path);
        self.pool.shutdown();
    }
}
