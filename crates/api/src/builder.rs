//! Builder-related types.

use crate::*;
use std::sync::Arc;

/// The general telefab endpoint builder.
/// This contains both configuration and factory instances, allowing
/// construction of runtime module instances.
pub struct Builder {
    /// The module configuration to be used when constructing an
    /// endpoint. This can be loaded from disk or modified before
    /// freezing the builder.
    pub config: config::Config,

    /// The [transport::TransportFactory] used to reach peers.
    pub transport: transport::DynTransportFactory,

    /// The [store::StoreBackendFactory] used when attaching master
    /// stores without an explicit backend.
    pub store_backend: store::DynStoreBackendFactory,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .finish()
    }
}

impl Builder {
    /// Construct a default config given the configured module
    /// factories. Call before freezing the builder in an `Arc`.
    pub fn set_default_config(&mut self) -> FabResult<()> {
        let Self {
            config,
            transport,
            store_backend,
        } = self;

        config.add_default_module_config::<config::FabricConfig>()?;
        transport.default_config(config)?;
        store_backend.default_config(config)?;

        Ok(())
    }

    /// Freeze this builder for use in endpoint construction.
    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }
}
