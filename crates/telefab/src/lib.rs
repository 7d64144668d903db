#![deny(missing_docs)]
//! Telefab is a distributed publish/subscribe fabric for
//! network-security telemetry.
//!
//! Endpoints peer with one another over TCP, exchange topic-scoped
//! typed messages with byte-prefix routing and per-subscriber flow
//! control, and can host replicated key/value stores whose mutations
//! ride the same message plane.
//!
//! ```no_run
//! # async fn run() -> telefab::FabResult<()> {
//! use telefab::{default_builder, BuilderExt, Endpoint, Filter};
//!
//! let builder = default_builder().with_default_config()?.build();
//! let ep =
//!     Endpoint::create(builder, Some("127.0.0.1:0".parse().unwrap()))
//!         .await?;
//!
//! let sub = ep.subscribe(Filter::from_prefixes(["zeek/events"])).await?;
//! ep.publish("zeek/events/errors", "oops").await?;
//! let msg = sub.recv().await?;
//! assert_eq!(telefab::Value::from("oops"), msg.value);
//! # Ok(())
//! # }
//! ```

pub use telefab_api::*;
pub use telefab_core::{
    expiry_after, Endpoint, MemBackendFactory, MemTransportFactory,
    Message, StatusFeed, StatusReceiver, Store, Subscriber,
};

/// The default builder: TCP transport and in-memory store backends.
pub fn default_builder() -> builder::Builder {
    builder::Builder {
        config: config::Config::default(),
        transport: telefab_transport_tcp::TcpTransportFactory::create(),
        store_backend: telefab_core::MemBackendFactory::create(),
    }
}

/// Extension helpers on [builder::Builder] construction.
pub trait BuilderExt: Sized {
    /// Populate the default config for every configured factory.
    fn with_default_config(self) -> FabResult<Self>;
}

impl BuilderExt for builder::Builder {
    fn with_default_config(mut self) -> FabResult<Self> {
        self.set_default_config()?;
        Ok(self)
    }
}
