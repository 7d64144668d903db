#![deny(missing_docs)]
//! Reference implementations of the [telefab API](telefab_api).
//!
//! The endpoint here is a set of cooperating actors: a router that owns
//! the routing table and fans messages out, one actor per peer
//! connection, and one actor per hosted store replica. Actors own their
//! state, receive work on mailboxes, and never share anything mutable.

mod endpoint;
pub use endpoint::*;

mod subscriber;
pub use subscriber::*;

mod status;
pub use status::*;

pub mod store;
pub use store::Store;

mod mem_backend;
pub use mem_backend::*;

mod mem_transport;
pub use mem_transport::*;

pub(crate) mod peer;
pub(crate) mod requests;
pub(crate) mod router;
pub(crate) mod routing;
