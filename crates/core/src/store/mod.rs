//! The replicated store overlay.
//!
//! A named store has exactly one master and any number of clones.
//! Masters and clones are actors; both ride the ordinary pub/sub plane
//! on the reserved store topics, so replication inherits routing,
//! ordering, and flow control from the message fabric.

use telefab_api::{
    store::{Command, Entry, Event, Query},
    EndpointId,
};
use tokio::sync::oneshot;

mod clone_store;
mod handle;
mod master;

pub use handle::Store;
pub(crate) use clone_store::spawn_clone;
pub(crate) use master::spawn_master;

/// Mailbox messages of a master actor.
pub(crate) enum MasterMsg {
    /// A mutation arriving on the store's command topic.
    Command {
        seq: u64,
        publisher: EndpointId,
        command: Command,
    },
    /// A read arriving on the store's command topic.
    Request {
        request_id: u64,
        requester: EndpointId,
        query: Query,
    },
    /// Drain and stop; in-flight mutations finish and their events
    /// flush first.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Mailbox messages of a clone actor.
pub(crate) enum CloneMsg {
    /// A replicated outcome arriving on the store's event topic.
    Event {
        seq: u64,
        publisher: EndpointId,
        event: Event,
    },
    /// Snapshot the local mirror.
    Mirror {
        reply: oneshot::Sender<Vec<Entry>>,
    },
    /// Stop the actor.
    Shutdown { reply: oneshot::Sender<()> },
}
