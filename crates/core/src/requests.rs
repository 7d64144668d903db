//! Request/response plumbing for store reads and responding commands.
//!
//! Request ids are monotonic per endpoint. The router keeps the pending
//! table and completes entries when a matching response frame arrives
//! on this endpoint's response topic.

use crate::router::{RouterCmd, RouterSender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use telefab_api::{
    store::QueryReply, wire::Frame, EndpointId, FabError, FabResult,
};
use tokio::sync::oneshot;

#[derive(Debug)]
pub(crate) struct Requests {
    router: RouterSender,
    endpoint: EndpointId,
    next_id: AtomicU64,
    timeout: Duration,
}

impl Requests {
    pub fn new(
        router: RouterSender,
        endpoint: EndpointId,
        timeout: Duration,
    ) -> Self {
        Self {
            router,
            endpoint,
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Allocate the next request id.
    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register interest in `request_id` with the router. The returned
    /// receiver completes when a matching response arrives.
    pub async fn register(
        &self,
        request_id: u64,
    ) -> FabResult<oneshot::Receiver<QueryReply>> {
        let (tx, rx) = oneshot::channel();
        self.router
            .send(RouterCmd::RequestRegister {
                request_id,
                reply_to: tx,
            })
            .await
            .map_err(|_| FabError::ShutdownInProgress)?;
        Ok(rx)
    }

    /// Hand a frame to the router for routing.
    pub async fn send(&self, frame: Frame) -> FabResult<()> {
        self.router
            .send(RouterCmd::Frame { from: None, frame })
            .await
            .map_err(|_| FabError::ShutdownInProgress)
    }

    /// Await a registered response, bounded by the configured request
    /// timeout.
    pub async fn finish(
        &self,
        request_id: u64,
        rx: oneshot::Receiver<QueryReply>,
    ) -> FabResult<QueryReply> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // The router dropped the pending entry, which only happens
            // on shutdown.
            Ok(Err(_)) => Err(FabError::ShutdownInProgress),
            Err(_) => {
                let _ = self
                    .router
                    .send(RouterCmd::RequestCancel { request_id })
                    .await;
                Err(FabError::request_timeout(format!(
                    "store request {request_id} got no answer"
                )))
            }
        }
    }

    /// Send `frame` (which must carry `request_id`) and await the
    /// response.
    pub async fn call(
        &self,
        request_id: u64,
        frame: Frame,
    ) -> FabResult<QueryReply> {
        let rx = self.register(request_id).await?;
        self.send(frame).await?;
        self.finish(request_id, rx).await
    }
}
