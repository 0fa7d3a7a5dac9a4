//! Interface to the external query work manager.

use crate::PeerId;
use async_trait::async_trait;
use mweb_primitives::Message;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outcome of handling a single response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// The request is fully answered and can be retired.
    pub finished: bool,
    /// The response moved the request forward.
    pub progressed: bool,
}

impl Progress {
    /// The response was useless; the dispatcher should reroute the
    /// request to another peer.
    pub fn rejected() -> Self {
        Self {
            finished: false,
            progressed: false,
        }
    }

    /// The request is complete.
    pub fn completed() -> Self {
        Self {
            finished: true,
            progressed: true,
        }
    }
}

/// A single query tracked by the dispatcher.
pub struct Request {
    /// Outbound message to send.
    pub req: Message,
    /// Callback validating responses to this request, potentially
    /// invoked concurrently from multiple peer workers.
    pub handler: Arc<dyn ResponseHandler>,
}

/// Validates responses delivered by the dispatcher.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    /// Inspects a response received for `req` from `peer`.
    async fn handle_response(&self, req: &Message, resp: &Message, peer: PeerId) -> Progress;
}

/// Terminal errors reported on the dispatcher's error channel.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The work manager is shutting down; orderly termination.
    #[error("work manager is shutting down")]
    WorkManagerShuttingDown,
    /// The batch failed before every request was answered.
    #[error("query failed: {0}")]
    Failed(String),
}

/// Distributes a batch of requests among the connected peers.
///
/// Per-request timeouts and retry routing are the dispatcher's
/// responsibility; a handler returning an unfinished [`Progress`]
/// reroutes the request to another peer. The dispatcher must honor the
/// cancellation handle and abandon in-flight requests once it fires.
pub trait QueryDispatcher: Send + Sync {
    /// Submits a batch of requests. The returned channel yields the
    /// terminal outcome of the batch: `Ok(())` once every request has
    /// finished, or the error that aborted it.
    fn query(
        &self,
        requests: Vec<Request>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<(), QueryError>>;
}
