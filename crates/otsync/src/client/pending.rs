use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::protocol::{QueryResults, Snapshot};
use crate::SyncResult;

/// Runs on the read path when a submit is acknowledged, before the caller wakes
pub(crate) type AckHook = Box<dyn FnOnce() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Submit,
    GetSnapshot,
    Query,
}

#[derive(Debug)]
pub(crate) enum Response {
    Ack,
    Snapshot(Snapshot),
    Query(QueryResults),
}

/// An outbound request waiting for its response
pub(crate) struct PendingRequest {
    pub(crate) kind: RequestKind,
    pub(crate) deadline: Instant,
    responder: oneshot::Sender<SyncResult<Response>>,
    on_ack: Option<AckHook>,
}

impl PendingRequest {
    pub(crate) fn new(
        kind: RequestKind,
        deadline: Instant,
        on_ack: Option<AckHook>,
    ) -> (Self, oneshot::Receiver<SyncResult<Response>>) {
        let (responder, rx) = oneshot::channel();
        (
            Self {
                kind,
                deadline,
                responder,
                on_ack,
            },
            rx,
        )
    }

    /// Resolve the request. Returns false if the caller already stopped waiting.
    pub(crate) fn complete(self, result: SyncResult<Response>) -> bool {
        if let (Ok(Response::Ack), Some(hook)) = (&result, self.on_ack) {
            hook();
        }
        self.responder.send(result).is_ok()
    }
}
