use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};

use super::{ApprovalGate, DecisionRequest};
use crate::errors::{FlowError, FlowResult};
use crate::models::Decision;

/// A decision request waiting on a human, as seen by the transport.
#[derive(Debug)]
pub struct PendingDecision {
    pub request: DecisionRequest,
    reply: oneshot::Sender<Decision>,
}

impl PendingDecision {
    /// Deliver the verdict. Returns false if the requesting flow is gone.
    pub fn decide(self, decision: Decision) -> bool {
        self.reply.send(decision).is_ok()
    }
}

/// Gate that hands requests to whatever transport drains its [`GateHandle`]:
/// a web UI, a chat bot, or a test script.
pub struct ChannelGate {
    tx: mpsc::Sender<PendingDecision>,
}

/// Receiving side of a [`ChannelGate`].
pub struct GateHandle {
    rx: Mutex<mpsc::Receiver<PendingDecision>>,
}

impl ChannelGate {
    pub fn new(buffer: usize) -> (Self, GateHandle) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, GateHandle { rx: Mutex::new(rx) })
    }
}

impl GateHandle {
    /// Wait for the next request. `None` once every gate has been dropped.
    pub async fn next(&self) -> Option<PendingDecision> {
        self.rx.lock().await.recv().await
    }
}

#[async_trait]
impl ApprovalGate for ChannelGate {
    async fn request_decision(&self, request: DecisionRequest) -> FlowResult<Decision> {
        let (reply, wait) = oneshot::channel();
        let run = request.run_id.to_string();
        self.tx
            .send(PendingDecision { request, reply })
            .await
            .map_err(|_| FlowError::Other(anyhow::anyhow!("approval channel closed")))?;
        wait.await.map_err(|_| {
            FlowError::Other(anyhow::anyhow!(
                "decision for {} was dropped without a verdict",
                run
            ))
        })
    }
}
