//! Confirmation channels: how the dispatcher asks a human about a call.
//!
//! The dispatcher awaits [`ConfirmationChannel::confirm`] under a timeout.
//! `None` (channel closed, nobody listening) and a timeout are both treated
//! as a refusal.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::types::{ConfirmationRequest, ConfirmationResponse};

#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    async fn confirm(&self, request: ConfirmationRequest) -> Option<ConfirmationResponse>;
}

/// Approves every request once. For unattended runs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ConfirmationChannel for AutoApprove {
    async fn confirm(&self, _request: ConfirmationRequest) -> Option<ConfirmationResponse> {
        Some(ConfirmationResponse::Confirmed)
    }
}

/// Refuses every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDeny;

#[async_trait]
impl ConfirmationChannel for AutoDeny {
    async fn confirm(&self, _request: ConfirmationRequest) -> Option<ConfirmationResponse> {
        Some(ConfirmationResponse::Rejected)
    }
}

/// A request waiting for an answer from the front end.
#[derive(Debug)]
pub struct PendingConfirmation {
    pub request: ConfirmationRequest,
    pub respond: oneshot::Sender<ConfirmationResponse>,
}

/// Forwards requests over an mpsc channel and waits on a oneshot reply.
///
/// The caller owns the receiving end and answers each
/// [`PendingConfirmation`] through its `respond` sender.
#[derive(Debug, Clone)]
pub struct ChannelConfirmation {
    tx: mpsc::Sender<PendingConfirmation>,
}

impl ChannelConfirmation {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingConfirmation>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConfirmationChannel for ChannelConfirmation {
    async fn confirm(&self, request: ConfirmationRequest) -> Option<ConfirmationResponse> {
        let (respond, reply) = oneshot::channel();
        let request_id = request.request_id.clone();
        if self.tx.send(PendingConfirmation { request, respond }).await.is_err() {
            tracing::warn!(request_id = %request_id, "confirmation receiver dropped");
            return None;
        }
        match reply.await {
            Ok(response) => Some(response),
            Err(_) => {
                tracing::warn!(request_id = %request_id, "confirmation responder dropped");
                None
            }
        }
    }
}
