//! Request/Ack correlation for one session.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::pdu::Pdu;
use crate::proto::{AckOutcome, Req};

/// Completion callback for one request. Receives the decoded outcome and the
/// Ack PDU positioned at its payload. Runs on the receiver task, so it must
/// not wait on the same session's inbound channel.
pub type AckFn = Box<dyn FnOnce(AckOutcome, Pdu) + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum AckerError {
    #[error("request {0} already has a pending ack")]
    AlreadyMapped(Req),
    #[error("ack for unregistered request {0}")]
    Unregistered(Req),
}

#[derive(Default)]
pub struct Acker {
    pending: Mutex<HashMap<Req, AckFn>>,
}

impl std::fmt::Debug for Acker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acker")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl Acker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` to run when the Ack for `req` arrives.
    pub fn map<F>(&self, req: Req, f: F) -> Result<(), AckerError>
    where
        F: FnOnce(AckOutcome, Pdu) + Send + 'static,
    {
        let mut pending = self.pending.lock();
        if pending.contains_key(&req) {
            return Err(AckerError::AlreadyMapped(req));
        }
        pending.insert(req, Box::new(f));
        Ok(())
    }

    /// Register a request whose result is awaited instead of called back.
    pub fn map_oneshot(
        &self,
        req: Req,
    ) -> Result<oneshot::Receiver<(AckOutcome, Pdu)>, AckerError> {
        let (tx, rx) = oneshot::channel();
        self.map(req, move |outcome, pdu| {
            let _ = tx.send((outcome, pdu));
        })?;
        Ok(rx)
    }

    /// Drop the callback for `req` without running it.
    pub fn unmap(&self, req: &Req) -> bool {
        self.pending.lock().remove(req).is_some()
    }

    /// Run and remove the callback for `req`. The lock is released before
    /// the callback runs so it may map further requests.
    pub fn rx(&self, req: Req, outcome: AckOutcome, pdu: Pdu) -> Result<(), AckerError> {
        let f = self
            .pending
            .lock()
            .remove(&req)
            .ok_or(AckerError::Unregistered(req))?;
        f(outcome, pdu);
        Ok(())
    }

    /// Forget every pending request. Awaiting oneshots see their sender drop.
    pub fn clear(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "dropping pending acks");
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}
