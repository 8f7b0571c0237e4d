//! Single-slot request/response rendezvous for the item-assignment exchange.
//!
//! The caller registers interest with [`PendingExchange::begin`] and awaits
//! the returned receiver; the read loop hands the server's `Result` to
//! [`PendingExchange::complete`]. At most one exchange is outstanding.

use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::messages::AssignmentResult;

/// Errors returned by the item-assignment exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// No result arrived within the exchange timeout.
    #[error("timed out waiting for the assignment result")]
    Timeout,
    /// The connection was closed while waiting.
    #[error("exchange cancelled by disconnect")]
    Cancelled,
    /// Another exchange is already waiting for its result.
    #[error("an exchange is already pending")]
    AlreadyPending,
    /// There is no server connection to exchange with.
    #[error("not connected")]
    NotConnected,
}

/// The waiting side of an exchange, if any.
#[derive(Debug, Default)]
pub struct PendingExchange {
    slot: Mutex<Option<oneshot::Sender<AssignmentResult>>>,
}

impl PendingExchange {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter.
    ///
    /// A slot whose receiver was dropped (a caller that timed out) counts as
    /// free.
    pub fn begin(&self) -> Result<oneshot::Receiver<AssignmentResult>, ExchangeError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(ExchangeError::AlreadyPending);
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        Ok(rx)
    }

    /// Deliver a result to the waiter. Returns `false` if nobody was waiting.
    pub fn complete(&self, result: AssignmentResult) -> bool {
        let tx = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match tx {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter; its receiver resolves with an error.
    pub fn cancel(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Whether a live waiter is registered.
    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}
