//! Delivery Confirmation Waiter
//!
//! After a send, race the per-message status stream and the receipt stream
//! against a timeout. Whichever source matches first wins; timing out is an
//! ordinary outcome, not an error.
//!
//! Subscriptions are taken with [`ConfirmationWaiter::arm`] before the send is
//! issued so an early acknowledgement is buffered instead of lost. Both
//! receivers are owned by the waiter and dropped when it resolves.

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::transport::{AckLevel, LinkHandle, MessageKey, Receipt, StatusUpdate};

/// Which stream confirmed the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckSource {
    StatusUpdate,
    Receipt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed(AckSource),
    TimedOut,
}

impl Confirmation {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
}

/// Resolve with the first of two futures, or `None` once `limit` elapses.
///
/// The losing future is dropped together with everything it borrowed.
pub async fn first_of<T, A, B>(a: A, b: B, limit: Duration) -> Option<T>
where
    A: Future<Output = T>,
    B: Future<Output = T>,
{
    let race = async {
        tokio::select! {
            value = a => value,
            value = b => value,
        }
    };
    tokio::time::timeout(limit, race).await.ok()
}

/// Armed acknowledgement subscriptions for one send.
pub struct ConfirmationWaiter {
    status: broadcast::Receiver<StatusUpdate>,
    receipts: broadcast::Receiver<Receipt>,
}

impl ConfirmationWaiter {
    /// Subscribe to both acknowledgement streams of `link`.
    pub fn arm(link: &dyn LinkHandle) -> Self {
        Self {
            status: link.status_updates(),
            receipts: link.receipts(),
        }
    }

    /// Wait for an acknowledgement of `key`, at most `limit`.
    pub async fn await_confirmation(mut self, key: &MessageKey, limit: Duration) -> Confirmation {
        let outcome = first_of(
            status_ack(&mut self.status, key),
            receipt_ack(&mut self.receipts, key),
            limit,
        )
        .await;

        match outcome {
            Some(source) => {
                debug!(message_id = %key.id, source = ?source, "Delivery confirmed");
                Confirmation::Confirmed(source)
            }
            None => Confirmation::TimedOut,
        }
    }
}

async fn status_ack(rx: &mut broadcast::Receiver<StatusUpdate>, key: &MessageKey) -> AckSource {
    loop {
        match rx.recv().await {
            Ok(update) if update.key == *key && update.level >= AckLevel::DeliveryAck => {
                return AckSource::StatusUpdate
            }
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped = skipped, "Status stream lagged");
            }
            // Source gone; leave the race to the other stream or the timer
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

async fn receipt_ack(rx: &mut broadcast::Receiver<Receipt>, key: &MessageKey) -> AckSource {
    loop {
        match rx.recv().await {
            Ok(receipt) if receipt.key.id == key.id => return AckSource::Receipt,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped = skipped, "Receipt stream lagged");
            }
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
