//! Settle-once slot shared by the two trigger paths of a pending request.
//!
//! A pending request is raced by a matching inbound response and by its timer.
//! Both hold the same `Settlement`; whichever calls `settle` first takes the
//! sender, every later call is a no-op.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

pub(crate) struct Settlement<T> {
    slot: Mutex<Option<oneshot::Sender<T>>>,
}

/// Create a settlement and the receiver its winner will be delivered to.
pub(crate) fn settlement<T>() -> (Arc<Settlement<T>>, oneshot::Receiver<T>) {
    let (tx, rx) = oneshot::channel();
    let settlement = Settlement {
        slot: Mutex::new(Some(tx)),
    };
    (Arc::new(settlement), rx)
}

impl<T> Settlement<T> {
    /// Complete with `value` unless already completed.
    ///
    /// Returns true if this call won.
    pub(crate) fn settle(&self, value: T) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                // The receiver may already be gone (caller dropped the request);
                // the settlement is still spent.
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_writer_wins() {
        let (settlement, rx) = settlement::<&'static str>();
        assert!(settlement.settle("response"));
        assert!(!settlement.settle("timeout"));

        assert_eq!(rx.await.unwrap(), "response");
    }

    #[test]
    fn test_settle_after_receiver_dropped() {
        let (settlement, rx) = settlement::<u32>();
        drop(rx);
        assert!(settlement.settle(1));
        assert!(!settlement.settle(2));
    }
}
