//! The acknowledgement rendezvous: an id generator plus a map of pending
//! single-shot waiters, one per in-flight ack exchange.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use tokio::sync::oneshot;

use crate::errors::Error;

/// Pending ack waiters of a single channel.
///
/// Ids are allocated monotonically and never reused within a channel; id 0 is
/// never handed out. Each registered waiter is fulfilled at most once.
#[derive(Debug, Default)]
pub(crate) struct PendingAcks {
    counter: Mutex<u64>,
    waiters: RwLock<HashMap<u64, oneshot::Sender<String>>>,
}

impl PendingAcks {
    /// Allocate the id for the next ack exchange.
    pub(crate) fn next_id(&self) -> u64 {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        *counter
    }

    /// Register a waiter. Must happen before the ack request frame is sent.
    pub(crate) fn register(&self, id: u64, waiter: oneshot::Sender<String>) {
        self.waiters.write().unwrap().insert(id, waiter);
    }

    /// Drop a waiter that is no longer needed (timeout or failed send).
    pub(crate) fn unregister(&self, id: u64) {
        self.waiters.write().unwrap().remove(&id);
    }

    /// Deliver an ack response to its waiter. A missing waiter (timed out or
    /// never registered) is reported so the caller can drop the frame.
    pub(crate) fn resolve(&self, id: u64, args: String) -> Result<(), Error> {
        let waiter = self
            .waiters
            .write()
            .unwrap()
            .remove(&id)
            .ok_or(Error::WaiterNotFound)?;
        // The receiving side may have given up between removal and delivery.
        waiter.send(args).ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_from_one() {
        let acks = PendingAcks::default();
        assert_eq!(acks.next_id(), 1);
        assert_eq!(acks.next_id(), 2);
        assert_eq!(acks.next_id(), 3);
    }

    #[test]
    fn concurrent_ids_are_distinct() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let acks = Arc::new(PendingAcks::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let acks = acks.clone();
            handles.push(std::thread::spawn(move || {
                (0..100).map(|_| acks.next_id()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "id {id} allocated twice");
            }
        }
    }

    #[tokio::test]
    async fn resolve_delivers_once() {
        let acks = PendingAcks::default();
        let id = acks.next_id();
        let (tx, rx) = oneshot::channel();
        acks.register(id, tx);

        acks.resolve(id, "\"OK\"".to_owned()).unwrap();
        assert_eq!(rx.await.unwrap(), "\"OK\"");

        // a second response for the same id is dropped
        assert!(matches!(
            acks.resolve(id, "\"again\"".to_owned()),
            Err(Error::WaiterNotFound)
        ));
    }

    #[test]
    fn resolve_unknown_id() {
        let acks = PendingAcks::default();
        assert!(matches!(
            acks.resolve(99, String::new()),
            Err(Error::WaiterNotFound)
        ));
    }

    #[test]
    fn unregister_forgets_waiter() {
        let acks = PendingAcks::default();
        let (tx, _rx) = oneshot::channel();
        acks.register(5, tx);
        acks.unregister(5);
        assert!(matches!(
            acks.resolve(5, String::new()),
            Err(Error::WaiterNotFound)
        ));
    }
}
